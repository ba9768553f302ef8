//! TLS-like session contexts.
//!
//! A three-flight handshake establishes per-direction traffic keys:
//!
//! ```text
//! Client                                 Server
//!   | -- ClientHello (random, eph pub) --> |
//!   | <- ServerHello (random, eph pub,     |
//!   |      cert chain, transcript sig) --- |
//!   | -- ClientFinish (opt. chain + sig,   |
//!   |      transcript MAC) --------------> |
//! ```
//!
//! Both sides keep a running transcript digest over every handshake byte.
//! The server always authenticates: its hello carries a certificate chain
//! and a signature over the transcript so far, and the chain must validate
//! against the context's trust directory. Client authentication is the
//! server's choice. Traffic keys are derived from the X25519 shared secret
//! and the transcript digest, one key per direction, and the data phase
//! seals each record with a counter nonce.
//!
//! The handshake state commits only after a flight fully verifies; a
//! rejected flight leaves the context where it was.

use byteorder::{ByteOrder, LittleEndian};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::cert::{unix_now, Certificate, CERT_LEN};
use crate::error::CryptoError;
use crate::handle::{DirHandle, KeyPairHandle, Resource, TlsHandle};
use crate::provider::{CryptoProvider, DigestState, KEY_LEN, NONCE_LEN, SIGNATURE_LEN};
use crate::session::SessionContext;

const MAGIC_CLIENT_HELLO: &[u8; 4] = b"TLH1";
const MAGIC_SERVER_HELLO: &[u8; 4] = b"TLH2";
const MAGIC_CLIENT_FINISH: &[u8; 4] = b"TLH3";

const HELLO_LEN: usize = 4 + 32 + KEY_LEN;
const MAC_LEN: usize = 32;

/// Server policy on client authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerAuth {
    NoClientAuth,
    RequireClientCert,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TlsRole {
    Client,
    Server,
}

enum TlsStage {
    ClientStart,
    ClientSentHello {
        eph: Zeroizing<[u8; KEY_LEN]>,
        transcript: Box<dyn DigestState>,
    },
    ServerStart,
    ServerSentHello {
        transcript: Box<dyn DigestState>,
        send_key: Zeroizing<[u8; KEY_LEN]>,
        recv_key: Zeroizing<[u8; KEY_LEN]>,
        fin_key: Zeroizing<[u8; KEY_LEN]>,
    },
    Data {
        send_key: Zeroizing<[u8; KEY_LEN]>,
        recv_key: Zeroizing<[u8; KEY_LEN]>,
        send_counter: u64,
        recv_counter: u64,
    },
}

pub(crate) struct TlsContext {
    role: TlsRole,
    auth: ServerAuth,
    seed: Zeroizing<[u8; KEY_LEN]>,
    chain: Vec<Certificate>,
    dir: DirHandle,
    stage: TlsStage,
    peer_chain: Vec<Certificate>,
}

/// Everything one handshake flight produces. Applied to the context only
/// after any peer chain validates.
struct Step {
    output: Vec<u8>,
    done: bool,
    stage: TlsStage,
    peer_chain: Option<Vec<Certificate>>,
}

fn traffic_key(
    provider: &dyn CryptoProvider,
    shared: &[u8; KEY_LEN],
    transcript: &[u8; 32],
    label: &[u8],
) -> Zeroizing<[u8; KEY_LEN]> {
    let mut state = provider.digest_begin();
    state.update(shared);
    state.update(transcript);
    state.update(label);
    Zeroizing::new(state.finalize())
}

fn finish_mac(provider: &dyn CryptoProvider, fin_key: &[u8; KEY_LEN], transcript: &[u8; 32]) -> [u8; MAC_LEN] {
    let mut state = provider.digest_begin();
    state.update(fin_key);
    state.update(transcript);
    state.finalize()
}

fn encode_chain(out: &mut Vec<u8>, chain: &[Certificate]) {
    out.push(chain.len() as u8);
    for cert in chain {
        out.extend_from_slice(&cert.encode());
    }
}

fn decode_chain(provider: &dyn CryptoProvider, raw: &[u8], count: usize) -> Result<Vec<Certificate>, CryptoError> {
    let mut chain = Vec::with_capacity(count);
    for i in 0..count {
        chain.push(Certificate::decode(provider, &raw[i * CERT_LEN..(i + 1) * CERT_LEN])?);
    }
    Ok(chain)
}

fn record_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    LittleEndian::write_u64(&mut nonce[..8], counter);
    nonce
}

impl TlsContext {
    fn initial_stage(role: TlsRole) -> TlsStage {
        match role {
            TlsRole::Client => TlsStage::ClientStart,
            TlsRole::Server => TlsStage::ServerStart,
        }
    }

    fn step(&self, provider: &dyn CryptoProvider, input: &[u8]) -> Result<Step, CryptoError> {
        match &self.stage {
            TlsStage::ClientStart => {
                if !input.is_empty() {
                    return Err(CryptoError::WrongState("client sends the first flight"));
                }
                let mut eph = Zeroizing::new([0u8; KEY_LEN]);
                provider.random_bytes(&mut *eph);
                let mut random = [0u8; 32];
                provider.random_bytes(&mut random);

                let mut hello = Vec::with_capacity(HELLO_LEN);
                hello.extend_from_slice(MAGIC_CLIENT_HELLO);
                hello.extend_from_slice(&random);
                hello.extend_from_slice(&provider.exchange_public(&eph));

                let mut transcript = provider.digest_begin();
                transcript.update(&hello);
                Ok(Step {
                    output: hello,
                    done: false,
                    stage: TlsStage::ClientSentHello { eph, transcript },
                    peer_chain: None,
                })
            }

            TlsStage::ClientSentHello { eph, transcript } => {
                self.client_process_server_hello(provider, input, eph, transcript.as_ref())
            }

            TlsStage::ServerStart => self.server_process_client_hello(provider, input),

            TlsStage::ServerSentHello {
                transcript,
                send_key,
                recv_key,
                fin_key,
            } => self.server_process_client_finish(
                provider,
                input,
                transcript.as_ref(),
                send_key,
                recv_key,
                fin_key,
            ),

            TlsStage::Data { .. } => Err(CryptoError::WrongState("handshake already complete")),
        }
    }

    fn client_process_server_hello(
        &self,
        provider: &dyn CryptoProvider,
        input: &[u8],
        eph: &Zeroizing<[u8; KEY_LEN]>,
        transcript: &dyn DigestState,
    ) -> Result<Step, CryptoError> {
        if input.len() < HELLO_LEN + 1 + SIGNATURE_LEN || &input[..4] != MAGIC_SERVER_HELLO {
            return Err(CryptoError::BadFormat("server hello"));
        }
        let count = input[HELLO_LEN] as usize;
        if count == 0 || input.len() != HELLO_LEN + 1 + count * CERT_LEN + SIGNATURE_LEN {
            return Err(CryptoError::BadFormat("server hello length"));
        }
        let peer_chain = decode_chain(provider, &input[HELLO_LEN + 1..], count)?;
        let (body, sig) = input.split_at(input.len() - SIGNATURE_LEN);

        let mut t = transcript.boxed_clone();
        t.update(body);
        let sig_digest = t.boxed_clone().finalize();
        if !provider.verify(&peer_chain[0].block.signing_key(), &sig_digest, sig) {
            return Err(CryptoError::BadSignature);
        }
        t.update(sig);

        let mut server_eph = [0u8; KEY_LEN];
        server_eph.copy_from_slice(&input[36..HELLO_LEN]);
        let shared = provider.agree(eph, &server_eph);
        let td = t.boxed_clone().finalize();
        let send_key = traffic_key(provider, &shared, &td, b"c2s");
        let recv_key = traffic_key(provider, &shared, &td, b"s2c");
        let fin_key = traffic_key(provider, &shared, &td, b"fin");

        let mut finish = Vec::with_capacity(5 + self.chain.len() * CERT_LEN + SIGNATURE_LEN + MAC_LEN);
        finish.extend_from_slice(MAGIC_CLIENT_FINISH);
        encode_chain(&mut finish, &self.chain);
        t.update(&finish);
        if !self.chain.is_empty() {
            let own_digest = t.boxed_clone().finalize();
            let own_sig = provider.sign(&self.seed, &own_digest);
            t.update(&own_sig);
            finish.extend_from_slice(&own_sig);
        }
        let mac = finish_mac(provider, &fin_key, &t.boxed_clone().finalize());
        finish.extend_from_slice(&mac);

        Ok(Step {
            output: finish,
            done: true,
            stage: TlsStage::Data {
                send_key,
                recv_key,
                send_counter: 0,
                recv_counter: 0,
            },
            peer_chain: Some(peer_chain),
        })
    }

    fn server_process_client_hello(
        &self,
        provider: &dyn CryptoProvider,
        input: &[u8],
    ) -> Result<Step, CryptoError> {
        if input.len() != HELLO_LEN || &input[..4] != MAGIC_CLIENT_HELLO {
            return Err(CryptoError::BadFormat("client hello"));
        }
        let mut client_eph = [0u8; KEY_LEN];
        client_eph.copy_from_slice(&input[36..]);

        let mut transcript = provider.digest_begin();
        transcript.update(input);

        let mut eph = Zeroizing::new([0u8; KEY_LEN]);
        provider.random_bytes(&mut *eph);
        let mut random = [0u8; 32];
        provider.random_bytes(&mut random);

        let mut hello = Vec::with_capacity(HELLO_LEN + 1 + self.chain.len() * CERT_LEN + SIGNATURE_LEN);
        hello.extend_from_slice(MAGIC_SERVER_HELLO);
        hello.extend_from_slice(&random);
        hello.extend_from_slice(&provider.exchange_public(&eph));
        encode_chain(&mut hello, &self.chain);
        transcript.update(&hello);
        let sig = provider.sign(&self.seed, &transcript.boxed_clone().finalize());
        transcript.update(&sig);
        hello.extend_from_slice(&sig);

        let shared = provider.agree(&eph, &client_eph);
        let td = transcript.boxed_clone().finalize();
        // Server sends s2c, receives c2s.
        let send_key = traffic_key(provider, &shared, &td, b"s2c");
        let recv_key = traffic_key(provider, &shared, &td, b"c2s");
        let fin_key = traffic_key(provider, &shared, &td, b"fin");

        Ok(Step {
            output: hello,
            done: false,
            stage: TlsStage::ServerSentHello {
                transcript,
                send_key,
                recv_key,
                fin_key,
            },
            peer_chain: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn server_process_client_finish(
        &self,
        provider: &dyn CryptoProvider,
        input: &[u8],
        transcript: &dyn DigestState,
        send_key: &Zeroizing<[u8; KEY_LEN]>,
        recv_key: &Zeroizing<[u8; KEY_LEN]>,
        fin_key: &Zeroizing<[u8; KEY_LEN]>,
    ) -> Result<Step, CryptoError> {
        if input.len() < 5 + MAC_LEN || &input[..4] != MAGIC_CLIENT_FINISH {
            return Err(CryptoError::BadFormat("client finish"));
        }
        let count = input[4] as usize;
        let sig_len = if count > 0 { SIGNATURE_LEN } else { 0 };
        let body_len = 5 + count * CERT_LEN;
        if input.len() != body_len + sig_len + MAC_LEN {
            return Err(CryptoError::BadFormat("client finish length"));
        }
        if count == 0 && self.auth == ServerAuth::RequireClientCert {
            return Err(CryptoError::NoKey);
        }
        let peer_chain = decode_chain(provider, &input[5..], count)?;

        let mut t = transcript.boxed_clone();
        t.update(&input[..body_len]);
        if count > 0 {
            let sig = &input[body_len..body_len + SIGNATURE_LEN];
            let sig_digest = t.boxed_clone().finalize();
            if !provider.verify(&peer_chain[0].block.signing_key(), &sig_digest, sig) {
                return Err(CryptoError::BadSignature);
            }
            t.update(sig);
        }
        let mac = &input[body_len + sig_len..];
        let expected = finish_mac(provider, fin_key, &t.boxed_clone().finalize());
        if !bool::from(expected.ct_eq(mac)) {
            return Err(CryptoError::BadSignature);
        }

        Ok(Step {
            output: Vec::new(),
            done: true,
            stage: TlsStage::Data {
                send_key: send_key.clone(),
                recv_key: recv_key.clone(),
                send_counter: 0,
                recv_counter: 0,
            },
            peer_chain: Some(peer_chain),
        })
    }
}

impl SessionContext {
    fn tls_init(
        &mut self,
        role: TlsRole,
        key: KeyPairHandle,
        dir: DirHandle,
        chain: Vec<Certificate>,
        auth: ServerAuth,
    ) -> Result<TlsHandle, CryptoError> {
        self.table.directory(dir)?;
        let state = self.table.key_pair(key)?;
        let ctx = TlsContext {
            role,
            auth,
            seed: Zeroizing::new(state.seed),
            chain,
            dir,
            stage: TlsContext::initial_stage(role),
            peer_chain: Vec::new(),
        };
        Ok(TlsHandle(self.table.insert(Resource::Tls(ctx))))
    }

    /// Open a client context. `chain` is presented to the server if it asks
    /// for client authentication; it may be empty.
    pub fn tls_client(
        &mut self,
        key: KeyPairHandle,
        dir: DirHandle,
        chain: Vec<Certificate>,
    ) -> Result<TlsHandle, CryptoError> {
        self.tls_init(TlsRole::Client, key, dir, chain, ServerAuth::NoClientAuth)
    }

    /// Open a server context. The server always authenticates, so `chain`
    /// must not be empty.
    pub fn tls_server(
        &mut self,
        key: KeyPairHandle,
        dir: DirHandle,
        chain: Vec<Certificate>,
        auth: ServerAuth,
    ) -> Result<TlsHandle, CryptoError> {
        if chain.is_empty() {
            return Err(CryptoError::NoKey);
        }
        self.tls_init(TlsRole::Server, key, dir, chain, auth)
    }

    /// Drive the handshake one flight. Call with the peer's last output
    /// (empty for the client's first call) until `done` is true; the
    /// returned bytes, if any, go to the peer.
    pub fn tls_handshake(
        &mut self,
        h: TlsHandle,
        input: &[u8],
    ) -> Result<(Vec<u8>, bool), CryptoError> {
        let provider = self.provider.clone();
        let (dir, step) = {
            let ctx = self.table.tls(h)?;
            (ctx.dir, ctx.step(provider.as_ref(), input)?)
        };
        if let Some(chain) = &step.peer_chain {
            if !chain.is_empty() {
                self.validate_chain(dir, chain, unix_now())?;
            }
        }
        let ctx = self.table.tls_mut(h)?;
        ctx.stage = step.stage;
        if let Some(chain) = step.peer_chain {
            ctx.peer_chain = chain;
        }
        Ok((step.output, step.done))
    }

    /// Seal one record for the peer. Data phase only.
    pub fn tls_write(&mut self, h: TlsHandle, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let provider = self.provider.clone();
        let ctx = self.table.tls_mut(h)?;
        let TlsStage::Data {
            send_key,
            send_counter,
            ..
        } = &mut ctx.stage
        else {
            return Err(CryptoError::WrongState("handshake not complete"));
        };
        let record = provider.seal(send_key, &record_nonce(*send_counter), &[], data);
        *send_counter += 1;
        Ok(record)
    }

    /// Open one record from the peer. Records must arrive in order; a
    /// tampered or replayed record fails with `BadSignature`.
    pub fn tls_read(&mut self, h: TlsHandle, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let provider = self.provider.clone();
        let ctx = self.table.tls_mut(h)?;
        let TlsStage::Data {
            recv_key,
            recv_counter,
            ..
        } = &mut ctx.stage
        else {
            return Err(CryptoError::WrongState("handshake not complete"));
        };
        let plain = provider
            .open(recv_key, &record_nonce(*recv_counter), &[], record)
            .map_err(|_| CryptoError::BadSignature)?;
        *recv_counter += 1;
        Ok(plain)
    }

    /// The peer's leaf certificate, once the handshake is complete. `None`
    /// for an unauthenticated client.
    pub fn tls_peer_certificate(&self, h: TlsHandle) -> Result<Option<&Certificate>, CryptoError> {
        let ctx = self.table.tls(h)?;
        if !matches!(ctx.stage, TlsStage::Data { .. }) {
            return Err(CryptoError::WrongState("handshake not complete"));
        }
        Ok(ctx.peer_chain.first())
    }

    /// Return the context to a fresh pre-handshake state, keeping its key,
    /// directory, chain, and policy.
    pub fn tls_reset(&mut self, h: TlsHandle) -> Result<(), CryptoError> {
        let ctx = self.table.tls_mut(h)?;
        ctx.stage = TlsContext::initial_stage(ctx.role);
        ctx.peer_chain.clear();
        Ok(())
    }

    /// Release a context.
    pub fn tls_close(&mut self, h: TlsHandle) -> Result<(), CryptoError> {
        self.table.take_tls(h).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CertificateError;
    use crate::keystore::KeySlot;
    use crate::session::test_session;

    const FAR_FUTURE: u64 = u64::MAX / 2;

    struct Net {
        session: SessionContext,
        dir: DirHandle,
        server_key: KeyPairHandle,
        client_key: KeyPairHandle,
        server_chain: Vec<Certificate>,
        client_chain: Vec<Certificate>,
    }

    fn net() -> Net {
        let mut session = test_session();
        let (ca, _) = session.generate_key_pair("pw", Some("root-ca"), KeySlot::Primary).unwrap();
        let (server_key, _) =
            session.generate_key_pair("pw", Some("server"), KeySlot::Primary).unwrap();
        let (client_key, _) =
            session.generate_key_pair("pw", Some("client"), KeySlot::Primary).unwrap();

        let dir = session.open_directory(true);
        let ca_block = session.public_key_block(ca).unwrap();
        session.dir_add(dir, "root-ca", ca_block, "anchor").unwrap();

        let root = session.self_certificate(ca, FAR_FUTURE).unwrap();
        let server_block = session.public_key_block(server_key).unwrap();
        let server_leaf = session
            .issue_certificate(ca, "server", server_block, FAR_FUTURE)
            .unwrap();
        let client_block = session.public_key_block(client_key).unwrap();
        let client_leaf = session
            .issue_certificate(ca, "client", client_block, FAR_FUTURE)
            .unwrap();

        Net {
            session,
            dir,
            server_key,
            client_key,
            server_chain: vec![server_leaf, root.clone()],
            client_chain: vec![client_leaf, root],
        }
    }

    fn pump(session: &mut SessionContext, client: TlsHandle, server: TlsHandle) {
        let (hello, done) = session.tls_handshake(client, &[]).unwrap();
        assert!(!done);
        let (server_hello, done) = session.tls_handshake(server, &hello).unwrap();
        assert!(!done);
        let (finish, done) = session.tls_handshake(client, &server_hello).unwrap();
        assert!(done);
        let (tail, done) = session.tls_handshake(server, &finish).unwrap();
        assert!(done);
        assert!(tail.is_empty());
    }

    #[test]
    fn handshake_and_data_both_ways() {
        let mut n = net();
        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, n.server_chain, ServerAuth::NoClientAuth)
            .unwrap();
        pump(&mut n.session, client, server);

        for round in 0..3u8 {
            let msg = vec![round; 100];
            let record = n.session.tls_write(client, &msg).unwrap();
            assert_eq!(n.session.tls_read(server, &record).unwrap(), msg);
            let reply = n.session.tls_write(server, &msg).unwrap();
            assert_eq!(n.session.tls_read(client, &reply).unwrap(), msg);
        }

        let peer = n.session.tls_peer_certificate(client).unwrap();
        assert_eq!(peer.map(|c| c.user_id.as_str()), Some("server"));
        assert_eq!(n.session.tls_peer_certificate(server).unwrap(), None);
    }

    #[test]
    fn mutual_authentication() {
        let mut n = net();
        let client = n
            .session
            .tls_client(n.client_key, n.dir, n.client_chain)
            .unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, n.server_chain, ServerAuth::RequireClientCert)
            .unwrap();
        pump(&mut n.session, client, server);
        let peer = n.session.tls_peer_certificate(server).unwrap();
        assert_eq!(peer.map(|c| c.user_id.as_str()), Some("client"));
    }

    #[test]
    fn missing_client_certificate_is_rejected() {
        let mut n = net();
        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, n.server_chain, ServerAuth::RequireClientCert)
            .unwrap();
        let (hello, _) = n.session.tls_handshake(client, &[]).unwrap();
        let (server_hello, _) = n.session.tls_handshake(server, &hello).unwrap();
        let (finish, _) = n.session.tls_handshake(client, &server_hello).unwrap();
        assert!(matches!(
            n.session.tls_handshake(server, &finish),
            Err(CryptoError::NoKey)
        ));
    }

    #[test]
    fn expired_server_certificate() {
        let mut n = net();
        let (ca2, _) = n.session.generate_key_pair("pw", Some("root-ca2"), KeySlot::Primary).unwrap();
        let ca2_block = n.session.public_key_block(ca2).unwrap();
        n.session.dir_add(n.dir, "root-ca2", ca2_block, "").unwrap();
        let stale_root = n.session.self_certificate(ca2, 100).unwrap();

        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, vec![stale_root], ServerAuth::NoClientAuth)
            .unwrap();
        let (hello, _) = n.session.tls_handshake(client, &[]).unwrap();
        let (server_hello, _) = n.session.tls_handshake(server, &hello).unwrap();
        assert!(matches!(
            n.session.tls_handshake(client, &server_hello),
            Err(CryptoError::Certificate(CertificateError::Expired))
        ));
    }

    #[test]
    fn untrusted_server_chain() {
        let mut n = net();
        let (rogue, _) = n.session.generate_key_pair("pw", Some("rogue"), KeySlot::Primary).unwrap();
        let rogue_root = n.session.self_certificate(rogue, FAR_FUTURE).unwrap();

        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(rogue, n.dir, vec![rogue_root], ServerAuth::NoClientAuth)
            .unwrap();
        let (hello, _) = n.session.tls_handshake(client, &[]).unwrap();
        let (server_hello, _) = n.session.tls_handshake(server, &hello).unwrap();
        assert!(matches!(
            n.session.tls_handshake(client, &server_hello),
            Err(CryptoError::Certificate(CertificateError::NotRoot))
        ));
        // The rejected flight did not advance the client.
        assert!(matches!(
            n.session.tls_write(client, b"x"),
            Err(CryptoError::WrongState(_))
        ));
    }

    #[test]
    fn tampered_record_fails() {
        let mut n = net();
        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, n.server_chain, ServerAuth::NoClientAuth)
            .unwrap();
        pump(&mut n.session, client, server);

        let mut record = n.session.tls_write(client, b"payload").unwrap();
        record[0] ^= 0x01;
        assert!(matches!(
            n.session.tls_read(server, &record),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn reordered_records_fail() {
        let mut n = net();
        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, n.server_chain, ServerAuth::NoClientAuth)
            .unwrap();
        pump(&mut n.session, client, server);

        let _first = n.session.tls_write(client, b"one").unwrap();
        let second = n.session.tls_write(client, b"two").unwrap();
        assert!(matches!(
            n.session.tls_read(server, &second),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn write_before_handshake() {
        let mut n = net();
        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        assert!(matches!(
            n.session.tls_write(client, b"x"),
            Err(CryptoError::WrongState(_))
        ));
    }

    #[test]
    fn reset_allows_a_second_handshake() {
        let mut n = net();
        let client = n.session.tls_client(n.client_key, n.dir, Vec::new()).unwrap();
        let server = n
            .session
            .tls_server(n.server_key, n.dir, n.server_chain, ServerAuth::NoClientAuth)
            .unwrap();
        pump(&mut n.session, client, server);

        n.session.tls_reset(client).unwrap();
        n.session.tls_reset(server).unwrap();
        assert!(matches!(
            n.session.tls_peer_certificate(client),
            Err(CryptoError::WrongState(_))
        ));
        pump(&mut n.session, client, server);
        let record = n.session.tls_write(server, b"again").unwrap();
        assert_eq!(n.session.tls_read(client, &record).unwrap(), b"again");
    }
}
