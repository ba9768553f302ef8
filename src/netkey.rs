//! Network keyrings.
//!
//! A keyring is a small array of 32-byte symmetric keys, one per recipient
//! slot. Slot keys are derived from an X25519 agreement between a local key
//! pair and a peer's public-key block, so both ends of a link derive the
//! same slot key independently. The keyring also records whether payloads
//! on this link are compressed before encryption.
//!
//! Keyrings persist wrapped under the session's carrier key:
//!
//! ```text
//! +-------+-------+--------------------------------------+-----+
//! | Magic | Nonce | Sealed slots (count + flag/key pairs) | CRC |
//! | NKF1  | 24    | AEAD ciphertext + tag                 | u16 |
//! +-------+-------+--------------------------------------+-----+
//! ```
//!
//! Closing a keyring zeroizes every slot key.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use zeroize::Zeroizing;

use crate::container::crc16;
use crate::error::CryptoError;
use crate::handle::{KeyPairHandle, NetKeyHandle, Resource};
use crate::keystore::PublicKeyBlock;
use crate::ops::{ENC_HEADER_LEN, ENC_MAC_LEN};
use crate::provider::{KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::session::SessionContext;

/// Most recipient slots one keyring will hold.
pub const MAX_NET_KEY_SLOTS: usize = 32;

const KEYRING_MAGIC: &[u8; 4] = b"NKF1";
const FILE_CHUNK: usize = 64 * 1024;

pub(crate) struct NetKeyState {
    slots: Vec<Option<Zeroizing<[u8; KEY_LEN]>>>,
    pub compress: bool,
}

impl NetKeyState {
    pub(crate) fn slot(&self, slot: u8) -> Option<&[u8; KEY_LEN]> {
        self.slots.get(slot as usize).and_then(|s| s.as_deref())
    }

    pub(crate) fn snapshot_slots(&self) -> Vec<Option<Zeroizing<[u8; KEY_LEN]>>> {
        self.slots.clone()
    }

    fn set_slot(&mut self, slot: u8, key: [u8; KEY_LEN]) -> Result<(), CryptoError> {
        let at = slot as usize;
        if at >= MAX_NET_KEY_SLOTS {
            return Err(CryptoError::BadLength {
                step: "select keyring slot",
                expected: MAX_NET_KEY_SLOTS,
                actual: at,
            });
        }
        if self.slots.len() <= at {
            self.slots.resize_with(at + 1, || None);
        }
        self.slots[at] = Some(Zeroizing::new(key));
        Ok(())
    }

    fn encode_slots(&self) -> Zeroizing<Vec<u8>> {
        let mut body = Vec::with_capacity(1 + self.slots.len() * (1 + KEY_LEN));
        body.push(self.slots.len() as u8);
        for slot in &self.slots {
            match slot {
                Some(key) => {
                    body.push(1);
                    body.extend_from_slice(key.as_slice());
                }
                None => {
                    body.push(0);
                    body.extend_from_slice(&[0u8; KEY_LEN]);
                }
            }
        }
        Zeroizing::new(body)
    }

    fn decode_slots(body: &[u8], compress: bool) -> Result<NetKeyState, CryptoError> {
        let count = *body.first().ok_or(CryptoError::BadFormat("keyring body empty"))? as usize;
        if count > MAX_NET_KEY_SLOTS || body.len() != 1 + count * (1 + KEY_LEN) {
            return Err(CryptoError::BadFormat("keyring slot table"));
        }
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let at = 1 + i * (1 + KEY_LEN);
            if body[at] == 0 {
                slots.push(None);
            } else {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&body[at + 1..at + 1 + KEY_LEN]);
                slots.push(Some(Zeroizing::new(key)));
            }
        }
        Ok(NetKeyState { slots, compress })
    }
}

fn agreed_slot_key(
    session: &SessionContext,
    key_pair: KeyPairHandle,
    peer: &PublicKeyBlock,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let state = session.table.key_pair(key_pair)?;
    let shared = session.provider.agree(&state.exchange, &peer.exchange_key());
    Ok(session.provider.kdf(&shared, b"krypta.netkey"))
}

impl SessionContext {
    /// Derive a keyring from a local key pair and a peer's public-key
    /// block. The derived key lands in slot 0; both peers derive the same
    /// key.
    pub fn derive_net_key(
        &mut self,
        key_pair: KeyPairHandle,
        peer: &PublicKeyBlock,
        compress: bool,
    ) -> Result<NetKeyHandle, CryptoError> {
        let key = agreed_slot_key(self, key_pair, peer)?;
        let mut state = NetKeyState {
            slots: Vec::new(),
            compress,
        };
        state.set_slot(0, key)?;
        Ok(NetKeyHandle(self.table.insert(Resource::NetKey(state))))
    }

    /// Derive an additional slot key into an existing keyring.
    pub fn derive_net_key_slot(
        &mut self,
        handle: NetKeyHandle,
        slot: u8,
        key_pair: KeyPairHandle,
        peer: &PublicKeyBlock,
    ) -> Result<(), CryptoError> {
        let key = agreed_slot_key(self, key_pair, peer)?;
        self.table.net_key_mut(handle)?.set_slot(slot, key)
    }

    /// Serialize a keyring, wrapped under the session's carrier key.
    pub fn save_net_key(&mut self, handle: NetKeyHandle) -> Result<Vec<u8>, CryptoError> {
        let body = self.table.net_key(handle)?.encode_slots();
        let wrap_key = self.provider.kdf(&self.carrier_key(), b"krypta.netkey.file");
        let mut nonce = [0u8; NONCE_LEN];
        self.provider.random_bytes(&mut nonce);
        let sealed = self.provider.seal(&wrap_key, &nonce, KEYRING_MAGIC, &body);

        let mut out = Vec::with_capacity(4 + NONCE_LEN + sealed.len() + 2);
        out.extend_from_slice(KEYRING_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        let crc = crc16(&out);
        let mut trailer = [0u8; 2];
        LittleEndian::write_u16(&mut trailer, crc);
        out.extend_from_slice(&trailer);
        Ok(out)
    }

    /// Load a keyring saved by [`save_net_key`](Self::save_net_key). The
    /// session must hold the same GK and substitution nodes that saved it.
    pub fn load_net_key(
        &mut self,
        raw: &[u8],
        compress: bool,
    ) -> Result<NetKeyHandle, CryptoError> {
        if raw.len() < 4 + NONCE_LEN + TAG_LEN + 2 {
            return Err(CryptoError::BadFormat("keyring blob too short"));
        }
        let (body, crc_bytes) = raw.split_at(raw.len() - 2);
        let expected = LittleEndian::read_u16(crc_bytes);
        let actual = crc16(body);
        if expected != actual {
            return Err(CryptoError::BadCrc { expected, actual });
        }
        if &body[..4] != KEYRING_MAGIC {
            return Err(CryptoError::BadFormat("keyring magic"));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&body[4..4 + NONCE_LEN]);
        let wrap_key = self.provider.kdf(&self.carrier_key(), b"krypta.netkey.file");
        let plain = Zeroizing::new(self.provider.open(
            &wrap_key,
            &nonce,
            KEYRING_MAGIC,
            &body[4 + NONCE_LEN..],
        )?);
        let state = NetKeyState::decode_slots(&plain, compress)?;
        Ok(NetKeyHandle(self.table.insert(Resource::NetKey(state))))
    }

    /// Load a keyring from a file.
    pub fn load_net_key_file(
        &mut self,
        path: &Path,
        compress: bool,
    ) -> Result<NetKeyHandle, CryptoError> {
        let raw = std::fs::read(path)?;
        self.load_net_key(&raw, compress)
    }

    /// Serialize a keyring to a file.
    pub fn save_net_key_file(
        &mut self,
        handle: NetKeyHandle,
        path: &Path,
    ) -> Result<(), CryptoError> {
        let raw = self.save_net_key(handle)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Zeroize and release a keyring.
    pub fn close_net_key(&mut self, handle: NetKeyHandle) -> Result<(), CryptoError> {
        self.table.take_net_key(handle).map(drop)
    }

    /// Single-shot encrypt under one keyring slot. Equivalent to an
    /// encrypt context fed the whole payload at once.
    pub fn net_encode(
        &mut self,
        handle: NetKeyHandle,
        slot: u8,
        content_type: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let op = self.encrypt_init(handle, slot, content_type)?;
        let mut out = self.encrypt_put_undef(op, payload)?;
        out.extend_from_slice(&self.encrypt_finish(op)?);
        Ok(out)
    }

    /// Single-shot decrypt. Returns the payload and its content type.
    pub fn net_decode(
        &mut self,
        handle: NetKeyHandle,
        stream: &[u8],
    ) -> Result<(Vec<u8>, u32), CryptoError> {
        let op = self.decrypt_init(handle)?;
        let payload = match self.decrypt_put_undef(op, stream) {
            Ok(payload) => payload,
            Err(err) => {
                let _ = self.table.take_decrypt_op(op);
                return Err(err);
            }
        };
        let content_type = self.decrypt_finish(op)?;
        Ok((payload, content_type))
    }

    /// Encrypt a file under one keyring slot, with progress reporting.
    pub fn net_encode_file(
        &mut self,
        handle: NetKeyHandle,
        slot: u8,
        content_type: u32,
        src: &Path,
        dst: &Path,
    ) -> Result<(), CryptoError> {
        let op = self.encrypt_init(handle, slot, content_type)?;
        let result = (|| {
            let mut input = File::open(src)?;
            let total = input.metadata()?.len();
            let mut output = File::create(dst)?;
            let mut buf = vec![0u8; FILE_CHUNK];
            let mut done = 0u64;
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let chunk = self.encrypt_put_undef(op, &buf[..n])?;
                output.write_all(&chunk)?;
                done += n as u64;
                self.report_progress(done, total);
            }
            output.write_all(&self.encrypt_finish(op)?)?;
            self.report_progress(total, total);
            Ok(())
        })();
        if result.is_err() {
            let _ = self.table.take_encrypt_op(op);
        }
        result
    }

    /// Decrypt a file, with progress reporting. Returns the content type.
    pub fn net_decode_file(
        &mut self,
        handle: NetKeyHandle,
        src: &Path,
        dst: &Path,
    ) -> Result<u32, CryptoError> {
        let op = self.decrypt_init(handle)?;
        let result = (|| {
            let mut input = File::open(src)?;
            let total = input.metadata()?.len();
            if total < (ENC_HEADER_LEN + ENC_MAC_LEN) as u64 {
                return Err(CryptoError::BadFormat("encrypted file too short"));
            }
            let mut output = File::create(dst)?;
            let mut buf = vec![0u8; FILE_CHUNK];
            let mut done = 0u64;
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let chunk = self.decrypt_put_undef(op, &buf[..n])?;
                output.write_all(&chunk)?;
                done += n as u64;
                self.report_progress(done, total);
            }
            self.report_progress(total, total);
            self.decrypt_finish(op)
        })();
        if result.is_err() {
            let _ = self.table.take_decrypt_op(op);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeySlot;
    use crate::session::test_session;

    fn linked_keyrings(compress: bool) -> (SessionContext, NetKeyHandle, NetKeyHandle) {
        let mut session = test_session();
        let (alice, _) = session.generate_key_pair("pw", Some("alice"), KeySlot::Primary).unwrap();
        let (bob, _) = session.generate_key_pair("pw", Some("bob"), KeySlot::Primary).unwrap();
        let alice_block = session.public_key_block(alice).unwrap();
        let bob_block = session.public_key_block(bob).unwrap();
        let ka = session.derive_net_key(alice, &bob_block, compress).unwrap();
        let kb = session.derive_net_key(bob, &alice_block, compress).unwrap();
        (session, ka, kb)
    }

    #[test]
    fn encode_decode_across_peers() {
        let (mut session, ka, kb) = linked_keyrings(false);
        let stream = session.net_encode(ka, 0, 7, b"over the wire").unwrap();
        let (payload, content_type) = session.net_decode(kb, &stream).unwrap();
        assert_eq!(payload, b"over the wire");
        assert_eq!(content_type, 7);
    }

    #[test]
    fn compressed_link() {
        let (mut session, ka, kb) = linked_keyrings(true);
        let payload: Vec<u8> = (0..30_000).map(|i| ((i / 9) % 200) as u8).collect();
        let stream = session.net_encode(ka, 0, 1, &payload).unwrap();
        // Compressible payload should shrink noticeably on the wire.
        assert!(stream.len() < payload.len() / 2);
        let (restored, _) = session.net_decode(kb, &stream).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn streaming_decrypt_matches_single_shot() {
        let (mut session, ka, kb) = linked_keyrings(false);
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let stream = session.net_encode(ka, 0, 3, &payload).unwrap();

        for chunk in [1usize, 17, 31, 4096] {
            let op = session.decrypt_init(kb).unwrap();
            let mut restored = Vec::new();
            for piece in stream.chunks(chunk) {
                restored.extend_from_slice(&session.decrypt_put_undef(op, piece).unwrap());
            }
            assert_eq!(session.decrypt_finish(op).unwrap(), 3);
            assert_eq!(restored, payload);
        }
    }

    #[test]
    fn tampered_stream_fails_the_mac() {
        let (mut session, ka, kb) = linked_keyrings(false);
        let mut stream = session.net_encode(ka, 0, 0, b"payload").unwrap();
        let at = stream.len() / 2;
        stream[at] ^= 0x01;
        assert!(matches!(
            session.net_decode(kb, &stream),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn truncated_header_is_a_format_error() {
        let (mut session, ka, kb) = linked_keyrings(false);
        let stream = session.net_encode(ka, 0, 2, b"payload").unwrap();
        // The wire stream ends before the 36-byte header completes. That is
        // a malformed stream, not a misuse of the context.
        let op = session.decrypt_init(kb).unwrap();
        session.decrypt_put_undef(op, &stream[..10]).unwrap();
        let err = session.decrypt_finish(op).unwrap_err();
        assert!(matches!(err, CryptoError::BadFormat(_)));
        assert!(!err.is_caller_bug());
    }

    #[test]
    fn empty_slot_is_no_key() {
        let (mut session, ka, kb) = linked_keyrings(false);
        assert!(matches!(
            session.encrypt_init(ka, 5, 0),
            Err(CryptoError::NoKey)
        ));
        // A stream addressed to a slot the receiver lacks fails the same
        // way.
        let (carol, _) = session.generate_key_pair("pw", Some("carol"), KeySlot::Primary).unwrap();
        let carol_block = session.public_key_block(carol).unwrap();
        session.derive_net_key_slot(ka, 2, carol, &carol_block).unwrap();
        let stream = session.net_encode(ka, 2, 0, b"for slot two").unwrap();
        assert!(matches!(
            session.net_decode(kb, &stream),
            Err(CryptoError::NoKey)
        ));
    }

    #[test]
    fn save_load_round_trip() {
        let (mut session, ka, kb) = linked_keyrings(false);
        let stream = session.net_encode(ka, 0, 9, b"persisted link").unwrap();

        let saved = session.save_net_key(kb).unwrap();
        session.close_net_key(kb).unwrap();
        let restored = session.load_net_key(&saved, false).unwrap();
        let (payload, content_type) = session.net_decode(restored, &stream).unwrap();
        assert_eq!(payload, b"persisted link");
        assert_eq!(content_type, 9);
    }

    #[test]
    fn tampered_save_is_rejected() {
        let (mut session, ka, _) = linked_keyrings(false);
        let mut saved = session.save_net_key(ka).unwrap();
        let last = saved.len() - 3;
        saved[last] ^= 0x01;
        assert!(matches!(
            session.load_net_key(&saved, false),
            Err(CryptoError::BadCrc { .. })
        ));
        // Repair the CRC and the AEAD still objects.
        let crc = crc16(&saved[..saved.len() - 2]);
        let at = saved.len() - 2;
        LittleEndian::write_u16(&mut saved[at..], crc);
        assert!(matches!(
            session.load_net_key(&saved, false),
            Err(CryptoError::WrongPassword)
        ));
    }

    #[test]
    fn close_zeroizes_and_invalidates() {
        let (mut session, ka, _) = linked_keyrings(false);
        session.close_net_key(ka).unwrap();
        assert!(matches!(
            session.close_net_key(ka),
            Err(CryptoError::BadHandle)
        ));
        assert!(matches!(
            session.net_encode(ka, 0, 0, b"x"),
            Err(CryptoError::BadHandle)
        ));
    }

    #[test]
    fn file_round_trip() {
        let (mut session, ka, kb) = linked_keyrings(true);
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("plain");
        let wire = tmp.path().join("wire");
        let out = tmp.path().join("out");
        let payload: Vec<u8> = (0..300_000).map(|i| ((i / 11) % 240) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        session.net_encode_file(ka, 0, 4, &src, &wire).unwrap();
        assert_eq!(session.net_decode_file(kb, &wire, &out).unwrap(), 4);
        assert_eq!(std::fs::read(&out).unwrap(), payload);
    }
}
