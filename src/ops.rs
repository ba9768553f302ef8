//! Streaming operation contexts.
//!
//! Sign, check, encrypt, and decrypt all share one shape: an init call mints
//! a handle, zero or more put calls feed data through, and exactly one
//! terminal call consumes the handle. Feeding a context out of order fails
//! with `WrongState`; touching it after the terminal call fails with
//! `BadHandle`. A failed context never disturbs any other live context.
//!
//! Signing and checking accept their input three mutually exclusive ways:
//! a precomputed digest (`put_hash`), buffered data (`put_data`, the
//! terminal call then returns the full signature container), or
//! undefined-length data (`put_data_undef`, which echoes the bytes through
//! so the caller can stream the container out itself while only the digest
//! is retained).
//!
//! Encrypted payload format, produced by the encrypt context and the
//! [`net_encode`](crate::SessionContext::net_encode) convenience:
//!
//! ```text
//! +-------+--------------+------+-------+------+-------+------------+-----+
//! | Magic | Content type | Slot | Flags | Rsvd | Nonce | Ciphertext | MAC |
//! | ENC1  | u32          | u8   | u8    | u16  | 24    | ...        | 32  |
//! +-------+--------------+------+-------+------+-------+------------+-----+
//! ```
//!
//! The ciphertext is the (optionally compressed) payload under the slot
//! key's XChaCha20 keystream. The MAC is a keyed Blake2b over the header
//! and ciphertext. Any chunking of the stream produces identical bytes.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::cert::{unix_now, Certificate};
use crate::compress::{Compressor, Decompressor};
use crate::container::{self, SignatureRecord};
use crate::error::CryptoError;
use crate::handle::{
    CheckOpHandle, DecryptOpHandle, DirHandle, EncryptOpHandle, KeyPairHandle, NetKeyHandle,
    Resource, SignOpHandle,
};
use crate::provider::{DigestState, KeystreamState, DIGEST_LEN, KEY_LEN, NONCE_LEN};
use crate::session::SessionContext;

/// Most co-signers one container check will process.
pub const MAX_COSIGNERS: usize = 100;

/// Longest certificate chain a check will assemble for one signer.
const MAX_CHAIN_LEN: usize = 8;

pub(crate) const ENC_MAGIC: &[u8; 4] = b"ENC1";
pub(crate) const ENC_HEADER_LEN: usize = 4 + 4 + 1 + 1 + 2 + NONCE_LEN;
pub(crate) const ENC_MAC_LEN: usize = DIGEST_LEN;

const ENC_FLAG_COMPRESSED: u8 = 0x01;
const FILE_CHUNK: usize = 64 * 1024;

/// Outcome of checking one signature record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignerStatus {
    /// Signature verifies against the signer's directory entry.
    Ok,
    /// The signer is in the directory but the signature does not verify.
    BadSignature,
    /// The signer id is not in the directory.
    UnknownSigner,
}

/// Per-signer result of a container check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerResult {
    pub signer_id: String,
    pub status: SignerStatus,
    /// Validated certificate chain for the signer, leaf first, when one
    /// could be assembled from the certificates fed to the context. Empty
    /// otherwise.
    pub chain: Vec<Certificate>,
}

/// How data has entered a sign or check context so far. The three input
/// paths are mutually exclusive.
enum Feed {
    Fresh,
    Hash([u8; DIGEST_LEN]),
    Data(Box<dyn DigestState>),
    Undef(Box<dyn DigestState>),
}

impl Feed {
    fn put_hash(&mut self, digest: [u8; DIGEST_LEN]) -> Result<(), CryptoError> {
        match self {
            Feed::Fresh => {
                *self = Feed::Hash(digest);
                Ok(())
            }
            _ => Err(CryptoError::WrongState("context already has input")),
        }
    }

    fn put_data(
        &mut self,
        data: &[u8],
        begin: impl FnOnce() -> Box<dyn DigestState>,
    ) -> Result<(), CryptoError> {
        match self {
            Feed::Fresh => {
                let mut state = begin();
                state.update(data);
                *self = Feed::Data(state);
                Ok(())
            }
            Feed::Data(state) => {
                state.update(data);
                Ok(())
            }
            _ => Err(CryptoError::WrongState("context is not in buffered-data mode")),
        }
    }

    fn put_undef(
        &mut self,
        data: &[u8],
        begin: impl FnOnce() -> Box<dyn DigestState>,
    ) -> Result<(), CryptoError> {
        match self {
            Feed::Fresh => {
                let mut state = begin();
                state.update(data);
                *self = Feed::Undef(state);
                Ok(())
            }
            Feed::Undef(state) => {
                state.update(data);
                Ok(())
            }
            _ => Err(CryptoError::WrongState("context is not in streaming mode")),
        }
    }

    fn digest(self) -> Result<[u8; DIGEST_LEN], CryptoError> {
        match self {
            Feed::Fresh => Err(CryptoError::WrongState("context received no input")),
            Feed::Hash(digest) => Ok(digest),
            Feed::Data(state) | Feed::Undef(state) => Ok(state.finalize()),
        }
    }
}

pub(crate) struct SignOp {
    seed: Zeroizing<[u8; KEY_LEN]>,
    signer_id: String,
    feed: Feed,
    /// Payload copy, kept only on the buffered-data path so the terminal
    /// call can emit the full container.
    payload: Vec<u8>,
}

pub(crate) struct CheckOp {
    dir: DirHandle,
    feed: Feed,
    certs: Vec<Certificate>,
}

pub(crate) struct EncryptOp {
    header: Option<Vec<u8>>,
    keystream: Box<dyn KeystreamState>,
    mac: Box<dyn DigestState>,
    compress: Option<Compressor>,
}

enum DecryptStage {
    Header(Vec<u8>),
    Body {
        content_type: u32,
        keystream: Box<dyn KeystreamState>,
        mac: Box<dyn DigestState>,
        /// Tail of the stream not yet decrypted: the final 32 bytes are the
        /// MAC, and where the stream ends is unknown until the terminal
        /// call.
        holdback: Vec<u8>,
        decompress: Option<Decompressor>,
    },
}

pub(crate) struct DecryptOp {
    slots: Vec<Option<Zeroizing<[u8; KEY_LEN]>>>,
    stage: DecryptStage,
}

fn payload_keys(slot_key: &[u8; KEY_LEN], provider: &dyn crate::provider::CryptoProvider) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    (
        provider.kdf(slot_key, b"krypta.net.enc"),
        provider.kdf(slot_key, b"krypta.net.mac"),
    )
}

impl SessionContext {
    // ---- sign ----

    /// Start a signing context over a key pair. The key material is
    /// snapshotted, so the key pair handle may be closed before the
    /// terminal call.
    pub fn sign_init(&mut self, key: KeyPairHandle) -> Result<SignOpHandle, CryptoError> {
        let state = self.table.key_pair(key)?;
        let op = SignOp {
            seed: Zeroizing::new(state.seed),
            signer_id: state.user_id.clone(),
            feed: Feed::Fresh,
            payload: Vec::new(),
        };
        Ok(SignOpHandle(self.table.insert(Resource::SignOp(op))))
    }

    /// Feed a precomputed digest. Excludes both data paths.
    pub fn sign_put_hash(
        &mut self,
        h: SignOpHandle,
        digest: [u8; DIGEST_LEN],
    ) -> Result<(), CryptoError> {
        self.table.sign_op_mut(h)?.feed.put_hash(digest)
    }

    /// Feed payload bytes, buffered; the terminal call returns the full
    /// container.
    pub fn sign_put_data(&mut self, h: SignOpHandle, data: &[u8]) -> Result<(), CryptoError> {
        let provider = self.provider.clone();
        let op = self.table.sign_op_mut(h)?;
        op.feed.put_data(data, || provider.digest_begin())?;
        op.payload.extend_from_slice(data);
        Ok(())
    }

    /// Feed payload bytes of undefined total length. The bytes are echoed
    /// back so the caller can stream them to their destination; only the
    /// running digest is retained.
    pub fn sign_put_data_undef(
        &mut self,
        h: SignOpHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let provider = self.provider.clone();
        let op = self.table.sign_op_mut(h)?;
        op.feed.put_undef(data, || provider.digest_begin())?;
        Ok(data.to_vec())
    }

    /// Terminal call. On the buffered-data path the result is the payload
    /// with the signature record appended; on the hash and streaming paths
    /// it is the detached record for the caller to append.
    pub fn sign_finish(&mut self, h: SignOpHandle) -> Result<Vec<u8>, CryptoError> {
        let op = self.table.take_sign_op(h)?;
        let detached = matches!(op.feed, Feed::Hash(_) | Feed::Undef(_));
        let digest = op.feed.digest()?;
        let signature = self.provider.sign(&op.seed, &digest);
        if detached {
            container::record_bytes(&signature, &op.signer_id)
        } else {
            let mut out = op.payload;
            container::embed(&mut out, &signature, &op.signer_id)?;
            Ok(out)
        }
    }

    /// Abandon a signing context without producing a signature.
    pub fn sign_abort(&mut self, h: SignOpHandle) -> Result<(), CryptoError> {
        self.table.take_sign_op(h).map(drop)
    }

    /// Single-shot: sign a payload and return the full container.
    pub fn sign_buffer(
        &mut self,
        key: KeyPairHandle,
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let h = self.sign_init(key)?;
        self.sign_put_data(h, payload)?;
        self.sign_finish(h)
    }

    /// Sign a file in place: the record is appended after the existing
    /// content. Streams through the file with progress reporting.
    pub fn sign_file(&mut self, key: KeyPairHandle, path: &Path) -> Result<(), CryptoError> {
        let h = self.sign_init(key)?;
        let result = self.sign_file_inner(h, path);
        if result.is_err() {
            let _ = self.sign_abort(h);
            return result;
        }
        let record = self.sign_finish(h)?;
        let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.write_all(&record)?;
        file.sync_data()?;
        Ok(())
    }

    fn sign_file_inner(&mut self, h: SignOpHandle, path: &Path) -> Result<(), CryptoError> {
        let mut file = File::open(path)?;
        let total = file.metadata()?.len();
        let mut buf = vec![0u8; FILE_CHUNK];
        let mut done = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.sign_put_data_undef(h, &buf[..n])?;
            done += n as u64;
            self.report_progress(done, total);
        }
        Ok(())
    }

    // ---- check ----

    /// Start a checking context against a directory. The directory handle
    /// must remain open until the terminal call resolves signer ids.
    pub fn check_init(&mut self, dir: DirHandle) -> Result<CheckOpHandle, CryptoError> {
        self.table.directory(dir)?;
        let op = CheckOp {
            dir,
            feed: Feed::Fresh,
            certs: Vec::new(),
        };
        Ok(CheckOpHandle(self.table.insert(Resource::CheckOp(op))))
    }

    /// Feed a certificate that accompanied the container. The terminal
    /// call uses these to assemble per-signer chains.
    pub fn check_add_certificate(
        &mut self,
        h: CheckOpHandle,
        cert: Certificate,
    ) -> Result<(), CryptoError> {
        self.table.check_op_mut(h)?.certs.push(cert);
        Ok(())
    }

    pub fn check_put_hash(
        &mut self,
        h: CheckOpHandle,
        digest: [u8; DIGEST_LEN],
    ) -> Result<(), CryptoError> {
        self.table.check_op_mut(h)?.feed.put_hash(digest)
    }

    pub fn check_put_data(&mut self, h: CheckOpHandle, data: &[u8]) -> Result<(), CryptoError> {
        let provider = self.provider.clone();
        self.table
            .check_op_mut(h)?
            .feed
            .put_data(data, || provider.digest_begin())
    }

    pub fn check_put_data_undef(
        &mut self,
        h: CheckOpHandle,
        data: &[u8],
    ) -> Result<(), CryptoError> {
        let provider = self.provider.clone();
        self.table
            .check_op_mut(h)?
            .feed
            .put_undef(data, || provider.digest_begin())
    }

    /// Terminal call: verify each extracted record against the directory.
    pub fn check_finish(
        &mut self,
        h: CheckOpHandle,
        records: &[SignatureRecord],
    ) -> Result<Vec<SignerResult>, CryptoError> {
        if records.len() > MAX_COSIGNERS {
            return Err(CryptoError::Unsupported("too many co-signers"));
        }
        let op = self.table.take_check_op(h)?;
        let digest = op.feed.digest()?;
        let now = unix_now();
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let status = match self.table.directory(op.dir)?.lookup(&record.signer_id) {
                None => SignerStatus::UnknownSigner,
                Some(entry) => {
                    let key = entry.block.signing_key();
                    if self.provider.verify(&key, &digest, &record.signature) {
                        SignerStatus::Ok
                    } else {
                        SignerStatus::BadSignature
                    }
                }
            };
            let chain = if status == SignerStatus::Ok {
                self.signer_chain(op.dir, &op.certs, &record.signer_id, now)
            } else {
                Vec::new()
            };
            results.push(SignerResult {
                signer_id: record.signer_id.clone(),
                status,
                chain,
            });
        }
        Ok(results)
    }

    /// Assemble and validate a chain for one signer out of the context's
    /// certificate pool. An unbuildable or invalid chain is reported as
    /// empty rather than as an error; the signature status stands on its
    /// own.
    fn signer_chain(
        &self,
        dir: DirHandle,
        certs: &[Certificate],
        signer_id: &str,
        now: u64,
    ) -> Vec<Certificate> {
        let Some(leaf) = certs.iter().find(|c| c.user_id == signer_id) else {
            return Vec::new();
        };
        let mut chain = vec![leaf.clone()];
        while !chain[chain.len() - 1].is_self_signed() {
            if chain.len() > MAX_CHAIN_LEN {
                return Vec::new();
            }
            let issuer_id = &chain[chain.len() - 1].issuer_id;
            match certs.iter().find(|c| &c.user_id == issuer_id) {
                Some(next) => chain.push(next.clone()),
                None => return Vec::new(),
            }
        }
        match self.validate_chain(dir, &chain, now) {
            Ok(()) => chain,
            Err(_) => Vec::new(),
        }
    }

    /// Single-shot: check every record in a container buffer.
    pub fn check_buffer(
        &mut self,
        dir: DirHandle,
        buf: &[u8],
    ) -> Result<Vec<SignerResult>, CryptoError> {
        let records = collect_records(buf)?;
        let payload_end = records[0].offset as usize;
        let h = self.check_init(dir)?;
        self.check_put_data(h, &buf[..payload_end])?;
        self.check_finish(h, &records)
    }

    /// Check every record in a container file, streaming the payload with
    /// progress reporting.
    pub fn check_file(
        &mut self,
        dir: DirHandle,
        path: &Path,
    ) -> Result<Vec<SignerResult>, CryptoError> {
        let mut records = Vec::new();
        let mut from = 0u64;
        loop {
            match container::extract_file(path, from, 1) {
                Ok(record) => {
                    from = record.offset + record.record_len as u64;
                    records.push(record);
                    if records.len() > MAX_COSIGNERS {
                        return Err(CryptoError::Unsupported("too many co-signers"));
                    }
                }
                Err(CryptoError::NoSignature) if !records.is_empty() => break,
                Err(err) => return Err(err),
            }
        }
        let payload_end = records[0].offset;

        let h = self.check_init(dir)?;
        let result = self.check_file_inner(h, path, payload_end);
        if let Err(err) = result {
            let _ = self.table.take_check_op(h);
            return Err(err);
        }
        self.check_finish(h, &records)
    }

    fn check_file_inner(
        &mut self,
        h: CheckOpHandle,
        path: &Path,
        payload_end: u64,
    ) -> Result<(), CryptoError> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; FILE_CHUNK];
        let mut done = 0u64;
        while done < payload_end {
            let want = ((payload_end - done) as usize).min(FILE_CHUNK);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(CryptoError::BadFormat("container shorter than its records claim"));
            }
            self.check_put_data_undef(h, &buf[..n])?;
            done += n as u64;
            self.report_progress(done, payload_end);
        }
        Ok(())
    }

    // ---- encrypt ----

    /// Start an encrypting context over one keyring slot. `NoKey` if the
    /// slot is unpopulated.
    pub fn encrypt_init(
        &mut self,
        key: NetKeyHandle,
        slot: u8,
        content_type: u32,
    ) -> Result<EncryptOpHandle, CryptoError> {
        let state = self.table.net_key(key)?;
        let slot_key = *state.slot(slot).ok_or(CryptoError::NoKey)?;
        let compressed = state.compress;

        let mut nonce = [0u8; NONCE_LEN];
        self.provider.random_bytes(&mut nonce);

        let mut header = vec![0u8; ENC_HEADER_LEN];
        header[..4].copy_from_slice(ENC_MAGIC);
        LittleEndian::write_u32(&mut header[4..8], content_type);
        header[8] = slot;
        header[9] = if compressed { ENC_FLAG_COMPRESSED } else { 0 };
        header[12..].copy_from_slice(&nonce);

        let (enc_key, mac_key) = payload_keys(&slot_key, self.provider.as_ref());
        let mut mac = self.provider.digest_begin();
        mac.update(&mac_key);
        mac.update(&header);

        let op = EncryptOp {
            header: Some(header),
            keystream: self.provider.keystream(&enc_key, &nonce),
            mac,
            compress: compressed.then(Compressor::new),
        };
        Ok(EncryptOpHandle(self.table.insert(Resource::EncryptOp(op))))
    }

    /// Encrypt one chunk. The first output carries the stream header; any
    /// chunking of the input produces the same concatenated stream.
    pub fn encrypt_put_undef(
        &mut self,
        h: EncryptOpHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let op = self.table.encrypt_op_mut(h)?;
        let mut chunk = match &mut op.compress {
            Some(codec) => codec.compress_block(data)?,
            None => data.to_vec(),
        };
        op.keystream.apply(&mut chunk);
        op.mac.update(&chunk);
        Ok(match op.header.take() {
            Some(mut header) => {
                header.extend_from_slice(&chunk);
                header
            }
            None => chunk,
        })
    }

    /// Terminal call: flush any compressed remainder and append the MAC.
    pub fn encrypt_finish(&mut self, h: EncryptOpHandle) -> Result<Vec<u8>, CryptoError> {
        let mut op = self.table.take_encrypt_op(h)?;
        let mut out = op.header.take().unwrap_or_default();
        if let Some(codec) = &mut op.compress {
            let mut tail = codec.finish()?;
            op.keystream.apply(&mut tail);
            op.mac.update(&tail);
            out.extend_from_slice(&tail);
        }
        out.extend_from_slice(&op.mac.finalize());
        Ok(out)
    }

    // ---- decrypt ----

    /// Start a decrypting context. The keyring's slots are snapshotted; the
    /// slot to use is read from the stream header.
    pub fn decrypt_init(&mut self, key: NetKeyHandle) -> Result<DecryptOpHandle, CryptoError> {
        let state = self.table.net_key(key)?;
        let op = DecryptOp {
            slots: state.snapshot_slots(),
            stage: DecryptStage::Header(Vec::with_capacity(ENC_HEADER_LEN)),
        };
        Ok(DecryptOpHandle(self.table.insert(Resource::DecryptOp(op))))
    }

    /// Decrypt one chunk of the stream, split anywhere. Output lags input
    /// by up to 32 bytes since the stream's tail is its MAC.
    pub fn decrypt_put_undef(
        &mut self,
        h: DecryptOpHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let provider = self.provider.clone();
        let op = self.table.decrypt_op_mut(h)?;

        let mut data = data;
        if let DecryptStage::Header(buf) = &mut op.stage {
            let want = ENC_HEADER_LEN - buf.len();
            let take = want.min(data.len());
            buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if buf.len() < ENC_HEADER_LEN {
                return Ok(Vec::new());
            }

            if &buf[..4] != ENC_MAGIC {
                return Err(CryptoError::BadFormat("encrypted stream magic"));
            }
            let content_type = LittleEndian::read_u32(&buf[4..8]);
            let slot = buf[8];
            let compressed = buf[9] & ENC_FLAG_COMPRESSED != 0;
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&buf[12..]);

            let slot_key = op
                .slots
                .get(slot as usize)
                .and_then(|s| s.as_deref())
                .copied()
                .ok_or(CryptoError::NoKey)?;
            let (enc_key, mac_key) = payload_keys(&slot_key, provider.as_ref());
            let mut mac = provider.digest_begin();
            mac.update(&mac_key);
            mac.update(buf);

            op.stage = DecryptStage::Body {
                content_type,
                keystream: provider.keystream(&enc_key, &nonce),
                mac,
                holdback: Vec::new(),
                decompress: compressed.then(Decompressor::new),
            };
        }

        let DecryptStage::Body {
            keystream,
            mac,
            holdback,
            decompress,
            ..
        } = &mut op.stage
        else {
            unreachable!()
        };

        holdback.extend_from_slice(data);
        if holdback.len() <= ENC_MAC_LEN {
            return Ok(Vec::new());
        }
        let mut chunk: Vec<u8> = holdback.drain(..holdback.len() - ENC_MAC_LEN).collect();
        mac.update(&chunk);
        keystream.apply(&mut chunk);
        match decompress {
            Some(codec) => codec.decompress_block(&chunk),
            None => Ok(chunk),
        }
    }

    /// Terminal call: verify the trailer MAC and return the content type.
    pub fn decrypt_finish(&mut self, h: DecryptOpHandle) -> Result<u32, CryptoError> {
        let op = self.table.take_decrypt_op(h)?;
        let DecryptStage::Body {
            content_type,
            mac,
            holdback,
            ..
        } = op.stage
        else {
            return Err(CryptoError::BadFormat("stream ended inside the header"));
        };
        if holdback.len() != ENC_MAC_LEN {
            return Err(CryptoError::BadLength {
                step: "read stream trailer",
                expected: ENC_MAC_LEN,
                actual: holdback.len(),
            });
        }
        let expected = mac.finalize();
        if expected.ct_eq(holdback.as_slice()).into() {
            Ok(content_type)
        } else {
            Err(CryptoError::BadSignature)
        }
    }
}

/// Collect every 32-bit record in a container buffer, in order.
fn collect_records(buf: &[u8]) -> Result<Vec<SignatureRecord>, CryptoError> {
    let mut records = Vec::new();
    let mut from = 0usize;
    loop {
        match container::extract(buf, from, 1) {
            Ok(record) => {
                from = record.offset as usize + record.record_len;
                records.push(record);
                if records.len() > MAX_COSIGNERS {
                    return Err(CryptoError::Unsupported("too many co-signers"));
                }
            }
            Err(CryptoError::NoSignature) if !records.is_empty() => return Ok(records),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeySlot;
    use crate::session::test_session;
    use crate::SessionContext;

    fn keyed_session(id: &str) -> (SessionContext, KeyPairHandle) {
        let mut session = test_session();
        let (h, _) = session.generate_key_pair("pw", Some(id), KeySlot::Primary).unwrap();
        (session, h)
    }

    fn dir_with(session: &mut SessionContext, entries: &[(KeyPairHandle, &str)]) -> DirHandle {
        let dir = session.open_directory(true);
        for &(key, id) in entries {
            let block = session.public_key_block(key).unwrap();
            session.dir_add(dir, id, block, "").unwrap();
        }
        dir
    }

    #[test]
    fn sign_buffer_then_check() {
        let (mut session, key) = keyed_session("alice");
        let dir = dir_with(&mut session, &[(key, "alice")]);
        let sealed = session.sign_buffer(key, b"important payload").unwrap();

        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].signer_id, "alice");
        assert_eq!(results[0].status, SignerStatus::Ok);
    }

    #[test]
    fn tampered_payload_fails_check() {
        let (mut session, key) = keyed_session("alice");
        let dir = dir_with(&mut session, &[(key, "alice")]);
        let mut sealed = session.sign_buffer(key, b"important payload").unwrap();
        sealed[3] ^= 0x01;
        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results[0].status, SignerStatus::BadSignature);
    }

    #[test]
    fn unknown_signer() {
        let (mut session, key) = keyed_session("alice");
        let dir = session.open_directory(true);
        let sealed = session.sign_buffer(key, b"payload").unwrap();
        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results[0].status, SignerStatus::UnknownSigner);
    }

    #[test]
    fn co_signing() {
        let (mut session, alice) = keyed_session("alice");
        let (bob, _) = session.generate_key_pair("pw", Some("bob"), KeySlot::Primary).unwrap();
        let dir = dir_with(&mut session, &[(alice, "alice"), (bob, "bob")]);

        let mut sealed = session.sign_buffer(alice, b"joint statement").unwrap();
        // Bob counter-signs the payload only, not Alice's record.
        let h = session.sign_init(bob).unwrap();
        session.sign_put_data(h, b"joint statement").unwrap();
        let with_bob = session.sign_finish(h).unwrap();
        sealed.extend_from_slice(&with_bob[b"joint statement".len()..]);

        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == SignerStatus::Ok));
        assert_eq!(results[0].signer_id, "alice");
        assert_eq!(results[1].signer_id, "bob");
    }

    #[test]
    fn hash_path_matches_data_path() {
        let (mut session, key) = keyed_session("alice");
        let dir = dir_with(&mut session, &[(key, "alice")]);

        let hh = session.hash_open();
        session.hash_update(hh, b"payload").unwrap();
        let digest = session.hash_finalize(hh).unwrap();

        let h = session.sign_init(key).unwrap();
        session.sign_put_hash(h, digest).unwrap();
        let record = session.sign_finish(h).unwrap();

        let mut sealed = b"payload".to_vec();
        sealed.extend_from_slice(&record);
        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results[0].status, SignerStatus::Ok);
    }

    #[test]
    fn feed_paths_are_exclusive() {
        let (mut session, key) = keyed_session("alice");
        let h = session.sign_init(key).unwrap();
        session.sign_put_data(h, b"x").unwrap();
        assert!(matches!(
            session.sign_put_hash(h, [0u8; DIGEST_LEN]),
            Err(CryptoError::WrongState(_))
        ));
        assert!(matches!(
            session.sign_put_data_undef(h, b"y"),
            Err(CryptoError::WrongState(_))
        ));
        // The failed calls must not have corrupted the context.
        session.sign_put_data(h, b"more").unwrap();
        session.sign_finish(h).unwrap();
    }

    #[test]
    fn finish_consumes_the_handle() {
        let (mut session, key) = keyed_session("alice");
        let h = session.sign_init(key).unwrap();
        session.sign_put_data(h, b"x").unwrap();
        session.sign_finish(h).unwrap();
        assert!(matches!(
            session.sign_put_data(h, b"y"),
            Err(CryptoError::BadHandle)
        ));
        assert!(matches!(session.sign_finish(h), Err(CryptoError::BadHandle)));
    }

    #[test]
    fn empty_context_cannot_finish() {
        let (mut session, key) = keyed_session("alice");
        let h = session.sign_init(key).unwrap();
        assert!(matches!(
            session.sign_finish(h),
            Err(CryptoError::WrongState(_))
        ));
    }

    #[test]
    fn undef_path_echoes_and_detaches() {
        let (mut session, key) = keyed_session("alice");
        let dir = dir_with(&mut session, &[(key, "alice")]);

        let h = session.sign_init(key).unwrap();
        let mut sealed = Vec::new();
        for chunk in [b"part one ".as_slice(), b"part two".as_slice()] {
            sealed.extend_from_slice(&session.sign_put_data_undef(h, chunk).unwrap());
        }
        let record = session.sign_finish(h).unwrap();
        assert_eq!(sealed, b"part one part two");
        sealed.extend_from_slice(&record);

        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results[0].status, SignerStatus::Ok);
    }

    #[test]
    fn sign_file_and_check_file() {
        let (mut session, key) = keyed_session("alice");
        let dir = dir_with(&mut session, &[(key, "alice")]);
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("report.bin");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        session.sign_file(key, &path).unwrap();
        let results = session.check_file(dir, &path).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, SignerStatus::Ok);

        // File and buffer checks agree.
        let buf = std::fs::read(&path).unwrap();
        assert_eq!(session.check_buffer(dir, &buf).unwrap(), results);
    }

    #[test]
    fn check_assembles_signer_chains() {
        let mut session = test_session();
        let (ca, _) = session.generate_key_pair("pw", Some("root-ca"), KeySlot::Primary).unwrap();
        let (key, _) = session.generate_key_pair("pw", Some("alice"), KeySlot::Primary).unwrap();

        let dir = session.open_directory(true);
        let ca_block = session.public_key_block(ca).unwrap();
        session.dir_add(dir, "root-ca", ca_block, "anchor").unwrap();
        let alice_block = session.public_key_block(key).unwrap();
        session.dir_add(dir, "alice", alice_block.clone(), "").unwrap();

        let far = u64::MAX / 2;
        let root = session.self_certificate(ca, far).unwrap();
        let leaf = session.issue_certificate(ca, "alice", alice_block, far).unwrap();

        let sealed = session.sign_buffer(key, b"payload").unwrap();
        let records = super::collect_records(&sealed).unwrap();

        let h = session.check_init(dir).unwrap();
        session.check_add_certificate(h, leaf.clone()).unwrap();
        session.check_add_certificate(h, root.clone()).unwrap();
        session.check_put_data(h, b"payload").unwrap();
        let results = session.check_finish(h, &records).unwrap();
        assert_eq!(results[0].status, SignerStatus::Ok);
        assert_eq!(results[0].chain, vec![leaf, root]);

        // Without the certificates the chain is simply absent.
        let results = session.check_buffer(dir, &sealed).unwrap();
        assert_eq!(results[0].status, SignerStatus::Ok);
        assert!(results[0].chain.is_empty());
    }

    #[test]
    fn signing_survives_key_close() {
        let (mut session, key) = keyed_session("alice");
        let dir = dir_with(&mut session, &[(key, "alice")]);
        let h = session.sign_init(key).unwrap();
        session.close_key_pair(key).unwrap();
        session.sign_put_data(h, b"payload").unwrap();
        let sealed = session.sign_finish(h).unwrap();
        assert_eq!(
            session.check_buffer(dir, &sealed).unwrap()[0].status,
            SignerStatus::Ok
        );
    }
}
