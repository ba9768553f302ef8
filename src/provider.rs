//! The cryptographic provider seam.
//!
//! Every primitive the session API needs is narrowed down to this trait:
//! incremental hashing, signing and verification over a digest, a raw
//! keystream cipher for chunked payload encryption, an AEAD for key carriers
//! and TLS records, X25519 agreement, and random bytes. The session holds the
//! provider as an `Arc<dyn CryptoProvider>`, so a hardware-backed
//! implementation can be swapped in without touching any higher layer.
//!
//! The default [`SoftwareProvider`] uses Blake2b (32-byte digests), Ed25519,
//! X25519, XChaCha20 for the keystream, and XChaCha20Poly1305 for sealed
//! boxes.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, Verifier};
use rand_core::{OsRng, RngCore};

use crate::error::CryptoError;

/// Digest length produced by every provider.
pub const DIGEST_LEN: usize = 32;
/// Signature length produced by every provider.
pub const SIGNATURE_LEN: usize = 64;
/// Symmetric key length.
pub const KEY_LEN: usize = 32;
/// Nonce length for both the keystream cipher and the AEAD.
pub const NONCE_LEN: usize = 24;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

type Blake2b256 = Blake2b<U32>;

/// A running incremental digest. Cloneable through `boxed_clone` so a hash
/// context can be duplicated mid-stream.
pub trait DigestState: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> [u8; DIGEST_LEN];
    fn boxed_clone(&self) -> Box<dyn DigestState>;
}

/// A running keystream position. Applying it to a buffer en/decrypts in
/// place; the position advances, so arbitrary chunk boundaries produce the
/// same stream as one big call.
pub trait KeystreamState: Send {
    fn apply(&mut self, buf: &mut [u8]);
}

/// Primitive operations required of a cryptographic provider.
pub trait CryptoProvider: Send + Sync {
    /// Start an incremental digest.
    fn digest_begin(&self) -> Box<dyn DigestState>;

    /// One-shot digest.
    fn hash(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut state = self.digest_begin();
        state.update(data);
        state.finalize()
    }

    /// Derive a subkey from key material and a context label.
    fn kdf(&self, key: &[u8; KEY_LEN], context: &[u8]) -> [u8; KEY_LEN] {
        let mut state = self.digest_begin();
        state.update(key);
        state.update(context);
        state.finalize()
    }

    /// Public signing key for a private seed.
    fn signing_public(&self, seed: &[u8; KEY_LEN]) -> [u8; KEY_LEN];

    /// Sign a digest with a private seed.
    fn sign(&self, seed: &[u8; KEY_LEN], digest: &[u8; DIGEST_LEN]) -> [u8; SIGNATURE_LEN];

    /// Verify a signature over a digest.
    fn verify(&self, public: &[u8; KEY_LEN], digest: &[u8; DIGEST_LEN], signature: &[u8]) -> bool;

    /// Public half of an exchange secret.
    fn exchange_public(&self, secret: &[u8; KEY_LEN]) -> [u8; KEY_LEN];

    /// Shared secret from our exchange secret and a peer's public half.
    fn agree(&self, secret: &[u8; KEY_LEN], peer: &[u8; KEY_LEN]) -> [u8; KEY_LEN];

    /// Start a keystream at position zero for (key, nonce).
    fn keystream(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Box<dyn KeystreamState>;

    /// Authenticated encryption; output is ciphertext followed by the tag.
    fn seal(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], plain: &[u8])
        -> Vec<u8>;

    /// Open a sealed box. Fails with `WrongPassword` on any tampering, since
    /// the sealed boxes in this crate all wrap key material.
    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Fill a buffer with cryptographically secure random bytes.
    fn random_bytes(&self, out: &mut [u8]);
}

/// Software provider over the crate's bundled algorithms.
pub struct SoftwareProvider;

impl SoftwareProvider {
    pub fn new() -> Self {
        SoftwareProvider
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        Self::new()
    }
}

struct Blake2bDigest(Blake2b256);

impl DigestState for Blake2bDigest {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> [u8; DIGEST_LEN] {
        self.0.finalize().into()
    }

    fn boxed_clone(&self) -> Box<dyn DigestState> {
        Box::new(Blake2bDigest(self.0.clone()))
    }
}

struct XChaChaKeystream(XChaCha20);

impl KeystreamState for XChaChaKeystream {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

impl CryptoProvider for SoftwareProvider {
    fn digest_begin(&self) -> Box<dyn DigestState> {
        Box::new(Blake2bDigest(Blake2b256::new()))
    }

    fn signing_public(&self, seed: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let key = ed25519_dalek::SigningKey::from_bytes(seed);
        key.verifying_key().to_bytes()
    }

    fn sign(&self, seed: &[u8; KEY_LEN], digest: &[u8; DIGEST_LEN]) -> [u8; SIGNATURE_LEN] {
        let key = ed25519_dalek::SigningKey::from_bytes(seed);
        key.sign(digest).to_bytes()
    }

    fn verify(&self, public: &[u8; KEY_LEN], digest: &[u8; DIGEST_LEN], signature: &[u8]) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(public) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        key.verify(digest, &signature).is_ok()
    }

    fn exchange_public(&self, secret: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let secret = x25519_dalek::StaticSecret::from(*secret);
        x25519_dalek::PublicKey::from(&secret).to_bytes()
    }

    fn agree(&self, secret: &[u8; KEY_LEN], peer: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let secret = x25519_dalek::StaticSecret::from(*secret);
        let peer = x25519_dalek::PublicKey::from(*peer);
        secret.diffie_hellman(&peer).to_bytes()
    }

    fn keystream(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Box<dyn KeystreamState> {
        Box::new(XChaChaKeystream(XChaCha20::new(key.into(), nonce.into())))
    }

    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plain: &[u8],
    ) -> Vec<u8> {
        let aead = XChaCha20Poly1305::new(key.into());
        // Only fails on plaintexts beyond the cipher's 256 GiB bound, far
        // past anything this API hands it in one piece.
        aead.encrypt(XNonce::from_slice(nonce), Payload { msg: plain, aad })
            .expect("AEAD encryption of in-memory data cannot fail")
    }

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aead = XChaCha20Poly1305::new(key.into());
        aead.decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::WrongPassword)
    }

    fn random_bytes(&self, out: &mut [u8]) {
        OsRng.fill_bytes(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_one_shot() {
        let p = SoftwareProvider::new();
        let mut state = p.digest_begin();
        state.update(b"hello ");
        state.update(b"world");
        assert_eq!(state.finalize(), p.hash(b"hello world"));
    }

    #[test]
    fn sign_and_verify() {
        let p = SoftwareProvider::new();
        let mut seed = [0u8; KEY_LEN];
        p.random_bytes(&mut seed);
        let public = p.signing_public(&seed);
        let digest = p.hash(b"payload");
        let sig = p.sign(&seed, &digest);
        assert!(p.verify(&public, &digest, &sig));
        assert!(!p.verify(&public, &p.hash(b"other payload"), &sig));
    }

    #[test]
    fn agreement_is_symmetric() {
        let p = SoftwareProvider::new();
        let mut a = [0u8; KEY_LEN];
        let mut b = [0u8; KEY_LEN];
        p.random_bytes(&mut a);
        p.random_bytes(&mut b);
        let shared_ab = p.agree(&a, &p.exchange_public(&b));
        let shared_ba = p.agree(&b, &p.exchange_public(&a));
        assert_eq!(shared_ab, shared_ba);
    }

    #[test]
    fn keystream_split_invariant() {
        let p = SoftwareProvider::new();
        let key = [7u8; KEY_LEN];
        let nonce = [9u8; NONCE_LEN];
        let mut whole = vec![0x5au8; 100];
        p.keystream(&key, &nonce).apply(&mut whole);

        let mut split = vec![0x5au8; 100];
        let mut ks = p.keystream(&key, &nonce);
        let (head, tail) = split.split_at_mut(33);
        ks.apply(head);
        ks.apply(tail);
        assert_eq!(whole, split);
    }

    #[test]
    fn seal_open_round_trip() {
        let p = SoftwareProvider::new();
        let key = [1u8; KEY_LEN];
        let nonce = [2u8; NONCE_LEN];
        let sealed = p.seal(&key, &nonce, b"aad", b"secret");
        assert_eq!(sealed.len(), 6 + TAG_LEN);
        assert_eq!(p.open(&key, &nonce, b"aad", &sealed).unwrap(), b"secret");
        assert!(p.open(&key, &nonce, b"bad aad", &sealed).is_err());
    }
}
