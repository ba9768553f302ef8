/*!
Handle-based cryptographic sessions: key management, signing, payload
encryption, and authenticated channels, all driven through a `SessionContext`.

A session is initialized from a wrapped group key and a substitution-node
table, or generated fresh for standalone use. Every other resource a caller
works with (key pairs, public-key directories, hash contexts, network
keyrings, streaming operation contexts, handshake contexts) lives inside the
session and is addressed by a typed, generation-tagged handle. A closed
handle stays dead forever: resolving it fails with `BadHandle` even after
its slot is reused.

# Cryptographic Algorithms Used

The default software provider uses:

- Hashing: Blake2b with a 32-byte digest
- Signing: Ed25519
- Symmetric encryption: XChaCha20 keystream for bulk payloads, with an AEAD
  cipher using XChaCha20 and Poly1305 for key carriers, keyring files, and
  channel records
- DH key exchange: X25519

All of them sit behind the [`CryptoProvider`] trait, so a hardware-backed
provider can replace the software one without touching the session API.

# Example

```
# use krypta::{SessionConfig, SessionContext, KeySlot};
# fn main() -> Result<(), krypta::CryptoError> {
let mut session = SessionContext::init(SessionConfig::default())?;

// Generate a password-wrapped key pair and publish its public half.
let (key, _carrier) = session.generate_key_pair("correct horse", Some("alice"), KeySlot::Primary)?;
let dir = session.open_directory(true);
let block = session.public_key_block(key)?;
session.dir_add(dir, "alice", block, "example key")?;

// Sign a payload, then verify the container against the directory.
let sealed = session.sign_buffer(key, b"attack at dawn")?;
let results = session.check_buffer(dir, &sealed)?;
assert!(results.iter().all(|r| r.status == krypta::SignerStatus::Ok));
# Ok(())
# }
```
*/

mod error;
pub use self::error::{CertificateError, CryptoError};

mod handle;
pub use self::handle::{
    CheckOpHandle, DecryptOpHandle, DirHandle, EncryptOpHandle, HashHandle, KeyPairHandle,
    NetKeyHandle, ResourceKind, SignOpHandle, TlsHandle,
};

pub mod provider;
pub use self::provider::{CryptoProvider, SoftwareProvider};

mod session;
pub use self::session::{ProgressSink, SessionConfig, SessionContext, TokenBinding};

pub mod keystore;
pub use self::keystore::{promote_secondary, KeySlot, KeyWrap, PublicKeyBlock};

pub mod directory;
pub use self::directory::DirectoryEntry;

mod hash;

pub mod container;
pub use self::container::SignatureRecord;

pub mod netkey;

pub mod ops;
pub use self::ops::{SignerResult, SignerStatus, MAX_COSIGNERS};

pub mod cert;
pub use self::cert::Certificate;

pub mod tls;
pub use self::tls::ServerAuth;

pub mod compress;
pub use self::compress::{Compressor, Decompressor};
