//! Session contexts.
//!
//! A [`SessionContext`] is the root resource: it owns the provider, the
//! handle table every other resource lives in, the GK/UZ provider key
//! material, and the seeded random source. All key, hash, container, and
//! streaming operations hang off a live session; dropping or
//! [`uninit`](SessionContext::uninit)-ing the session zeroizes its key
//! material and tears down every child handle with it.
//!
//! Every mutating operation takes `&mut self`, so two operations can never
//! run concurrently against one session: the borrow checker enforces the
//! serialization the underlying providers require. Distinct sessions are
//! fully independent.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::handle::HandleTable;
use crate::provider::{CryptoProvider, SoftwareProvider, KEY_LEN, NONCE_LEN, TAG_LEN};

/// GK blob: magic, salt, nonce, sealed 32-byte key.
const GK_MAGIC: &[u8; 4] = b"GKF1";
const GK_SALT_LEN: usize = 16;
const GK_BLOB_LEN: usize = 4 + GK_SALT_LEN + NONCE_LEN + KEY_LEN + TAG_LEN;

/// Length of the substitution-node table.
pub const UZ_LEN: usize = 64;
/// Length of the random-source seed.
pub const SEED_LEN: usize = 64;

// Built-in substitution nodes, used when a session is initialized without
// its own UZ carrier.
const DEFAULT_UZ: [u8; UZ_LEN] = [
    0x4e, 0xc9, 0x03, 0x7a, 0xb1, 0x26, 0xd8, 0x65, 0x0f, 0x92, 0x5c, 0xe1, 0x38, 0xaf, 0x74, 0x1b,
    0x86, 0x2d, 0xf0, 0x59, 0xc4, 0x13, 0xea, 0x07, 0xb8, 0x41, 0x9e, 0x6c, 0x25, 0xd3, 0x50, 0xff,
    0x1a, 0x87, 0x3e, 0xc5, 0x62, 0xf9, 0x0c, 0xb3, 0x48, 0xd1, 0x76, 0x2f, 0xe8, 0x95, 0x0a, 0x53,
    0xcc, 0x31, 0xbe, 0x67, 0x04, 0x9b, 0x58, 0xe5, 0x12, 0xa9, 0x7e, 0xc3, 0x30, 0x8d, 0x46, 0xdb,
];

/// How the session is bound to a hardware token carrier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TokenBinding {
    /// No token involved.
    #[default]
    None,
    /// A token is required; `None` inside means the binding was demanded but
    /// no carrier is attached, which fails session init.
    Required(Option<PathBuf>),
}

/// Configuration for [`SessionContext::init`].
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Path to a wrapped GK blob. A fresh session-local GK is generated
    /// when absent.
    pub gk_path: Option<PathBuf>,
    /// Path to a 64-byte substitution-node table. The built-in table is
    /// used when absent.
    pub uz_path: Option<PathBuf>,
    /// Password unwrapping the GK blob. Treated as empty when absent.
    pub password: Option<String>,
    /// Hardware-token binding.
    pub token: TokenBinding,
    /// Path to a previously persisted random seed.
    pub seed_path: Option<PathBuf>,
}

/// Observes progress of long file operations. Invoked synchronously on the
/// caller's thread; purely informational and never required for
/// correctness.
pub trait ProgressSink {
    fn progress(&mut self, done: u64, total: u64);
}

/// The root handle: provider configuration, key material, random source,
/// and the table of all child resources.
pub struct SessionContext {
    pub(crate) provider: Arc<dyn CryptoProvider>,
    pub(crate) table: HandleTable,
    pub(crate) gk: Zeroizing<[u8; KEY_LEN]>,
    uz: Zeroizing<[u8; UZ_LEN]>,
    pub(crate) master_key: Option<Zeroizing<[u8; KEY_LEN]>>,
    seed: Zeroizing<[u8; SEED_LEN]>,
    counter: u64,
    progress: Option<Box<dyn ProgressSink>>,
    #[allow(dead_code)]
    token: Option<PathBuf>,
}

impl SessionContext {
    /// Initialize a session with the default software provider.
    pub fn init(config: SessionConfig) -> Result<SessionContext, CryptoError> {
        Self::init_with_provider(config, Arc::new(SoftwareProvider::new()))
    }

    /// Initialize a session with a caller-supplied provider.
    pub fn init_with_provider(
        config: SessionConfig,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<SessionContext, CryptoError> {
        let token = match config.token {
            TokenBinding::None => None,
            TokenBinding::Required(Some(path)) => Some(path),
            TokenBinding::Required(None) => {
                return Err(CryptoError::Device("token required but not attached"));
            }
        };

        let uz = match &config.uz_path {
            Some(path) => {
                let raw = fs::read(path).map_err(|_| CryptoError::MaskInit)?;
                parse_uz(&raw)?
            }
            None => DEFAULT_UZ,
        };

        let password = config.password.as_deref().unwrap_or("");
        let gk = match &config.gk_path {
            Some(path) => {
                let blob = fs::read(path)?;
                unwrap_gk(provider.as_ref(), &blob, password)?
            }
            None => {
                let mut gk = [0u8; KEY_LEN];
                provider.random_bytes(&mut gk);
                gk
            }
        };

        let seed = match &config.seed_path {
            Some(path) => {
                let raw = fs::read(path)?;
                parse_seed(&raw)?
            }
            None => {
                let mut seed = [0u8; SEED_LEN];
                provider.random_bytes(&mut seed);
                seed
            }
        };

        Ok(SessionContext {
            provider,
            table: HandleTable::new(),
            gk: Zeroizing::new(gk),
            uz: Zeroizing::new(uz),
            master_key: None,
            seed: Zeroizing::new(seed),
            counter: 0,
            progress: None,
            token,
        })
    }

    /// Initialize from in-memory GK and UZ blobs instead of files. Same
    /// success and failure semantics as [`init`](Self::init).
    pub fn init_from_buffer(
        gk_blob: &[u8],
        uz: &[u8],
        password: &str,
        config: SessionConfig,
    ) -> Result<SessionContext, CryptoError> {
        let provider: Arc<dyn CryptoProvider> = Arc::new(SoftwareProvider::new());
        let token = match config.token {
            TokenBinding::None => None,
            TokenBinding::Required(Some(path)) => Some(path),
            TokenBinding::Required(None) => {
                return Err(CryptoError::Device("token required but not attached"));
            }
        };
        let uz = parse_uz(uz)?;
        let gk = unwrap_gk(provider.as_ref(), gk_blob, password)?;
        let mut seed = [0u8; SEED_LEN];
        provider.random_bytes(&mut seed);
        Ok(SessionContext {
            provider,
            table: HandleTable::new(),
            gk: Zeroizing::new(gk),
            uz: Zeroizing::new(uz),
            master_key: None,
            seed: Zeroizing::new(seed),
            counter: 0,
            progress: None,
            token,
        })
    }

    /// Tear the session down. Key material is zeroized and every child
    /// handle dies with the table; the consuming signature makes any later
    /// use a compile error rather than a runtime one.
    pub fn uninit(self) {}

    /// Export the session's GK wrapped under a password, suitable for a
    /// later [`init`](Self::init) via `gk_path` or
    /// [`init_from_buffer`](Self::init_from_buffer).
    pub fn export_gk(&self, password: &str) -> Vec<u8> {
        wrap_gk(self.provider.as_ref(), &self.gk, password)
    }

    /// Generate a fresh master key. Returns the raw key and a copy wrapped
    /// under the session GK.
    pub fn generate_master_key(&mut self) -> ([u8; KEY_LEN], Vec<u8>) {
        let mut mk = [0u8; KEY_LEN];
        self.provider.random_bytes(&mut mk);
        let wrapped = self.wrap_under_carrier_key(&mk);
        (mk, wrapped)
    }

    /// Install a master key for `*_mk` key-pair operations.
    pub fn install_master_key(&mut self, master_key: &[u8; KEY_LEN]) {
        self.master_key = Some(Zeroizing::new(*master_key));
    }

    /// The installed master key, if any.
    pub(crate) fn master_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.master_key.as_deref()
    }

    /// Re-seed the random source from the operating system, optionally
    /// persisting the new seed to a file.
    pub fn seed_random(&mut self, path: Option<&Path>) -> Result<(), CryptoError> {
        let mut seed = [0u8; SEED_LEN];
        self.provider.random_bytes(&mut seed);
        if let Some(path) = path {
            fs::write(path, seed)?;
        }
        self.seed = Zeroizing::new(seed);
        self.counter = 0;
        Ok(())
    }

    /// Persist the evolved random seed so a later session can resume from
    /// it.
    pub fn persist_random(&mut self, path: &Path) -> Result<(), CryptoError> {
        let evolved = self.evolve_seed();
        fs::write(path, evolved.as_slice())?;
        Ok(())
    }

    /// Produce 32 random bytes from the session's seeded generator.
    pub fn random32(&mut self) -> [u8; KEY_LEN] {
        let mut state = self.provider.digest_begin();
        state.update(self.seed.as_slice());
        state.update(&self.counter.to_le_bytes());
        self.counter += 1;
        state.finalize()
    }

    fn evolve_seed(&mut self) -> Zeroizing<[u8; SEED_LEN]> {
        let half_a = self.random32();
        let half_b = self.random32();
        let mut out = Zeroizing::new([0u8; SEED_LEN]);
        out[..KEY_LEN].copy_from_slice(&half_a);
        out[KEY_LEN..].copy_from_slice(&half_b);
        out
    }

    /// Install (or clear) the progress sink for long file operations.
    pub fn set_progress_sink(&mut self, sink: Option<Box<dyn ProgressSink>>) {
        self.progress = sink;
    }

    pub(crate) fn report_progress(&mut self, done: u64, total: u64) {
        if let Some(sink) = self.progress.as_mut() {
            sink.progress(done, total);
        }
    }

    /// Session-local wrapping key for key files on disk, bound to both the
    /// GK and the loaded substitution nodes.
    pub(crate) fn carrier_key(&self) -> [u8; KEY_LEN] {
        let mut state = self.provider.digest_begin();
        state.update(self.gk.as_slice());
        state.update(self.uz.as_slice());
        state.update(b"krypta.carrier");
        state.finalize()
    }

    pub(crate) fn wrap_under_carrier_key(&mut self, key: &[u8; KEY_LEN]) -> Vec<u8> {
        let carrier_key = self.carrier_key();
        let mut nonce = [0u8; NONCE_LEN];
        self.provider.random_bytes(&mut nonce);
        let sealed = self.provider.seal(&carrier_key, &nonce, b"mk", key);
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        out
    }

    pub(crate) fn unwrap_under_carrier_key(
        &self,
        blob: &[u8],
    ) -> Result<[u8; KEY_LEN], CryptoError> {
        if blob.len() != NONCE_LEN + KEY_LEN + TAG_LEN {
            return Err(CryptoError::BadLength {
                step: "unwrap master key",
                expected: NONCE_LEN + KEY_LEN + TAG_LEN,
                actual: blob.len(),
            });
        }
        let carrier_key = self.carrier_key();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[..NONCE_LEN]);
        let plain = self
            .provider
            .open(&carrier_key, &nonce, b"mk", &blob[NONCE_LEN..])?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&plain);
        Ok(key)
    }
}

fn parse_uz(raw: &[u8]) -> Result<[u8; UZ_LEN], CryptoError> {
    if raw.len() != UZ_LEN {
        return Err(CryptoError::MaskInit);
    }
    // A substitution table that is one repeated byte is a scrubbed or blank
    // carrier, not a table.
    if raw.iter().all(|&b| b == raw[0]) {
        return Err(CryptoError::MaskInit);
    }
    let mut uz = [0u8; UZ_LEN];
    uz.copy_from_slice(raw);
    Ok(uz)
}

fn parse_seed(raw: &[u8]) -> Result<[u8; SEED_LEN], CryptoError> {
    if raw.len() != SEED_LEN {
        return Err(CryptoError::BadLength {
            step: "load random seed",
            expected: SEED_LEN,
            actual: raw.len(),
        });
    }
    let mut seed = [0u8; SEED_LEN];
    seed.copy_from_slice(raw);
    Ok(seed)
}

fn wrap_gk(provider: &dyn CryptoProvider, gk: &[u8; KEY_LEN], password: &str) -> Vec<u8> {
    let mut salt = [0u8; GK_SALT_LEN];
    provider.random_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    provider.random_bytes(&mut nonce);
    let wrap_key = password_key(provider, &salt, password);
    let mut out = Vec::with_capacity(GK_BLOB_LEN);
    out.extend_from_slice(GK_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    let sealed = provider.seal(&wrap_key, &nonce, GK_MAGIC, gk);
    out.extend_from_slice(&sealed);
    out
}

fn unwrap_gk(
    provider: &dyn CryptoProvider,
    blob: &[u8],
    password: &str,
) -> Result<[u8; KEY_LEN], CryptoError> {
    if blob.len() != GK_BLOB_LEN {
        return Err(CryptoError::BadLength {
            step: "read GK blob",
            expected: GK_BLOB_LEN,
            actual: blob.len(),
        });
    }
    if &blob[..4] != GK_MAGIC {
        return Err(CryptoError::BadFormat("GK blob magic"));
    }
    let mut salt = [0u8; GK_SALT_LEN];
    salt.copy_from_slice(&blob[4..4 + GK_SALT_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&blob[4 + GK_SALT_LEN..4 + GK_SALT_LEN + NONCE_LEN]);
    let wrap_key = password_key(provider, &salt, password);
    let plain = provider.open(
        &wrap_key,
        &nonce,
        GK_MAGIC,
        &blob[4 + GK_SALT_LEN + NONCE_LEN..],
    )?;
    let mut gk = [0u8; KEY_LEN];
    gk.copy_from_slice(&plain);
    Ok(gk)
}

pub(crate) fn password_key(
    provider: &dyn CryptoProvider,
    salt: &[u8],
    password: &str,
) -> [u8; KEY_LEN] {
    let mut state = provider.digest_begin();
    state.update(salt);
    state.update(password.as_bytes());
    state.finalize()
}

#[cfg(test)]
pub(crate) fn test_session() -> SessionContext {
    SessionContext::init(SessionConfig::default()).unwrap()
}
