//! Key pairs and their carriers.
//!
//! A key pair is a private signing seed, a derived exchange secret, and a
//! bounded user id. Key pairs travel in a fixed 128-byte carrier record,
//! wrapped under either a password or a master key:
//!
//! ```text
//! +-------+-------+----------+------+-------+------------------+-----+
//! | Magic | Flags | User id  | Salt | Nonce | Sealed seed      | CRC |
//! | KPC1  | u16   | 32 bytes | 16   | 24    | 32 + 16 tag      | u16 |
//! +-------+-------+----------+------+-------+------------------+-----+
//! ```
//!
//! The CRC-16 covers everything before it. A carrier can hold two records:
//! the primary at offset 0 and a secondary at offset 128. The secondary
//! slot is how a replacement key is staged on a small hardware carrier
//! before being promoted over the primary.
//!
//! Closing a key pair zeroizes the seed and exchange secret before the
//! handle is released.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::container::crc16;
use crate::error::CryptoError;
use crate::handle::{KeyPairHandle, Resource};
use crate::provider::{CryptoProvider, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::session::{password_key, SessionContext};

/// Maximum length of a user id, in bytes.
pub const MAX_USER_ID_LEN: usize = 32;

/// Size of one key carrier record.
pub const KEY_RECORD_LEN: usize = 128;
/// Offset of the secondary key slot within a carrier.
pub const SECONDARY_SLOT_OFFSET: usize = 128;

/// Size of an exported public-key block.
pub const PUBLIC_KEY_BLOCK_LEN: usize = 256;
/// Bytes of a public-key block meant for display; the rest is
/// verification-only auxiliary data.
pub const PUBLIC_KEY_DISPLAY_LEN: usize = 64;

const CARRIER_MAGIC: &[u8; 4] = b"KPC1";
const FLAG_MASTER_KEY_WRAP: u16 = 0x0001;

const OFF_FLAGS: usize = 4;
const OFF_UID: usize = 6;
const OFF_SALT: usize = OFF_UID + MAX_USER_ID_LEN;
const OFF_NONCE: usize = OFF_SALT + 16;
const OFF_SEALED: usize = OFF_NONCE + NONCE_LEN;
const OFF_CRC: usize = OFF_SEALED + KEY_LEN + TAG_LEN;

/// Which of a carrier's two record slots an operation targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeySlot {
    #[default]
    Primary,
    Secondary,
}

impl KeySlot {
    fn offset(self) -> usize {
        match self {
            KeySlot::Primary => 0,
            KeySlot::Secondary => SECONDARY_SLOT_OFFSET,
        }
    }
}

/// The secret wrapping a carrier record.
#[derive(Clone, Copy)]
pub enum KeyWrap<'a> {
    Password(&'a str),
    MasterKey(&'a [u8; KEY_LEN]),
}

/// An exported public key: a 64-byte display prefix (signing key followed
/// by exchange key) plus 192 bytes of auxiliary data that is derived from
/// the prefix and re-checked on import.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyBlock([u8; PUBLIC_KEY_BLOCK_LEN]);

impl PublicKeyBlock {
    pub(crate) fn from_keys(
        provider: &dyn CryptoProvider,
        signing: &[u8; KEY_LEN],
        exchange: &[u8; KEY_LEN],
    ) -> PublicKeyBlock {
        let mut block = [0u8; PUBLIC_KEY_BLOCK_LEN];
        block[..KEY_LEN].copy_from_slice(signing);
        block[KEY_LEN..2 * KEY_LEN].copy_from_slice(exchange);
        fill_aux(provider, &mut block);
        PublicKeyBlock(block)
    }

    /// Import a block, re-deriving and checking the auxiliary bytes.
    pub fn decode(provider: &dyn CryptoProvider, raw: &[u8]) -> Result<PublicKeyBlock, CryptoError> {
        if raw.len() != PUBLIC_KEY_BLOCK_LEN {
            return Err(CryptoError::BadLength {
                step: "decode public key block",
                expected: PUBLIC_KEY_BLOCK_LEN,
                actual: raw.len(),
            });
        }
        let mut block = [0u8; PUBLIC_KEY_BLOCK_LEN];
        block.copy_from_slice(raw);
        let mut expected = block;
        fill_aux(provider, &mut expected);
        if expected[PUBLIC_KEY_DISPLAY_LEN..] != block[PUBLIC_KEY_DISPLAY_LEN..] {
            return Err(CryptoError::BadFormat("public key block auxiliary data"));
        }
        Ok(PublicKeyBlock(block))
    }

    /// The leading bytes meant for human display or printing.
    pub fn display_prefix(&self) -> &[u8] {
        &self.0[..PUBLIC_KEY_DISPLAY_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BLOCK_LEN] {
        &self.0
    }

    pub(crate) fn signing_key(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&self.0[..KEY_LEN]);
        key
    }

    pub(crate) fn exchange_key(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&self.0[KEY_LEN..2 * KEY_LEN]);
        key
    }
}

impl fmt::Debug for PublicKeyBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKeyBlock {{ display: {:x?} }}", self.display_prefix())
    }
}

impl fmt::Display for PublicKeyBlock {
    /// Displays only the display prefix, as hex.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.display_prefix() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

fn fill_aux(provider: &dyn CryptoProvider, block: &mut [u8; PUBLIC_KEY_BLOCK_LEN]) {
    let mut display = [0u8; PUBLIC_KEY_DISPLAY_LEN];
    display.copy_from_slice(&block[..PUBLIC_KEY_DISPLAY_LEN]);
    let mut offset = PUBLIC_KEY_DISPLAY_LEN;
    let mut round = 0u8;
    while offset < PUBLIC_KEY_BLOCK_LEN {
        let mut state = provider.digest_begin();
        state.update(&display);
        state.update(&[round]);
        let chunk = state.finalize();
        let take = chunk.len().min(PUBLIC_KEY_BLOCK_LEN - offset);
        block[offset..offset + take].copy_from_slice(&chunk[..take]);
        offset += take;
        round += 1;
    }
}

/// Private half of a key pair, held in the session table.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyPairState {
    #[zeroize(skip)]
    pub user_id: String,
    pub seed: [u8; KEY_LEN],
    pub exchange: [u8; KEY_LEN],
}

impl KeyPairState {
    pub fn public_block(&self, provider: &dyn CryptoProvider) -> PublicKeyBlock {
        PublicKeyBlock::from_keys(
            provider,
            &provider.signing_public(&self.seed),
            &provider.exchange_public(&self.exchange),
        )
    }
}

pub(crate) fn check_user_id(user_id: &str) -> Result<(), CryptoError> {
    if user_id.is_empty()
        || user_id.len() > MAX_USER_ID_LEN
        || !user_id.bytes().all(|b| (0x20..0x7f).contains(&b))
    {
        return Err(CryptoError::BadUser);
    }
    Ok(())
}

impl SessionContext {
    /// Generate a fresh key pair, wrapped under a password. Returns the
    /// handle and the carrier bytes. A secondary-slot request produces a
    /// 256-byte carrier with the record at offset 128.
    pub fn generate_key_pair(
        &mut self,
        password: &str,
        user_id: Option<&str>,
        slot: KeySlot,
    ) -> Result<(KeyPairHandle, Vec<u8>), CryptoError> {
        let salt = {
            let mut salt = [0u8; 16];
            self.provider.random_bytes(&mut salt);
            salt
        };
        let wrap_key = password_key(self.provider.as_ref(), &salt, password);
        self.generate_inner(wrap_key, salt, 0, user_id, slot)
    }

    /// Generate a fresh key pair wrapped under a master key instead of a
    /// password.
    pub fn generate_key_pair_mk(
        &mut self,
        master_key: &[u8; KEY_LEN],
        user_id: Option<&str>,
        slot: KeySlot,
    ) -> Result<(KeyPairHandle, Vec<u8>), CryptoError> {
        let salt = {
            let mut salt = [0u8; 16];
            self.provider.random_bytes(&mut salt);
            salt
        };
        let wrap_key = self.provider.kdf(master_key, &salt);
        self.generate_inner(wrap_key, salt, FLAG_MASTER_KEY_WRAP, user_id, slot)
    }

    fn generate_inner(
        &mut self,
        wrap_key: [u8; KEY_LEN],
        salt: [u8; 16],
        flags: u16,
        user_id: Option<&str>,
        slot: KeySlot,
    ) -> Result<(KeyPairHandle, Vec<u8>), CryptoError> {
        let user_id = match user_id {
            Some(id) => {
                check_user_id(id)?;
                id.to_string()
            }
            None => {
                let r = self.random32();
                format!("key-{:02x}{:02x}{:02x}{:02x}", r[0], r[1], r[2], r[3])
            }
        };

        let seed = self.random32();
        let exchange = self.provider.kdf(&seed, b"krypta.exchange");

        let mut record = vec![0u8; KEY_RECORD_LEN];
        record[..4].copy_from_slice(CARRIER_MAGIC);
        LittleEndian::write_u16(&mut record[OFF_FLAGS..OFF_UID], flags);
        record[OFF_UID..OFF_UID + user_id.len()].copy_from_slice(user_id.as_bytes());
        record[OFF_SALT..OFF_NONCE].copy_from_slice(&salt);
        let mut nonce = [0u8; NONCE_LEN];
        self.provider.random_bytes(&mut nonce);
        record[OFF_NONCE..OFF_SEALED].copy_from_slice(&nonce);
        let sealed = {
            let aad = record[..OFF_SEALED].to_vec();
            self.provider.seal(&wrap_key, &nonce, &aad, &seed)
        };
        record[OFF_SEALED..OFF_CRC].copy_from_slice(&sealed);
        let crc = crc16(&record[..OFF_CRC]);
        LittleEndian::write_u16(&mut record[OFF_CRC..], crc);

        let carrier = match slot {
            KeySlot::Primary => record,
            KeySlot::Secondary => {
                let mut carrier = vec![0u8; SECONDARY_SLOT_OFFSET + KEY_RECORD_LEN];
                carrier[SECONDARY_SLOT_OFFSET..].copy_from_slice(&record);
                carrier
            }
        };

        let state = KeyPairState {
            user_id,
            seed,
            exchange,
        };
        let handle = KeyPairHandle(self.table.insert(Resource::KeyPair(state)));
        Ok((handle, carrier))
    }

    /// Load a key pair from a carrier record. Checks, in order: the record
    /// CRC, the embedded user id, and finally the wrap itself.
    pub fn load_key_pair(
        &mut self,
        wrap: KeyWrap,
        carrier: &[u8],
        slot: KeySlot,
    ) -> Result<KeyPairHandle, CryptoError> {
        let offset = slot.offset();
        if carrier.len() < offset + KEY_RECORD_LEN {
            return Err(CryptoError::BadLength {
                step: "read key carrier",
                expected: offset + KEY_RECORD_LEN,
                actual: carrier.len(),
            });
        }
        let record = &carrier[offset..offset + KEY_RECORD_LEN];

        let expected = LittleEndian::read_u16(&record[OFF_CRC..]);
        let actual = crc16(&record[..OFF_CRC]);
        if expected != actual {
            return Err(CryptoError::BadCrc { expected, actual });
        }
        if &record[..4] != CARRIER_MAGIC {
            return Err(CryptoError::BadFormat("key carrier magic"));
        }
        let flags = LittleEndian::read_u16(&record[OFF_FLAGS..OFF_UID]);

        let uid_field = &record[OFF_UID..OFF_UID + MAX_USER_ID_LEN];
        let uid_len = uid_field.iter().position(|&b| b == 0).unwrap_or(MAX_USER_ID_LEN);
        let user_id = std::str::from_utf8(&uid_field[..uid_len])
            .map_err(|_| CryptoError::BadUser)?
            .to_string();
        check_user_id(&user_id)?;

        let salt = &record[OFF_SALT..OFF_NONCE];
        let wrap_key = match wrap {
            KeyWrap::Password(password) => {
                if flags & FLAG_MASTER_KEY_WRAP != 0 {
                    return Err(CryptoError::WrongPassword);
                }
                password_key(self.provider.as_ref(), salt, password)
            }
            KeyWrap::MasterKey(mk) => {
                if flags & FLAG_MASTER_KEY_WRAP == 0 {
                    return Err(CryptoError::WrongPassword);
                }
                self.provider.kdf(mk, salt)
            }
        };

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&record[OFF_NONCE..OFF_SEALED]);
        let plain = self.provider.open(
            &wrap_key,
            &nonce,
            &record[..OFF_SEALED],
            &record[OFF_SEALED..OFF_CRC],
        )?;
        let mut seed = [0u8; KEY_LEN];
        seed.copy_from_slice(&plain);
        let exchange = self.provider.kdf(&seed, b"krypta.exchange");

        let state = KeyPairState {
            user_id,
            seed,
            exchange,
        };
        Ok(KeyPairHandle(self.table.insert(Resource::KeyPair(state))))
    }

    /// Load a key pair wrapped under the session's installed master key.
    /// Fails with `NoKey` if no master key is installed.
    pub fn load_key_pair_installed_mk(
        &mut self,
        carrier: &[u8],
        slot: KeySlot,
    ) -> Result<KeyPairHandle, CryptoError> {
        let mk = *self.master_key().ok_or(CryptoError::NoKey)?;
        self.load_key_pair(KeyWrap::MasterKey(&mk), carrier, slot)
    }

    /// Zeroize and release a key pair. A second close fails with
    /// `BadHandle`.
    pub fn close_key_pair(&mut self, handle: KeyPairHandle) -> Result<(), CryptoError> {
        // Dropping the state zeroizes the seed and exchange secret.
        self.table.take_key_pair(handle).map(drop)
    }

    /// The user id bound to a key pair.
    pub fn key_pair_id(&self, handle: KeyPairHandle) -> Result<&str, CryptoError> {
        Ok(&self.table.key_pair(handle)?.user_id)
    }

    /// Export the public half of a key pair as a 256-byte block.
    pub fn public_key_block(&self, handle: KeyPairHandle) -> Result<PublicKeyBlock, CryptoError> {
        let state = self.table.key_pair(handle)?;
        Ok(state.public_block(self.provider.as_ref()))
    }
}

/// Promote a carrier's secondary record over its primary, destroying the
/// old primary. No validity check is made; load the key afterwards to
/// verify it.
pub fn promote_secondary(carrier: &mut [u8]) -> Result<(), CryptoError> {
    if carrier.len() < SECONDARY_SLOT_OFFSET + KEY_RECORD_LEN {
        return Err(CryptoError::BadLength {
            step: "promote secondary key",
            expected: SECONDARY_SLOT_OFFSET + KEY_RECORD_LEN,
            actual: carrier.len(),
        });
    }
    let (primary, rest) = carrier.split_at_mut(SECONDARY_SLOT_OFFSET);
    primary[..KEY_RECORD_LEN].copy_from_slice(&rest[..KEY_RECORD_LEN]);
    rest[..KEY_RECORD_LEN].zeroize();
    Ok(())
}
