//! Certificates binding user ids to public-key blocks.
//!
//! A certificate carries a subject id, the subject's public-key block, the
//! issuer's id, and an expiry time, signed by the issuer over all of it. A
//! chain is a leaf followed by the certificates of successive issuers and
//! must end in a self-signed root whose block is present in the trust
//! directory. Serialized form:
//!
//! ```text
//! +-------+---------+-------+-----------+-----------+-----------+-----+
//! | Magic | Subject | Block | Issuer id | Not after | Signature | CRC |
//! | CRT1  | 32      | 256   | 32        | u64       | 64        | u16 |
//! +-------+---------+-------+-----------+-----------+-----------+-----+
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::container::crc16;
use crate::error::{CertificateError, CryptoError};
use crate::handle::{DirHandle, KeyPairHandle};
use crate::keystore::{check_user_id, PublicKeyBlock, MAX_USER_ID_LEN, PUBLIC_KEY_BLOCK_LEN};
use crate::provider::{CryptoProvider, SIGNATURE_LEN};
use crate::session::SessionContext;

const CERT_MAGIC: &[u8; 4] = b"CRT1";

/// Serialized certificate size.
pub const CERT_LEN: usize =
    4 + MAX_USER_ID_LEN + PUBLIC_KEY_BLOCK_LEN + MAX_USER_ID_LEN + 8 + SIGNATURE_LEN + 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub user_id: String,
    pub block: PublicKeyBlock,
    pub issuer_id: String,
    /// Expiry, seconds since the Unix epoch.
    pub not_after: u64,
    signature: [u8; SIGNATURE_LEN],
}

fn uid_field(user_id: &str) -> [u8; MAX_USER_ID_LEN] {
    let mut field = [0u8; MAX_USER_ID_LEN];
    field[..user_id.len()].copy_from_slice(user_id.as_bytes());
    field
}

fn parse_uid_field(field: &[u8]) -> Result<String, CryptoError> {
    let len = field.iter().position(|&b| b == 0).unwrap_or(MAX_USER_ID_LEN);
    let user_id = std::str::from_utf8(&field[..len])
        .map_err(|_| CryptoError::BadUser)?
        .to_string();
    check_user_id(&user_id)?;
    Ok(user_id)
}

impl Certificate {
    /// The digest the issuer signs: every field except the signature.
    fn signed_digest(
        provider: &dyn CryptoProvider,
        user_id: &str,
        block: &PublicKeyBlock,
        issuer_id: &str,
        not_after: u64,
    ) -> [u8; 32] {
        let mut state = provider.digest_begin();
        state.update(&uid_field(user_id));
        state.update(block.as_bytes());
        state.update(&uid_field(issuer_id));
        state.update(&not_after.to_le_bytes());
        state.finalize()
    }

    /// True if `issuer_block` signed this certificate.
    pub fn issued_by(&self, provider: &dyn CryptoProvider, issuer_block: &PublicKeyBlock) -> bool {
        let digest = Self::signed_digest(
            provider,
            &self.user_id,
            &self.block,
            &self.issuer_id,
            self.not_after,
        );
        provider.verify(&issuer_block.signing_key(), &digest, &self.signature)
    }

    pub fn is_self_signed(&self) -> bool {
        self.user_id == self.issuer_id
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CERT_LEN);
        out.extend_from_slice(CERT_MAGIC);
        out.extend_from_slice(&uid_field(&self.user_id));
        out.extend_from_slice(self.block.as_bytes());
        out.extend_from_slice(&uid_field(&self.issuer_id));
        out.extend_from_slice(&self.not_after.to_le_bytes());
        out.extend_from_slice(&self.signature);
        let crc = crc16(&out);
        let mut trailer = [0u8; 2];
        LittleEndian::write_u16(&mut trailer, crc);
        out.extend_from_slice(&trailer);
        out
    }

    pub fn decode(provider: &dyn CryptoProvider, raw: &[u8]) -> Result<Certificate, CryptoError> {
        if raw.len() != CERT_LEN {
            return Err(CryptoError::BadLength {
                step: "decode certificate",
                expected: CERT_LEN,
                actual: raw.len(),
            });
        }
        let (body, crc_bytes) = raw.split_at(CERT_LEN - 2);
        let expected = LittleEndian::read_u16(crc_bytes);
        let actual = crc16(body);
        if expected != actual {
            return Err(CryptoError::BadCrc { expected, actual });
        }
        if &body[..4] != CERT_MAGIC {
            return Err(CryptoError::BadFormat("certificate magic"));
        }
        let mut at = 4;
        let user_id = parse_uid_field(&body[at..at + MAX_USER_ID_LEN])?;
        at += MAX_USER_ID_LEN;
        let block = PublicKeyBlock::decode(provider, &body[at..at + PUBLIC_KEY_BLOCK_LEN])?;
        at += PUBLIC_KEY_BLOCK_LEN;
        let issuer_id = parse_uid_field(&body[at..at + MAX_USER_ID_LEN])?;
        at += MAX_USER_ID_LEN;
        let not_after = LittleEndian::read_u64(&body[at..at + 8]);
        at += 8;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&body[at..at + SIGNATURE_LEN]);
        Ok(Certificate {
            user_id,
            block,
            issuer_id,
            not_after,
            signature,
        })
    }
}

/// Seconds since the Unix epoch, saturating at zero on a pre-epoch clock.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SessionContext {
    /// Issue a certificate for a subject block, signed by `issuer`.
    pub fn issue_certificate(
        &mut self,
        issuer: KeyPairHandle,
        subject_id: &str,
        subject_block: PublicKeyBlock,
        not_after: u64,
    ) -> Result<Certificate, CryptoError> {
        check_user_id(subject_id)?;
        let state = self.table.key_pair(issuer)?;
        let issuer_id = state.user_id.clone();
        let digest = Certificate::signed_digest(
            self.provider.as_ref(),
            subject_id,
            &subject_block,
            &issuer_id,
            not_after,
        );
        let signature = self.provider.sign(&state.seed, &digest);
        Ok(Certificate {
            user_id: subject_id.to_string(),
            block: subject_block,
            issuer_id,
            not_after,
            signature,
        })
    }

    /// Issue a self-signed certificate for a key pair.
    pub fn self_certificate(
        &mut self,
        key: KeyPairHandle,
        not_after: u64,
    ) -> Result<Certificate, CryptoError> {
        let state = self.table.key_pair(key)?;
        let subject_id = state.user_id.clone();
        let block = state.public_block(self.provider.as_ref());
        self.issue_certificate(key, &subject_id, block, not_after)
    }

    /// Validate a chain: leaf first, each certificate signed by the next,
    /// ending in a self-signed root whose block is in the directory.
    pub fn validate_chain(
        &self,
        dir: DirHandle,
        chain: &[Certificate],
        now: u64,
    ) -> Result<(), CryptoError> {
        if chain.is_empty() {
            return Err(CryptoError::BadFormat("empty certificate chain"));
        }
        for cert in chain {
            if now > cert.not_after {
                return Err(CertificateError::Expired.into());
            }
        }
        for pair in chain.windows(2) {
            let (cert, issuer) = (&pair[0], &pair[1]);
            if cert.issuer_id != issuer.user_id
                || !cert.issued_by(self.provider.as_ref(), &issuer.block)
            {
                return Err(CertificateError::NotIssuer.into());
            }
        }
        let root = chain.last().ok_or(CryptoError::BadFormat("empty certificate chain"))?;
        if !root.is_self_signed() || !root.issued_by(self.provider.as_ref(), &root.block) {
            return Err(CertificateError::NotRoot.into());
        }
        match self.table.directory(dir)?.lookup(&root.user_id) {
            Some(entry) if entry.block == root.block => Ok(()),
            _ => Err(CertificateError::NotRoot.into()),
        }
    }
}
