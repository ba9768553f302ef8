use std::error::Error;
use std::{fmt, io};

use crate::handle::ResourceKind;

/// Possible error conditions for session, key, container, and streaming
/// operations.
///
/// Exactly one kind is reported per failed call, and a failed call leaves no
/// partial state behind: retrying is always the caller's job, starting from
/// scratch.
#[derive(Debug)]
pub enum CryptoError {
    /// A handle was never allocated, or was already closed.
    BadHandle,
    /// A live handle was passed to an operation expecting a different
    /// resource kind.
    HandleType {
        expected: ResourceKind,
        actual: ResourceKind,
    },
    /// An operation was called out of its allowed order (update after
    /// finalize, put after the terminal call, enumeration after a point
    /// lookup, and so on).
    WrongState(&'static str),
    /// The provider's substitution nodes could not be loaded at session
    /// init.
    MaskInit,
    /// A checksum on a key carrier or directory did not match its contents.
    BadCrc { expected: u16, actual: u16 },
    /// The user id embedded in a carrier is malformed (empty, overlong, or
    /// not printable ASCII).
    BadUser,
    /// Decryption of wrapped key material failed its integrity check.
    WrongPassword,
    /// A signature or MAC failed verification.
    BadSignature,
    /// The addressed recipient slot of a network key is unpopulated, or a
    /// required key is missing.
    NoKey,
    /// Fewer signature records exist than the requested index.
    NoSignature,
    /// A fixed-capacity destination cannot hold the output.
    BufferTooSmall { required: usize },
    /// A field or buffer had the wrong length for the step being decoded.
    BadLength {
        step: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Container, carrier, or message bytes do not match the format.
    BadFormat(&'static str),
    /// The algorithm or feature is not available in this build.
    Unsupported(&'static str),
    /// A certificate in a presented chain failed validation.
    Certificate(CertificateError),
    /// A hardware token is required but absent, or misbehaved.
    Device(&'static str),
    /// File open/read/write failure.
    Io(io::Error),
}

/// Reasons a certificate chain can fail validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateError {
    /// The certificate's validity window has passed.
    Expired,
    /// The chain does not terminate in a trusted self-signed root.
    NotRoot,
    /// An issuer signature did not verify, or the named issuer is unknown.
    NotIssuer,
    /// The certificate has been revoked.
    Revoked,
}

impl CryptoError {
    /// True for errors that indicate a bug in the calling code (stale
    /// handles, out-of-order calls) rather than a recoverable condition like
    /// a wrong password or a corrupted file. These should not be caught and
    /// retried.
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            CryptoError::BadHandle | CryptoError::HandleType { .. } | CryptoError::WrongState(_)
        )
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CryptoError::BadHandle => write!(f, "Handle is unknown or already closed"),
            CryptoError::HandleType { expected, actual } => write!(
                f,
                "Handle kind mismatch: expected {:?}, got {:?}",
                expected, actual
            ),
            CryptoError::WrongState(step) => write!(f, "Call out of order: {}", step),
            CryptoError::MaskInit => write!(f, "Substitution nodes could not be loaded"),
            CryptoError::BadCrc { expected, actual } => write!(
                f,
                "Carrier checksum mismatch: expected {:#06x}, got {:#06x}",
                expected, actual
            ),
            CryptoError::BadUser => write!(f, "Embedded user id is malformed"),
            CryptoError::WrongPassword => write!(f, "Could not unwrap key material"),
            CryptoError::BadSignature => write!(f, "Signature failed verification"),
            CryptoError::NoKey => write!(f, "No key in the addressed slot"),
            CryptoError::NoSignature => write!(f, "No signature record at the requested index"),
            CryptoError::BufferTooSmall { required } => {
                write!(f, "Destination too small, {} bytes required", required)
            }
            CryptoError::BadLength {
                step,
                expected,
                actual,
            } => write!(
                f,
                "Bad length during {}: expected {}, got {}",
                step, expected, actual
            ),
            CryptoError::BadFormat(what) => write!(f, "Format mismatch: {}", what),
            CryptoError::Unsupported(what) => write!(f, "Not supported: {}", what),
            CryptoError::Certificate(ref err) => write!(f, "Certificate invalid: {}", err),
            CryptoError::Device(what) => write!(f, "Token failure: {}", what),
            CryptoError::Io(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CertificateError::Expired => write!(f, "expired"),
            CertificateError::NotRoot => write!(f, "chain does not end at a trusted root"),
            CertificateError::NotIssuer => write!(f, "issuer signature did not verify"),
            CertificateError::Revoked => write!(f, "revoked"),
        }
    }
}

impl Error for CryptoError {}

impl From<io::Error> for CryptoError {
    fn from(err: io::Error) -> CryptoError {
        CryptoError::Io(err)
    }
}

impl From<CertificateError> for CryptoError {
    fn from(err: CertificateError) -> CryptoError {
        CryptoError::Certificate(err)
    }
}
