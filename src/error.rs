//! Error types for lmkvault.
//!
//! Every variant is a distinct failure kind of the vault and operation
//! engine. Messages are intentionally minimal: they signal *what* failed
//! without revealing *why* in ways that could leak key material or
//! plaintext.

use thiserror::Error;

/// The single error type for all lmkvault operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HsmError {
    /// A length, range or enumeration value was out of bounds.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The caller's output buffer is too small; `required` is the size needed.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    /// No key occupies the requested index.
    #[error("key not found")]
    KeyNotFound,

    /// The requested index is occupied and overwrite was not requested.
    #[error("key already exists")]
    KeyExists,

    /// A private-key operation was attempted without a live access grant.
    #[error("access denied")]
    AccessDenied,

    /// The supplied password does not match the key's stored credential.
    #[error("wrong password")]
    WrongPassword,

    /// A wrapped key failed its integrity or structure check while
    /// being unwrapped under a protector.
    #[error("unwrap authentication failed")]
    UnwrapAuthFailed,

    /// An authenticated decryption failed its tag check. No plaintext is
    /// returned.
    #[error("authentication tag mismatch")]
    AuthTagMismatch,

    /// The requested algorithm, mode or format combination is not supported.
    #[error("unsupported algorithm combination")]
    UnsupportedAlgorithmCombination,

    /// A streaming context or agreement handle was presented out of order
    /// or to a session that does not own it.
    #[error("invalid context state")]
    InvalidContextState,

    /// LMK ciphertext or an imported key structure is malformed.
    #[error("key format invalid")]
    KeyFormatInvalid,

    /// The index named as a protector does not hold a key.
    #[error("protector not found")]
    ProtectorNotFound,

    /// A signature or check value did not verify.
    #[error("verification failed")]
    VerifyFailed,

    /// The system random source failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything unexpected. Carries a static description only.
    #[error("internal fault: {0}")]
    InternalFault(&'static str),
}

impl HsmError {
    /// Stable numeric status for callers that surface integer result codes.
    /// Zero is reserved for success and never returned here.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidParameter(_) => 0x0100_0001,
            Self::BufferTooSmall { .. } => 0x0100_0002,
            Self::KeyNotFound => 0x0100_0003,
            Self::KeyExists => 0x0100_0004,
            Self::AccessDenied => 0x0100_0005,
            Self::WrongPassword => 0x0100_0006,
            Self::UnwrapAuthFailed => 0x0100_0007,
            Self::AuthTagMismatch => 0x0100_0008,
            Self::UnsupportedAlgorithmCombination => 0x0100_0009,
            Self::InvalidContextState => 0x0100_000A,
            Self::KeyFormatInvalid => 0x0100_000B,
            Self::ProtectorNotFound => 0x0100_000C,
            Self::VerifyFailed => 0x0100_000D,
            Self::RandomnessFailure => 0x0100_000E,
            Self::Config(_) => 0x0100_000F,
            Self::InternalFault(_) => 0x0100_00FF,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, HsmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_nonzero() {
        let all = [
            HsmError::InvalidParameter("x"),
            HsmError::BufferTooSmall { required: 1 },
            HsmError::KeyNotFound,
            HsmError::KeyExists,
            HsmError::AccessDenied,
            HsmError::WrongPassword,
            HsmError::UnwrapAuthFailed,
            HsmError::AuthTagMismatch,
            HsmError::UnsupportedAlgorithmCombination,
            HsmError::InvalidContextState,
            HsmError::KeyFormatInvalid,
            HsmError::ProtectorNotFound,
            HsmError::VerifyFailed,
            HsmError::RandomnessFailure,
            HsmError::Config("x".into()),
            HsmError::InternalFault("x"),
        ];
        let mut codes: Vec<u32> = all.iter().map(HsmError::code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn buffer_too_small_reports_size() {
        let err = HsmError::BufferTooSmall { required: 48 };
        assert_eq!(err.to_string(), "buffer too small, 48 bytes required");
    }
}
