//! The master key domain (LMK).
//!
//! One root secret protects every key at rest. It is never exported and
//! never used directly: each key namespace gets its own wrapping key,
//! derived once with HKDF-SHA256 when the domain is constructed.
//!
//! ## Blob layout
//!
//! ```text
//! [ "LV" ][ version ][ key type ][ alg/curve code (u16 BE) ][ bits (u16 BE) ]   8-byte header
//! [ nonce (12 bytes) ][ AES-256-GCM ciphertext ][ tag (16 bytes) ]
//! ```
//!
//! The header is bound as associated data, so a blob cannot be presented
//! as a different key type or algorithm without failing authentication.

use ring::hkdf;
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN};
use crate::error::{HsmError, Result};
use crate::types::{EccCurve, KeyAlgorithm, KeyType, SymmAlg};

const MAGIC: [u8; 2] = *b"LV";
const VERSION: u8 = 1;

/// Length of the authenticated blob header.
pub const HEADER_LEN: usize = 8;

/// HKDF info labels, one per namespace.
mod info {
    pub const SYMMETRIC: &str = "lmkvault:lmk:symm";
    pub const RSA: &str = "lmkvault:lmk:rsa";
    pub const ECC: &str = "lmkvault:lmk:ecc";
}

/// A namespace wrapping key, zeroized on drop.
struct DomainKey(Zeroizing<[u8; KEY_LEN]>);

/// The root of trust for all at-rest key material.
///
/// - Not `Clone`; share it behind an `Arc`.
/// - Root and derived keys are zeroized on drop.
pub struct MasterKeyDomain {
    keys: [DomainKey; 3],
}

impl std::fmt::Debug for MasterKeyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKeyDomain { .. }")
    }
}

fn derive(master: &[u8; KEY_LEN], label: &str) -> Result<DomainKey> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(master);

    let info = [label.as_bytes()];
    let okm = prk
        .expand(&info, hkdf::HKDF_SHA256)
        .map_err(|_| HsmError::InternalFault("lmk derivation"))?;

    let mut derived = Zeroizing::new([0u8; KEY_LEN]);
    okm.fill(&mut derived[..])
        .map_err(|_| HsmError::InternalFault("lmk derivation"))?;
    Ok(DomainKey(derived))
}

impl MasterKeyDomain {
    /// Provision a fresh random master key.
    pub fn generate() -> Result<Self> {
        let root = Zeroizing::new(crypto::generate_random_key()?);
        Self::from_root(&root)
    }

    /// Build the domain from known root bytes. Intended for restoring a
    /// provisioned device and for deterministic test fixtures.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Result<Self> {
        let root = Zeroizing::new(bytes);
        Self::from_root(&root)
    }

    fn from_root(root: &[u8; KEY_LEN]) -> Result<Self> {
        Ok(Self {
            keys: [
                derive(root, info::SYMMETRIC)?,
                derive(root, info::RSA)?,
                derive(root, info::ECC)?,
            ],
        })
    }

    fn key_for(&self, key_type: KeyType) -> &[u8; KEY_LEN] {
        &self.keys[key_type.slot()].0
    }

    /// Seal plaintext key material of the given algorithm.
    pub(crate) fn wrap(&self, algorithm: KeyAlgorithm, plaintext: &[u8]) -> Result<Vec<u8>> {
        let header = encode_header(algorithm);
        let sealed = crypto::seal(self.key_for(algorithm.key_type()), &header, plaintext)?;
        let mut blob = Vec::with_capacity(HEADER_LEN + sealed.len());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Open a blob, returning its algorithm and plaintext.
    pub(crate) fn unwrap(&self, blob: &[u8]) -> Result<(KeyAlgorithm, Zeroizing<Vec<u8>>)> {
        let algorithm = peek_algorithm(blob)?;
        let plaintext = crypto::open(
            self.key_for(algorithm.key_type()),
            &blob[..HEADER_LEN],
            &blob[HEADER_LEN..],
        )?;
        Ok((algorithm, plaintext))
    }

    /// Open a blob that must hold a key of `expected` type.
    pub(crate) fn unwrap_as(
        &self,
        expected: KeyType,
        blob: &[u8],
    ) -> Result<(KeyAlgorithm, Zeroizing<Vec<u8>>)> {
        let (algorithm, plaintext) = self.unwrap(blob)?;
        if algorithm.key_type() != expected {
            return Err(HsmError::KeyFormatInvalid);
        }
        Ok((algorithm, plaintext))
    }
}

fn encode_header(algorithm: KeyAlgorithm) -> [u8; HEADER_LEN] {
    let (code, bits) = match algorithm {
        KeyAlgorithm::Symmetric(alg) => (alg.code(), (alg.key_len() * 8) as u16),
        KeyAlgorithm::Rsa { bits } => (0, bits),
        KeyAlgorithm::Ecc(curve) => (curve.code(), (curve.field_len() * 8) as u16),
    };
    let mut header = [0u8; HEADER_LEN];
    header[..2].copy_from_slice(&MAGIC);
    header[2] = VERSION;
    header[3] = algorithm.key_type().code();
    header[4..6].copy_from_slice(&code.to_be_bytes());
    header[6..8].copy_from_slice(&bits.to_be_bytes());
    header
}

/// Read the algorithm from a blob header without opening it.
pub fn peek_algorithm(blob: &[u8]) -> Result<KeyAlgorithm> {
    if blob.len() < HEADER_LEN + crypto::NONCE_LEN + crypto::TAG_LEN
        || blob[..2] != MAGIC
        || blob[2] != VERSION
    {
        return Err(HsmError::KeyFormatInvalid);
    }
    let key_type = KeyType::from_code(blob[3]).map_err(|_| HsmError::KeyFormatInvalid)?;
    let code = u16::from_be_bytes([blob[4], blob[5]]);
    let bits = u16::from_be_bytes([blob[6], blob[7]]);
    let algorithm = match key_type {
        KeyType::Symmetric => KeyAlgorithm::Symmetric(
            SymmAlg::from_code(code).map_err(|_| HsmError::KeyFormatInvalid)?,
        ),
        KeyType::Rsa => KeyAlgorithm::Rsa { bits },
        KeyType::Ecc => {
            KeyAlgorithm::Ecc(EccCurve::from_code(code).map_err(|_| HsmError::KeyFormatInvalid)?)
        }
    };
    Ok(algorithm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_domain() -> MasterKeyDomain {
        MasterKeyDomain::from_bytes([0x42; KEY_LEN]).unwrap()
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let lmk = fixed_domain();
        let alg = KeyAlgorithm::Symmetric(SymmAlg::Sm4);
        let blob = lmk.wrap(alg, &[7u8; 16]).unwrap();
        let (seen, plain) = lmk.unwrap(&blob).unwrap();
        assert_eq!(seen, alg);
        assert_eq!(plain.as_slice(), &[7u8; 16]);
    }

    #[test]
    fn same_root_opens_blobs_across_instances() {
        let blob = fixed_domain()
            .wrap(KeyAlgorithm::Ecc(EccCurve::NistP256), &[1u8; 32])
            .unwrap();
        assert!(fixed_domain().unwrap(&blob).is_ok());
    }

    #[test]
    fn other_root_cannot_open() {
        let blob = fixed_domain()
            .wrap(KeyAlgorithm::Symmetric(SymmAlg::Aes128), &[1u8; 16])
            .unwrap();
        let other = MasterKeyDomain::generate().unwrap();
        assert_eq!(other.unwrap(&blob).unwrap_err(), HsmError::KeyFormatInvalid);
    }

    #[test]
    fn relabelled_header_fails_authentication() {
        let lmk = fixed_domain();
        let mut blob = lmk
            .wrap(KeyAlgorithm::Symmetric(SymmAlg::Aes128), &[1u8; 16])
            .unwrap();
        // Claim the blob is SM4 instead of AES-128.
        blob[5] = SymmAlg::Sm4.code() as u8;
        assert_eq!(lmk.unwrap(&blob).unwrap_err(), HsmError::KeyFormatInvalid);
    }

    #[test]
    fn namespace_mismatch_is_rejected() {
        let lmk = fixed_domain();
        let blob = lmk
            .wrap(KeyAlgorithm::Symmetric(SymmAlg::Aes256), &[1u8; 32])
            .unwrap();
        assert_eq!(
            lmk.unwrap_as(KeyType::Ecc, &blob).unwrap_err(),
            HsmError::KeyFormatInvalid
        );
    }
}
