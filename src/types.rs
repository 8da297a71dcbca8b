//! Algorithm identifiers, key references and key part layouts.
//!
//! Numeric codes follow the device's wire enumerations so that LMK blobs
//! and exported metadata stay stable across versions.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{HsmError, Result};

/// Identifies the session that owns a grant, context or handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Algorithm identifiers
// ---------------------------------------------------------------------------

/// The three key namespaces. Each has its own index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyType {
    Symmetric,
    Rsa,
    Ecc,
}

impl KeyType {
    pub const ALL: [KeyType; 3] = [KeyType::Symmetric, KeyType::Rsa, KeyType::Ecc];

    pub fn code(self) -> u8 {
        match self {
            Self::Symmetric => 0,
            Self::Rsa => 1,
            Self::Ecc => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Symmetric),
            1 => Ok(Self::Rsa),
            2 => Ok(Self::Ecc),
            _ => Err(HsmError::InvalidParameter("key type")),
        }
    }

    pub(crate) fn slot(self) -> usize {
        self.code() as usize
    }
}

/// Symmetric block ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmAlg {
    /// Two-key triple DES.
    Tdes128,
    /// Three-key triple DES.
    Tdes192,
    Aes128,
    Aes192,
    Aes256,
    Sm4,
}

impl SymmAlg {
    pub fn code(self) -> u16 {
        match self {
            Self::Tdes128 => 1,
            Self::Tdes192 => 2,
            Self::Aes128 => 3,
            Self::Aes192 => 4,
            Self::Aes256 => 5,
            Self::Sm4 => 7,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            1 => Ok(Self::Tdes128),
            2 => Ok(Self::Tdes192),
            3 => Ok(Self::Aes128),
            4 => Ok(Self::Aes192),
            5 => Ok(Self::Aes256),
            7 => Ok(Self::Sm4),
            6 | 8..=11 => Err(HsmError::UnsupportedAlgorithmCombination),
            _ => Err(HsmError::InvalidParameter("symmetric algorithm")),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Tdes128 | Self::Aes128 | Self::Sm4 => 16,
            Self::Tdes192 | Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    pub fn block_len(self) -> usize {
        match self {
            Self::Tdes128 | Self::Tdes192 => 8,
            Self::Aes128 | Self::Aes192 | Self::Aes256 | Self::Sm4 => 16,
        }
    }
}

/// Symmetric modes of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmMode {
    Ecb,
    Cbc,
    Cfb,
    Ofb,
    Gcm,
    Ccm,
    Ctr,
    Xts,
}

impl SymmMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Ecb => 0,
            Self::Cbc => 1,
            Self::Cfb => 2,
            Self::Ofb => 3,
            Self::Gcm => 6,
            Self::Ccm => 7,
            Self::Ctr => 8,
            Self::Xts => 9,
        }
    }

    /// Block-aligned modes; the rest accept arbitrary lengths.
    pub fn needs_alignment(self) -> bool {
        matches!(self, Self::Ecb | Self::Cbc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmOp {
    Encrypt,
    Decrypt,
}

/// Elliptic curves by device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EccCurve {
    Sm2,
    NistP256,
    Secp256k1,
    Secp384r1,
}

impl EccCurve {
    pub fn code(self) -> u16 {
        match self {
            Self::Sm2 => 0x0007,
            Self::NistP256 => 0x019F,
            Self::Secp256k1 => 0x02CA,
            Self::Secp384r1 => 0x02CB,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0x0007 => Ok(Self::Sm2),
            0x019F => Ok(Self::NistP256),
            0x02CA => Ok(Self::Secp256k1),
            0x02CB => Ok(Self::Secp384r1),
            0x039B | 0x03A0 | 0x03A8 | 0x040A => Err(HsmError::UnsupportedAlgorithmCombination),
            _ => Err(HsmError::InvalidParameter("curve")),
        }
    }

    /// Width in bytes of field elements and scalars.
    pub fn field_len(self) -> usize {
        match self {
            Self::Sm2 | Self::NistP256 | Self::Secp256k1 => 32,
            Self::Secp384r1 => 48,
        }
    }
}

/// Hash functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlg {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sm3,
}

impl HashAlg {
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 | Self::Sm3 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// RSA encryption and signature paddings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RsaPadding {
    /// Raw modular exponentiation; input must be exactly the modulus length.
    None,
    Pkcs1v15,
    /// OAEP with separate label and MGF1 hashes. The label must be UTF-8.
    Oaep {
        hash: HashAlg,
        mgf_hash: HashAlg,
        /// At most 99 bytes of valid UTF-8.
        label: Vec<u8>,
    },
    /// PSS with MGF1 over the signing hash.
    Pss { salt_len: usize },
}

/// Framing position of a chunk in a multi-call MAC or hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBlock {
    First,
    Mid,
    Last,
}

impl DataBlock {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::First),
            2 => Ok(Self::Mid),
            3 => Ok(Self::Last),
            _ => Err(HsmError::InvalidParameter("data block type")),
        }
    }
}

/// Export/import layouts for key material under a transport protector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFormat {
    /// Raw key bytes: a symmetric key, or a fixed-width ECC scalar.
    Raw,
    /// RSA private key, PKCS#8 DER.
    RsaPkcs8,
    /// ECC private key, PKCS#8 DER.
    EccPkcs8,
    /// ECC private key as 32 zero bytes followed by the fixed-width scalar.
    EccSpecial,
    /// Symmetric key with a transport MAC.
    SymmMac,
    /// RSA key with a transport MAC.
    RsaMac,
    /// ECC key with a transport MAC.
    EccMac,
    /// RSA private key, PKCS#1 DER.
    RsaPkcs1,
}

impl KeyFormat {
    pub fn code(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::RsaPkcs8 => 1,
            Self::EccPkcs8 => 2,
            Self::EccSpecial => 12,
            Self::SymmMac => 20,
            Self::RsaMac => 21,
            Self::EccMac => 22,
            Self::RsaPkcs1 => 31,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Raw),
            1 => Ok(Self::RsaPkcs8),
            2 => Ok(Self::EccPkcs8),
            12 => Ok(Self::EccSpecial),
            20 => Ok(Self::SymmMac),
            21 => Ok(Self::RsaMac),
            22 => Ok(Self::EccMac),
            31 => Ok(Self::RsaPkcs1),
            _ => Err(HsmError::InvalidParameter("key format")),
        }
    }
}

/// What a stored or wrapped key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Symmetric(SymmAlg),
    Rsa { bits: u16 },
    Ecc(EccCurve),
}

impl KeyAlgorithm {
    pub fn key_type(self) -> KeyType {
        match self {
            Self::Symmetric(_) => KeyType::Symmetric,
            Self::Rsa { .. } => KeyType::Rsa,
            Self::Ecc(_) => KeyType::Ecc,
        }
    }
}

// ---------------------------------------------------------------------------
// Key parts
// ---------------------------------------------------------------------------

/// RSA public key as fixed-width big-endian fields, each `k` bytes where
/// `k` is the modulus length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaPublicParts {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
}

impl RsaPublicParts {
    pub fn bits(&self) -> usize {
        self.n.len() * 8
    }
}

/// RSA private key. `n`, `e`, `d` are `k` bytes; the prime and CRT fields
/// are `k / 2` bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RsaPrivateParts {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
    pub d: Vec<u8>,
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub dp: Vec<u8>,
    pub dq: Vec<u8>,
    pub qinv: Vec<u8>,
}

impl RsaPrivateParts {
    pub fn public(&self) -> RsaPublicParts {
        RsaPublicParts {
            n: self.n.clone(),
            e: self.e.clone(),
        }
    }

    pub fn bits(&self) -> usize {
        self.n.len() * 8
    }
}

impl fmt::Debug for RsaPrivateParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaPrivateParts")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}

/// ECC public point as fixed-width affine coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccPublicParts {
    pub curve: EccCurve,
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl EccPublicParts {
    /// SEC1 uncompressed encoding `04 | x | y`.
    pub fn to_sec1(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.x.len() + self.y.len());
        out.push(0x04);
        out.extend_from_slice(&self.x);
        out.extend_from_slice(&self.y);
        out
    }

    /// Split a SEC1 uncompressed point.
    pub fn from_sec1(curve: EccCurve, bytes: &[u8]) -> Result<Self> {
        let width = curve.field_len();
        if bytes.len() != 1 + 2 * width || bytes[0] != 0x04 {
            return Err(HsmError::InvalidParameter("uncompressed point"));
        }
        Ok(Self {
            curve,
            x: bytes[1..1 + width].to_vec(),
            y: bytes[1 + width..].to_vec(),
        })
    }

    /// `x | y` without the SEC1 prefix.
    pub fn to_xy(&self) -> Vec<u8> {
        let mut out = self.x.clone();
        out.extend_from_slice(&self.y);
        out
    }

    pub(crate) fn check_width(&self) -> Result<()> {
        let width = self.curve.field_len();
        if self.x.len() != width || self.y.len() != width {
            return Err(HsmError::InvalidParameter("coordinate width"));
        }
        Ok(())
    }
}

/// ECC private scalar, fixed width.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EccPrivateParts {
    #[zeroize(skip)]
    pub curve: EccCurve,
    pub d: Vec<u8>,
}

impl fmt::Debug for EccPrivateParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EccPrivateParts")
            .field("curve", &self.curve)
            .finish_non_exhaustive()
    }
}

/// Signature as fixed-width `r` and `s`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccSignature {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

/// EC-ElGamal ciphertext: ephemeral point `(x, y)`, SM3 check value `m`
/// over the plaintext and the masked data `c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccCipher {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
    pub m: Vec<u8>,
    pub c: Vec<u8>,
}

impl EccCipher {
    /// Check value length (SM3 output).
    pub const M_LEN: usize = 32;

    /// Flat `x | y | M | C` layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        [&self.x[..], &self.y, &self.m, &self.c].concat()
    }

    pub fn from_bytes(curve: EccCurve, bytes: &[u8]) -> Result<Self> {
        let width = curve.field_len();
        let fixed = 2 * width + Self::M_LEN;
        if bytes.len() <= fixed {
            return Err(HsmError::InvalidParameter("ecc ciphertext length"));
        }
        Ok(Self {
            x: bytes[..width].to_vec(),
            y: bytes[width..2 * width].to_vec(),
            m: bytes[2 * width..fixed].to_vec(),
            c: bytes[fixed..].to_vec(),
        })
    }

    /// Length of the masked data.
    pub fn data_len(&self) -> usize {
        self.c.len()
    }
}

/// A key under the master key, with its check value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub kcv: [u8; 8],
}

// ---------------------------------------------------------------------------
// Key references
// ---------------------------------------------------------------------------

fn fmt_index_ref(f: &mut fmt::Formatter<'_>, name: &str, index: Option<u32>) -> fmt::Result {
    match index {
        Some(i) => write!(f, "{name}::Index({i})"),
        None => write!(f, "{name}::External"),
    }
}

/// Reject the reserved index.
pub(crate) fn checked_index(index: u32) -> Result<u32> {
    if index == 0 {
        return Err(HsmError::InvalidParameter("index 0 is reserved"));
    }
    Ok(index)
}

/// A symmetric key: a vault slot, an LMK ciphertext, or plaintext material.
#[derive(Clone, Copy)]
pub enum SymmKeyRef<'a> {
    Index(u32),
    Lmk(&'a [u8]),
    Plain { alg: SymmAlg, key: &'a [u8] },
}

impl SymmKeyRef<'_> {
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Index(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Debug for SymmKeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_index_ref(f, "SymmKeyRef", self.index())
    }
}

/// An RSA private key reference.
#[derive(Clone, Copy)]
pub enum RsaKeyRef<'a> {
    Index(u32),
    Lmk(&'a [u8]),
    Plain(&'a RsaPrivateParts),
}

impl RsaKeyRef<'_> {
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Index(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Debug for RsaKeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_index_ref(f, "RsaKeyRef", self.index())
    }
}

/// An RSA public key reference.
#[derive(Debug, Clone, Copy)]
pub enum RsaPublicRef<'a> {
    Index(u32),
    Plain(&'a RsaPublicParts),
}

/// An ECC private key reference.
#[derive(Clone, Copy)]
pub enum EccKeyRef<'a> {
    Index(u32),
    Lmk(&'a [u8]),
    Plain(&'a EccPrivateParts),
}

impl EccKeyRef<'_> {
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Index(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Debug for EccKeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_index_ref(f, "EccKeyRef", self.index())
    }
}

/// An ECC public key reference.
#[derive(Debug, Clone, Copy)]
pub enum EccPublicRef<'a> {
    Index(u32),
    Plain(&'a EccPublicParts),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for alg in [
            SymmAlg::Tdes128,
            SymmAlg::Tdes192,
            SymmAlg::Aes128,
            SymmAlg::Aes192,
            SymmAlg::Aes256,
            SymmAlg::Sm4,
        ] {
            assert_eq!(SymmAlg::from_code(alg.code()).unwrap(), alg);
        }
        for curve in [
            EccCurve::Sm2,
            EccCurve::NistP256,
            EccCurve::Secp256k1,
            EccCurve::Secp384r1,
        ] {
            assert_eq!(EccCurve::from_code(curve.code()).unwrap(), curve);
        }
        assert_eq!(KeyFormat::from_code(12).unwrap(), KeyFormat::EccSpecial);
    }

    #[test]
    fn known_but_absent_algorithms_are_unsupported() {
        assert_eq!(
            SymmAlg::from_code(6),
            Err(HsmError::UnsupportedAlgorithmCombination)
        );
        assert_eq!(
            EccCurve::from_code(0x040A),
            Err(HsmError::UnsupportedAlgorithmCombination)
        );
        assert!(matches!(
            SymmAlg::from_code(42),
            Err(HsmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn reserved_index_is_rejected() {
        assert!(checked_index(0).is_err());
        assert_eq!(checked_index(7).unwrap(), 7);
    }

    #[test]
    fn sec1_split_checks_width() {
        let point = EccPublicParts {
            curve: EccCurve::NistP256,
            x: vec![1; 32],
            y: vec![2; 32],
        };
        let sec1 = point.to_sec1();
        assert_eq!(EccPublicParts::from_sec1(EccCurve::NistP256, &sec1).unwrap(), point);
        assert!(EccPublicParts::from_sec1(EccCurve::Secp384r1, &sec1).is_err());
    }

    #[test]
    fn ecc_cipher_layout_splits_fields() {
        let cipher = EccCipher {
            x: vec![1; 32],
            y: vec![2; 32],
            m: vec![3; 32],
            c: vec![4; 5],
        };
        let flat = cipher.to_bytes();
        assert_eq!(flat.len(), 101);
        assert_eq!(EccCipher::from_bytes(EccCurve::NistP256, &flat).unwrap(), cipher);
        assert!(EccCipher::from_bytes(EccCurve::NistP256, &flat[..96]).is_err());
    }

    #[test]
    fn private_parts_debug_is_redacted() {
        let parts = EccPrivateParts {
            curve: EccCurve::NistP256,
            d: vec![0xAB; 32],
        };
        let shown = format!("{parts:?}");
        assert!(!shown.contains("171"));
        assert!(shown.contains("NistP256"));
    }
}
