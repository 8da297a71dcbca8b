//! Cryptographic operation engine.
//!
//! Every function in here works on resolved key material: vault lookups,
//! LMK unwrapping and access checks happen in the session layer before a
//! primitive is invoked. Algorithm selection is a runtime enum, so the
//! dispatch macros below expand a body once per concrete cipher, digest or
//! curve type.

use sha2::{Digest, Sha256};

use crate::error::{HsmError, Result};
use crate::types::{EccPublicParts, RsaPublicParts, SymmAlg};

/// Expand `$body` with `$C` bound to the block cipher type for `$alg`.
macro_rules! with_block_cipher {
    ($alg:expr, $C:ident => $body:expr) => {
        match $alg {
            $crate::types::SymmAlg::Tdes128 => {
                type $C = des::TdesEde2;
                $body
            }
            $crate::types::SymmAlg::Tdes192 => {
                type $C = des::TdesEde3;
                $body
            }
            $crate::types::SymmAlg::Aes128 => {
                type $C = aes::Aes128;
                $body
            }
            $crate::types::SymmAlg::Aes192 => {
                type $C = aes::Aes192;
                $body
            }
            $crate::types::SymmAlg::Aes256 => {
                type $C = aes::Aes256;
                $body
            }
            $crate::types::SymmAlg::Sm4 => {
                type $C = $crate::engine::sm4::Sm4;
                $body
            }
        }
    };
}

/// Like `with_block_cipher!` but restricted to 128-bit block ciphers; the
/// triple-DES family evaluates to `UnsupportedAlgorithmCombination`.
macro_rules! with_wide_block_cipher {
    ($alg:expr, $C:ident => $body:expr) => {
        match $alg {
            $crate::types::SymmAlg::Tdes128 | $crate::types::SymmAlg::Tdes192 => {
                Err($crate::error::HsmError::UnsupportedAlgorithmCombination)
            }
            $crate::types::SymmAlg::Aes128 => {
                type $C = aes::Aes128;
                $body
            }
            $crate::types::SymmAlg::Aes192 => {
                type $C = aes::Aes192;
                $body
            }
            $crate::types::SymmAlg::Aes256 => {
                type $C = aes::Aes256;
                $body
            }
            $crate::types::SymmAlg::Sm4 => {
                type $C = $crate::engine::sm4::Sm4;
                $body
            }
        }
    };
}

/// Expand `$body` with `$D` bound to the digest type for `$alg`.
macro_rules! with_digest {
    ($alg:expr, $D:ident => $body:expr) => {
        match $alg {
            $crate::types::HashAlg::Sha1 => {
                type $D = sha1::Sha1;
                $body
            }
            $crate::types::HashAlg::Sha224 => {
                type $D = sha2::Sha224;
                $body
            }
            $crate::types::HashAlg::Sha256 => {
                type $D = sha2::Sha256;
                $body
            }
            $crate::types::HashAlg::Sha384 => {
                type $D = sha2::Sha384;
                $body
            }
            $crate::types::HashAlg::Sha512 => {
                type $D = sha2::Sha512;
                $body
            }
            $crate::types::HashAlg::Sm3 => {
                type $D = $crate::engine::sm3::Sm3;
                $body
            }
        }
    };
}

/// Expand `$body` with `$C` bound to the curve type for `$curve`. Curves
/// without an arithmetic backend evaluate to `UnsupportedAlgorithmCombination`.
macro_rules! with_curve {
    ($curve:expr, $C:ident => $body:expr) => {
        match $curve {
            $crate::types::EccCurve::Sm2 => {
                Err($crate::error::HsmError::UnsupportedAlgorithmCombination)
            }
            $crate::types::EccCurve::NistP256 => {
                type $C = p256::NistP256;
                $body
            }
            $crate::types::EccCurve::Secp256k1 => {
                type $C = k256::Secp256k1;
                $body
            }
            $crate::types::EccCurve::Secp384r1 => {
                type $C = p384::NistP384;
                $body
            }
        }
    };
}

pub mod aead;
pub mod agreement;
pub mod ecc;
pub mod ecies;
pub mod hash;
pub mod kdf;
pub mod mac;
pub mod rsa;
pub mod sm3;
pub mod sm4;
pub mod symm;

/// Length of every key check value.
pub const KCV_LEN: usize = 8;

/// Build a block cipher from a key slice, mapping a length mismatch to
/// `InvalidParameter`.
pub(crate) fn new_cipher<C: cipher::KeyInit>(key: &[u8]) -> Result<C> {
    C::new_from_slice(key).map_err(|_| HsmError::InvalidParameter("key length"))
}

/// Reject key material whose length does not fit `alg`.
pub(crate) fn check_key_len(alg: SymmAlg, key: &[u8]) -> Result<()> {
    if key.len() != alg.key_len() {
        return Err(HsmError::InvalidParameter("key length"));
    }
    Ok(())
}

/// Symmetric key check value: the first eight bytes of one zero block
/// encrypted in ECB mode.
pub fn symm_kcv(alg: SymmAlg, key: &[u8]) -> Result<[u8; KCV_LEN]> {
    check_key_len(alg, key)?;
    let encrypted = with_block_cipher!(alg, C => {
        use cipher::BlockEncrypt;
        let engine: C = new_cipher(key)?;
        let mut block = cipher::Block::<C>::default();
        engine.encrypt_block(&mut block);
        block.to_vec()
    });
    let mut kcv = [0u8; KCV_LEN];
    kcv.copy_from_slice(&encrypted[..KCV_LEN]);
    Ok(kcv)
}

fn truncated_sha256(parts: &[&[u8]]) -> [u8; KCV_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut kcv = [0u8; KCV_LEN];
    kcv.copy_from_slice(&digest[..KCV_LEN]);
    kcv
}

/// RSA check value over the public modulus and exponent.
pub fn rsa_kcv(public: &RsaPublicParts) -> [u8; KCV_LEN] {
    truncated_sha256(&[&public.n, &public.e])
}

/// ECC check value over the uncompressed public point.
pub fn ecc_kcv(public: &EccPublicParts) -> [u8; KCV_LEN] {
    truncated_sha256(&[&public.to_sec1()])
}
