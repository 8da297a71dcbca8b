//! Key derivation: HKDF, PBKDF2 and the counter-mode hash KDFs used by
//! ECIES, ECDH and the SM2-style schemes.

use digest::Digest;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{HsmError, Result};
use crate::types::HashAlg;

/// Longest salt accepted by [`hkdf`].
pub const HKDF_SALT_MAX: usize = 128;

/// Most bytes one derivation call produces.
pub const DERIVED_LEN_MAX: usize = 64 * 1024;

pub(crate) fn check_derived_len(len: usize) -> Result<()> {
    if len == 0 || len > DERIVED_LEN_MAX {
        return Err(HsmError::InvalidParameter("derived key length"));
    }
    Ok(())
}

/// HKDF extract-and-expand. An empty salt selects the all-zero default.
pub fn hkdf(
    hash: HashAlg,
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if salt.len() > HKDF_SALT_MAX {
        return Err(HsmError::InvalidParameter("salt length"));
    }
    if ikm.is_empty() {
        return Err(HsmError::InvalidParameter("hkdf input"));
    }
    check_derived_len(len)?;
    let salt = (!salt.is_empty()).then_some(salt);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    with_digest!(hash, D => {
        Hkdf::<D>::new(salt, ikm)
            .expand(info, &mut okm)
            .map_err(|_| HsmError::InvalidParameter("hkdf output length"))
    })?;
    Ok(okm)
}

/// PBKDF2 with HMAC over `hash`.
pub fn pbkdf2(
    hash: HashAlg,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    max_iterations: u32,
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if iterations == 0 || iterations > max_iterations {
        return Err(HsmError::InvalidParameter("iteration count"));
    }
    if password.is_empty() {
        return Err(HsmError::InvalidParameter("pbkdf input"));
    }
    check_derived_len(len)?;
    let mut out = Zeroizing::new(vec![0u8; len]);
    with_digest!(hash, D => ::pbkdf2::pbkdf2_hmac::<D>(password, salt, iterations, &mut out));
    Ok(out)
}

/// Counter-mode hash KDF family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKdf {
    /// ISO 18033-2 KDF1: counter starts at 0.
    Kdf1,
    /// ISO 18033-2 KDF2: counter starts at 1.
    Kdf2,
    /// ANSI X9.63: counter starts at 1, shared info follows the counter.
    X963,
}

/// Where KDF1/KDF2 place the shared info relative to the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SharedInfoOrder {
    /// `Z | S1 | counter`
    #[default]
    SecretFirst,
    /// `S1 | Z | counter`
    InfoFirst,
}

/// Run a counter-mode KDF to `len` bytes.
pub fn counter_kdf(
    kind: CounterKdf,
    hash: HashAlg,
    secret: &[u8],
    shared_info: &[u8],
    order: SharedInfoOrder,
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if len == 0 {
        return Err(HsmError::InvalidParameter("kdf output length"));
    }
    let start: u32 = match kind {
        CounterKdf::Kdf1 => 0,
        CounterKdf::Kdf2 | CounterKdf::X963 => 1,
    };
    let blocks = len.div_ceil(hash.output_len());
    let mut out = Zeroizing::new(Vec::with_capacity(blocks * hash.output_len()));
    for i in 0..blocks {
        let counter = start
            .checked_add(u32::try_from(i).map_err(|_| HsmError::InvalidParameter("kdf length"))?)
            .ok_or(HsmError::InvalidParameter("kdf length"))?
            .to_be_bytes();
        let block = with_digest!(hash, D => {
            let mut h = D::new();
            match (kind, order) {
                (CounterKdf::X963, _) => {
                    h.update(secret);
                    h.update(counter);
                    h.update(shared_info);
                }
                (_, SharedInfoOrder::SecretFirst) => {
                    h.update(secret);
                    h.update(shared_info);
                    h.update(counter);
                }
                (_, SharedInfoOrder::InfoFirst) => {
                    h.update(shared_info);
                    h.update(secret);
                    h.update(counter);
                }
            }
            h.finalize().to_vec()
        });
        out.extend_from_slice(&block);
    }
    out.truncate(len);
    Ok(out)
}

/// ANSI X9.63 KDF.
pub fn x963(hash: HashAlg, secret: &[u8], shared_info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    counter_kdf(
        CounterKdf::X963,
        hash,
        secret,
        shared_info,
        SharedInfoOrder::SecretFirst,
        len,
    )
}

/// The SM2 key derivation function: X9.63 over SM3 with no shared info.
pub fn sm3_kdf(secret: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    x963(HashAlg::Sm3, secret, &[], len)
}
