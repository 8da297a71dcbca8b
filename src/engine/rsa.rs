//! RSA key generation, signatures, encryption and the raw public-key
//! operation, over fixed-width key part layouts.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use super::hash;
use crate::codec::to_fixed_width;
use crate::error::{HsmError, Result};
use crate::types::{HashAlg, RsaPadding, RsaPrivateParts, RsaPublicParts};

/// Modulus sizes accepted by [`generate`].
pub const SUPPORTED_BITS: [u16; 4] = [1024, 2048, 3072, 4096];

/// Public exponents accepted by [`generate`].
pub const SUPPORTED_EXPONENTS: [u32; 2] = [3, 65537];

/// Longest OAEP label.
pub const OAEP_LABEL_MAX: usize = 99;

// ---------------------------------------------------------------------------
// Part conversions
// ---------------------------------------------------------------------------

fn big(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

fn fixed(value: &BigUint, width: usize) -> Result<Vec<u8>> {
    to_fixed_width(&value.to_bytes_be(), width)
}

/// Fixed-width public parts of any RSA key.
pub fn public_parts(key: &impl PublicKeyParts) -> Result<RsaPublicParts> {
    let k = key.size();
    Ok(RsaPublicParts {
        n: fixed(key.n(), k)?,
        e: fixed(key.e(), k)?,
    })
}

pub(crate) fn private_parts(key: &RsaPrivateKey) -> Result<RsaPrivateParts> {
    let k = key.size();
    let half = k / 2;
    let [p, q] = key.primes() else {
        return Err(HsmError::KeyFormatInvalid);
    };
    let dp = key.dp().ok_or(HsmError::InternalFault("rsa crt values"))?;
    let dq = key.dq().ok_or(HsmError::InternalFault("rsa crt values"))?;
    let qinv = key
        .crt_coefficient()
        .ok_or(HsmError::InternalFault("rsa crt values"))?;
    Ok(RsaPrivateParts {
        n: fixed(key.n(), k)?,
        e: fixed(key.e(), k)?,
        d: fixed(key.d(), k)?,
        p: fixed(p, half)?,
        q: fixed(q, half)?,
        dp: fixed(dp, half)?,
        dq: fixed(dq, half)?,
        qinv: fixed(&qinv, half)?,
    })
}

pub(crate) fn public_key(parts: &RsaPublicParts) -> Result<RsaPublicKey> {
    RsaPublicKey::new(big(&parts.n), big(&parts.e)).map_err(|_| HsmError::KeyFormatInvalid)
}

/// Rebuild a private key; the CRT values are recomputed from `p` and `q`.
pub(crate) fn private_key(parts: &RsaPrivateParts) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_components(
        big(&parts.n),
        big(&parts.e),
        big(&parts.d),
        vec![big(&parts.p), big(&parts.q)],
    )
    .map_err(|_| HsmError::KeyFormatInvalid)
}

/// PKCS#8 DER encoding of a private key.
pub fn to_pkcs8_der(parts: &RsaPrivateParts) -> Result<Zeroizing<Vec<u8>>> {
    let doc = private_key(parts)?
        .to_pkcs8_der()
        .map_err(|_| HsmError::InternalFault("pkcs8 encoding"))?;
    Ok(Zeroizing::new(doc.as_bytes().to_vec()))
}

pub fn from_pkcs8_der(der: &[u8]) -> Result<RsaPrivateParts> {
    let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|_| HsmError::KeyFormatInvalid)?;
    private_parts(&key)
}

/// PKCS#1 `RSAPrivateKey` DER encoding.
pub fn to_pkcs1_der(parts: &RsaPrivateParts) -> Result<Zeroizing<Vec<u8>>> {
    let doc = private_key(parts)?
        .to_pkcs1_der()
        .map_err(|_| HsmError::InternalFault("pkcs1 encoding"))?;
    Ok(Zeroizing::new(doc.as_bytes().to_vec()))
}

pub fn from_pkcs1_der(der: &[u8]) -> Result<RsaPrivateParts> {
    let key = RsaPrivateKey::from_pkcs1_der(der).map_err(|_| HsmError::KeyFormatInvalid)?;
    private_parts(&key)
}

/// Modulus length in bits of a PKCS#8 encoded key.
pub fn pkcs8_bits(der: &[u8]) -> Result<u16> {
    let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|_| HsmError::KeyFormatInvalid)?;
    u16::try_from(key.size() * 8).map_err(|_| HsmError::KeyFormatInvalid)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Generate a two-prime key.
#[tracing::instrument(level = "debug")]
pub fn generate(bits: u16, exponent: u32) -> Result<RsaPrivateParts> {
    if !SUPPORTED_BITS.contains(&bits) {
        return Err(HsmError::InvalidParameter("modulus size"));
    }
    if !SUPPORTED_EXPONENTS.contains(&exponent) {
        return Err(HsmError::InvalidParameter("public exponent"));
    }
    let key = RsaPrivateKey::new_with_exp(&mut OsRng, usize::from(bits), &BigUint::from(exponent))
        .map_err(|_| HsmError::InternalFault("rsa key generation"))?;
    private_parts(&key)
}

fn check_rsa_hash(hash: HashAlg) -> Result<()> {
    if hash == HashAlg::Sm3 {
        return Err(HsmError::UnsupportedAlgorithmCombination);
    }
    Ok(())
}

/// OAEP scheme for `hash`/`mgf_hash`. The `rsa` crate carries the label as a
/// `String`, so labels must be valid UTF-8. Other byte strings are refused
/// with `InvalidParameter`, never re-encoded.
fn oaep(hash: HashAlg, mgf_hash: HashAlg, label: &[u8]) -> Result<Oaep> {
    check_rsa_hash(hash)?;
    check_rsa_hash(mgf_hash)?;
    if label.len() > OAEP_LABEL_MAX {
        return Err(HsmError::InvalidParameter("oaep label length"));
    }
    let label = std::str::from_utf8(label)
        .map_err(|_| HsmError::InvalidParameter("oaep label encoding"))?;
    let scheme = with_digest!(hash, D => with_digest!(mgf_hash, M => {
        if label.is_empty() {
            Oaep::new_with_mgf_hash::<D, M>()
        } else {
            Oaep::new_with_mgf_hash_and_label::<D, M, _>(label)
        }
    }));
    Ok(scheme)
}

fn raw_exponentiate(
    modulus_len: usize,
    data: &[u8],
    op: impl FnOnce(&BigUint) -> rsa::Result<BigUint>,
    n: &BigUint,
) -> Result<Vec<u8>> {
    if data.len() != modulus_len {
        return Err(HsmError::InvalidParameter("input must equal modulus length"));
    }
    let m = big(data);
    if &m >= n {
        return Err(HsmError::InvalidParameter("input not below modulus"));
    }
    let out = op(&m).map_err(|_| HsmError::InvalidParameter("raw rsa operation"))?;
    fixed(&out, modulus_len)
}

/// Sign `message`, hashing it with `hash` first. With [`RsaPadding::None`]
/// `message` must already be a full-width encoded block and is
/// exponentiated as is.
pub fn sign(
    parts: &RsaPrivateParts,
    padding: &RsaPadding,
    hash_alg: HashAlg,
    message: &[u8],
) -> Result<Vec<u8>> {
    let key = private_key(parts)?;
    match padding {
        RsaPadding::None => raw_exponentiate(
            key.size(),
            message,
            |m| rsa::hazmat::rsa_decrypt_and_check(&key, Some(&mut OsRng), m),
            key.n(),
        ),
        RsaPadding::Pkcs1v15 => {
            check_rsa_hash(hash_alg)?;
            let digest = hash::hash(hash_alg, message);
            let scheme = with_digest!(hash_alg, D => Pkcs1v15Sign::new::<D>());
            key.sign_with_rng(&mut OsRng, scheme, &digest)
                .map_err(|_| HsmError::InvalidParameter("rsa signature input"))
        }
        RsaPadding::Pss { salt_len } => {
            check_rsa_hash(hash_alg)?;
            let max_salt = key.size().saturating_sub(hash_alg.output_len() + 2);
            if *salt_len > max_salt {
                return Err(HsmError::InvalidParameter("pss salt length"));
            }
            let digest = hash::hash(hash_alg, message);
            let scheme = with_digest!(hash_alg, D => Pss::new_with_salt::<D>(*salt_len));
            key.sign_with_rng(&mut OsRng, scheme, &digest)
                .map_err(|_| HsmError::InvalidParameter("rsa signature input"))
        }
        RsaPadding::Oaep { .. } => Err(HsmError::UnsupportedAlgorithmCombination),
    }
}

/// Verify a signature produced by [`sign`].
pub fn verify(
    public: &RsaPublicParts,
    padding: &RsaPadding,
    hash_alg: HashAlg,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let key = public_key(public)?;
    match padding {
        RsaPadding::None => {
            let recovered = public_key_operation(public, signature)?;
            let expected = to_fixed_width(message, key.size())?;
            if subtle::ConstantTimeEq::ct_eq(&recovered[..], &expected[..]).into() {
                Ok(())
            } else {
                Err(HsmError::VerifyFailed)
            }
        }
        RsaPadding::Pkcs1v15 => {
            check_rsa_hash(hash_alg)?;
            let digest = hash::hash(hash_alg, message);
            let scheme = with_digest!(hash_alg, D => Pkcs1v15Sign::new::<D>());
            key.verify(scheme, &digest, signature)
                .map_err(|_| HsmError::VerifyFailed)
        }
        RsaPadding::Pss { salt_len } => {
            check_rsa_hash(hash_alg)?;
            let digest = hash::hash(hash_alg, message);
            let scheme = with_digest!(hash_alg, D => Pss::new_with_salt::<D>(*salt_len));
            key.verify(scheme, &digest, signature)
                .map_err(|_| HsmError::VerifyFailed)
        }
        RsaPadding::Oaep { .. } => Err(HsmError::UnsupportedAlgorithmCombination),
    }
}

/// Public-key encryption.
pub fn encrypt(public: &RsaPublicParts, padding: &RsaPadding, data: &[u8]) -> Result<Vec<u8>> {
    let key = public_key(public)?;
    match padding {
        RsaPadding::None => public_key_operation(public, data),
        RsaPadding::Pkcs1v15 => key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
            .map_err(|_| HsmError::InvalidParameter("message too long")),
        RsaPadding::Oaep {
            hash,
            mgf_hash,
            label,
        } => key
            .encrypt(&mut OsRng, oaep(*hash, *mgf_hash, label)?, data)
            .map_err(|_| HsmError::InvalidParameter("message too long")),
        RsaPadding::Pss { .. } => Err(HsmError::UnsupportedAlgorithmCombination),
    }
}

/// Private-key decryption. Padding failures surface as `UnwrapAuthFailed`
/// so callers cannot tell the padding checks apart.
pub fn decrypt(
    parts: &RsaPrivateParts,
    padding: &RsaPadding,
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let key = private_key(parts)?;
    let plain = match padding {
        RsaPadding::None => raw_exponentiate(
            key.size(),
            data,
            |c| rsa::hazmat::rsa_decrypt_and_check(&key, Some(&mut OsRng), c),
            key.n(),
        )?,
        RsaPadding::Pkcs1v15 => key
            .decrypt(Pkcs1v15Encrypt, data)
            .map_err(|_| HsmError::UnwrapAuthFailed)?,
        RsaPadding::Oaep {
            hash,
            mgf_hash,
            label,
        } => key
            .decrypt(oaep(*hash, *mgf_hash, label)?, data)
            .map_err(|_| HsmError::UnwrapAuthFailed)?,
        RsaPadding::Pss { .. } => return Err(HsmError::UnsupportedAlgorithmCombination),
    };
    Ok(Zeroizing::new(plain))
}

/// Raw `data^e mod n`; the output has the modulus length.
pub fn public_key_operation(public: &RsaPublicParts, data: &[u8]) -> Result<Vec<u8>> {
    let key = public_key(public)?;
    raw_exponentiate(
        key.size(),
        data,
        |m| rsa::hazmat::rsa_encrypt(&key, m),
        key.n(),
    )
}
