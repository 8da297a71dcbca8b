//! Elliptic-curve keys, ECDSA over digests and the EC-ElGamal envelope.
//!
//! The envelope follows the SM2 public-key encryption layout:
//! `C1 = kG`, `(x2, y2) = kP`, `t = KDF(x2 | y2, len)`, `C = M ^ t` and the
//! check value `SM3(x2 | M | y2)`, serialised as `x | y | check | C`.

use ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use elliptic_curve::group::Group as _;
use elliptic_curve::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use elliptic_curve::sec1::ToEncodedPoint;
use elliptic_curve::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::hash::hash;
use super::kdf::sm3_kdf;
use crate::error::{HsmError, Result};
use crate::types::{EccCipher, EccCurve, EccPrivateParts, EccPublicParts, EccSignature, HashAlg};

/// Curves with an arithmetic backend.
pub const ARITHMETIC_CURVES: [EccCurve; 3] =
    [EccCurve::NistP256, EccCurve::Secp256k1, EccCurve::Secp384r1];

/// Split an uncompressed SEC1 encoding into public parts.
fn split_point(curve: EccCurve, encoded: &[u8]) -> Result<EccPublicParts> {
    EccPublicParts::from_sec1(curve, encoded).map_err(|_| HsmError::InternalFault("point encoding"))
}

/// Fresh key pair.
pub fn generate(curve: EccCurve) -> Result<(EccPrivateParts, EccPublicParts)> {
    with_curve!(curve, C => {
        let secret = SecretKey::<C>::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        Ok((
            EccPrivateParts {
                curve,
                d: secret.to_bytes().to_vec(),
            },
            split_point(curve, public.as_bytes())?,
        ))
    })
}

/// Derive `dG`.
pub fn public_from_private(private: &EccPrivateParts) -> Result<EccPublicParts> {
    let curve = private.curve;
    with_curve!(curve, C => {
        let secret = SecretKey::<C>::from_slice(&private.d).map_err(|_| HsmError::KeyFormatInvalid)?;
        split_point(curve, secret.public_key().to_encoded_point(false).as_bytes())
    })
}

/// Reject points that are off the curve or the identity.
pub fn check_public(public: &EccPublicParts) -> Result<()> {
    public.check_width()?;
    with_curve!(public.curve, C => {
        PublicKey::<C>::from_sec1_bytes(&public.to_sec1())
            .map(|_| ())
            .map_err(|_| HsmError::InvalidParameter("public point"))
    })
}

/// Reject scalars outside `[1, n)` or of the wrong width.
pub fn check_private(private: &EccPrivateParts) -> Result<()> {
    if private.d.len() != private.curve.field_len() {
        return Err(HsmError::KeyFormatInvalid);
    }
    with_curve!(private.curve, C => {
        SecretKey::<C>::from_slice(&private.d)
            .map(|_| ())
            .map_err(|_| HsmError::KeyFormatInvalid)
    })
}

/// PKCS#8 DER of a private key. The public key is embedded.
pub fn to_pkcs8_der(private: &EccPrivateParts) -> Result<Zeroizing<Vec<u8>>> {
    with_curve!(private.curve, C => {
        let secret = SecretKey::<C>::from_slice(&private.d).map_err(|_| HsmError::KeyFormatInvalid)?;
        let doc = secret
            .to_pkcs8_der()
            .map_err(|_| HsmError::InternalFault("pkcs8 encoding"))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    })
}

/// Parse PKCS#8 DER; the curve comes from the algorithm parameters.
pub fn from_pkcs8_der(der: &[u8]) -> Result<EccPrivateParts> {
    for curve in ARITHMETIC_CURVES {
        let parsed: Result<Vec<u8>> = with_curve!(curve, C => {
            SecretKey::<C>::from_pkcs8_der(der)
                .map(|secret| secret.to_bytes().to_vec())
                .map_err(|_| HsmError::KeyFormatInvalid)
        });
        if let Ok(d) = parsed {
            return Ok(EccPrivateParts { curve, d });
        }
    }
    Err(HsmError::KeyFormatInvalid)
}

/// ECDSA over a caller-computed digest; `r` and `s` are fixed width.
pub fn sign_hash(private: &EccPrivateParts, digest: &[u8]) -> Result<EccSignature> {
    let width = private.curve.field_len();
    with_curve!(private.curve, C => {
        let signer = ecdsa::SigningKey::<C>::from_slice(&private.d)
            .map_err(|_| HsmError::KeyFormatInvalid)?;
        let signature: ecdsa::Signature<C> = signer
            .sign_prehash(digest)
            .map_err(|_| HsmError::InvalidParameter("digest length"))?;
        let bytes = signature.to_bytes();
        Ok(EccSignature {
            r: bytes[..width].to_vec(),
            s: bytes[width..].to_vec(),
        })
    })
}

/// Verify an ECDSA signature over a digest.
pub fn verify_hash(public: &EccPublicParts, digest: &[u8], signature: &EccSignature) -> Result<()> {
    public.check_width()?;
    let width = public.curve.field_len();
    if signature.r.len() != width || signature.s.len() != width {
        return Err(HsmError::InvalidParameter("signature width"));
    }
    with_curve!(public.curve, C => {
        let verifier = ecdsa::VerifyingKey::<C>::from_sec1_bytes(&public.to_sec1())
            .map_err(|_| HsmError::InvalidParameter("public point"))?;
        let rs = [&signature.r[..], &signature.s[..]].concat();
        let parsed = ecdsa::Signature::<C>::from_slice(&rs).map_err(|_| HsmError::VerifyFailed)?;
        verifier
            .verify_prehash(digest, &parsed)
            .map_err(|_| HsmError::VerifyFailed)
    })
}

fn envelope_check(x2: &[u8], data: &[u8], y2: &[u8]) -> Vec<u8> {
    hash(HashAlg::Sm3, &[x2, data, y2].concat())
}

/// EC-ElGamal encryption to `public`.
pub fn encrypt(public: &EccPublicParts, data: &[u8]) -> Result<EccCipher> {
    public.check_width()?;
    if data.is_empty() {
        return Err(HsmError::InvalidParameter("empty input"));
    }
    with_curve!(public.curve, C => {
        let peer = PublicKey::<C>::from_sec1_bytes(&public.to_sec1())
            .map_err(|_| HsmError::InvalidParameter("public point"))?;
        loop {
            let k = elliptic_curve::NonZeroScalar::<C>::random(&mut OsRng);
            let c1 = (elliptic_curve::ProjectivePoint::<C>::generator() * *k)
                .to_affine()
                .to_encoded_point(false);
            let shared = (peer.to_projective() * *k).to_affine().to_encoded_point(false);
            let (Some(x1), Some(y1), Some(x2), Some(y2)) = (c1.x(), c1.y(), shared.x(), shared.y())
            else {
                return Err(HsmError::InternalFault("identity point"));
            };
            let z = Zeroizing::new([&x2[..], &y2[..]].concat());
            let mask = sm3_kdf(&z, data.len())?;
            if mask.iter().all(|b| *b == 0) {
                continue;
            }
            let c = data.iter().zip(mask.iter()).map(|(d, t)| d ^ t).collect();
            break Ok(EccCipher {
                x: x1.to_vec(),
                y: y1.to_vec(),
                m: envelope_check(x2, data, y2),
                c,
            });
        }
    })
}

/// EC-ElGamal decryption. A failed check value is `AuthTagMismatch` and
/// releases nothing.
pub fn decrypt(private: &EccPrivateParts, cipher: &EccCipher) -> Result<Zeroizing<Vec<u8>>> {
    let curve = private.curve;
    let width = curve.field_len();
    if cipher.x.len() != width || cipher.y.len() != width || cipher.m.len() != EccCipher::M_LEN {
        return Err(HsmError::InvalidParameter("ecc ciphertext layout"));
    }
    if cipher.c.is_empty() {
        return Err(HsmError::InvalidParameter("ecc ciphertext layout"));
    }
    with_curve!(curve, C => {
        let secret = SecretKey::<C>::from_slice(&private.d).map_err(|_| HsmError::KeyFormatInvalid)?;
        let c1_sec1 = [&[0x04u8][..], &cipher.x, &cipher.y].concat();
        let c1 = PublicKey::<C>::from_sec1_bytes(&c1_sec1)
            .map_err(|_| HsmError::InvalidParameter("ephemeral point"))?;
        let shared = (c1.to_projective() * *secret.to_nonzero_scalar())
            .to_affine()
            .to_encoded_point(false);
        let (Some(x2), Some(y2)) = (shared.x(), shared.y()) else {
            return Err(HsmError::InternalFault("identity point"));
        };
        let z = Zeroizing::new([&x2[..], &y2[..]].concat());
        let mask = sm3_kdf(&z, cipher.c.len())?;
        if mask.iter().all(|b| *b == 0) {
            return Err(HsmError::AuthTagMismatch);
        }
        let plain: Zeroizing<Vec<u8>> =
            Zeroizing::new(cipher.c.iter().zip(mask.iter()).map(|(c, t)| c ^ t).collect());
        let check = envelope_check(x2, &plain, y2);
        if bool::from(check.ct_eq(&cipher.m)) {
            Ok(plain)
        } else {
            Err(HsmError::AuthTagMismatch)
        }
    })
}

/// Raw ECDH: the x coordinate of `d * Q`.
pub(crate) fn shared_x(private: &EccPrivateParts, peer: &EccPublicParts) -> Result<Zeroizing<Vec<u8>>> {
    if private.curve != peer.curve {
        return Err(HsmError::InvalidParameter("curve mismatch"));
    }
    peer.check_width()?;
    with_curve!(private.curve, C => {
        let secret = SecretKey::<C>::from_slice(&private.d).map_err(|_| HsmError::KeyFormatInvalid)?;
        let public = PublicKey::<C>::from_sec1_bytes(&peer.to_sec1())
            .map_err(|_| HsmError::InvalidParameter("public point"))?;
        let shared = elliptic_curve::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    })
}
