//! Key conversion between protection domains.
//!
//! Every crossing has the same shape:
//! 1. Peel the key out from under the source protector
//! 2. Refuse to let a key protect itself
//! 3. Seal the key under the destination protector
//!
//! The plaintext key lives only between steps 1 and 3, in a zeroizing
//! buffer owned by [`convert`]. Protector references are resolved (vault
//! lookup, LMK unwrap, grant check) by the session before they get here.

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::codec::Padding;
use crate::engine::aead::{self, AeadMode};
use crate::engine::symm::{self, SymmParams};
use crate::engine::{ecc, rsa, symm_kcv, ecc_kcv, rsa_kcv};
use crate::error::{HsmError, Result};
use crate::lmk::MasterKeyDomain;
use crate::types::{
    EccCipher, EccCurve, EccKeyRef, EccPrivateParts, EccPublicParts, EccPublicRef, KeyAlgorithm,
    KeyFormat, RsaKeyRef, RsaPadding, RsaPrivateParts, RsaPublicParts, RsaPublicRef, SymmAlg,
    SymmKeyRef, SymmMode, SymmOp, WrappedKey,
};
use crate::vault::PublicPart;

// ---------------------------------------------------------------------------
// Caller-facing protector descriptions
// ---------------------------------------------------------------------------

/// How a KEK encrypts the protected key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KekMode<'a> {
    Ecb,
    Cbc { iv: &'a [u8] },
    /// The tag is appended to the ciphertext. Padding is not applied.
    Gcm { nonce: &'a [u8], aad: &'a [u8] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KekParams<'a> {
    pub mode: KekMode<'a>,
    pub padding: Padding,
}

impl<'a> KekParams<'a> {
    /// ECB with forced ISO pad-80.
    pub fn ecb() -> Self {
        Self {
            mode: KekMode::Ecb,
            padding: Padding::Iso80Forced,
        }
    }

    /// CBC with forced ISO pad-80.
    pub fn cbc(iv: &'a [u8]) -> Self {
        Self {
            mode: KekMode::Cbc { iv },
            padding: Padding::Iso80Forced,
        }
    }

    pub fn gcm(nonce: &'a [u8], aad: &'a [u8]) -> Self {
        Self {
            mode: KekMode::Gcm { nonce, aad },
            padding: Padding::None,
        }
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }
}

impl Default for KekParams<'_> {
    fn default() -> Self {
        Self::ecb()
    }
}

/// Source protector: what opens the incoming ciphertext.
#[derive(Debug, Clone)]
pub enum Unwrapper<'a> {
    Lmk,
    Kek {
        key: SymmKeyRef<'a>,
        params: KekParams<'a>,
    },
    RsaPrivate {
        key: RsaKeyRef<'a>,
        padding: RsaPadding,
    },
    EccPrivate {
        key: EccKeyRef<'a>,
    },
}

/// Destination protector: what seals the outgoing ciphertext.
#[derive(Debug, Clone)]
pub enum Wrapper<'a> {
    Lmk,
    Kek {
        key: SymmKeyRef<'a>,
        params: KekParams<'a>,
    },
    RsaPublic {
        key: RsaPublicRef<'a>,
        padding: RsaPadding,
    },
    EccPublic {
        key: EccPublicRef<'a>,
    },
}

/// The kind of key being carried. For LMK sources the blob header is
/// authoritative and must agree with this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Symmetric(SymmAlg),
    Rsa,
    Ecc(EccCurve),
}

impl KeyKind {
    fn admits(self, algorithm: KeyAlgorithm) -> bool {
        match (self, algorithm) {
            (Self::Symmetric(a), KeyAlgorithm::Symmetric(b)) => a == b,
            (Self::Rsa, KeyAlgorithm::Rsa { .. }) => true,
            (Self::Ecc(a), KeyAlgorithm::Ecc(b)) => a == b,
            _ => false,
        }
    }
}

impl From<KeyAlgorithm> for KeyKind {
    fn from(algorithm: KeyAlgorithm) -> Self {
        match algorithm {
            KeyAlgorithm::Symmetric(alg) => Self::Symmetric(alg),
            KeyAlgorithm::Rsa { .. } => Self::Rsa,
            KeyAlgorithm::Ecc(curve) => Self::Ecc(curve),
        }
    }
}

/// A full conversion request.
#[derive(Debug, Clone)]
pub struct Conversion<'a> {
    /// The key as protected by `from`.
    pub cipher: &'a [u8],
    pub kind: KeyKind,
    pub from: Unwrapper<'a>,
    /// Layout under `from`; ignored for the LMK.
    pub from_format: KeyFormat,
    pub to: Wrapper<'a>,
    /// Layout under `to`; ignored for the LMK.
    pub to_format: KeyFormat,
}

// ---------------------------------------------------------------------------
// Resolved protectors
// ---------------------------------------------------------------------------

pub(crate) enum Opener<'a> {
    Lmk(&'a MasterKeyDomain),
    Kek {
        alg: SymmAlg,
        key: Zeroizing<Vec<u8>>,
        params: KekParams<'a>,
    },
    Rsa {
        private: RsaPrivateParts,
        padding: RsaPadding,
    },
    Ecc {
        private: EccPrivateParts,
    },
}

pub(crate) enum Sealer<'a> {
    Lmk(&'a MasterKeyDomain),
    Kek {
        alg: SymmAlg,
        key: Zeroizing<Vec<u8>>,
        params: KekParams<'a>,
    },
    Rsa {
        public: RsaPublicParts,
        padding: RsaPadding,
    },
    Ecc {
        public: EccPublicParts,
    },
}

/// A key in its LMK payload layout: raw symmetric bytes, RSA PKCS#8 DER,
/// or the fixed-width ECC scalar.
pub(crate) struct Material {
    pub algorithm: KeyAlgorithm,
    pub bytes: Zeroizing<Vec<u8>>,
}

impl Material {
    pub(crate) fn new(algorithm: KeyAlgorithm, bytes: Zeroizing<Vec<u8>>) -> Self {
        Self { algorithm, bytes }
    }

    /// Public half of an asymmetric key.
    pub(crate) fn public_part(&self) -> Result<Option<PublicPart>> {
        Ok(match self.algorithm {
            KeyAlgorithm::Symmetric(_) => None,
            KeyAlgorithm::Rsa { .. } => {
                Some(PublicPart::Rsa(rsa::from_pkcs8_der(&self.bytes)?.public()))
            }
            KeyAlgorithm::Ecc(curve) => Some(PublicPart::Ecc(ecc::public_from_private(
                &EccPrivateParts {
                    curve,
                    d: self.bytes.to_vec(),
                },
            )?)),
        })
    }

    pub(crate) fn kcv(&self, public: Option<&PublicPart>) -> Result<[u8; 8]> {
        match (self.algorithm, public) {
            (KeyAlgorithm::Symmetric(alg), _) => symm_kcv(alg, &self.bytes),
            (_, Some(PublicPart::Rsa(parts))) => Ok(rsa_kcv(parts)),
            (_, Some(PublicPart::Ecc(parts))) => Ok(ecc_kcv(parts)),
            (_, None) => Err(HsmError::InternalFault("asymmetric key without public part")),
        }
    }

    /// Seal under the LMK and compute the check value.
    pub(crate) fn to_lmk(&self, lmk: &MasterKeyDomain) -> Result<(WrappedKey, Option<PublicPart>)> {
        let public = self.public_part()?;
        let kcv = self.kcv(public.as_ref())?;
        let ciphertext = lmk.wrap(self.algorithm, &self.bytes)?;
        Ok((WrappedKey { ciphertext, kcv }, public))
    }
}

fn rsa_protector_padding(padding: &RsaPadding) -> Result<()> {
    match padding {
        RsaPadding::Pkcs1v15 | RsaPadding::Oaep { .. } => Ok(()),
        RsaPadding::None | RsaPadding::Pss { .. } => Err(HsmError::UnsupportedAlgorithmCombination),
    }
}

fn kek_apply(
    alg: SymmAlg,
    key: &[u8],
    params: &KekParams<'_>,
    op: SymmOp,
    data: &[u8],
) -> Result<Vec<u8>> {
    match params.mode {
        KekMode::Ecb => Ok(symm::operate(alg, key, &SymmParams::ecb(op, params.padding), data)?.data),
        KekMode::Cbc { iv } => {
            let symm_params = SymmParams::with_iv(op, SymmMode::Cbc, iv).padding(params.padding);
            Ok(symm::operate(alg, key, &symm_params, data)?.data)
        }
        KekMode::Gcm { nonce, aad } => match op {
            SymmOp::Encrypt => aead::seal(alg, AeadMode::Gcm, key, nonce, aad, data),
            SymmOp::Decrypt => {
                aead::open(alg, AeadMode::Gcm, key, nonce, aad, data).map(|p| p.to_vec())
            }
        },
    }
}

/// Decrypt a non-LMK ciphertext to its transport payload. Any failure is
/// `UnwrapAuthFailed` apart from misconfigured protectors.
pub(crate) fn open_payload(opener: &Opener<'_>, src: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if src.is_empty() {
        return Err(HsmError::InvalidParameter("empty ciphertext"));
    }
    let outcome = match opener {
        Opener::Lmk(lmk) => return lmk.unwrap(src).map(|(_, plain)| plain),
        Opener::Kek { alg, key, params } => {
            kek_apply(*alg, key, params, SymmOp::Decrypt, src).map(Zeroizing::new)
        }
        Opener::Rsa { private, padding } => {
            rsa_protector_padding(padding)?;
            rsa::decrypt(private, padding, src)
        }
        Opener::Ecc { private } => EccCipher::from_bytes(private.curve, src)
            .and_then(|cipher| ecc::decrypt(private, &cipher)),
    };
    outcome.map_err(|err| match err {
        HsmError::UnsupportedAlgorithmCombination => err,
        _ => HsmError::UnwrapAuthFailed,
    })
}

/// Encrypt a transport payload under a non-LMK protector.
pub(crate) fn seal_payload(sealer: &Sealer<'_>, payload: &[u8]) -> Result<Vec<u8>> {
    match sealer {
        Sealer::Lmk(_) => Err(HsmError::InternalFault("lmk sealing needs an algorithm")),
        Sealer::Kek { alg, key, params } => kek_apply(*alg, key, params, SymmOp::Encrypt, payload),
        Sealer::Rsa { public, padding } => {
            rsa_protector_padding(padding)?;
            rsa::encrypt(public, padding, payload)
        }
        Sealer::Ecc { public } => ecc::encrypt(public, payload).map(|c| c.to_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Transport layouts
// ---------------------------------------------------------------------------

/// Leading zero bytes of the "special" ECC layout.
const SPECIAL_PREFIX: usize = 32;

fn reject_mac_formats(format: KeyFormat) -> Result<()> {
    match format {
        KeyFormat::SymmMac | KeyFormat::RsaMac | KeyFormat::EccMac => {
            Err(HsmError::UnsupportedAlgorithmCombination)
        }
        _ => Ok(()),
    }
}

/// Parse a transport payload into LMK layout.
pub(crate) fn decode(kind: KeyKind, format: KeyFormat, payload: &[u8]) -> Result<Material> {
    reject_mac_formats(format)?;
    match (kind, format) {
        (KeyKind::Symmetric(alg), KeyFormat::Raw) => {
            if payload.len() != alg.key_len() {
                return Err(HsmError::KeyFormatInvalid);
            }
            Ok(Material::new(
                KeyAlgorithm::Symmetric(alg),
                Zeroizing::new(payload.to_vec()),
            ))
        }
        (KeyKind::Rsa, KeyFormat::RsaPkcs8 | KeyFormat::RsaPkcs1) => {
            let parts = if format == KeyFormat::RsaPkcs8 {
                rsa::from_pkcs8_der(payload)?
            } else {
                rsa::from_pkcs1_der(payload)?
            };
            let bits = u16::try_from(parts.bits()).map_err(|_| HsmError::KeyFormatInvalid)?;
            Ok(Material::new(
                KeyAlgorithm::Rsa { bits },
                rsa::to_pkcs8_der(&parts)?,
            ))
        }
        (KeyKind::Ecc(curve), KeyFormat::EccPkcs8 | KeyFormat::EccSpecial | KeyFormat::Raw) => {
            let private = match format {
                KeyFormat::EccPkcs8 => {
                    let parsed = ecc::from_pkcs8_der(payload)?;
                    if parsed.curve != curve {
                        return Err(HsmError::KeyFormatInvalid);
                    }
                    parsed
                }
                KeyFormat::EccSpecial => {
                    let width = curve.field_len();
                    if payload.len() != SPECIAL_PREFIX + width
                        || payload[..SPECIAL_PREFIX].iter().any(|b| *b != 0)
                    {
                        return Err(HsmError::KeyFormatInvalid);
                    }
                    EccPrivateParts {
                        curve,
                        d: payload[SPECIAL_PREFIX..].to_vec(),
                    }
                }
                _ => EccPrivateParts {
                    curve,
                    d: payload.to_vec(),
                },
            };
            ecc::check_private(&private)?;
            Ok(Material::new(
                KeyAlgorithm::Ecc(curve),
                Zeroizing::new(private.d.clone()),
            ))
        }
        _ => Err(HsmError::InvalidParameter("format does not match key kind")),
    }
}

/// Lay out LMK-format material for transport.
pub(crate) fn encode(material: &Material, format: KeyFormat) -> Result<Zeroizing<Vec<u8>>> {
    reject_mac_formats(format)?;
    match (material.algorithm, format) {
        (KeyAlgorithm::Symmetric(_), KeyFormat::Raw) => Ok(material.bytes.clone()),
        (KeyAlgorithm::Rsa { .. }, KeyFormat::RsaPkcs8) => Ok(material.bytes.clone()),
        (KeyAlgorithm::Rsa { .. }, KeyFormat::RsaPkcs1) => {
            rsa::to_pkcs1_der(&rsa::from_pkcs8_der(&material.bytes)?)
        }
        (KeyAlgorithm::Ecc(curve), KeyFormat::EccPkcs8) => ecc::to_pkcs8_der(&EccPrivateParts {
            curve,
            d: material.bytes.to_vec(),
        }),
        (KeyAlgorithm::Ecc(_), KeyFormat::EccSpecial) => {
            let mut out = Zeroizing::new(vec![0u8; SPECIAL_PREFIX]);
            out.extend_from_slice(&material.bytes);
            Ok(out)
        }
        (KeyAlgorithm::Ecc(_), KeyFormat::Raw) => Ok(material.bytes.clone()),
        _ => Err(HsmError::InvalidParameter("format does not match key kind")),
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Open `src` under `opener` into LMK layout.
pub(crate) fn peel(
    opener: &Opener<'_>,
    src: &[u8],
    kind: KeyKind,
    format: KeyFormat,
) -> Result<Material> {
    match opener {
        Opener::Lmk(lmk) => {
            let (algorithm, bytes) = lmk.unwrap(src)?;
            if !kind.admits(algorithm) {
                return Err(HsmError::KeyFormatInvalid);
            }
            Ok(Material::new(algorithm, bytes))
        }
        _ => {
            let payload = open_payload(opener, src)?;
            decode(kind, format, &payload).map_err(|err| match err {
                HsmError::KeyFormatInvalid => HsmError::UnwrapAuthFailed,
                other => other,
            })
        }
    }
}

/// Seal LMK-layout material under `sealer`.
pub(crate) fn seal(sealer: &Sealer<'_>, material: &Material, format: KeyFormat) -> Result<Vec<u8>> {
    match sealer {
        Sealer::Lmk(lmk) => lmk.wrap(material.algorithm, &material.bytes),
        _ => {
            let payload = encode(material, format)?;
            seal_payload(sealer, &payload)
        }
    }
}

/// Refuse a destination protector that is the protected key itself.
pub(crate) fn check_not_self(material: &Material, sealer: &Sealer<'_>) -> Result<()> {
    let same = match (material.algorithm, sealer) {
        (KeyAlgorithm::Symmetric(_), Sealer::Kek { key, .. }) => {
            bool::from(material.bytes.as_slice().ct_eq(key.as_slice()))
        }
        (KeyAlgorithm::Rsa { .. }, Sealer::Rsa { public, .. }) => {
            material.public_part()?.as_ref().and_then(PublicPart::as_rsa) == Some(public)
        }
        (KeyAlgorithm::Ecc(_), Sealer::Ecc { public }) => {
            material.public_part()?.as_ref().and_then(PublicPart::as_ecc) == Some(public)
        }
        _ => false,
    };
    if same {
        return Err(HsmError::InvalidParameter("key cannot protect itself"));
    }
    Ok(())
}

/// Move a key from one protector to another.
pub(crate) fn convert(
    src: &[u8],
    opener: &Opener<'_>,
    sealer: &Sealer<'_>,
    kind: KeyKind,
    from_format: KeyFormat,
    to_format: KeyFormat,
) -> Result<(Vec<u8>, KeyAlgorithm)> {
    // Peel
    let material = peel(opener, src, kind, from_format)?;

    // Refuse self-protection
    check_not_self(&material, sealer)?;

    // Seal
    let out = seal(sealer, &material, to_format)?;
    Ok((out, material.algorithm))
}
