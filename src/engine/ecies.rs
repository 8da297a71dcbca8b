//! ECIES hybrid encryption.
//!
//! An ephemeral key pair agrees a shared `x` with the recipient, a counter
//! KDF stretches it into an encryption key and an optional MAC key, the
//! payload is XOR-masked or CBC-encrypted, and the MAC covers `C | S2`.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::ecc;
use super::kdf::{counter_kdf, CounterKdf, SharedInfoOrder};
use super::mac;
use super::symm::{self, SymmParams};
use crate::codec::Padding;
use crate::error::{HsmError, Result};
use crate::types::{EccPrivateParts, EccPublicParts, HashAlg, SymmAlg, SymmMode, SymmOp};

/// How the payload is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EciesCipher {
    /// XOR with a KDF stream as long as the payload.
    Xor,
    /// CBC with PKCS#7 padding and a zero IV.
    Block { alg: SymmAlg },
}

/// Scheme selection shared by both sides.
#[derive(Debug, Clone, Copy)]
pub struct EciesParams<'a> {
    pub kdf: CounterKdf,
    pub hash: HashAlg,
    pub order: SharedInfoOrder,
    /// KDF shared info.
    pub s1: &'a [u8],
    /// MAC shared info.
    pub s2: &'a [u8],
    pub cipher: EciesCipher,
    /// `None` omits the tag.
    pub mac_hash: Option<HashAlg>,
}

impl<'a> EciesParams<'a> {
    /// X9.63 over SHA-256, XOR cipher, HMAC-SHA-256.
    pub fn new() -> Self {
        Self {
            kdf: CounterKdf::X963,
            hash: HashAlg::Sha256,
            order: SharedInfoOrder::SecretFirst,
            s1: &[],
            s2: &[],
            cipher: EciesCipher::Xor,
            mac_hash: Some(HashAlg::Sha256),
        }
    }
}

impl Default for EciesParams<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ephemeral public key, ciphertext and optional tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EciesEnvelope {
    pub ephemeral: EccPublicParts,
    pub ciphertext: Vec<u8>,
    pub tag: Option<Vec<u8>>,
}

struct DerivedKeys {
    material: Zeroizing<Vec<u8>>,
    enc_len: usize,
}

impl DerivedKeys {
    fn enc(&self) -> &[u8] {
        &self.material[..self.enc_len]
    }

    fn mac(&self) -> &[u8] {
        &self.material[self.enc_len..]
    }
}

fn derive(params: &EciesParams<'_>, shared: &[u8], payload_len: usize) -> Result<DerivedKeys> {
    let enc_len = match params.cipher {
        EciesCipher::Xor => payload_len,
        EciesCipher::Block { alg } => alg.key_len(),
    };
    let mac_len = params.mac_hash.map_or(0, HashAlg::output_len);
    let material = counter_kdf(
        params.kdf,
        params.hash,
        shared,
        params.s1,
        params.order,
        enc_len + mac_len,
    )?;
    Ok(DerivedKeys { material, enc_len })
}

fn compute_tag(
    params: &EciesParams<'_>,
    keys: &DerivedKeys,
    ciphertext: &[u8],
) -> Result<Option<Vec<u8>>> {
    params
        .mac_hash
        .map(|hash| mac::hmac(hash, keys.mac(), &[ciphertext, params.s2].concat()))
        .transpose()
}

fn block_params(op: SymmOp, zero_iv: &[u8]) -> SymmParams<'_> {
    SymmParams::with_iv(op, SymmMode::Cbc, zero_iv).padding(Padding::Pkcs7)
}

/// Encrypt `data` to `recipient`.
pub fn encrypt(
    recipient: &EccPublicParts,
    params: &EciesParams<'_>,
    data: &[u8],
) -> Result<EciesEnvelope> {
    if data.is_empty() {
        return Err(HsmError::InvalidParameter("empty input"));
    }
    ecc::check_public(recipient)?;
    let (ephemeral_private, ephemeral) = ecc::generate(recipient.curve)?;
    let shared = ecc::shared_x(&ephemeral_private, recipient)?;
    let keys = derive(params, &shared, data.len())?;

    let ciphertext = match params.cipher {
        EciesCipher::Xor => data.iter().zip(keys.enc()).map(|(d, k)| d ^ k).collect(),
        EciesCipher::Block { alg } => {
            let zero_iv = vec![0u8; alg.block_len()];
            symm::operate(alg, keys.enc(), &block_params(SymmOp::Encrypt, &zero_iv), data)?.data
        }
    };
    let tag = compute_tag(params, &keys, &ciphertext)?;
    Ok(EciesEnvelope {
        ephemeral,
        ciphertext,
        tag,
    })
}

/// Decrypt an envelope. The tag is checked before any decryption.
pub fn decrypt(
    private: &EccPrivateParts,
    params: &EciesParams<'_>,
    envelope: &EciesEnvelope,
) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.ciphertext.is_empty() {
        return Err(HsmError::InvalidParameter("empty input"));
    }
    let shared = ecc::shared_x(private, &envelope.ephemeral)?;
    let keys = derive(params, &shared, envelope.ciphertext.len())?;

    match (params.mac_hash, &envelope.tag) {
        (Some(hash), Some(tag)) => mac::verify_hmac(
            hash,
            keys.mac(),
            &[&envelope.ciphertext[..], params.s2].concat(),
            tag,
        )?,
        (None, None) => {}
        _ => return Err(HsmError::InvalidParameter("tag presence")),
    }

    match params.cipher {
        EciesCipher::Xor => Ok(Zeroizing::new(
            envelope
                .ciphertext
                .iter()
                .zip(keys.enc())
                .map(|(c, k)| c ^ k)
                .collect(),
        )),
        EciesCipher::Block { alg } => {
            let zero_iv = vec![0u8; alg.block_len()];
            symm::operate(
                alg,
                keys.enc(),
                &block_params(SymmOp::Decrypt, &zero_iv),
                &envelope.ciphertext,
            )
            .map(|out| Zeroizing::new(out.data))
            .map_err(|_| HsmError::AuthTagMismatch)
        }
    }
}
