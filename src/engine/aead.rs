//! GCM and CCM, one-shot and streaming.
//!
//! Streaming contexts buffer their input and run the whole AEAD at
//! `finish`, so a decryption never releases plaintext before the tag has
//! been checked.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::AesGcm;
use ccm::Ccm;
use cipher::consts::{U12, U13, U16};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::check_key_len;
use crate::error::{HsmError, Result};
use crate::types::{SessionId, SymmAlg, SymmMode, SymmOp};

/// Authentication tag length for both modes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AeadMode {
    Gcm,
    Ccm,
}

impl AeadMode {
    pub fn from_symm_mode(mode: SymmMode) -> Result<Self> {
        match mode {
            SymmMode::Gcm => Ok(Self::Gcm),
            SymmMode::Ccm => Ok(Self::Ccm),
            _ => Err(HsmError::InvalidParameter("not an AEAD mode")),
        }
    }

    fn check_nonce(self, nonce: &[u8]) -> Result<()> {
        let ok = match self {
            Self::Gcm => matches!(nonce.len(), 12 | 16),
            Self::Ccm => matches!(nonce.len(), 12 | 13),
        };
        if !ok {
            return Err(HsmError::InvalidParameter("nonce length"));
        }
        Ok(())
    }
}

/// Expand `$body` with `$A` bound to the AEAD type for the cipher, mode and
/// nonce length.
macro_rules! with_aead {
    ($alg:expr, $mode:expr, $nonce_len:expr, $A:ident => $body:expr) => {
        with_wide_block_cipher!($alg, C => match ($mode, $nonce_len) {
            (AeadMode::Gcm, 12) => {
                type $A = AesGcm<C, U12>;
                $body
            }
            (AeadMode::Gcm, 16) => {
                type $A = AesGcm<C, U16>;
                $body
            }
            (AeadMode::Ccm, 12) => {
                type $A = Ccm<C, U16, U12>;
                $body
            }
            (AeadMode::Ccm, 13) => {
                type $A = Ccm<C, U16, U13>;
                $body
            }
            _ => Err(HsmError::InvalidParameter("nonce length")),
        })
    };
}

fn validate(alg: SymmAlg, mode: AeadMode, key: &[u8], nonce: &[u8]) -> Result<()> {
    check_key_len(alg, key)?;
    if alg.block_len() != 16 {
        return Err(HsmError::UnsupportedAlgorithmCombination);
    }
    mode.check_nonce(nonce)
}

/// Encrypt `buf` in place, returning the tag.
pub fn seal_detached(
    alg: SymmAlg,
    mode: AeadMode,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN]> {
    validate(alg, mode, key, nonce)?;
    let tag = with_aead!(alg, mode, nonce.len(), A => {
        let aead = A::new_from_slice(key).map_err(|_| HsmError::InvalidParameter("key length"))?;
        aead.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
            .map(|tag| tag.to_vec())
            .map_err(|_| HsmError::InternalFault("aead seal"))
    })?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `buf` in place after checking `tag`. On a mismatch `buf` is
/// cleared before returning.
pub fn open_detached(
    alg: SymmAlg,
    mode: AeadMode,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8],
) -> Result<()> {
    validate(alg, mode, key, nonce)?;
    if tag.len() != TAG_LEN {
        return Err(HsmError::InvalidParameter("tag length"));
    }
    let outcome = with_aead!(alg, mode, nonce.len(), A => {
        let aead = A::new_from_slice(key).map_err(|_| HsmError::InvalidParameter("key length"))?;
        aead.decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| HsmError::AuthTagMismatch)
    });
    if outcome.is_err() {
        buf.fill(0);
    }
    outcome
}

/// One-shot encryption. Output is `ciphertext | tag`.
pub fn seal(
    alg: SymmAlg,
    mode: AeadMode,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut out = plaintext.to_vec();
    let tag = seal_detached(alg, mode, key, nonce, aad, &mut out)?;
    out.extend_from_slice(&tag);
    Ok(out)
}

/// One-shot decryption of `ciphertext | tag`.
pub fn open(
    alg: SymmAlg,
    mode: AeadMode,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < TAG_LEN {
        return Err(HsmError::InvalidParameter("input shorter than tag"));
    }
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    let mut out = Zeroizing::new(body.to_vec());
    open_detached(alg, mode, key, nonce, aad, &mut out, tag)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Output of a finished streaming encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// An in-progress GCM/CCM operation. Owned by the session that created it;
/// dropping it discards the buffered input and key.
pub struct AeadContext {
    owner: SessionId,
    alg: SymmAlg,
    mode: AeadMode,
    op: SymmOp,
    key: Zeroizing<Vec<u8>>,
    nonce: Vec<u8>,
    aad: Vec<u8>,
    buffer: Zeroizing<Vec<u8>>,
    cap: usize,
}

impl fmt::Debug for AeadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadContext")
            .field("owner", &self.owner)
            .field("alg", &self.alg)
            .field("mode", &self.mode)
            .field("op", &self.op)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// Parameters captured at init.
#[derive(Debug, Clone, Copy)]
pub struct AeadInit<'a> {
    pub alg: SymmAlg,
    pub mode: AeadMode,
    pub op: SymmOp,
    pub nonce: &'a [u8],
    pub aad: &'a [u8],
}

impl AeadContext {
    pub(crate) fn init(
        owner: SessionId,
        params: &AeadInit<'_>,
        key: Zeroizing<Vec<u8>>,
        cap: usize,
    ) -> Result<Self> {
        validate(params.alg, params.mode, &key, params.nonce)?;
        Ok(Self {
            owner,
            alg: params.alg,
            mode: params.mode,
            op: params.op,
            key,
            nonce: params.nonce.to_vec(),
            aad: params.aad.to_vec(),
            buffer: Zeroizing::new(Vec::new()),
            cap,
        })
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn op(&self) -> SymmOp {
        self.op
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn update(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buffer.len() + chunk.len() > self.cap {
            return Err(HsmError::InvalidParameter("stream buffer limit"));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn finish_encrypt(self) -> Result<Sealed> {
        if self.op != SymmOp::Encrypt {
            return Err(HsmError::InvalidContextState);
        }
        let mut ciphertext = self.buffer.to_vec();
        let tag = seal_detached(
            self.alg,
            self.mode,
            &self.key,
            &self.nonce,
            &self.aad,
            &mut ciphertext,
        )?;
        Ok(Sealed { ciphertext, tag })
    }

    pub(crate) fn finish_decrypt(self, tag: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if self.op != SymmOp::Decrypt {
            return Err(HsmError::InvalidContextState);
        }
        let mut plaintext = Zeroizing::new(self.buffer.to_vec());
        open_detached(
            self.alg,
            self.mode,
            &self.key,
            &self.nonce,
            &self.aad,
            &mut plaintext,
            tag,
        )?;
        Ok(plaintext)
    }
}
