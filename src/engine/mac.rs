//! Message authentication: ISO/IEC 9797-1 CBC-MAC, CMAC and HMAC, the
//! framed multi-call variants and the SP 800-108 CMAC counter KDF.

use std::fmt;

use cipher::{BlockDecrypt, BlockEncrypt};
use cmac::Cmac;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{check_key_len, new_cipher};
use crate::codec::Padding;
use crate::error::{HsmError, Result};
use crate::types::{DataBlock, HashAlg, SessionId, SymmAlg};

/// ISO/IEC 9797-1 MAC algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CbcMacMode {
    /// Algorithm 1: plain CBC-MAC, output is the last chaining block.
    #[default]
    Iso9797Alg1,
    /// Algorithm 3 ("retail MAC"): single-DES chaining with a two-key
    /// final transformation. Two-key triple DES only.
    Iso9797Alg3,
}

/// ISO/IEC 9797-1 CBC-MAC over `data`. `iv` defaults to a zero block.
pub fn cbc_mac(
    alg: SymmAlg,
    mode: CbcMacMode,
    key: &[u8],
    iv: Option<&[u8]>,
    padding: Padding,
    data: &[u8],
) -> Result<Vec<u8>> {
    check_key_len(alg, key)?;
    if data.is_empty() {
        return Err(HsmError::InvalidParameter("empty input"));
    }
    let block = alg.block_len();
    let mut chain = match iv {
        Some(iv) if iv.len() == block => iv.to_vec(),
        Some(_) => return Err(HsmError::InvalidParameter("iv length")),
        None => vec![0u8; block],
    };
    let padded = Zeroizing::new(padding.pad(data, block)?);

    match mode {
        CbcMacMode::Iso9797Alg1 => with_block_cipher!(alg, C => {
            let engine: C = new_cipher(key)?;
            chain_blocks(&engine, &mut chain, &padded);
        }),
        CbcMacMode::Iso9797Alg3 => {
            if alg != SymmAlg::Tdes128 {
                return Err(HsmError::UnsupportedAlgorithmCombination);
            }
            let first: des::Des = new_cipher(&key[..8])?;
            let second: des::Des = new_cipher(&key[8..16])?;
            chain_blocks(&first, &mut chain, &padded);
            let last = cipher::Block::<des::Des>::from_mut_slice(&mut chain);
            second.decrypt_block(last);
            first.encrypt_block(last);
        }
    }
    Ok(chain)
}

fn chain_blocks<C: BlockEncrypt>(engine: &C, chain: &mut [u8], data: &[u8]) {
    for chunk in data.chunks(chain.len()) {
        chain.iter_mut().zip(chunk).for_each(|(c, b)| *c ^= b);
        engine.encrypt_block(cipher::Block::<C>::from_mut_slice(chain));
    }
}

/// NIST SP 800-38B CMAC.
pub fn cmac(alg: SymmAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_key_len(alg, key)?;
    with_block_cipher!(alg, C => {
        let mut mac = <Cmac<C> as Mac>::new_from_slice(key)
            .map_err(|_| HsmError::InvalidParameter("key length"))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    })
}

/// RFC 2104 HMAC. Any key length is accepted.
pub fn hmac(hash: HashAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.is_empty() {
        return Err(HsmError::InvalidParameter("empty key"));
    }
    with_digest!(hash, D => {
        let mut mac = <Hmac<D> as Mac>::new_from_slice(key)
            .map_err(|_| HsmError::InvalidParameter("key length"))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    })
}

/// Constant-time HMAC check.
pub fn verify_hmac(hash: HashAlg, key: &[u8], data: &[u8], tag: &[u8]) -> Result<()> {
    with_digest!(hash, D => {
        let mut mac = <Hmac<D> as Mac>::new_from_slice(key)
            .map_err(|_| HsmError::InvalidParameter("key length"))?;
        mac.update(data);
        mac.verify_slice(tag).map_err(|_| HsmError::AuthTagMismatch)
    })
}

/// NIST SP 800-108 counter-mode KDF with CMAC as the PRF:
/// `K(i) = CMAC(key, [i]32 | label | 0x00 | context | [L]32)`.
pub fn prf_kdf_cmac(
    alg: SymmAlg,
    key: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    crate::engine::kdf::check_derived_len(len)?;
    let bits = len
        .checked_mul(8)
        .and_then(|b| u32::try_from(b).ok())
        .ok_or(HsmError::InvalidParameter("kdf output length"))?;
    let block = alg.block_len();
    let rounds = u32::try_from(len.div_ceil(block))
        .map_err(|_| HsmError::InvalidParameter("kdf output length"))?;

    let mut fixed = Vec::with_capacity(label.len() + context.len() + 5);
    fixed.extend_from_slice(label);
    fixed.push(0x00);
    fixed.extend_from_slice(context);
    fixed.extend_from_slice(&bits.to_be_bytes());

    let mut out = Zeroizing::new(Vec::with_capacity(rounds as usize * block));
    for i in 1..=rounds {
        let input = [&i.to_be_bytes()[..], &fixed].concat();
        out.extend_from_slice(&cmac(alg, key, &input)?);
    }
    out.truncate(len);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Framed multi-call MACs
// ---------------------------------------------------------------------------

/// Which MAC a framed context computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacSpec {
    CbcMac {
        alg: SymmAlg,
        mode: CbcMacMode,
        padding: Padding,
    },
    Cmac {
        alg: SymmAlg,
    },
    Hmac {
        hash: HashAlg,
    },
}

/// Buffered state of a framed MAC. Owned by one session.
pub struct MacContext {
    owner: SessionId,
    spec: MacSpec,
    key: Zeroizing<Vec<u8>>,
    iv: Option<Vec<u8>>,
    buffered: Zeroizing<Vec<u8>>,
    cap: usize,
}

impl fmt::Debug for MacContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacContext")
            .field("owner", &self.owner)
            .field("spec", &self.spec)
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

/// Result of feeding one framed block.
#[derive(Debug)]
pub enum MacProgress {
    /// More blocks expected; present this context with the next one.
    Pending(MacContext),
    /// `Last` was processed.
    Done(Vec<u8>),
}

impl MacContext {
    pub(crate) fn init(
        owner: SessionId,
        spec: MacSpec,
        key: Zeroizing<Vec<u8>>,
        iv: Option<&[u8]>,
        cap: usize,
    ) -> Result<Self> {
        match spec {
            MacSpec::CbcMac { alg, .. } | MacSpec::Cmac { alg } => check_key_len(alg, &key)?,
            MacSpec::Hmac { .. } if key.is_empty() => {
                return Err(HsmError::InvalidParameter("empty key"))
            }
            MacSpec::Hmac { .. } => {}
        }
        Ok(Self {
            owner,
            spec,
            key,
            iv: iv.map(<[u8]>::to_vec),
            buffered: Zeroizing::new(Vec::new()),
            cap,
        })
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn spec(&self) -> MacSpec {
        self.spec
    }

    fn absorb(&mut self, data: &[u8]) -> Result<()> {
        if self.buffered.len() + data.len() > self.cap {
            return Err(HsmError::InvalidParameter("stream buffer limit"));
        }
        self.buffered.extend_from_slice(data);
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        match self.spec {
            MacSpec::CbcMac { alg, mode, padding } => cbc_mac(
                alg,
                mode,
                &self.key,
                self.iv.as_deref(),
                padding,
                &self.buffered,
            ),
            MacSpec::Cmac { alg } => cmac(alg, &self.key, &self.buffered),
            MacSpec::Hmac { hash } => hmac(hash, &self.key, &self.buffered),
        }
    }
}

/// Advance a framed MAC by one block.
///
/// `First` must arrive without a context and `Mid`/`Last` with one; any
/// other pairing is `InvalidContextState`. `start` builds the context for
/// `First` and is not called otherwise.
pub(crate) fn step(
    ctx: Option<MacContext>,
    block: DataBlock,
    start: impl FnOnce() -> Result<MacContext>,
    data: &[u8],
) -> Result<MacProgress> {
    let mut ctx = match (block, ctx) {
        (DataBlock::First, None) => start()?,
        (DataBlock::Mid | DataBlock::Last, Some(ctx)) => ctx,
        _ => return Err(HsmError::InvalidContextState),
    };
    ctx.absorb(data)?;
    match block {
        DataBlock::Last => ctx.finish().map(MacProgress::Done),
        DataBlock::First | DataBlock::Mid => Ok(MacProgress::Pending(ctx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AES_KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const TDES_KEY: &str = "0123456789abcdeffedcba9876543210";

    fn aes_key() -> Vec<u8> {
        hex::decode(AES_KEY).unwrap()
    }

    #[test]
    fn cmac_rfc4493_vectors() {
        let key = aes_key();
        assert_eq!(
            hex::encode(cmac(SymmAlg::Aes128, &key, b"").unwrap()),
            "bb1d6929e95937287fa37d129b756746"
        );
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(
            hex::encode(cmac(SymmAlg::Aes128, &key, &msg).unwrap()),
            "070a16b46b4d4144f79bdd9dd04a287c"
        );
    }

    #[test]
    fn hmac_rfc4231_case_2() {
        let tag = hmac(HashAlg::Sha256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(&tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(verify_hmac(HashAlg::Sha256, b"Jefe", b"what do ya want for nothing?", &tag).is_ok());
        assert_eq!(
            verify_hmac(HashAlg::Sha256, b"Jefe", b"what do ya want for nothing!", &tag),
            Err(HsmError::AuthTagMismatch)
        );
    }

    #[test]
    fn hmac_accepts_sm3() {
        assert_eq!(hmac(HashAlg::Sm3, b"key", b"data").unwrap().len(), 32);
    }

    #[test]
    fn cbc_mac_algorithm_1_and_3() {
        let key = hex::decode(TDES_KEY).unwrap();
        let data = b"Now is the time for all ";
        let alg1 = cbc_mac(
            SymmAlg::Tdes128,
            CbcMacMode::Iso9797Alg1,
            &key,
            None,
            Padding::None,
            data,
        )
        .unwrap();
        assert_eq!(hex::encode(alg1), "93462a6db9b4a4d1");

        let alg3 = cbc_mac(
            SymmAlg::Tdes128,
            CbcMacMode::Iso9797Alg3,
            &key,
            None,
            Padding::None,
            data,
        )
        .unwrap();
        assert_eq!(hex::encode(alg3), "a1c72e74ea3fa9b6");
    }

    #[test]
    fn retail_mac_needs_two_key_tdes() {
        assert_eq!(
            cbc_mac(
                SymmAlg::Aes128,
                CbcMacMode::Iso9797Alg3,
                &aes_key(),
                None,
                Padding::Iso80Forced,
                b"x",
            ),
            Err(HsmError::UnsupportedAlgorithmCombination)
        );
    }

    #[test]
    fn unaligned_cbc_mac_without_padding_is_rejected() {
        assert!(cbc_mac(
            SymmAlg::Aes128,
            CbcMacMode::Iso9797Alg1,
            &aes_key(),
            None,
            Padding::None,
            b"short",
        )
        .is_err());
    }

    #[test]
    fn prf_kdf_matches_sp800_108_layout() {
        let key: Vec<u8> = (0u8..16).collect();
        let out = prf_kdf_cmac(SymmAlg::Aes128, &key, b"label", b"context", 32).unwrap();
        assert_eq!(
            hex::encode(out.as_slice()),
            "4a63599f94bd3bf38b763386bb5397c690a3a40600f96a691059cc001c163c49"
        );
    }

    #[test]
    fn prf_kdf_output_is_bounded() {
        let key = [0u8; 16];
        for len in [0, (1 << 29) - 1] {
            assert!(matches!(
                prf_kdf_cmac(SymmAlg::Aes128, &key, b"label", b"", len),
                Err(HsmError::InvalidParameter(_))
            ));
        }
    }

    fn start_cmac(owner: SessionId) -> impl FnOnce() -> Result<MacContext> {
        move || {
            MacContext::init(
                owner,
                MacSpec::Cmac { alg: SymmAlg::Aes128 },
                Zeroizing::new(aes_key()),
                None,
                1024,
            )
        }
    }

    #[test]
    fn framed_cmac_matches_single_shot() {
        let owner = SessionId(1);
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let MacProgress::Pending(ctx) =
            step(None, DataBlock::First, start_cmac(owner), &msg[..5]).unwrap()
        else {
            panic!("expected a pending context");
        };
        let MacProgress::Pending(ctx) =
            step(Some(ctx), DataBlock::Mid, start_cmac(owner), &msg[5..9]).unwrap()
        else {
            panic!("expected a pending context");
        };
        let MacProgress::Done(tag) =
            step(Some(ctx), DataBlock::Last, start_cmac(owner), &msg[9..]).unwrap()
        else {
            panic!("expected a finished tag");
        };
        assert_eq!(hex::encode(tag), "070a16b46b4d4144f79bdd9dd04a287c");
    }

    #[test]
    fn framing_out_of_order_is_rejected() {
        let owner = SessionId(1);
        assert!(matches!(
            step(None, DataBlock::Mid, start_cmac(owner), b"x"),
            Err(HsmError::InvalidContextState)
        ));
        let MacProgress::Pending(ctx) =
            step(None, DataBlock::First, start_cmac(owner), b"x").unwrap()
        else {
            panic!("expected a pending context");
        };
        assert!(matches!(
            step(Some(ctx), DataBlock::First, start_cmac(owner), b"x"),
            Err(HsmError::InvalidContextState)
        ));
    }
}
