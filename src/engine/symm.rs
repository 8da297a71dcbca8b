//! Symmetric block-cipher modes.
//!
//! ECB and CBC run through the RustCrypto `ecb`/`cbc` crates with padding
//! applied by [`Padding`]; CFB and CTR use `cfb-mode` and `ctr`. OFB and
//! XTS are composed directly over the block cipher, the latter with
//! ciphertext stealing for inputs that are not a whole number of blocks.
//! GCM and CCM requests are forwarded to [`aead`](super::aead) with an
//! empty associated-data string.

use aes::Aes128;
use cipher::block_padding::NoPadding;
use cipher::{
    AsyncStreamCipher, Block, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit, StreamCipher,
};
use ctr::{Ctr128BE, Ctr64BE};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::aead::{self, AeadMode};
use super::{check_key_len, new_cipher};
use crate::codec::Padding;
use crate::error::{HsmError, Result};
use crate::types::{SymmAlg, SymmMode, SymmOp};

/// XTS tweak and block width.
const XTS_BLOCK: usize = 16;

/// Mode parameters for one symmetric call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmParams<'a> {
    pub op: SymmOp,
    pub mode: SymmMode,
    /// IV, initial counter, XTS tweak or AEAD nonce. Ignored by ECB.
    pub iv: Option<&'a [u8]>,
    /// Only ECB and CBC accept a scheme other than [`Padding::None`].
    pub padding: Padding,
}

impl<'a> SymmParams<'a> {
    pub fn ecb(op: SymmOp, padding: Padding) -> Self {
        Self {
            op,
            mode: SymmMode::Ecb,
            iv: None,
            padding,
        }
    }

    pub fn with_iv(op: SymmOp, mode: SymmMode, iv: &'a [u8]) -> Self {
        Self {
            op,
            mode,
            iv: Some(iv),
            padding: Padding::None,
        }
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }
}

/// Result of a symmetric call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmOutput {
    pub data: Vec<u8>,
    /// Chaining value for continuing CBC/CFB/OFB/CTR on a later call.
    pub iv_out: Option<Vec<u8>>,
}

impl SymmOutput {
    fn plain(data: Vec<u8>) -> Self {
        Self { data, iv_out: None }
    }
}

/// Run one symmetric operation over `data`.
pub fn operate(
    alg: SymmAlg,
    key: &[u8],
    params: &SymmParams<'_>,
    data: &[u8],
) -> Result<SymmOutput> {
    check_key_len(alg, key)?;
    if data.is_empty() {
        return Err(HsmError::InvalidParameter("empty input"));
    }
    if params.padding != Padding::None && !params.mode.needs_alignment() {
        return Err(HsmError::InvalidParameter("padding applies to ECB and CBC only"));
    }

    match params.mode {
        SymmMode::Ecb => run_ecb(alg, key, params.op, params.padding, data).map(SymmOutput::plain),
        SymmMode::Cbc => run_cbc(alg, key, params, data),
        SymmMode::Cfb => run_cfb(alg, key, params.op, block_iv(alg, params.iv)?, data),
        SymmMode::Ofb => run_ofb(alg, key, block_iv(alg, params.iv)?, data),
        SymmMode::Ctr => run_ctr(alg, key, block_iv(alg, params.iv)?, data),
        SymmMode::Xts => {
            let tweak = params.iv.ok_or(HsmError::InvalidParameter("missing tweak"))?;
            run_xts(alg, key, params.op, tweak, data).map(SymmOutput::plain)
        }
        SymmMode::Gcm | SymmMode::Ccm => {
            let nonce = params.iv.ok_or(HsmError::InvalidParameter("missing nonce"))?;
            let mode = AeadMode::from_symm_mode(params.mode)?;
            let out = match params.op {
                SymmOp::Encrypt => aead::seal(alg, mode, key, nonce, &[], data)?,
                SymmOp::Decrypt => aead::open(alg, mode, key, nonce, &[], data)?.to_vec(),
            };
            Ok(SymmOutput::plain(out))
        }
    }
}

/// Left-align a short IV in a zero-filled block. Used by callers that pass
/// the IV length explicitly.
pub fn expand_iv(alg: SymmAlg, iv: &[u8], iv_len: usize) -> Result<Vec<u8>> {
    let block = alg.block_len();
    if iv_len == 0 || iv_len > block || iv.len() < iv_len {
        return Err(HsmError::InvalidParameter("iv length"));
    }
    let mut out = vec![0u8; block];
    out[..iv_len].copy_from_slice(&iv[..iv_len]);
    Ok(out)
}

fn block_iv<'a>(alg: SymmAlg, iv: Option<&'a [u8]>) -> Result<&'a [u8]> {
    match iv {
        Some(iv) if iv.len() == alg.block_len() => Ok(iv),
        Some(_) => Err(HsmError::InvalidParameter("iv length")),
        None => Err(HsmError::InvalidParameter("missing iv")),
    }
}

fn key_error<E>(_: E) -> HsmError {
    HsmError::InvalidParameter("key or iv length")
}

fn aligned_input(op: SymmOp, padding: Padding, data: &[u8], block: usize) -> Result<Vec<u8>> {
    match op {
        SymmOp::Encrypt => padding.pad(data, block),
        SymmOp::Decrypt if data.len() % block != 0 => {
            Err(HsmError::InvalidParameter("data not block aligned"))
        }
        SymmOp::Decrypt => Ok(data.to_vec()),
    }
}

/// Strip padding in place. The padding bytes, or the whole buffer when
/// the padding is bad, are wiped before release.
fn unpadded_output(op: SymmOp, padding: Padding, mut buf: Vec<u8>, block: usize) -> Result<Vec<u8>> {
    if op == SymmOp::Encrypt {
        return Ok(buf);
    }
    match padding.unpad(&buf, block).map(<[u8]>::len) {
        Ok(len) => {
            buf[len..].zeroize();
            buf.truncate(len);
            Ok(buf)
        }
        Err(err) => {
            buf.zeroize();
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// ECB / CBC
// ---------------------------------------------------------------------------

fn run_ecb(alg: SymmAlg, key: &[u8], op: SymmOp, padding: Padding, data: &[u8]) -> Result<Vec<u8>> {
    let block = alg.block_len();
    let mut buf = aligned_input(op, padding, data, block)?;
    let len = buf.len();
    with_block_cipher!(alg, C => {
        match op {
            SymmOp::Encrypt => {
                ecb::Encryptor::<C>::new_from_slice(key)
                    .map_err(key_error)?
                    .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                    .map_err(|_| HsmError::InternalFault("ecb"))?;
            }
            SymmOp::Decrypt => {
                ecb::Decryptor::<C>::new_from_slice(key)
                    .map_err(key_error)?
                    .decrypt_padded_mut::<NoPadding>(&mut buf)
                    .map_err(|_| HsmError::InternalFault("ecb"))?;
            }
        }
        Ok::<(), HsmError>(())
    })?;
    unpadded_output(op, padding, buf, block)
}

fn run_cbc(alg: SymmAlg, key: &[u8], params: &SymmParams<'_>, data: &[u8]) -> Result<SymmOutput> {
    let block = alg.block_len();
    let iv = block_iv(alg, params.iv)?;
    let mut buf = aligned_input(params.op, params.padding, data, block)?;
    let len = buf.len();
    // The chaining value is the last ciphertext block on either side.
    let iv_out = match params.op {
        SymmOp::Encrypt => None,
        SymmOp::Decrypt => Some(buf[len - block..].to_vec()),
    };
    with_block_cipher!(alg, C => {
        match params.op {
            SymmOp::Encrypt => {
                cbc::Encryptor::<C>::new_from_slices(key, iv)
                    .map_err(key_error)?
                    .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                    .map_err(|_| HsmError::InternalFault("cbc"))?;
            }
            SymmOp::Decrypt => {
                cbc::Decryptor::<C>::new_from_slices(key, iv)
                    .map_err(key_error)?
                    .decrypt_padded_mut::<NoPadding>(&mut buf)
                    .map_err(|_| HsmError::InternalFault("cbc"))?;
            }
        }
        Ok::<(), HsmError>(())
    })?;
    let iv_out = iv_out.unwrap_or_else(|| buf[len - block..].to_vec());
    Ok(SymmOutput {
        data: unpadded_output(params.op, params.padding, buf, block)?,
        iv_out: Some(iv_out),
    })
}

// ---------------------------------------------------------------------------
// CFB / OFB / CTR
// ---------------------------------------------------------------------------

fn run_cfb(alg: SymmAlg, key: &[u8], op: SymmOp, iv: &[u8], data: &[u8]) -> Result<SymmOutput> {
    let block = alg.block_len();
    let mut buf = data.to_vec();
    with_block_cipher!(alg, C => {
        match op {
            SymmOp::Encrypt => cfb_mode::Encryptor::<C>::new_from_slices(key, iv)
                .map_err(key_error)?
                .encrypt(&mut buf),
            SymmOp::Decrypt => cfb_mode::Decryptor::<C>::new_from_slices(key, iv)
                .map_err(key_error)?
                .decrypt(&mut buf),
        }
        Ok::<(), HsmError>(())
    })?;

    let ciphertext = match op {
        SymmOp::Encrypt => buf.as_slice(),
        SymmOp::Decrypt => data,
    };
    let mut chain = iv.to_vec();
    chain.extend_from_slice(ciphertext);
    let iv_out = chain[chain.len() - block..].to_vec();
    Ok(SymmOutput {
        data: buf,
        iv_out: Some(iv_out),
    })
}

/// Output feedback over any block cipher. Returns the final register.
fn ofb_apply<C: BlockEncrypt>(engine: &C, iv: &[u8], data: &mut [u8]) -> Vec<u8> {
    let mut register = Block::<C>::clone_from_slice(iv);
    for chunk in data.chunks_mut(C::block_size()) {
        engine.encrypt_block(&mut register);
        for (byte, key) in chunk.iter_mut().zip(register.iter()) {
            *byte ^= key;
        }
    }
    register.to_vec()
}

fn run_ofb(alg: SymmAlg, key: &[u8], iv: &[u8], data: &[u8]) -> Result<SymmOutput> {
    let mut buf = data.to_vec();
    let iv_out = with_block_cipher!(alg, C => {
        let engine: C = new_cipher(key)?;
        ofb_apply(&engine, iv, &mut buf)
    });
    Ok(SymmOutput {
        data: buf,
        iv_out: Some(iv_out),
    })
}

fn ctr_apply<M: KeyIvInit + StreamCipher>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let mut stream = M::new_from_slices(key, iv).map_err(key_error)?;
    stream.apply_keystream(buf);
    Ok(())
}

/// Add `blocks` to a big-endian counter, wrapping at the counter width.
fn advance_counter(counter: &mut [u8], blocks: u64) {
    let mut carry = u128::from(blocks);
    for byte in counter.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = u128::from(*byte) + (carry & 0xff);
        *byte = sum as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
}

fn run_ctr(alg: SymmAlg, key: &[u8], iv: &[u8], data: &[u8]) -> Result<SymmOutput> {
    let mut buf = data.to_vec();
    match alg {
        SymmAlg::Tdes128 => ctr_apply::<Ctr64BE<des::TdesEde2>>(key, iv, &mut buf)?,
        SymmAlg::Tdes192 => ctr_apply::<Ctr64BE<des::TdesEde3>>(key, iv, &mut buf)?,
        SymmAlg::Aes128 => ctr_apply::<Ctr128BE<aes::Aes128>>(key, iv, &mut buf)?,
        SymmAlg::Aes192 => ctr_apply::<Ctr128BE<aes::Aes192>>(key, iv, &mut buf)?,
        SymmAlg::Aes256 => ctr_apply::<Ctr128BE<aes::Aes256>>(key, iv, &mut buf)?,
        SymmAlg::Sm4 => ctr_apply::<Ctr128BE<super::sm4::Sm4>>(key, iv, &mut buf)?,
    }
    let blocks = data.len().div_ceil(alg.block_len()) as u64;
    let mut iv_out = iv.to_vec();
    advance_counter(&mut iv_out, blocks);
    Ok(SymmOutput {
        data: buf,
        iv_out: Some(iv_out),
    })
}

// ---------------------------------------------------------------------------
// XTS
// ---------------------------------------------------------------------------

/// Multiply the tweak by the primitive element of GF(2^128), little-endian.
fn mul_alpha(tweak: &mut [u8; XTS_BLOCK]) {
    let mut carry = 0u8;
    for byte in tweak.iter_mut() {
        let next = *byte >> 7;
        *byte = (*byte << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        tweak[0] ^= 0x87;
    }
}

fn xts_block(engine: &Aes128, op: SymmOp, input: &[u8], tweak: &[u8; XTS_BLOCK]) -> [u8; XTS_BLOCK] {
    let mut block = Block::<Aes128>::default();
    for ((out, byte), t) in block.iter_mut().zip(input).zip(tweak) {
        *out = byte ^ t;
    }
    match op {
        SymmOp::Encrypt => engine.encrypt_block(&mut block),
        SymmOp::Decrypt => engine.decrypt_block(&mut block),
    }
    let mut out = [0u8; XTS_BLOCK];
    for ((o, byte), t) in out.iter_mut().zip(block.iter()).zip(tweak) {
        *o = byte ^ t;
    }
    out
}

/// XTS-AES-128 over a 256-bit key: the first half encrypts data, the second
/// half encrypts the tweak.
fn run_xts(alg: SymmAlg, key: &[u8], op: SymmOp, tweak: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if alg != SymmAlg::Aes256 {
        return Err(HsmError::UnsupportedAlgorithmCombination);
    }
    if tweak.len() != XTS_BLOCK {
        return Err(HsmError::InvalidParameter("tweak length"));
    }
    if data.len() < XTS_BLOCK {
        return Err(HsmError::InvalidParameter("xts input shorter than one block"));
    }

    let data_key: Aes128 = new_cipher(&key[..16])?;
    let tweak_key: Aes128 = new_cipher(&key[16..])?;

    let mut t = [0u8; XTS_BLOCK];
    let mut tweak_block = Block::<Aes128>::clone_from_slice(tweak);
    tweak_key.encrypt_block(&mut tweak_block);
    t.copy_from_slice(&tweak_block);

    let full = data.len() / XTS_BLOCK;
    let tail = data.len() % XTS_BLOCK;
    let plain_blocks = if tail == 0 { full } else { full - 1 };

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(XTS_BLOCK).take(plain_blocks) {
        out.extend_from_slice(&xts_block(&data_key, op, chunk, &t));
        mul_alpha(&mut t);
    }
    if tail == 0 {
        return Ok(out);
    }

    // Ciphertext stealing over the last full block and the partial tail.
    let last = &data[plain_blocks * XTS_BLOCK..full * XTS_BLOCK];
    let partial = &data[full * XTS_BLOCK..];
    let mut t_next = t;
    mul_alpha(&mut t_next);
    let (first_tweak, second_tweak) = match op {
        SymmOp::Encrypt => (&t, &t_next),
        SymmOp::Decrypt => (&t_next, &t),
    };

    let head = xts_block(&data_key, op, last, first_tweak);
    let mut stolen = [0u8; XTS_BLOCK];
    stolen[..tail].copy_from_slice(partial);
    stolen[tail..].copy_from_slice(&head[tail..]);
    out.extend_from_slice(&xts_block(&data_key, op, &stolen, second_tweak));
    out.extend_from_slice(&head[..tail]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(alg: SymmAlg) -> Vec<u8> {
        (0..alg.key_len() as u8).collect()
    }

    const ALL: [SymmAlg; 6] = [
        SymmAlg::Tdes128,
        SymmAlg::Tdes192,
        SymmAlg::Aes128,
        SymmAlg::Aes192,
        SymmAlg::Aes256,
        SymmAlg::Sm4,
    ];

    #[test]
    fn stream_modes_invert_for_odd_lengths() {
        for alg in ALL {
            let key = key_for(alg);
            let iv = vec![0x11; alg.block_len()];
            for mode in [SymmMode::Cfb, SymmMode::Ofb, SymmMode::Ctr] {
                let data: Vec<u8> = (0..37u8).collect();
                let enc = operate(
                    alg,
                    &key,
                    &SymmParams::with_iv(SymmOp::Encrypt, mode, &iv),
                    &data,
                )
                .unwrap();
                assert_ne!(enc.data, data);
                let dec = operate(
                    alg,
                    &key,
                    &SymmParams::with_iv(SymmOp::Decrypt, mode, &iv),
                    &enc.data,
                )
                .unwrap();
                assert_eq!(dec.data, data, "{alg:?} {mode:?}");
            }
        }
    }

    #[test]
    fn cbc_iv_out_continues_the_chain() {
        let key = key_for(SymmAlg::Aes128);
        let iv = [7u8; 16];
        let data = [3u8; 64];
        let whole = operate(
            SymmAlg::Aes128,
            &key,
            &SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Cbc, &iv),
            &data,
        )
        .unwrap();

        let first = operate(
            SymmAlg::Aes128,
            &key,
            &SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Cbc, &iv),
            &data[..32],
        )
        .unwrap();
        let chain = first.iv_out.unwrap();
        let second = operate(
            SymmAlg::Aes128,
            &key,
            &SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Cbc, &chain),
            &data[32..],
        )
        .unwrap();
        assert_eq!([first.data, second.data].concat(), whole.data);
    }

    #[test]
    fn ctr_iv_out_is_the_next_counter() {
        let key = key_for(SymmAlg::Sm4);
        let iv = [0xff; 16];
        let out = operate(
            SymmAlg::Sm4,
            &key,
            &SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Ctr, &iv),
            &[0u8; 20],
        )
        .unwrap();
        let mut expected = [0u8; 16];
        expected[15] = 1;
        assert_eq!(out.iv_out.unwrap(), expected);
    }

    #[test]
    fn ecb_without_padding_needs_alignment() {
        let key = key_for(SymmAlg::Aes128);
        let err = operate(
            SymmAlg::Aes128,
            &key,
            &SymmParams::ecb(SymmOp::Encrypt, Padding::None),
            &[0u8; 15],
        )
        .unwrap_err();
        assert!(matches!(err, HsmError::InvalidParameter(_)));
    }

    #[test]
    fn decrypted_padding_is_trimmed_in_place() {
        let buf = vec![0xA1, 0xA2, 0xA3, 5, 5, 5, 5, 5];
        let capacity = buf.capacity();
        let out = unpadded_output(SymmOp::Decrypt, Padding::Pkcs7, buf, 8).unwrap();
        assert_eq!(out, vec![0xA1, 0xA2, 0xA3]);
        assert_eq!(out.capacity(), capacity);

        let bad = vec![0xA1, 0xA2, 0xA3, 5, 5, 5, 5, 9];
        assert!(unpadded_output(SymmOp::Decrypt, Padding::Pkcs7, bad, 8).is_err());
    }

    #[test]
    fn padding_is_rejected_for_stream_modes() {
        let key = key_for(SymmAlg::Aes128);
        let iv = [0u8; 16];
        let params =
            SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Ctr, &iv).padding(Padding::Pkcs7);
        assert!(operate(SymmAlg::Aes128, &key, &params, b"abc").is_err());
    }

    #[test]
    fn xts_matches_reference_vectors() {
        let key: Vec<u8> = (0..32u8).collect();
        let tweak: Vec<u8> = (0xa0..0xb0u8).collect();
        let cases = [
            (16, "18491d35ea52523c0db80d431db1ce12"),
            (20, "14438af516cd4b8e6643b4f298bd96b518491d35"),
            (
                37,
                "18491d35ea52523c0db80d431db1ce124610c736e50ac0ad53f4b78b8ab2d3834f6630801b",
            ),
        ];
        for (len, expected) in cases {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let enc = operate(
                SymmAlg::Aes256,
                &key,
                &SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Xts, &tweak),
                &data,
            )
            .unwrap();
            assert_eq!(hex::encode(&enc.data), expected, "len {len}");
            let dec = operate(
                SymmAlg::Aes256,
                &key,
                &SymmParams::with_iv(SymmOp::Decrypt, SymmMode::Xts, &tweak),
                &enc.data,
            )
            .unwrap();
            assert_eq!(dec.data, data);
        }
    }

    #[test]
    fn xts_limits() {
        let tweak = [0u8; 16];
        let params = SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Xts, &tweak);
        assert_eq!(
            operate(SymmAlg::Sm4, &key_for(SymmAlg::Sm4), &params, &[0u8; 32]),
            Err(HsmError::UnsupportedAlgorithmCombination)
        );
        assert!(operate(SymmAlg::Aes256, &key_for(SymmAlg::Aes256), &params, &[0u8; 15]).is_err());
    }

    #[test]
    fn short_iv_is_left_aligned() {
        let iv = expand_iv(SymmAlg::Aes128, &[1, 2, 3, 4], 4).unwrap();
        assert_eq!(&iv[..4], &[1, 2, 3, 4]);
        assert!(iv[4..].iter().all(|b| *b == 0));
        assert!(expand_iv(SymmAlg::Tdes128, &[0u8; 16], 16).is_err());
    }
}
