//! Stateless transcoding helpers.
//!
//! Hex transcoding, block padding schemes, fixed-width big-endian fields and
//! the two-phase output convention used by buffer-oriented callers. Nothing
//! in here touches key material beyond the slices it is handed.

use serde::{Deserialize, Serialize};

use crate::error::{HsmError, Result};

// ---------------------------------------------------------------------------
// Hex
// ---------------------------------------------------------------------------

/// Upper-case hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode hex in either case. Odd lengths and non-hex digits are rejected.
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).map_err(|_| HsmError::InvalidParameter("hex text"))
}

// ---------------------------------------------------------------------------
// Block padding
// ---------------------------------------------------------------------------

/// Block padding schemes for symmetric operations and key transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    /// No padding; input must already be block aligned.
    None,
    /// PKCS#5/PKCS#7: always appends 1..=block bytes of value `n`.
    Pkcs7,
    /// ISO/IEC 9797-1 method 2, always applied: `0x80` then zeros.
    Iso80Forced,
    /// ISO/IEC 9797-1 method 2, applied only when input is not aligned.
    Iso80Optional,
    /// Zero fill, applied only when input is not aligned.
    ZeroOptional,
}

impl Padding {
    /// Length after padding `len` bytes to `block` alignment.
    pub fn padded_len(self, len: usize, block: usize) -> Result<usize> {
        let rem = len % block;
        match self {
            Self::None if rem != 0 => Err(HsmError::InvalidParameter("data not block aligned")),
            Self::None => Ok(len),
            Self::Pkcs7 | Self::Iso80Forced => Ok(len + block - rem),
            Self::Iso80Optional | Self::ZeroOptional if rem == 0 => Ok(len),
            Self::Iso80Optional | Self::ZeroOptional => Ok(len + block - rem),
        }
    }

    /// Return a padded copy of `data`.
    pub fn pad(self, data: &[u8], block: usize) -> Result<Vec<u8>> {
        let target = self.padded_len(data.len(), block)?;
        let mut out = Vec::with_capacity(target);
        out.extend_from_slice(data);
        match self {
            Self::None => {}
            Self::Pkcs7 => {
                let n = target - data.len();
                out.resize(target, n as u8);
            }
            Self::Iso80Forced | Self::Iso80Optional => {
                if target > data.len() {
                    out.push(0x80);
                    out.resize(target, 0x00);
                }
            }
            Self::ZeroOptional => out.resize(target, 0x00),
        }
        Ok(out)
    }

    /// Strip padding from `data`.
    ///
    /// The optional schemes are not self-describing, so they return the
    /// input unchanged; callers that know the payload length truncate.
    pub fn unpad(self, data: &[u8], block: usize) -> Result<&[u8]> {
        if data.len() % block != 0 {
            return Err(HsmError::InvalidParameter("data not block aligned"));
        }
        match self {
            Self::None | Self::Iso80Optional | Self::ZeroOptional => Ok(data),
            Self::Pkcs7 => {
                let n = *data.last().ok_or(HsmError::InvalidParameter("bad padding"))? as usize;
                if n == 0 || n > block || n > data.len() {
                    return Err(HsmError::InvalidParameter("bad padding"));
                }
                let (body, pad) = data.split_at(data.len() - n);
                if pad.iter().any(|b| *b as usize != n) {
                    return Err(HsmError::InvalidParameter("bad padding"));
                }
                Ok(body)
            }
            Self::Iso80Forced => {
                let tail_start = data.len().saturating_sub(block);
                let marker = data[tail_start..]
                    .iter()
                    .rposition(|b| *b != 0)
                    .map(|p| tail_start + p)
                    .ok_or(HsmError::InvalidParameter("bad padding"))?;
                if data[marker] != 0x80 {
                    return Err(HsmError::InvalidParameter("bad padding"));
                }
                Ok(&data[..marker])
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-width fields
// ---------------------------------------------------------------------------

/// Left-pad a big-endian integer to exactly `width` bytes. Leading zero
/// bytes beyond `width` are dropped; a value that needs more than `width`
/// significant bytes is rejected.
pub fn to_fixed_width(value: &[u8], width: usize) -> Result<Vec<u8>> {
    let first = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let significant = &value[first..];
    if significant.len() > width {
        return Err(HsmError::InvalidParameter("value wider than field"));
    }
    let mut out = vec![0u8; width - significant.len()];
    out.extend_from_slice(significant);
    Ok(out)
}

/// Drop leading zero bytes, keeping at least one byte.
pub fn trim_leading_zeros(value: &[u8]) -> &[u8] {
    let first = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    if first == value.len() {
        &value[value.len().saturating_sub(1)..]
    } else {
        &value[first..]
    }
}

// ---------------------------------------------------------------------------
// Two-phase output
// ---------------------------------------------------------------------------

/// Outcome of writing an operation result into a caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    /// The result was copied; the value is the number of bytes written.
    Written(usize),
    /// No buffer was supplied; the value is the size the result needs.
    Required(usize),
}

/// Copy `data` into `out` following the length-query convention:
/// no buffer reports the required size and succeeds, a short buffer fails
/// with [`HsmError::BufferTooSmall`] carrying the required size.
pub fn emit(data: &[u8], out: Option<&mut [u8]>) -> Result<Emitted> {
    match out {
        None => Ok(Emitted::Required(data.len())),
        Some(buf) if buf.len() < data.len() => Err(HsmError::BufferTooSmall {
            required: data.len(),
        }),
        Some(buf) => {
            buf[..data.len()].copy_from_slice(data);
            Ok(Emitted::Written(data.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_accepts_both_cases() {
        assert_eq!(from_hex("0aFf").unwrap(), vec![0x0a, 0xff]);
        assert_eq!(to_hex(&[0x0a, 0xff]), "0AFF");
        assert!(from_hex("abc").is_err());
    }

    #[test]
    fn pkcs7_pads_full_block_when_aligned() {
        let padded = Padding::Pkcs7.pad(&[1u8; 16], 16).unwrap();
        assert_eq!(padded.len(), 32);
        assert!(padded[16..].iter().all(|b| *b == 16));
        assert_eq!(Padding::Pkcs7.unpad(&padded, 16).unwrap(), &[1u8; 16]);
    }

    #[test]
    fn pkcs7_rejects_inconsistent_tail() {
        let mut padded = Padding::Pkcs7.pad(b"abc", 8).unwrap();
        padded[4] ^= 1;
        assert!(Padding::Pkcs7.unpad(&padded, 8).is_err());
    }

    #[test]
    fn iso80_forced_and_optional_differ_on_aligned_input() {
        let data = [7u8; 8];
        assert_eq!(Padding::Iso80Forced.pad(&data, 8).unwrap().len(), 16);
        assert_eq!(Padding::Iso80Optional.pad(&data, 8).unwrap().len(), 8);

        let padded = Padding::Iso80Forced.pad(b"key", 8).unwrap();
        assert_eq!(padded, b"key\x80\0\0\0\0");
        assert_eq!(Padding::Iso80Forced.unpad(&padded, 8).unwrap(), b"key");
    }

    #[test]
    fn iso80_forced_unpad_requires_marker() {
        assert!(Padding::Iso80Forced.unpad(&[0u8; 8], 8).is_err());
        assert!(Padding::Iso80Forced.unpad(&[1, 2, 3, 4, 5, 6, 7, 8], 8).is_err());
    }

    #[test]
    fn no_padding_requires_alignment() {
        assert!(matches!(
            Padding::None.pad(&[0u8; 15], 16),
            Err(HsmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn fixed_width_pads_and_trims() {
        assert_eq!(to_fixed_width(&[0, 0, 1, 2], 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(to_fixed_width(&[1, 2], 4).unwrap(), vec![0, 0, 1, 2]);
        assert!(to_fixed_width(&[1, 2, 3], 2).is_err());
        assert_eq!(trim_leading_zeros(&[0, 0, 5]), &[5]);
        assert_eq!(trim_leading_zeros(&[0, 0]), &[0]);
    }

    #[test]
    fn emit_follows_length_query_convention() {
        let data = [9u8; 12];
        assert_eq!(emit(&data, None).unwrap(), Emitted::Required(12));

        let mut small = [0u8; 4];
        assert_eq!(
            emit(&data, Some(&mut small)),
            Err(HsmError::BufferTooSmall { required: 12 })
        );

        let mut big = [0u8; 16];
        assert_eq!(emit(&data, Some(&mut big)).unwrap(), Emitted::Written(12));
        assert_eq!(&big[..12], &data);
    }
}
