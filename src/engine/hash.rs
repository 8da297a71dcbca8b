//! Message digests, streaming hash contexts and the SM3 identity binding.

use std::fmt;

use digest::Digest;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use super::sm3::Sm3;
use crate::error::{HsmError, Result};
use crate::types::{HashAlg, SessionId};

/// Signer identity used when the caller supplies none.
pub const DEFAULT_SM2_ID: &[u8] = b"1234567812345678";

/// Max items and max item length accepted by [`multi_hash`].
pub const MULTI_HASH_MAX_ITEMS: usize = 64;
pub const MULTI_HASH_MAX_ITEM_LEN: usize = 64;

// SM2 recommended curve parameters, hashed into the identity digest.
const SM2_A: &str = "FFFFFFFEFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF00000000FFFFFFFFFFFFFFFC";
const SM2_B: &str = "28E9FA9E9D9F5E344D5A9E4BCF6509A7F39789F515AB8F92DDBCBD414D940E93";
const SM2_GX: &str = "32C4AE2C1F1981195F9904466A39C9948FE30BBFF2660BE1715A4589334C74C7";
const SM2_GY: &str = "BC3736A2F4F6779C59BDCEE36B692153D0A9877CC62A474002DF32E52139F0A0";

/// Public key and signer identity folded into an SM3 hash.
#[derive(Debug, Clone, Copy)]
pub struct Sm3Binding<'a> {
    pub x: &'a [u8],
    pub y: &'a [u8],
    /// `None` selects [`DEFAULT_SM2_ID`].
    pub id: Option<&'a [u8]>,
}

/// `Z = SM3(ENTL | ID | a | b | Gx | Gy | xA | yA)`.
pub fn sm3_z(binding: &Sm3Binding<'_>) -> Result<[u8; 32]> {
    let id = binding.id.unwrap_or(DEFAULT_SM2_ID);
    let entl = id
        .len()
        .checked_mul(8)
        .and_then(|bits| u16::try_from(bits).ok())
        .ok_or(HsmError::InvalidParameter("identity too long"))?;

    let mut hasher = Sm3::new();
    hasher.update(entl.to_be_bytes());
    hasher.update(id);
    for constant in [SM2_A, SM2_B, SM2_GX, SM2_GY] {
        let bytes = hex::decode(constant).map_err(|_| HsmError::InternalFault("sm2 constant"))?;
        hasher.update(bytes);
    }
    hasher.update(binding.x);
    hasher.update(binding.y);
    Ok(hasher.finalize().into())
}

/// One-shot digest.
pub fn hash(alg: HashAlg, data: &[u8]) -> Vec<u8> {
    with_digest!(alg, D => D::digest(data).to_vec())
}

/// Digest of `data`, prefixed with the identity digest when `binding` is
/// given. Only SM3 accepts a binding.
pub fn hash_bound(alg: HashAlg, binding: Option<&Sm3Binding<'_>>, data: &[u8]) -> Result<Vec<u8>> {
    let mut state = HashState::start(alg, binding)?;
    state.update(data);
    Ok(state.finalize())
}

/// Hash up to 64 short inputs with one algorithm selection.
pub fn multi_hash(alg: HashAlg, items: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
    if items.is_empty() || items.len() > MULTI_HASH_MAX_ITEMS {
        return Err(HsmError::InvalidParameter("item count"));
    }
    if items
        .iter()
        .any(|item| item.is_empty() || item.len() > MULTI_HASH_MAX_ITEM_LEN)
    {
        return Err(HsmError::InvalidParameter("item length"));
    }
    Ok(items.iter().map(|item| hash(alg, item)).collect())
}

#[derive(Clone)]
enum HashState {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    Sm3(Sm3),
}

impl HashState {
    fn start(alg: HashAlg, binding: Option<&Sm3Binding<'_>>) -> Result<Self> {
        let mut state = match alg {
            HashAlg::Sha1 => Self::Sha1(Sha1::new()),
            HashAlg::Sha224 => Self::Sha224(Sha224::new()),
            HashAlg::Sha256 => Self::Sha256(Sha256::new()),
            HashAlg::Sha384 => Self::Sha384(Sha384::new()),
            HashAlg::Sha512 => Self::Sha512(Sha512::new()),
            HashAlg::Sm3 => Self::Sm3(Sm3::new()),
        };
        if let Some(binding) = binding {
            if alg != HashAlg::Sm3 {
                return Err(HsmError::UnsupportedAlgorithmCombination);
            }
            state.update(&sm3_z(binding)?);
        }
        Ok(state)
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Sm3(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha224(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
            Self::Sm3(h) => h.finalize().to_vec(),
        }
    }
}

/// A streaming hash owned by one session.
pub struct HashContext {
    owner: SessionId,
    alg: HashAlg,
    state: HashState,
    absorbed: u64,
}

impl fmt::Debug for HashContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashContext")
            .field("owner", &self.owner)
            .field("alg", &self.alg)
            .field("absorbed", &self.absorbed)
            .finish()
    }
}

impl HashContext {
    pub(crate) fn init(
        owner: SessionId,
        alg: HashAlg,
        binding: Option<&Sm3Binding<'_>>,
    ) -> Result<Self> {
        Ok(Self {
            owner,
            alg,
            state: HashState::start(alg, binding)?,
            absorbed: 0,
        })
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn alg(&self) -> HashAlg {
        self.alg
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        self.state.update(data);
        self.absorbed += data.len() as u64;
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.state.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lengths_match_algorithms() {
        for alg in [
            HashAlg::Sha1,
            HashAlg::Sha224,
            HashAlg::Sha256,
            HashAlg::Sha384,
            HashAlg::Sha512,
            HashAlg::Sm3,
        ] {
            assert_eq!(hash(alg, b"abc").len(), alg.output_len(), "{alg:?}");
        }
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut ctx = HashContext::init(SessionId(3), HashAlg::Sha256, None).unwrap();
        ctx.update(b"1234567812345678");
        ctx.update(b"1234567812345678");
        assert_eq!(
            ctx.finish(),
            hash(HashAlg::Sha256, b"12345678123456781234567812345678")
        );
    }

    #[test]
    fn binding_changes_the_digest_and_needs_sm3() {
        let x = [1u8; 32];
        let y = [2u8; 32];
        let binding = Sm3Binding { x: &x, y: &y, id: None };
        let bound = hash_bound(HashAlg::Sm3, Some(&binding), b"msg").unwrap();
        assert_ne!(bound, hash(HashAlg::Sm3, b"msg"));

        let z = sm3_z(&binding).unwrap();
        assert_eq!(bound, hash(HashAlg::Sm3, &[&z[..], b"msg"].concat()));

        assert_eq!(
            hash_bound(HashAlg::Sha256, Some(&binding), b"msg"),
            Err(HsmError::UnsupportedAlgorithmCombination)
        );
    }

    #[test]
    fn multi_hash_limits() {
        let items: Vec<&[u8]> = vec![b"a", b"bc"];
        let out = multi_hash(HashAlg::Sm3, &items).unwrap();
        assert_eq!(out[1], hash(HashAlg::Sm3, b"bc"));

        assert!(multi_hash(HashAlg::Sm3, &[]).is_err());
        let long = [0u8; 65];
        assert!(multi_hash(HashAlg::Sm3, &[&long[..]]).is_err());
        let many = vec![&b"x"[..]; 65];
        assert!(multi_hash(HashAlg::Sm3, &many).is_err());
    }
}
