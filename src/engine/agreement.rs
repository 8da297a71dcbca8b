//! Key agreement: one-shot ECDH and the two-phase SM2-style exchange.
//!
//! Two-phase flow: each side calls [`AgreementHandle::start`] with its
//! long-term key and sends the returned ephemeral point to the peer, then
//! calls [`AgreementHandle::finish`] with the peer's long-term and
//! ephemeral public keys. Both sides arrive at the same key material.
//!
//! With `w = field_bits / 2 - 1` and `x̄ = 2^w + (x mod 2^w)`:
//! `t = d + x̄·r mod n`, `V = t·(P_peer + x̄_peer·R_peer)` and
//! `K = KDF(xV | yV | Z_sponsor | Z_responder)`.

use std::fmt;

use elliptic_curve::ff::PrimeField;
use elliptic_curve::group::Group as _;
use elliptic_curve::sec1::ToEncodedPoint;
use elliptic_curve::{FieldBytes, PublicKey, Scalar, SecretKey};
use zeroize::Zeroizing;

use super::ecc;
use super::hash::{sm3_z, Sm3Binding};
use super::kdf::{sm3_kdf, x963};
use crate::error::{HsmError, Result};
use crate::types::{EccCurve, EccPrivateParts, EccPublicParts, HashAlg, SessionId, SymmAlg};

/// Longest identity accepted for the two-phase exchange.
pub const MAX_ID_LEN: usize = 128;

/// ECDH followed by an X9.63 SHA-256 KDF, producing a key for `alg`.
pub fn ecdh_derive(
    private: &EccPrivateParts,
    peer: &EccPublicParts,
    alg: SymmAlg,
    shared_info: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let z = ecc::shared_x(private, peer)?;
    x963(HashAlg::Sha256, &z, shared_info, alg.key_len())
}

/// Which side of the exchange this party plays. The sponsor's identity
/// digest comes first in the KDF input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgreementRole {
    Sponsor,
    Responder,
}

/// Long-term public key and identity of one party.
#[derive(Debug, Clone, Copy)]
pub struct AgreementParty<'a> {
    pub public: &'a EccPublicParts,
    /// `None` selects the default signer identity.
    pub id: Option<&'a [u8]>,
}

impl AgreementParty<'_> {
    fn z(&self) -> Result<[u8; 32]> {
        if self.id.is_some_and(|id| id.is_empty() || id.len() > MAX_ID_LEN) {
            return Err(HsmError::InvalidParameter("identity length"));
        }
        sm3_z(&Sm3Binding {
            x: &self.public.x,
            y: &self.public.y,
            id: self.id,
        })
    }
}

/// Phase-one state. Single use: [`finish`](Self::finish) and
/// [`discard`](Self::discard) consume it, and dropping it wipes the
/// ephemeral and long-term scalars.
pub struct AgreementHandle {
    owner: SessionId,
    curve: EccCurve,
    role: AgreementRole,
    ephemeral_d: Zeroizing<Vec<u8>>,
    ephemeral: EccPublicParts,
    own_d: Zeroizing<Vec<u8>>,
    own_public: EccPublicParts,
    own_id: Option<Vec<u8>>,
}

impl fmt::Debug for AgreementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementHandle")
            .field("owner", &self.owner)
            .field("curve", &self.curve)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// `x̄` for a fixed-width x coordinate.
fn x_bar(x: &[u8]) -> Vec<u8> {
    let width = x.len();
    let start = width - (width / 2);
    let mut out = vec![0u8; width];
    out[start..].copy_from_slice(&x[start..]);
    out[start] = (out[start] & 0x7f) | 0x80;
    out
}

impl AgreementHandle {
    /// Phase one: draw an ephemeral pair for `own`.
    pub(crate) fn start(
        owner: SessionId,
        role: AgreementRole,
        own: &EccPrivateParts,
        own_id: Option<&[u8]>,
    ) -> Result<Self> {
        if own_id.is_some_and(|id| id.is_empty() || id.len() > MAX_ID_LEN) {
            return Err(HsmError::InvalidParameter("identity length"));
        }
        let own_public = ecc::public_from_private(own)?;
        let (ephemeral_private, ephemeral) = ecc::generate(own.curve)?;
        Ok(Self {
            owner,
            curve: own.curve,
            role,
            ephemeral_d: Zeroizing::new(ephemeral_private.d.clone()),
            ephemeral,
            own_d: Zeroizing::new(own.d.clone()),
            own_public,
            own_id: own_id.map(<[u8]>::to_vec),
        })
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn curve(&self) -> EccCurve {
        self.curve
    }

    /// The ephemeral point to send to the peer.
    pub fn ephemeral_public(&self) -> &EccPublicParts {
        &self.ephemeral
    }

    /// Drop the handle without deriving a key.
    pub fn discard(self) {}

    /// Phase two: derive `key_len` bytes from the peer's keys.
    pub(crate) fn finish(
        self,
        peer: AgreementParty<'_>,
        peer_ephemeral: &EccPublicParts,
        key_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if key_len == 0 {
            return Err(HsmError::InvalidParameter("key length"));
        }
        if peer.public.curve != self.curve || peer_ephemeral.curve != self.curve {
            return Err(HsmError::InvalidParameter("curve mismatch"));
        }
        peer.public.check_width()?;
        peer_ephemeral.check_width()?;

        let own_x_bar = x_bar(&self.ephemeral.x);
        let peer_x_bar = x_bar(&peer_ephemeral.x);

        let shared: Zeroizing<Vec<u8>> = with_curve!(self.curve, C => {
            let scalar = |bytes: &[u8]| -> Result<Scalar<C>> {
                let repr = FieldBytes::<C>::clone_from_slice(bytes);
                Option::<Scalar<C>>::from(Scalar::<C>::from_repr(repr))
                    .ok_or(HsmError::InternalFault("scalar encoding"))
            };
            let point = |parts: &EccPublicParts| -> Result<PublicKey<C>> {
                PublicKey::<C>::from_sec1_bytes(&parts.to_sec1())
                    .map_err(|_| HsmError::InvalidParameter("public point"))
            };

            let d = *SecretKey::<C>::from_slice(&self.own_d)
                .map_err(|_| HsmError::KeyFormatInvalid)?
                .to_nonzero_scalar();
            let r = *SecretKey::<C>::from_slice(&self.ephemeral_d)
                .map_err(|_| HsmError::InternalFault("ephemeral scalar"))?
                .to_nonzero_scalar();
            let t = d + scalar(&own_x_bar)? * r;

            let peer_point = point(peer.public)?.to_projective();
            let peer_r = point(peer_ephemeral)?.to_projective();
            let v = (peer_point + peer_r * scalar(&peer_x_bar)?) * t;
            if bool::from(v.is_identity()) {
                return Err(HsmError::VerifyFailed);
            }
            let encoded = v.to_affine().to_encoded_point(false);
            let (Some(x), Some(y)) = (encoded.x(), encoded.y()) else {
                return Err(HsmError::InternalFault("identity point"));
            };
            Ok(Zeroizing::new([&x[..], &y[..]].concat()))
        })?;

        let own_z = AgreementParty {
            public: &self.own_public,
            id: self.own_id.as_deref(),
        }
        .z()?;
        let peer_z = peer.z()?;
        let (first, second) = match self.role {
            AgreementRole::Sponsor => (own_z, peer_z),
            AgreementRole::Responder => (peer_z, own_z),
        };
        let input = Zeroizing::new([&shared[..], &first, &second].concat());
        sm3_kdf(&input, key_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_bar_keeps_the_low_half_and_sets_bit_w() {
        let x = [0xffu8; 32];
        let bar = x_bar(&x);
        assert!(bar[..16].iter().all(|b| *b == 0));
        assert_eq!(bar[16], 0xff);

        let x = [0x00u8; 48];
        let bar = x_bar(&x);
        assert!(bar[..24].iter().all(|b| *b == 0));
        assert_eq!(bar[24], 0x80);
    }

    #[test]
    fn ecdh_derive_agrees() {
        let (a, a_pub) = ecc::generate(EccCurve::NistP256).unwrap();
        let (b, b_pub) = ecc::generate(EccCurve::NistP256).unwrap();
        let ka = ecdh_derive(&a, &b_pub, SymmAlg::Aes256, b"info").unwrap();
        let kb = ecdh_derive(&b, &a_pub, SymmAlg::Aes256, b"info").unwrap();
        assert_eq!(ka.len(), 32);
        assert_eq!(ka.as_slice(), kb.as_slice());
    }

    fn exchange(curve: EccCurve) {
        let (a, a_pub) = ecc::generate(curve).unwrap();
        let (b, b_pub) = ecc::generate(curve).unwrap();

        let ha = AgreementHandle::start(SessionId(1), AgreementRole::Sponsor, &a, Some(&b"alice"[..]))
            .unwrap();
        let hb =
            AgreementHandle::start(SessionId(2), AgreementRole::Responder, &b, None).unwrap();
        let ra = ha.ephemeral_public().clone();
        let rb = hb.ephemeral_public().clone();

        let ka = ha
            .finish(AgreementParty { public: &b_pub, id: None }, &rb, 16)
            .unwrap();
        let kb = hb
            .finish(
                AgreementParty {
                    public: &a_pub,
                    id: Some(&b"alice"[..]),
                },
                &ra,
                16,
            )
            .unwrap();
        assert_eq!(ka.as_slice(), kb.as_slice());
    }

    #[test]
    fn two_phase_exchange_agrees_on_every_curve() {
        exchange(EccCurve::NistP256);
        exchange(EccCurve::Secp256k1);
        exchange(EccCurve::Secp384r1);
    }

    #[test]
    fn mismatched_identity_breaks_agreement() {
        let (a, a_pub) = ecc::generate(EccCurve::NistP256).unwrap();
        let (b, b_pub) = ecc::generate(EccCurve::NistP256).unwrap();
        let ha = AgreementHandle::start(SessionId(1), AgreementRole::Sponsor, &a, Some(&b"alice"[..]))
            .unwrap();
        let hb =
            AgreementHandle::start(SessionId(1), AgreementRole::Responder, &b, None).unwrap();
        let (ra, rb) = (ha.ephemeral_public().clone(), hb.ephemeral_public().clone());
        let ka = ha
            .finish(AgreementParty { public: &b_pub, id: None }, &rb, 16)
            .unwrap();
        let mallory = AgreementParty {
            public: &a_pub,
            id: Some(&b"mallory"[..]),
        };
        let kb = hb.finish(mallory, &ra, 16).unwrap();
        assert_ne!(ka.as_slice(), kb.as_slice());
    }

    #[test]
    fn curve_mismatch_is_rejected() {
        let (a, _) = ecc::generate(EccCurve::NistP256).unwrap();
        let (_, other) = ecc::generate(EccCurve::Secp384r1).unwrap();
        let handle =
            AgreementHandle::start(SessionId(1), AgreementRole::Sponsor, &a, None).unwrap();
        let eph = handle.ephemeral_public().clone();
        assert!(handle
            .finish(AgreementParty { public: &other, id: None }, &eph, 16)
            .is_err());
    }
}
