//! Low-level primitives for the master-key domain.
//!
//! This module and `lmk` are the only places that import `ring` directly.
//! The LMK seals every at-rest key with the functions exposed here; stored
//! key passwords are checked through the credential helpers.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM with caller-supplied associated data
//! - **Nonce**: 96-bit, generated fresh per seal via `SystemRandom`
//! - **Credentials**: PBKDF2-HMAC-SHA256 with a random 16-byte salt

use std::fmt;
use std::num::NonZeroU32;

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{HsmError, Result};

/// The AEAD algorithm used to seal LMK blobs.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a master or derived key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

const CREDENTIAL_SALT_LEN: usize = 16;
const CREDENTIAL_HASH_LEN: usize = 32;

/// A nonce generated for a single seal operation.
struct OwnedNonce(Nonce);

fn generate_nonce() -> Result<OwnedNonce> {
    let mut buf = [0u8; NONCE_LEN];
    fill_random(&mut buf)?;
    Ok(OwnedNonce(Nonce::assume_unique_for_key(buf)))
}

/// Fill `buf` from the system random source.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| HsmError::RandomnessFailure)
}

/// Return `len` random bytes in a zeroizing buffer.
pub fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    fill_random(&mut out)?;
    Ok(out)
}

/// Seal `plaintext` under `key`, binding `aad`.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn seal(key_bytes: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let unbound =
        UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| HsmError::InternalFault("lmk key"))?;
    let key = LessSafeKey::new(unbound);

    let nonce = generate_nonce()?;

    let mut output = Vec::with_capacity(NONCE_LEN + plaintext.len() + ALGORITHM.tag_len());
    output.extend_from_slice(nonce.0.as_ref());

    // Encrypted in place, then the GCM tag is appended.
    let mut body = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce.0, aead::Aad::from(aad), &mut body)
        .map_err(|_| HsmError::InternalFault("seal"))?;
    output.extend_from_slice(&body);

    Ok(output)
}

/// Open a blob produced by [`seal`] with the same `aad`.
///
/// A wrong key, altered header or tampered body fails the tag check and
/// yields [`HsmError::KeyFormatInvalid`]; no partial plaintext is returned.
pub fn open(key_bytes: &[u8; KEY_LEN], aad: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(HsmError::KeyFormatInvalid);
    }

    let nonce_bytes: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .map_err(|_| HsmError::KeyFormatInvalid)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound =
        UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| HsmError::InternalFault("lmk key"))?;
    let key = LessSafeKey::new(unbound);

    let mut payload = Zeroizing::new(sealed[NONCE_LEN..].to_vec());
    let plain_len = key
        .open_in_place(nonce, aead::Aad::from(aad), &mut payload)
        .map_err(|_| HsmError::KeyFormatInvalid)?
        .len();
    payload.truncate(plain_len);

    Ok(payload)
}

/// Generate a random 256-bit key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

// ---------------------------------------------------------------------------
// Password credentials
// ---------------------------------------------------------------------------

/// A stored password verifier for an access-controlled key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    salt: [u8; CREDENTIAL_SALT_LEN],
    hash: [u8; CREDENTIAL_HASH_LEN],
    iterations: NonZeroU32,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential { .. }")
    }
}

impl Credential {
    /// Derive a verifier for `password`.
    pub fn derive(password: &[u8], iterations: u32) -> Result<Self> {
        if password.is_empty() {
            return Err(HsmError::InvalidParameter("empty password"));
        }
        let iterations =
            NonZeroU32::new(iterations).ok_or(HsmError::InvalidParameter("iterations"))?;
        let mut salt = [0u8; CREDENTIAL_SALT_LEN];
        fill_random(&mut salt)?;
        let mut hash = [0u8; CREDENTIAL_HASH_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &salt,
            password,
            &mut hash,
        );
        Ok(Self {
            salt,
            hash,
            iterations,
        })
    }

    /// Constant-time check of `password` against the verifier.
    pub fn verify(&self, password: &[u8]) -> Result<()> {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            &self.salt,
            password,
            &self.hash,
        )
        .map_err(|_| HsmError::WrongPassword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip_with_aad() {
        let key = generate_random_key().unwrap();
        let sealed = seal(&key, b"header", b"secret key bytes").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 16 + TAG_LEN);
        let opened = open(&key, b"header", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"secret key bytes");
    }

    #[test]
    fn open_rejects_other_aad() {
        let key = generate_random_key().unwrap();
        let sealed = seal(&key, b"type-a", b"payload").unwrap();
        assert_eq!(
            open(&key, b"type-b", &sealed),
            Err(HsmError::KeyFormatInvalid)
        );
    }

    #[test]
    fn open_rejects_truncated_blob() {
        let key = generate_random_key().unwrap();
        assert_eq!(open(&key, b"", &[0u8; 8]), Err(HsmError::KeyFormatInvalid));
    }

    #[test]
    fn credential_accepts_only_matching_password() {
        let cred = Credential::derive(b"12345678", 1_000).unwrap();
        assert!(cred.verify(b"12345678").is_ok());
        assert_eq!(cred.verify(b"87654321"), Err(HsmError::WrongPassword));
        assert_eq!(format!("{cred:?}"), "Credential { .. }");
    }
}
