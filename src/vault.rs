//! Indexed key storage.
//!
//! Three independent namespaces (symmetric, RSA, ECC) map an index to an
//! immutable [`KeyRecord`]. Records hold key material only as LMK
//! ciphertext. Each namespace sits behind its own `RwLock`; readers clone
//! the record's `Arc` and drop the lock at once, so an operation racing a
//! destroy either sees the whole record or `KeyNotFound`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::Credential;
use crate::error::{HsmError, Result};
use crate::types::{
    checked_index, EccPublicParts, KeyAlgorithm, KeyType, RsaPublicParts, WrappedKey,
};

/// The public half stored next to an asymmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicPart {
    Rsa(RsaPublicParts),
    Ecc(EccPublicParts),
}

impl PublicPart {
    pub fn as_rsa(&self) -> Option<&RsaPublicParts> {
        match self {
            Self::Rsa(parts) => Some(parts),
            Self::Ecc(_) => None,
        }
    }

    pub fn as_ecc(&self) -> Option<&EccPublicParts> {
        match self {
            Self::Ecc(parts) => Some(parts),
            Self::Rsa(_) => None,
        }
    }
}

/// One stored key.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub index: u32,
    pub algorithm: KeyAlgorithm,
    /// LMK blob; the only form in which the secret is kept.
    pub ciphertext: Vec<u8>,
    pub public: Option<PublicPart>,
    pub label: String,
    pub kcv: [u8; 8],
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Password verifier gating private-key use.
    pub credential: Option<Credential>,
    /// Assigned by the vault on store; distinguishes a key from a later
    /// key stored at the same index. Zero until stored.
    pub generation: u64,
}

impl KeyRecord {
    pub fn new(index: u32, algorithm: KeyAlgorithm, wrapped: WrappedKey) -> Self {
        let now = Utc::now();
        Self {
            index,
            algorithm,
            ciphertext: wrapped.ciphertext,
            public: None,
            label: String::new(),
            kcv: wrapped.kcv,
            created_at: now,
            updated_at: now,
            credential: None,
            generation: 0,
        }
    }

    pub fn with_public(mut self, public: PublicPart) -> Self {
        self.public = Some(public);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn key_type(&self) -> KeyType {
        self.algorithm.key_type()
    }

    pub fn wrapped(&self) -> WrappedKey {
        WrappedKey {
            ciphertext: self.ciphertext.clone(),
            kcv: self.kcv,
        }
    }

    pub fn info(&self) -> KeyInfo {
        let (bits, exponent) = match (&self.algorithm, &self.public) {
            (KeyAlgorithm::Symmetric(alg), _) => (alg.key_len() * 8, None),
            (KeyAlgorithm::Rsa { bits }, public) => (
                usize::from(*bits),
                public
                    .as_ref()
                    .and_then(PublicPart::as_rsa)
                    .map(|p| codec::trim_leading_zeros(&p.e).to_vec()),
            ),
            (KeyAlgorithm::Ecc(curve), _) => (curve.field_len() * 8, None),
        };
        KeyInfo {
            index: self.index,
            algorithm: self.algorithm,
            bits,
            exponent,
            label: self.label.clone(),
            kcv: self.kcv,
            has_password: self.credential.is_some(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Key metadata. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub index: u32,
    pub algorithm: KeyAlgorithm,
    pub bits: usize,
    /// RSA public exponent without leading zeros.
    pub exponent: Option<Vec<u8>>,
    pub label: String,
    pub kcv: [u8; 8],
    pub has_password: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type Table = RwLock<BTreeMap<u32, Arc<KeyRecord>>>;

/// The three index namespaces.
#[derive(Debug)]
pub struct KeyVault {
    tables: [Table; 3],
    next_generation: AtomicU64,
    max_index: u32,
    label_max: usize,
}

impl KeyVault {
    pub fn new(max_index: u32, label_max: usize) -> Self {
        Self {
            tables: Default::default(),
            next_generation: AtomicU64::new(1),
            max_index,
            label_max,
        }
    }

    fn table(&self, key_type: KeyType) -> &Table {
        &self.tables[key_type.slot()]
    }

    fn check_index(&self, index: u32) -> Result<u32> {
        let index = checked_index(index)?;
        if index > self.max_index {
            return Err(HsmError::InvalidParameter("index out of range"));
        }
        Ok(index)
    }

    fn check_label(&self, label: &str) -> Result<()> {
        if label.len() > self.label_max {
            return Err(HsmError::InvalidParameter("label too long"));
        }
        Ok(())
    }

    /// Store `record` at its index. An occupied slot is replaced only when
    /// `cover` is set.
    pub fn store(&self, mut record: KeyRecord, cover: bool) -> Result<()> {
        let index = self.check_index(record.index)?;
        self.check_label(&record.label)?;
        let key_type = record.key_type();

        let mut table = self.table(key_type).write();
        if table.contains_key(&index) && !cover {
            return Err(HsmError::KeyExists);
        }
        record.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let generation = record.generation;
        table.insert(index, Arc::new(record));
        tracing::debug!(?key_type, index, generation, cover, "key stored");
        Ok(())
    }

    /// Snapshot of the record at `index`.
    pub fn get(&self, key_type: KeyType, index: u32) -> Result<Arc<KeyRecord>> {
        let index = self.check_index(index)?;
        self.table(key_type)
            .read()
            .get(&index)
            .cloned()
            .ok_or(HsmError::KeyNotFound)
    }

    pub fn destroy(&self, key_type: KeyType, index: u32) -> Result<()> {
        let index = self.check_index(index)?;
        self.table(key_type)
            .write()
            .remove(&index)
            .ok_or(HsmError::KeyNotFound)?;
        tracing::debug!(?key_type, index, "key destroyed");
        Ok(())
    }

    pub fn set_label(&self, key_type: KeyType, index: u32, label: &str) -> Result<()> {
        let index = self.check_index(index)?;
        self.check_label(label)?;
        let mut table = self.table(key_type).write();
        let slot = table.get_mut(&index).ok_or(HsmError::KeyNotFound)?;
        let mut updated = (**slot).clone();
        updated.label = label.to_owned();
        updated.updated_at = Utc::now();
        *slot = Arc::new(updated);
        Ok(())
    }

    pub fn label(&self, key_type: KeyType, index: u32) -> Result<String> {
        self.get(key_type, index).map(|r| r.label.clone())
    }

    /// Lowest index carrying `label`. Labels are not unique.
    pub fn index_by_label(&self, key_type: KeyType, label: &str) -> Result<u32> {
        if label.is_empty() {
            return Err(HsmError::InvalidParameter("empty label"));
        }
        self.table(key_type)
            .read()
            .values()
            .find(|r| r.label == label)
            .map(|r| r.index)
            .ok_or(HsmError::KeyNotFound)
    }

    /// Occupied indices, ascending.
    pub fn occupied(&self, key_type: KeyType) -> Vec<u32> {
        self.table(key_type).read().keys().copied().collect()
    }

    pub fn info(&self, key_type: KeyType, index: u32) -> Result<KeyInfo> {
        self.get(key_type, index).map(|r| r.info())
    }

    pub fn public_part(&self, key_type: KeyType, index: u32) -> Result<PublicPart> {
        if key_type == KeyType::Symmetric {
            return Err(HsmError::InvalidParameter("symmetric keys have no public part"));
        }
        self.get(key_type, index)?
            .public
            .clone()
            .ok_or(HsmError::InternalFault("asymmetric record without public part"))
    }

    pub fn max_index(&self) -> u32 {
        self.max_index
    }
}
