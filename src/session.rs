//! The device object and its sessions.
//!
//! [`Hsm`] owns the master key domain, the vault, the access gate and the
//! audit log. Every operation runs through a [`Session`], which resolves
//! key references, checks access grants and records audit events before
//! handing resolved key material to the engine. Closing or dropping a
//! session revokes its grants.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::access::AccessGate;
use crate::audit::{AuditEvent, AuditLog, AuditRecord, AuditSink};
use crate::codec::{self, Emitted, Padding};
use crate::config::HsmConfig;
use crate::crypto::{self, Credential};
use crate::engine::aead::{self, AeadContext, AeadInit, AeadMode, Sealed};
use crate::engine::agreement::{self, AgreementHandle, AgreementParty, AgreementRole};
use crate::engine::ecies::{self, EciesEnvelope, EciesParams};
use crate::engine::hash::{self, HashContext, Sm3Binding};
use crate::engine::mac::{self, CbcMacMode, MacContext, MacProgress, MacSpec};
use crate::engine::symm::{self, SymmOutput, SymmParams};
use crate::engine::{ecc, kdf, rsa};
use crate::error::{HsmError, Result};
use crate::lmk::{self, MasterKeyDomain};
use crate::types::{
    EccCipher, EccCurve, EccKeyRef, EccPrivateParts, EccPublicParts, EccPublicRef, EccSignature,
    HashAlg, KeyAlgorithm, KeyFormat, KeyType, RsaKeyRef, RsaPadding, RsaPrivateParts,
    RsaPublicParts, RsaPublicRef, SessionId, SymmAlg, SymmKeyRef, SymmMode, SymmOp, WrappedKey,
};
use crate::vault::{KeyInfo, KeyRecord, KeyVault, PublicPart};
use crate::wrap::{self, Conversion, KeyKind, Material, Opener, Sealer, Unwrapper, Wrapper};

/// Most inputs one batch call accepts.
pub const BATCH_MAX_ITEMS: usize = 64;

struct Shared {
    config: HsmConfig,
    lmk: MasterKeyDomain,
    vault: KeyVault,
    gate: AccessGate,
    audit: Mutex<AuditLog>,
    next_session: AtomicU64,
}

/// A software HSM instance.
#[derive(Clone)]
pub struct Hsm {
    shared: Arc<Shared>,
}

impl fmt::Debug for Hsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hsm")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Hsm {
    pub fn new(config: HsmConfig, lmk: MasterKeyDomain) -> Result<Self> {
        config.validate()?;
        let vault = KeyVault::new(config.max_index, config.label_max);
        let gate = AccessGate::new(config.grant_ttl(), config.max_password_attempts);
        tracing::debug!(max_index = config.max_index, "hsm initialised");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                lmk,
                vault,
                gate,
                audit: Mutex::new(AuditLog::new()),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    pub fn open_session(&self) -> Session {
        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(session = %id, "session opened");
        Session {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    pub fn config(&self) -> &HsmConfig {
        &self.shared.config
    }

    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.shared.audit.lock().add_forward_sink(sink);
    }

    /// Copy of the audit trail so far.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.shared.audit.lock().iter().cloned().collect()
    }
}

/// Where and how a generated or imported key is stored.
#[derive(Clone, Copy)]
pub struct StoreAt<'a> {
    pub index: u32,
    pub label: &'a str,
    /// Required for RSA and ECC keys, refused for symmetric keys.
    pub password: Option<&'a [u8]>,
    /// Replace an occupied slot.
    pub cover: bool,
}

impl<'a> StoreAt<'a> {
    pub fn index(index: u32) -> Self {
        Self {
            index,
            label: "",
            password: None,
            cover: false,
        }
    }

    pub fn label(mut self, label: &'a str) -> Self {
        self.label = label;
        self
    }

    pub fn password(mut self, password: &'a [u8]) -> Self {
        self.password = Some(password);
        self
    }

    pub fn cover(mut self) -> Self {
        self.cover = true;
        self
    }
}

impl fmt::Debug for StoreAt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreAt")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("password", &self.password.map(|_| ".."))
            .field("cover", &self.cover)
            .finish()
    }
}

/// Where an exported key comes from.
#[derive(Debug, Clone, Copy)]
pub enum KeySource<'a> {
    Index(KeyType, u32),
    Lmk(&'a [u8]),
}

/// One key out of [`Session::export_keys`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedKey {
    pub index: u32,
    /// The key under the requested protector.
    pub cipher: Vec<u8>,
    pub kcv: [u8; 8],
}

/// Parameters for the first block of a framed MAC.
#[derive(Debug, Clone, Copy)]
pub struct MacStart<'a> {
    pub key: SymmKeyRef<'a>,
    pub spec: MacSpec,
    /// CBC-MAC starting value; zero when absent.
    pub iv: Option<&'a [u8]>,
}

fn protector_error(err: HsmError) -> HsmError {
    match err {
        HsmError::KeyNotFound => HsmError::ProtectorNotFound,
        other => other,
    }
}

/// Refuse to export a stored key under itself.
fn check_not_protector(to: &Wrapper<'_>, key_type: KeyType, index: u32) -> Result<()> {
    let protector = match to {
        Wrapper::Kek { key, .. } => key.index().map(|i| (KeyType::Symmetric, i)),
        Wrapper::RsaPublic {
            key: RsaPublicRef::Index(i),
            ..
        } => Some((KeyType::Rsa, *i)),
        Wrapper::EccPublic {
            key: EccPublicRef::Index(i),
        } => Some((KeyType::Ecc, *i)),
        _ => None,
    };
    if protector == Some((key_type, index)) {
        return Err(HsmError::InvalidParameter("key cannot protect itself"));
    }
    Ok(())
}

fn symm_alg_of(algorithm: KeyAlgorithm) -> Result<SymmAlg> {
    match algorithm {
        KeyAlgorithm::Symmetric(alg) => Ok(alg),
        _ => Err(HsmError::KeyFormatInvalid),
    }
}

/// An open session. `Send + Sync`; contexts it creates are refused by
/// other sessions.
pub struct Session {
    shared: Arc<Shared>,
    id: SessionId,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.gate.revoke_session(self.id);
        tracing::debug!(session = %self.id, "session closed");
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Close the session, revoking every grant it holds.
    pub fn close(self) {}

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn audit(&self, event: AuditEvent, key_type: Option<KeyType>, index: Option<u32>) {
        self.shared
            .audit
            .lock()
            .append(AuditRecord::now(event, key_type, index, self.id));
    }

    fn check_chunk(&self, len: usize) -> Result<()> {
        if len > self.shared.config.chunk_cap {
            return Err(HsmError::InvalidParameter("input exceeds chunk cap"));
        }
        Ok(())
    }

    fn check_owner(&self, owner: SessionId) -> Result<()> {
        if owner != self.id {
            tracing::warn!(session = %self.id, %owner, "foreign context refused");
            return Err(HsmError::InvalidContextState);
        }
        Ok(())
    }

    fn symm_key(&self, key: SymmKeyRef<'_>) -> Result<(SymmAlg, Zeroizing<Vec<u8>>)> {
        let blob_key = |blob: &[u8]| -> Result<(SymmAlg, Zeroizing<Vec<u8>>)> {
            let (algorithm, bytes) = self.shared.lmk.unwrap_as(KeyType::Symmetric, blob)?;
            Ok((symm_alg_of(algorithm)?, bytes))
        };
        match key {
            SymmKeyRef::Index(index) => {
                let record = self.shared.vault.get(KeyType::Symmetric, index)?;
                blob_key(&record.ciphertext)
            }
            SymmKeyRef::Lmk(blob) => blob_key(blob),
            SymmKeyRef::Plain { alg, key } => Ok((alg, Zeroizing::new(key.to_vec()))),
        }
    }

    /// Grant first, then the record: a key without a grant is
    /// `AccessDenied` whether or not it exists. A grant taken on an
    /// earlier key at the same index does not cover the current one.
    fn private_record(&self, key_type: KeyType, index: u32) -> Result<Arc<KeyRecord>> {
        let ticket = self.shared.gate.check(self.id, key_type, index)?;
        tracing::trace!(?ticket, "grant captured");
        let record = self.shared.vault.get(key_type, index)?;
        if !ticket.covers(&record) {
            tracing::warn!(session = %self.id, ?key_type, index, "grant belongs to a replaced key");
            return Err(HsmError::AccessDenied);
        }
        Ok(record)
    }

    fn rsa_private(&self, key: RsaKeyRef<'_>) -> Result<RsaPrivateParts> {
        let from_blob = |blob: &[u8]| -> Result<RsaPrivateParts> {
            let (_, der) = self.shared.lmk.unwrap_as(KeyType::Rsa, blob)?;
            rsa::from_pkcs8_der(&der)
        };
        match key {
            RsaKeyRef::Index(index) => from_blob(&self.private_record(KeyType::Rsa, index)?.ciphertext),
            RsaKeyRef::Lmk(blob) => from_blob(blob),
            RsaKeyRef::Plain(parts) => Ok(parts.clone()),
        }
    }

    fn rsa_public(&self, key: RsaPublicRef<'_>) -> Result<RsaPublicParts> {
        match key {
            RsaPublicRef::Index(index) => self
                .shared
                .vault
                .public_part(KeyType::Rsa, index)?
                .as_rsa()
                .cloned()
                .ok_or(HsmError::InternalFault("rsa record holds another key type")),
            RsaPublicRef::Plain(parts) => Ok(parts.clone()),
        }
    }

    fn ecc_private(&self, key: EccKeyRef<'_>) -> Result<EccPrivateParts> {
        let from_blob = |blob: &[u8]| -> Result<EccPrivateParts> {
            let (algorithm, d) = self.shared.lmk.unwrap_as(KeyType::Ecc, blob)?;
            let KeyAlgorithm::Ecc(curve) = algorithm else {
                return Err(HsmError::KeyFormatInvalid);
            };
            Ok(EccPrivateParts { curve, d: d.to_vec() })
        };
        match key {
            EccKeyRef::Index(index) => from_blob(&self.private_record(KeyType::Ecc, index)?.ciphertext),
            EccKeyRef::Lmk(blob) => from_blob(blob),
            EccKeyRef::Plain(parts) => Ok(parts.clone()),
        }
    }

    fn ecc_public(&self, key: EccPublicRef<'_>) -> Result<EccPublicParts> {
        match key {
            EccPublicRef::Index(index) => self
                .shared
                .vault
                .public_part(KeyType::Ecc, index)?
                .as_ecc()
                .cloned()
                .ok_or(HsmError::InternalFault("ecc record holds another key type")),
            EccPublicRef::Plain(parts) => Ok(parts.clone()),
        }
    }

    fn opener<'a>(&'a self, from: &Unwrapper<'a>) -> Result<Opener<'a>> {
        let opener = match from {
            Unwrapper::Lmk => Opener::Lmk(&self.shared.lmk),
            Unwrapper::Kek { key, params } => {
                let (alg, key) = self.symm_key(*key)?;
                Opener::Kek {
                    alg,
                    key,
                    params: *params,
                }
            }
            Unwrapper::RsaPrivate { key, padding } => Opener::Rsa {
                private: self.rsa_private(*key)?,
                padding: padding.clone(),
            },
            Unwrapper::EccPrivate { key } => Opener::Ecc {
                private: self.ecc_private(*key)?,
            },
        };
        Ok(opener)
    }

    fn sealer<'a>(&'a self, to: &Wrapper<'a>) -> Result<Sealer<'a>> {
        let sealer = match to {
            Wrapper::Lmk => Sealer::Lmk(&self.shared.lmk),
            Wrapper::Kek { key, params } => {
                let (alg, key) = self.symm_key(*key)?;
                Sealer::Kek {
                    alg,
                    key,
                    params: *params,
                }
            }
            Wrapper::RsaPublic { key, padding } => Sealer::Rsa {
                public: self.rsa_public(*key)?,
                padding: padding.clone(),
            },
            Wrapper::EccPublic { key } => {
                let public = self.ecc_public(*key)?;
                ecc::check_public(&public)?;
                Sealer::Ecc { public }
            }
        };
        Ok(sealer)
    }

    /// LMK-wrap `material` and, when `at` is given, store it.
    fn commit(&self, material: &Material, at: Option<StoreAt<'_>>) -> Result<(WrappedKey, Option<PublicPart>)> {
        let (wrapped, public) = material.to_lmk(&self.shared.lmk)?;
        let Some(at) = at else {
            return Ok((wrapped, public));
        };
        let key_type = material.algorithm.key_type();
        let mut record = KeyRecord::new(at.index, material.algorithm, wrapped.clone()).with_label(at.label);
        if let Some(public) = public.clone() {
            record = record.with_public(public);
        }
        match (key_type, at.password) {
            (KeyType::Symmetric, None) => {}
            (KeyType::Symmetric, Some(_)) => {
                return Err(HsmError::InvalidParameter("symmetric keys take no password"))
            }
            (_, Some(password)) => {
                let credential =
                    Credential::derive(password, self.shared.config.credential_iterations)?;
                record = record.with_credential(credential);
            }
            (_, None) => return Err(HsmError::InvalidParameter("asymmetric keys need a password")),
        }
        self.shared.vault.store(record, at.cover)?;
        // Grants on a replaced key do not carry over.
        self.shared.gate.revoke_index(key_type, at.index);
        Ok((wrapped, public))
    }

    fn commit_symm(
        &self,
        alg: SymmAlg,
        key: Zeroizing<Vec<u8>>,
        at: Option<StoreAt<'_>>,
        event: AuditEvent,
    ) -> Result<WrappedKey> {
        let material = Material::new(KeyAlgorithm::Symmetric(alg), key);
        let (wrapped, _) = self.commit(&material, at)?;
        self.audit(event, Some(KeyType::Symmetric), at.map(|a| a.index));
        Ok(wrapped)
    }

    // -----------------------------------------------------------------------
    // Key lifecycle
    // -----------------------------------------------------------------------

    /// Generate a symmetric key. With `at` the key is also stored.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?alg, index = at.map(|a| a.index)))]
    pub fn generate_symm_key(&self, alg: SymmAlg, at: Option<StoreAt<'_>>) -> Result<WrappedKey> {
        let key = crypto::random_bytes(alg.key_len())?;
        self.commit_symm(alg, key, at, AuditEvent::KeyGenerated)
    }

    /// Generate a symmetric key and return it both under the LMK and under
    /// a transport protector.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?alg))]
    pub fn generate_symm_key_protected(
        &self,
        alg: SymmAlg,
        to: &Wrapper<'_>,
    ) -> Result<(WrappedKey, Vec<u8>)> {
        let sealer = self.sealer(to).map_err(protector_error)?;
        let material = Material::new(KeyAlgorithm::Symmetric(alg), crypto::random_bytes(alg.key_len())?);
        let (wrapped, _) = material.to_lmk(&self.shared.lmk)?;
        let transport = wrap::seal(&sealer, &material, KeyFormat::Raw)?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Symmetric), None);
        self.audit(AuditEvent::KeyExported, Some(KeyType::Symmetric), None);
        Ok((wrapped, transport))
    }

    /// Generate and store an RSA key.
    #[tracing::instrument(skip_all, fields(session = %self.id, bits = bits, index = at.index))]
    pub fn generate_rsa_key(&self, bits: u16, exponent: u32, at: StoreAt<'_>) -> Result<RsaPublicParts> {
        let parts = rsa::generate(bits, exponent)?;
        let material = Material::new(KeyAlgorithm::Rsa { bits }, rsa::to_pkcs8_der(&parts)?);
        self.commit(&material, Some(at))?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Rsa), Some(at.index));
        Ok(parts.public())
    }

    /// Generate an RSA key and return it in the clear. Bootstrap use only.
    #[tracing::instrument(skip_all, fields(session = %self.id, bits = bits))]
    pub fn generate_rsa_key_plain(&self, bits: u16, exponent: u32) -> Result<RsaPrivateParts> {
        let parts = rsa::generate(bits, exponent)?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Rsa), None);
        Ok(parts)
    }

    /// Generate an RSA key and return its public half and LMK ciphertext.
    #[tracing::instrument(skip_all, fields(session = %self.id, bits = bits))]
    pub fn generate_rsa_key_with_lmk(
        &self,
        bits: u16,
        exponent: u32,
    ) -> Result<(RsaPublicParts, WrappedKey)> {
        let parts = rsa::generate(bits, exponent)?;
        let material = Material::new(KeyAlgorithm::Rsa { bits }, rsa::to_pkcs8_der(&parts)?);
        let (wrapped, _) = self.commit(&material, None)?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Rsa), None);
        Ok((parts.public(), wrapped))
    }

    /// Generate and store an ECC key.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?curve, index = at.index))]
    pub fn generate_ecc_key(&self, curve: EccCurve, at: StoreAt<'_>) -> Result<EccPublicParts> {
        let (private, public) = ecc::generate(curve)?;
        let material = Material::new(KeyAlgorithm::Ecc(curve), Zeroizing::new(private.d.clone()));
        self.commit(&material, Some(at))?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Ecc), Some(at.index));
        Ok(public)
    }

    /// Generate an ECC key pair in the clear. Bootstrap use only.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?curve))]
    pub fn generate_ecc_key_plain(&self, curve: EccCurve) -> Result<(EccPrivateParts, EccPublicParts)> {
        let pair = ecc::generate(curve)?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Ecc), None);
        Ok(pair)
    }

    /// Generate an ECC key and return its public half and LMK ciphertext.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?curve))]
    pub fn generate_ecc_key_with_lmk(&self, curve: EccCurve) -> Result<(EccPublicParts, WrappedKey)> {
        let (private, public) = ecc::generate(curve)?;
        let material = Material::new(KeyAlgorithm::Ecc(curve), Zeroizing::new(private.d.clone()));
        let (wrapped, _) = self.commit(&material, None)?;
        self.audit(AuditEvent::KeyGenerated, Some(KeyType::Ecc), None);
        Ok((public, wrapped))
    }

    /// Unwrap `cipher` under `from`, re-wrap under the LMK and store it.
    /// The vault is untouched unless every step succeeds.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?kind, ?format, index = at.index))]
    pub fn import_wrapped(
        &self,
        kind: KeyKind,
        cipher: &[u8],
        from: &Unwrapper<'_>,
        format: KeyFormat,
        at: StoreAt<'_>,
    ) -> Result<WrappedKey> {
        let material = self.peel_for_import(kind, cipher, from, format)?;
        let (wrapped, _) = self.commit(&material, Some(at))?;
        self.audit(
            AuditEvent::KeyImported,
            Some(material.algorithm.key_type()),
            Some(at.index),
        );
        Ok(wrapped)
    }

    /// Re-wrap an external ciphertext under the LMK without storing it.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?kind, ?format))]
    pub fn import_key(
        &self,
        kind: KeyKind,
        cipher: &[u8],
        from: &Unwrapper<'_>,
        format: KeyFormat,
    ) -> Result<WrappedKey> {
        let material = self.peel_for_import(kind, cipher, from, format)?;
        let (wrapped, _) = self.commit(&material, None)?;
        self.audit(AuditEvent::KeyImported, Some(material.algorithm.key_type()), None);
        Ok(wrapped)
    }

    fn peel_for_import(
        &self,
        kind: KeyKind,
        cipher: &[u8],
        from: &Unwrapper<'_>,
        format: KeyFormat,
    ) -> Result<Material> {
        let opener = self.opener(from).map_err(protector_error)?;
        wrap::peel(&opener, cipher, kind, format).map_err(|err| match err {
            HsmError::UnwrapAuthFailed => HsmError::KeyFormatInvalid,
            other => other,
        })
    }

    /// Export a key from under the LMK to a transport protector.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?source, ?format))]
    pub fn export_key(
        &self,
        source: KeySource<'_>,
        to: &Wrapper<'_>,
        format: KeyFormat,
    ) -> Result<Vec<u8>> {
        let (blob, key_type, index) = match source {
            KeySource::Index(key_type, index) => {
                check_not_protector(to, key_type, index)?;
                let record = match key_type {
                    KeyType::Symmetric => self.shared.vault.get(key_type, index)?,
                    KeyType::Rsa | KeyType::Ecc => self.private_record(key_type, index)?,
                };
                (record.ciphertext.clone(), key_type, Some(index))
            }
            KeySource::Lmk(blob) => {
                let key_type = lmk::peek_algorithm(blob)?.key_type();
                (blob.to_vec(), key_type, None)
            }
        };
        let algorithm = lmk::peek_algorithm(&blob)?;
        let sealer = self.sealer(to).map_err(protector_error)?;
        let (out, _) = wrap::convert(
            &blob,
            &Opener::Lmk(&self.shared.lmk),
            &sealer,
            algorithm.into(),
            format,
            format,
        )?;
        self.audit(AuditEvent::KeyExported, Some(key_type), index);
        Ok(out)
    }

    /// Export several stored symmetric keys under one protector. Either
    /// every key is exported or none is.
    #[tracing::instrument(skip_all, fields(session = %self.id, count = indices.len(), ?format))]
    pub fn export_keys(
        &self,
        indices: &[u32],
        to: &Wrapper<'_>,
        format: KeyFormat,
    ) -> Result<Vec<ExportedKey>> {
        if indices.is_empty() || indices.len() > BATCH_MAX_ITEMS {
            return Err(HsmError::InvalidParameter("batch size"));
        }
        let records = indices
            .iter()
            .map(|&index| {
                check_not_protector(to, KeyType::Symmetric, index)?;
                self.shared.vault.get(KeyType::Symmetric, index)
            })
            .collect::<Result<Vec<_>>>()?;
        let sealer = self.sealer(to).map_err(protector_error)?;
        let opener = Opener::Lmk(&self.shared.lmk);
        let exported = records
            .iter()
            .map(|record| {
                let (cipher, _) = wrap::convert(
                    &record.ciphertext,
                    &opener,
                    &sealer,
                    record.algorithm.into(),
                    format,
                    format,
                )?;
                Ok(ExportedKey {
                    index: record.index,
                    cipher,
                    kcv: record.kcv,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        for key in &exported {
            self.audit(AuditEvent::KeyExported, Some(KeyType::Symmetric), Some(key.index));
        }
        Ok(exported)
    }

    /// Move a key from one protector to another in one step.
    #[tracing::instrument(skip_all, fields(session = %self.id, kind = ?conversion.kind))]
    pub fn convert(&self, conversion: &Conversion<'_>) -> Result<Vec<u8>> {
        let opener = self.opener(&conversion.from).map_err(protector_error)?;
        let sealer = self.sealer(&conversion.to).map_err(protector_error)?;
        let (out, algorithm) = wrap::convert(
            conversion.cipher,
            &opener,
            &sealer,
            conversion.kind,
            conversion.from_format,
            conversion.to_format,
        )?;
        self.audit(AuditEvent::KeyConverted, Some(algorithm.key_type()), None);
        Ok(out)
    }

    /// Re-encrypt a digital envelope from one key pair to another. The
    /// carried key is treated as opaque bytes.
    #[tracing::instrument(skip_all, fields(session = %self.id))]
    pub fn exchange_envelope(
        &self,
        envelope: &[u8],
        from: &Unwrapper<'_>,
        to: &Wrapper<'_>,
    ) -> Result<Vec<u8>> {
        let from_index = match from {
            Unwrapper::RsaPrivate { key, .. } => key.index().map(|i| (KeyType::Rsa, i)),
            Unwrapper::EccPrivate { key } => key.index().map(|i| (KeyType::Ecc, i)),
            _ => return Err(HsmError::InvalidParameter("envelope source must be a private key")),
        };
        if !matches!(to, Wrapper::RsaPublic { .. } | Wrapper::EccPublic { .. }) {
            return Err(HsmError::InvalidParameter("envelope destination must be a public key"));
        }
        let opener = self.opener(from).map_err(protector_error)?;
        let sealer = self.sealer(to).map_err(protector_error)?;

        let key = wrap::open_payload(&opener, envelope)?;
        let out = wrap::seal_payload(&sealer, &key)?;
        drop(key);

        self.audit(
            AuditEvent::EnvelopeExchanged,
            from_index.map(|(t, _)| t),
            from_index.map(|(_, i)| i),
        );
        Ok(out)
    }

    /// Envelope exchange between two RSA keys.
    pub fn exchange_envelope_rsa(
        &self,
        envelope: &[u8],
        from: RsaKeyRef<'_>,
        from_padding: RsaPadding,
        to: RsaPublicRef<'_>,
        to_padding: RsaPadding,
    ) -> Result<Vec<u8>> {
        self.exchange_envelope(
            envelope,
            &Unwrapper::RsaPrivate {
                key: from,
                padding: from_padding,
            },
            &Wrapper::RsaPublic {
                key: to,
                padding: to_padding,
            },
        )
    }

    /// Envelope exchange between two ECC keys.
    pub fn exchange_envelope_ecc(
        &self,
        envelope: &[u8],
        from: EccKeyRef<'_>,
        to: EccPublicRef<'_>,
    ) -> Result<Vec<u8>> {
        self.exchange_envelope(
            envelope,
            &Unwrapper::EccPrivate { key: from },
            &Wrapper::EccPublic { key: to },
        )
    }

    /// Store an existing LMK ciphertext. The public half and check value
    /// are recomputed from the key itself.
    #[tracing::instrument(skip_all, fields(session = %self.id, index = at.index))]
    pub fn import_lmk_cipher(&self, cipher: &[u8], at: StoreAt<'_>) -> Result<WrappedKey> {
        let (algorithm, bytes) = self.shared.lmk.unwrap(cipher)?;
        let material = Material::new(algorithm, bytes);
        let (wrapped, _) = self.commit(&material, Some(at))?;
        self.audit(AuditEvent::KeyImported, Some(algorithm.key_type()), Some(at.index));
        Ok(wrapped)
    }

    /// The stored LMK ciphertext of a key.
    pub fn lmk_cipher_of(&self, key_type: KeyType, index: u32) -> Result<WrappedKey> {
        Ok(self.shared.vault.get(key_type, index)?.wrapped())
    }

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key_type, index = index))]
    pub fn destroy_key(&self, key_type: KeyType, index: u32) -> Result<()> {
        self.shared.vault.destroy(key_type, index)?;
        self.shared.gate.revoke_index(key_type, index);
        self.audit(AuditEvent::KeyDestroyed, Some(key_type), Some(index));
        Ok(())
    }

    pub fn set_label(&self, key_type: KeyType, index: u32, label: &str) -> Result<()> {
        self.shared.vault.set_label(key_type, index, label)?;
        self.audit(AuditEvent::LabelChanged, Some(key_type), Some(index));
        Ok(())
    }

    pub fn label(&self, key_type: KeyType, index: u32) -> Result<String> {
        self.shared.vault.label(key_type, index)
    }

    pub fn index_by_label(&self, key_type: KeyType, label: &str) -> Result<u32> {
        self.shared.vault.index_by_label(key_type, label)
    }

    /// Occupied indices in a namespace, ascending.
    pub fn occupied(&self, key_type: KeyType) -> Vec<u32> {
        self.shared.vault.occupied(key_type)
    }

    pub fn key_info(&self, key_type: KeyType, index: u32) -> Result<KeyInfo> {
        self.shared.vault.info(key_type, index)
    }

    pub fn symm_key_info(&self, index: u32) -> Result<KeyInfo> {
        self.key_info(KeyType::Symmetric, index)
    }

    pub fn public_key(&self, key_type: KeyType, index: u32) -> Result<PublicPart> {
        self.shared.vault.public_part(key_type, index)
    }

    pub fn rsa_public_from_private(&self, key: RsaKeyRef<'_>) -> Result<RsaPublicParts> {
        match key {
            RsaKeyRef::Index(index) => self.rsa_public(RsaPublicRef::Index(index)),
            RsaKeyRef::Lmk(_) | RsaKeyRef::Plain(_) => Ok(self.rsa_private(key)?.public()),
        }
    }

    pub fn ecc_public_from_private(&self, key: EccKeyRef<'_>) -> Result<EccPublicParts> {
        match key {
            EccKeyRef::Index(index) => self.ecc_public(EccPublicRef::Index(index)),
            EccKeyRef::Lmk(_) | EccKeyRef::Plain(_) => ecc::public_from_private(&self.ecc_private(key)?),
        }
    }

    /// Check value of a symmetric key.
    pub fn symm_kcv(&self, key: SymmKeyRef<'_>) -> Result<[u8; 8]> {
        let (alg, key) = self.symm_key(key)?;
        crate::engine::symm_kcv(alg, &key)
    }

    // -----------------------------------------------------------------------
    // Access rights
    // -----------------------------------------------------------------------

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key_type, index = index))]
    pub fn acquire_access(&self, key_type: KeyType, index: u32, password: &[u8]) -> Result<()> {
        let outcome = self
            .shared
            .vault
            .get(key_type, index)
            .and_then(|record| self.shared.gate.acquire(self.id, &record, password));
        match outcome {
            Ok(_) => {
                self.audit(AuditEvent::GrantAcquired, Some(key_type), Some(index));
                Ok(())
            }
            Err(err) => {
                if matches!(err, HsmError::WrongPassword | HsmError::AccessDenied) {
                    self.audit(AuditEvent::GrantRefused, Some(key_type), Some(index));
                }
                Err(err)
            }
        }
    }

    /// Release a grant. Releasing an absent grant succeeds.
    pub fn release_access(&self, key_type: KeyType, index: u32) {
        if self.shared.gate.release(self.id, key_type, index) {
            self.audit(AuditEvent::GrantReleased, Some(key_type), Some(index));
        }
    }

    // -----------------------------------------------------------------------
    // Symmetric operations
    // -----------------------------------------------------------------------

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key, mode = ?params.mode, len = data.len()))]
    pub fn operate(
        &self,
        key: SymmKeyRef<'_>,
        params: &SymmParams<'_>,
        data: &[u8],
    ) -> Result<SymmOutput> {
        self.check_chunk(data.len())?;
        let (alg, key) = self.symm_key(key)?;
        symm::operate(alg, &key, params, data)
    }

    /// [`operate`](Self::operate) into a caller buffer. `None` reports the
    /// required size.
    pub fn operate_into(
        &self,
        key: SymmKeyRef<'_>,
        params: &SymmParams<'_>,
        data: &[u8],
        out: Option<&mut [u8]>,
    ) -> Result<Emitted> {
        let result = Zeroizing::new(self.operate(key, params, data)?.data);
        codec::emit(&result, out)
    }

    /// CFB/OFB/CTR with an IV shorter than a block; the first `iv_len`
    /// bytes of `params.iv` are zero-extended.
    pub fn operate_with_iv_len(
        &self,
        key: SymmKeyRef<'_>,
        params: &SymmParams<'_>,
        iv_len: usize,
        data: &[u8],
    ) -> Result<SymmOutput> {
        if !matches!(params.mode, SymmMode::Cfb | SymmMode::Ofb | SymmMode::Ctr) {
            return Err(HsmError::InvalidParameter("explicit iv length needs CFB, OFB or CTR"));
        }
        self.check_chunk(data.len())?;
        let (alg, key) = self.symm_key(key)?;
        let iv = params.iv.ok_or(HsmError::InvalidParameter("missing iv"))?;
        let iv = symm::expand_iv(alg, iv, iv_len)?;
        let params = SymmParams {
            iv: Some(&iv),
            ..*params
        };
        symm::operate(alg, &key, &params, data)
    }

    /// Apply one operation to independent inputs, each starting from the
    /// same IV.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?key, items = items.len()))]
    pub fn batch_operate(
        &self,
        key: SymmKeyRef<'_>,
        params: &SymmParams<'_>,
        items: &[&[u8]],
    ) -> Result<Vec<Vec<u8>>> {
        if items.is_empty() || items.len() > BATCH_MAX_ITEMS {
            return Err(HsmError::InvalidParameter("batch size"));
        }
        for item in items {
            self.check_chunk(item.len())?;
        }
        let (alg, key) = self.symm_key(key)?;
        items
            .iter()
            .map(|item| symm::operate(alg, &key, params, item).map(|out| out.data))
            .collect()
    }

    /// One-shot AEAD encryption; output is `ciphertext | tag`.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?key, ?mode, len = data.len()))]
    pub fn aead_encrypt(
        &self,
        key: SymmKeyRef<'_>,
        mode: AeadMode,
        nonce: &[u8],
        aad: &[u8],
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.check_chunk(data.len())?;
        let (alg, key) = self.symm_key(key)?;
        aead::seal(alg, mode, &key, nonce, aad, data)
    }

    /// One-shot AEAD decryption of `ciphertext | tag`.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?key, ?mode, len = sealed.len()))]
    pub fn aead_decrypt(
        &self,
        key: SymmKeyRef<'_>,
        mode: AeadMode,
        nonce: &[u8],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.check_chunk(sealed.len())?;
        let (alg, key) = self.symm_key(key)?;
        aead::open(alg, mode, &key, nonce, aad, sealed)
    }

    pub fn aead_init(
        &self,
        key: SymmKeyRef<'_>,
        mode: AeadMode,
        op: SymmOp,
        nonce: &[u8],
        aad: &[u8],
    ) -> Result<AeadContext> {
        let (alg, key) = self.symm_key(key)?;
        let init = AeadInit {
            alg,
            mode,
            op,
            nonce,
            aad,
        };
        AeadContext::init(self.id, &init, key, self.shared.config.stream_buffer_cap)
    }

    /// Feed a chunk. Nothing is released until the context finishes.
    pub fn aead_update(&self, ctx: &mut AeadContext, chunk: &[u8]) -> Result<()> {
        self.check_owner(ctx.owner())?;
        self.check_chunk(chunk.len())?;
        ctx.update(chunk)
    }

    pub fn aead_finish_encrypt(&self, ctx: AeadContext) -> Result<Sealed> {
        self.check_owner(ctx.owner())?;
        ctx.finish_encrypt()
    }

    /// Verify `tag` and release the plaintext. On a mismatch nothing is
    /// returned.
    pub fn aead_finish_decrypt(&self, ctx: AeadContext, tag: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.check_owner(ctx.owner())?;
        ctx.finish_decrypt(tag)
    }

    // -----------------------------------------------------------------------
    // MACs
    // -----------------------------------------------------------------------

    /// ISO/IEC 9797-1 CBC-MAC.
    pub fn calculate_mac(
        &self,
        key: SymmKeyRef<'_>,
        mode: CbcMacMode,
        iv: Option<&[u8]>,
        padding: Padding,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.check_chunk(data.len())?;
        let (alg, key) = self.symm_key(key)?;
        mac::cbc_mac(alg, mode, &key, iv, padding, data)
    }

    pub fn cmac(&self, key: SymmKeyRef<'_>, data: &[u8]) -> Result<Vec<u8>> {
        self.check_chunk(data.len())?;
        let (alg, key) = self.symm_key(key)?;
        mac::cmac(alg, &key, data)
    }

    /// HMAC. For plain keys the algorithm tag is ignored and any key length
    /// is accepted.
    pub fn hmac(&self, hash: HashAlg, key: SymmKeyRef<'_>, data: &[u8]) -> Result<Vec<u8>> {
        self.check_chunk(data.len())?;
        let (_, key) = self.symm_key(key)?;
        mac::hmac(hash, &key, data)
    }

    /// Feed one framed block of a CBC-MAC, CMAC or HMAC. `start` is
    /// required with [`DataBlock::First`](crate::types::DataBlock::First)
    /// and ignored afterwards.
    pub fn mac_block(
        &self,
        ctx: Option<MacContext>,
        block: crate::types::DataBlock,
        start: Option<&MacStart<'_>>,
        data: &[u8],
    ) -> Result<MacProgress> {
        if let Some(ctx) = &ctx {
            self.check_owner(ctx.owner())?;
        }
        self.check_chunk(data.len())?;
        let begin = || -> Result<MacContext> {
            let start = start.ok_or(HsmError::InvalidParameter("first block needs a key"))?;
            let (alg, key) = self.symm_key(start.key)?;
            match start.spec {
                MacSpec::CbcMac { alg: want, .. } | MacSpec::Cmac { alg: want } if want != alg => {
                    return Err(HsmError::InvalidParameter("key algorithm does not match"));
                }
                _ => {}
            }
            MacContext::init(
                self.id,
                start.spec,
                key,
                start.iv,
                self.shared.config.stream_buffer_cap,
            )
        };
        mac::step(ctx, block, begin, data)
    }

    /// SP 800-108 counter-mode KDF over CMAC.
    pub fn prf_kdf_cmac(
        &self,
        key: SymmKeyRef<'_>,
        label: &[u8],
        context: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (alg, key) = self.symm_key(key)?;
        mac::prf_kdf_cmac(alg, &key, label, context, len)
    }

    // -----------------------------------------------------------------------
    // Digests
    // -----------------------------------------------------------------------

    pub fn hash(&self, alg: HashAlg, data: &[u8]) -> Result<Vec<u8>> {
        self.check_chunk(data.len())?;
        Ok(hash::hash(alg, data))
    }

    pub fn hash_into(&self, alg: HashAlg, data: &[u8], out: Option<&mut [u8]>) -> Result<Emitted> {
        codec::emit(&self.hash(alg, data)?, out)
    }

    /// SM3 with the identity digest of `binding` prefixed.
    pub fn hash_bound(
        &self,
        alg: HashAlg,
        binding: Option<&Sm3Binding<'_>>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.check_chunk(data.len())?;
        hash::hash_bound(alg, binding, data)
    }

    pub fn hash_init(&self, alg: HashAlg, binding: Option<&Sm3Binding<'_>>) -> Result<HashContext> {
        HashContext::init(self.id, alg, binding)
    }

    pub fn hash_update(&self, ctx: &mut HashContext, data: &[u8]) -> Result<()> {
        self.check_owner(ctx.owner())?;
        self.check_chunk(data.len())?;
        ctx.update(data);
        Ok(())
    }

    pub fn hash_finish(&self, ctx: HashContext) -> Result<Vec<u8>> {
        self.check_owner(ctx.owner())?;
        Ok(ctx.finish())
    }

    pub fn multi_hash(&self, alg: HashAlg, items: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        hash::multi_hash(alg, items)
    }

    // -----------------------------------------------------------------------
    // RSA
    // -----------------------------------------------------------------------

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key, ?hash_alg))]
    pub fn rsa_sign(
        &self,
        key: RsaKeyRef<'_>,
        padding: &RsaPadding,
        hash_alg: HashAlg,
        message: &[u8],
    ) -> Result<Vec<u8>> {
        self.check_chunk(message.len())?;
        let private = self.rsa_private(key)?;
        rsa::sign(&private, padding, hash_alg, message)
    }

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key, ?hash_alg))]
    pub fn rsa_verify(
        &self,
        key: RsaPublicRef<'_>,
        padding: &RsaPadding,
        hash_alg: HashAlg,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        self.check_chunk(message.len())?;
        let public = self.rsa_public(key)?;
        rsa::verify(&public, padding, hash_alg, message, signature)
    }

    pub fn rsa_encrypt(&self, key: RsaPublicRef<'_>, padding: &RsaPadding, data: &[u8]) -> Result<Vec<u8>> {
        let public = self.rsa_public(key)?;
        rsa::encrypt(&public, padding, data)
    }

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key))]
    pub fn rsa_decrypt(
        &self,
        key: RsaKeyRef<'_>,
        padding: &RsaPadding,
        data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let private = self.rsa_private(key)?;
        rsa::decrypt(&private, padding, data)
    }

    /// Raw `data^e mod n`, e.g. to recover an encoded signature block.
    pub fn rsa_public_key_operation(&self, key: RsaPublicRef<'_>, data: &[u8]) -> Result<Vec<u8>> {
        let public = self.rsa_public(key)?;
        rsa::public_key_operation(&public, data)
    }

    // -----------------------------------------------------------------------
    // ECC
    // -----------------------------------------------------------------------

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key))]
    pub fn ecc_sign_hash(&self, key: EccKeyRef<'_>, digest: &[u8]) -> Result<EccSignature> {
        let private = self.ecc_private(key)?;
        ecc::sign_hash(&private, digest)
    }

    pub fn ecc_verify_hash(
        &self,
        key: EccPublicRef<'_>,
        digest: &[u8],
        signature: &EccSignature,
    ) -> Result<()> {
        let public = self.ecc_public(key)?;
        ecc::verify_hash(&public, digest, signature)
    }

    pub fn ecc_encrypt(&self, key: EccPublicRef<'_>, data: &[u8]) -> Result<EccCipher> {
        self.check_chunk(data.len())?;
        let public = self.ecc_public(key)?;
        ecc::encrypt(&public, data)
    }

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key))]
    pub fn ecc_decrypt(&self, key: EccKeyRef<'_>, cipher: &EccCipher) -> Result<Zeroizing<Vec<u8>>> {
        let private = self.ecc_private(key)?;
        ecc::decrypt(&private, cipher)
    }

    pub fn ecies_encrypt(
        &self,
        key: EccPublicRef<'_>,
        params: &EciesParams<'_>,
        data: &[u8],
    ) -> Result<EciesEnvelope> {
        self.check_chunk(data.len())?;
        let public = self.ecc_public(key)?;
        ecies::encrypt(&public, params, data)
    }

    #[tracing::instrument(skip_all, fields(session = %self.id, ?key))]
    pub fn ecies_decrypt(
        &self,
        key: EccKeyRef<'_>,
        params: &EciesParams<'_>,
        envelope: &EciesEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let private = self.ecc_private(key)?;
        ecies::decrypt(&private, params, envelope)
    }

    // -----------------------------------------------------------------------
    // Key agreement
    // -----------------------------------------------------------------------

    /// ECDH with X9.63 SHA-256; the result is a symmetric key under the LMK.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?own, ?alg))]
    pub fn ecdh_agree(
        &self,
        own: EccKeyRef<'_>,
        peer: EccPublicRef<'_>,
        alg: SymmAlg,
        shared_info: &[u8],
        at: Option<StoreAt<'_>>,
    ) -> Result<WrappedKey> {
        let private = self.ecc_private(own)?;
        let peer = self.ecc_public(peer)?;
        let key = agreement::ecdh_derive(&private, &peer, alg, shared_info)?;
        self.commit_symm(alg, key, at, AuditEvent::KeyDerived)
    }

    /// Phase one of the two-phase exchange.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?own, ?role))]
    pub fn generate_agreement_data(
        &self,
        own: EccKeyRef<'_>,
        role: AgreementRole,
        own_id: Option<&[u8]>,
    ) -> Result<AgreementHandle> {
        let private = self.ecc_private(own)?;
        AgreementHandle::start(self.id, role, &private, own_id)
    }

    /// Phase two: consume the handle and derive a symmetric key under the
    /// LMK.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?alg))]
    pub fn generate_key_from_agreement(
        &self,
        handle: AgreementHandle,
        peer: EccPublicRef<'_>,
        peer_id: Option<&[u8]>,
        peer_ephemeral: &EccPublicParts,
        alg: SymmAlg,
        at: Option<StoreAt<'_>>,
    ) -> Result<WrappedKey> {
        self.check_owner(handle.owner())?;
        let peer = self.ecc_public(peer)?;
        let key = handle.finish(
            AgreementParty {
                public: &peer,
                id: peer_id,
            },
            peer_ephemeral,
            alg.key_len(),
        )?;
        self.commit_symm(alg, key, at, AuditEvent::KeyDerived)
    }

    // -----------------------------------------------------------------------
    // Key derivation and randomness
    // -----------------------------------------------------------------------

    /// HKDF from a symmetric key into a new symmetric key under the LMK.
    /// For plain input keys the algorithm tag is ignored.
    #[tracing::instrument(skip_all, fields(session = %self.id, ?ikm, ?hash_alg, ?alg))]
    pub fn hkdf(
        &self,
        hash_alg: HashAlg,
        ikm: SymmKeyRef<'_>,
        salt: &[u8],
        info: &[u8],
        alg: SymmAlg,
        at: Option<StoreAt<'_>>,
    ) -> Result<WrappedKey> {
        let (_, ikm) = self.symm_key(ikm)?;
        let key = kdf::hkdf(hash_alg, &ikm, salt, info, alg.key_len())?;
        self.commit_symm(alg, key, at, AuditEvent::KeyDerived)
    }

    /// PBKDF2 with a caller-supplied salt.
    pub fn pbkdf(
        &self,
        hash_alg: HashAlg,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        kdf::pbkdf2(
            hash_alg,
            password,
            salt,
            iterations,
            self.shared.config.pbkdf_max_iterations,
            len,
        )
    }

    /// PBKDF2 over `random | salt` where `random` is drawn by the device
    /// and returned alongside the derived bytes.
    pub fn pbkdf_with_random(
        &self,
        hash_alg: HashAlg,
        password: &[u8],
        salt: &[u8],
        random_len: usize,
        iterations: u32,
        len: usize,
    ) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        if random_len == 0 {
            return Err(HsmError::InvalidParameter("random length"));
        }
        let random = self.random(random_len)?;
        let full_salt = [&random[..], salt].concat();
        let derived = self.pbkdf(hash_alg, password, &full_salt, iterations, len)?;
        Ok((random, derived))
    }

    pub fn random(&self, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(HsmError::InvalidParameter("random length"));
        }
        self.check_chunk(len)?;
        let mut out = vec![0u8; len];
        crypto::fill_random(&mut out)?;
        Ok(out)
    }
}
