//! Audit forwarding and file-backed configuration.

mod common;

use std::sync::{Arc, Mutex};

use lmkvault::audit::{AuditEvent, AuditRecord, AuditSink, FileAuditSink};
use lmkvault::types::SymmKeyRef;
use lmkvault::{
    EccCurve, Hsm, HsmConfig, HsmError, KekParams, KeyFormat, KeySource, KeyType,
    MasterKeyDomain, StoreAt, SymmAlg, Wrapper,
};
use test_log::test;

/// Collects records into a shared Vec.
struct SharedVecSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditSink for SharedVecSink {
    fn append(&mut self, record: &AuditRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

fn scratch_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("lmkvault-{}-{name}", std::process::id()))
}

#[test]
fn key_domain_crossings_reach_forward_sinks() {
    let hsm = common::hsm();
    let records = Arc::new(Mutex::new(Vec::new()));
    hsm.add_audit_sink(Box::new(SharedVecSink {
        records: Arc::clone(&records),
    }));

    let s = hsm.open_session();
    s.generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(1)))
        .unwrap();
    s.generate_ecc_key(EccCurve::NistP256, StoreAt::index(2).password(b"pw"))
        .unwrap();
    assert!(s.acquire_access(KeyType::Ecc, 2, b"nope").is_err());
    s.acquire_access(KeyType::Ecc, 2, b"pw").unwrap();
    s.export_key(
        KeySource::Index(KeyType::Ecc, 2),
        &Wrapper::Kek {
            key: SymmKeyRef::Index(1),
            params: KekParams::ecb(),
        },
        KeyFormat::EccPkcs8,
    )
    .unwrap();
    s.release_access(KeyType::Ecc, 2);
    s.destroy_key(KeyType::Ecc, 2).unwrap();

    let events: Vec<_> = records.lock().unwrap().iter().map(|r| r.event).collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::KeyGenerated,
            AuditEvent::KeyGenerated,
            AuditEvent::GrantRefused,
            AuditEvent::GrantAcquired,
            AuditEvent::KeyExported,
            AuditEvent::GrantReleased,
            AuditEvent::KeyDestroyed,
        ]
    );
    let trail = hsm.audit_records();
    assert_eq!(trail.len(), events.len());
    assert!(trail.iter().all(|r| r.session == s.id()));
    assert_eq!(trail[4].index, Some(2));
    assert_eq!(trail[4].key_type, Some(KeyType::Ecc));
}

#[test]
fn symmetric_operations_are_not_audited() {
    let hsm = common::hsm();
    let s = hsm.open_session();
    s.generate_symm_key(SymmAlg::Sm4, Some(StoreAt::index(1)))
        .unwrap();
    let before = hsm.audit_records().len();
    s.cmac(SymmKeyRef::Index(1), b"data").unwrap();
    s.hash(lmkvault::HashAlg::Sm3, b"data").unwrap();
    assert_eq!(hsm.audit_records().len(), before);
}

#[test]
fn file_sink_writes_json_lines() {
    let path = scratch_path("audit.jsonl");
    let _ = std::fs::remove_file(&path);

    let hsm = common::hsm();
    hsm.add_audit_sink(Box::new(FileAuditSink::new(&path).unwrap()));
    let s = hsm.open_session();
    s.generate_symm_key(SymmAlg::Aes256, Some(StoreAt::index(3)))
        .unwrap();
    s.destroy_key(KeyType::Symmetric, 3).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<AuditRecord> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].event, AuditEvent::KeyDestroyed);
    assert_eq!(lines[1].index, Some(3));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn configuration_loads_from_a_json_file() {
    let path = scratch_path("config.json");
    std::fs::write(&path, r#"{ "max_index": 16, "label_max": 8, "grant_ttl_secs": null }"#).unwrap();
    let config = HsmConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.max_index, 16);
    assert_eq!(config.grant_ttl_secs, None);
    assert_eq!(config.chunk_cap, HsmConfig::default().chunk_cap);

    let hsm = Hsm::new(config, MasterKeyDomain::from_bytes([1u8; 32]).unwrap()).unwrap();
    let s = hsm.open_session();
    assert!(matches!(
        s.generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(17))),
        Err(HsmError::InvalidParameter(_))
    ));
    assert!(matches!(
        s.generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(16).label("too-long-label"))),
        Err(HsmError::InvalidParameter(_))
    ));
    assert!(s.occupied(KeyType::Symmetric).is_empty());
}

#[test]
fn invalid_configuration_is_refused() {
    let config = HsmConfig {
        chunk_cap: 0,
        ..HsmConfig::default()
    };
    assert!(matches!(
        Hsm::new(config, MasterKeyDomain::from_bytes([1u8; 32]).unwrap()),
        Err(HsmError::Config(_))
    ));
}
