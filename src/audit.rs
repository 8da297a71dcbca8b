//! Append-only audit trail.
//!
//! Records every event where key material crosses a protection boundary:
//! generation, import, export, conversion, envelope exchange, derivation,
//! destruction and access-grant transitions. Records carry identifiers
//! only, never key bytes. Pluggable sinks receive a copy of each record.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{KeyType, SessionId};

/// A sink that receives audit records, e.g. a file or a remote collector.
pub trait AuditSink: Send {
    /// Called once per appended record.
    fn append(&mut self, record: &AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEvent {
    KeyGenerated,
    KeyImported,
    KeyExported,
    KeyConverted,
    EnvelopeExchanged,
    KeyDerived,
    KeyDestroyed,
    LabelChanged,
    GrantAcquired,
    GrantReleased,
    GrantRefused,
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub key_type: Option<KeyType>,
    /// Vault index, or `None` for keys that never touched the vault.
    pub index: Option<u32>,
    pub session: SessionId,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn now(
        event: AuditEvent,
        key_type: Option<KeyType>,
        index: Option<u32>,
        session: SessionId,
    ) -> Self {
        Self {
            event,
            key_type,
            index,
            session,
            timestamp: Utc::now(),
        }
    }
}

/// The in-memory log plus its forward sinks.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward a copy of every later record to `sink`.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    pub fn append(&mut self, record: AuditRecord) {
        for sink in &mut self.forward_sinks {
            sink.append(&record);
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    /// Records matching `event`, oldest first.
    pub fn events(&self, event: AuditEvent) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter().filter(move |r| r.event == event)
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes records as JSON lines, appending to the file.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: &AuditRecord) {
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(err) = writeln!(self.file, "{line}").and_then(|()| self.file.flush()) {
                    tracing::warn!(%err, "audit sink write failed");
                }
            }
            Err(err) => tracing::warn!(%err, "audit record serialisation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<AuditEvent>>>);

    impl AuditSink for Collect {
        fn append(&mut self, record: &AuditRecord) {
            self.0.lock().unwrap().push(record.event);
        }
    }

    #[test]
    fn forward_sinks_see_every_record() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut log = AuditLog::new();
        log.add_forward_sink(Box::new(Collect(seen.clone())));

        log.append(AuditRecord::now(
            AuditEvent::KeyGenerated,
            Some(KeyType::Rsa),
            Some(5),
            SessionId(1),
        ));
        log.append(AuditRecord::now(
            AuditEvent::KeyDestroyed,
            Some(KeyType::Rsa),
            Some(5),
            SessionId(1),
        ));

        assert_eq!(log.len(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![AuditEvent::KeyGenerated, AuditEvent::KeyDestroyed]
        );
        assert_eq!(log.events(AuditEvent::KeyDestroyed).count(), 1);
    }

    #[test]
    fn records_serialise_without_key_material() {
        let record = AuditRecord::now(AuditEvent::GrantAcquired, Some(KeyType::Ecc), Some(2), SessionId(9));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("GrantAcquired"));
        assert!(json.contains("\"index\":2"));
    }
}
