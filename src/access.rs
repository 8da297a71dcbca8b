//! Password-gated access to private keys.
//!
//! A grant is keyed by (session, key type, index) and bound to the
//! generation of the record whose password was checked, so it never
//! unlocks a different key later stored at the same index. It is required
//! by every private-key operation on that index. Grants end on
//! explicit release, on expiry, when the session closes, or when the key
//! is destroyed.
//!
//! Operations capture a [`GrantTicket`] up front and run to completion
//! even if the grant is revoked meanwhile; only later checks fail.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{HsmError, Result};
use crate::types::{KeyType, SessionId};
use crate::vault::KeyRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GrantKey {
    session: SessionId,
    key_type: KeyType,
    index: u32,
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    generation: u64,
    expires_at: Option<Instant>,
}

impl Grant {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Proof that a grant was live when an operation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantTicket {
    pub session: SessionId,
    pub key_type: KeyType,
    pub index: u32,
    /// Generation of the record the password was checked against.
    pub generation: u64,
    pub expires_at: Option<Instant>,
}

impl GrantTicket {
    /// Whether this ticket was issued for `record`.
    pub fn covers(&self, record: &KeyRecord) -> bool {
        self.key_type == record.key_type()
            && self.index == record.index
            && self.generation == record.generation
    }
}

#[derive(Debug, Default)]
struct GateState {
    grants: HashMap<GrantKey, Grant>,
    failures: HashMap<GrantKey, u32>,
}

/// Per-index grant table.
#[derive(Debug)]
pub struct AccessGate {
    state: Mutex<GateState>,
    ttl: Option<Duration>,
    max_attempts: u32,
}

impl AccessGate {
    pub fn new(ttl: Option<Duration>, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            ttl,
            max_attempts,
        }
    }

    /// Check `password` against `record` and open (or renew) a grant.
    pub fn acquire(
        &self,
        session: SessionId,
        record: &KeyRecord,
        password: &[u8],
    ) -> Result<GrantTicket> {
        let key_type = record.key_type();
        if key_type == KeyType::Symmetric {
            return Err(HsmError::InvalidParameter("symmetric keys are not access-controlled"));
        }
        let key = GrantKey {
            session,
            key_type,
            index: record.index,
        };

        let Some(credential) = record.credential.as_ref() else {
            tracing::warn!(%session, ?key_type, index = record.index, "key has no credential");
            return Err(HsmError::AccessDenied);
        };

        // Count the attempt before checking, so concurrent guesses cannot
        // overrun the limit.
        {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key).or_insert(0);
            if *failures >= self.max_attempts {
                tracing::warn!(%session, ?key_type, index = record.index, "access locked out");
                return Err(HsmError::AccessDenied);
            }
            *failures += 1;
        }

        // The password check is slow; keep it outside the lock.
        if let Err(err) = credential.verify(password) {
            tracing::warn!(%session, ?key_type, index = record.index, "wrong password");
            return Err(err);
        }

        let mut state = self.state.lock();
        state.failures.remove(&key);
        let grant = Grant {
            generation: record.generation,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        };
        state.grants.insert(key, grant);
        tracing::debug!(%session, ?key_type, index = record.index, "grant acquired");
        Ok(ticket(key, grant))
    }

    /// The live grant for (session, type, index). Expired grants are
    /// dropped on sight.
    pub fn check(&self, session: SessionId, key_type: KeyType, index: u32) -> Result<GrantTicket> {
        let key = GrantKey {
            session,
            key_type,
            index,
        };
        let mut state = self.state.lock();
        match state.grants.get(&key).copied() {
            Some(grant) if !grant.expired(Instant::now()) => Ok(ticket(key, grant)),
            Some(_) => {
                state.grants.remove(&key);
                tracing::warn!(%session, ?key_type, index, "grant expired");
                Err(HsmError::AccessDenied)
            }
            None => {
                tracing::warn!(%session, ?key_type, index, "no grant");
                Err(HsmError::AccessDenied)
            }
        }
    }

    /// Drop a grant. Releasing a grant that is not held is not an error.
    /// Returns whether one was held.
    pub fn release(&self, session: SessionId, key_type: KeyType, index: u32) -> bool {
        let released = self
            .state
            .lock()
            .grants
            .remove(&GrantKey {
                session,
                key_type,
                index,
            })
            .is_some();
        if released {
            tracing::debug!(%session, ?key_type, index, "grant released");
        }
        released
    }

    /// Drop every grant and failure count held by `session`.
    pub fn revoke_session(&self, session: SessionId) -> usize {
        let mut state = self.state.lock();
        let before = state.grants.len();
        state.grants.retain(|k, _| k.session != session);
        state.failures.retain(|k, _| k.session != session);
        let revoked = before - state.grants.len();
        tracing::debug!(%session, revoked, "session grants revoked");
        revoked
    }

    /// Drop every grant on a destroyed key.
    pub fn revoke_index(&self, key_type: KeyType, index: u32) {
        let mut state = self.state.lock();
        state
            .grants
            .retain(|k, _| !(k.key_type == key_type && k.index == index));
        state
            .failures
            .retain(|k, _| !(k.key_type == key_type && k.index == index));
    }

    /// Number of grants currently held, expired or not.
    pub fn len(&self) -> usize {
        self.state.lock().grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ticket(key: GrantKey, grant: Grant) -> GrantTicket {
    GrantTicket {
        session: key.session,
        key_type: key.key_type,
        index: key.index,
        generation: grant.generation,
        expires_at: grant.expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Credential;
    use crate::types::{EccCurve, KeyAlgorithm, SymmAlg, WrappedKey};

    fn ecc_record(index: u32, password: &[u8]) -> KeyRecord {
        KeyRecord::new(
            index,
            KeyAlgorithm::Ecc(EccCurve::NistP256),
            WrappedKey {
                ciphertext: Vec::new(),
                kcv: [0; 8],
            },
        )
        .with_credential(Credential::derive(password, 100).unwrap())
    }

    #[test]
    fn grant_lifecycle() {
        let gate = AccessGate::new(None, 3);
        let record = ecc_record(4, b"secret");
        let s = SessionId(1);

        assert_eq!(gate.check(s, KeyType::Ecc, 4), Err(HsmError::AccessDenied));
        gate.acquire(s, &record, b"secret").unwrap();
        assert_eq!(gate.check(s, KeyType::Ecc, 4).unwrap().index, 4);
        assert_eq!(
            gate.check(SessionId(2), KeyType::Ecc, 4),
            Err(HsmError::AccessDenied)
        );
        assert_eq!(gate.check(s, KeyType::Rsa, 4), Err(HsmError::AccessDenied));

        assert!(gate.release(s, KeyType::Ecc, 4));
        assert!(!gate.release(s, KeyType::Ecc, 4));
        assert_eq!(gate.check(s, KeyType::Ecc, 4), Err(HsmError::AccessDenied));
    }

    #[test]
    fn reacquire_replaces_the_grant() {
        let gate = AccessGate::new(None, 3);
        let record = ecc_record(4, b"secret");
        gate.acquire(SessionId(1), &record, b"secret").unwrap();
        gate.acquire(SessionId(1), &record, b"secret").unwrap();
        assert_eq!(gate.len(), 1);
    }

    #[test]
    fn zero_ttl_grant_expires_immediately() {
        let gate = AccessGate::new(Some(Duration::ZERO), 3);
        let record = ecc_record(1, b"pw");
        gate.acquire(SessionId(1), &record, b"pw").unwrap();
        assert_eq!(
            gate.check(SessionId(1), KeyType::Ecc, 1),
            Err(HsmError::AccessDenied)
        );
        assert!(gate.is_empty());
    }

    #[test]
    fn repeated_wrong_passwords_lock_the_session_out() {
        let gate = AccessGate::new(None, 2);
        let record = ecc_record(1, b"right");
        let s = SessionId(7);
        assert_eq!(gate.acquire(s, &record, b"wrong"), Err(HsmError::WrongPassword));
        assert_eq!(gate.acquire(s, &record, b"wrong"), Err(HsmError::WrongPassword));
        assert_eq!(gate.acquire(s, &record, b"right"), Err(HsmError::AccessDenied));
        // Other sessions are unaffected.
        assert!(gate.acquire(SessionId(8), &record, b"right").is_ok());
        gate.revoke_session(s);
        assert!(gate.acquire(s, &record, b"right").is_ok());
    }

    #[test]
    fn symmetric_keys_cannot_be_acquired() {
        let gate = AccessGate::new(None, 3);
        let record = KeyRecord::new(
            1,
            KeyAlgorithm::Symmetric(SymmAlg::Sm4),
            WrappedKey {
                ciphertext: Vec::new(),
                kcv: [0; 8],
            },
        );
        assert!(matches!(
            gate.acquire(SessionId(1), &record, b"pw"),
            Err(HsmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn tickets_cover_only_the_checked_record() {
        let gate = AccessGate::new(None, 3);
        let mut old = ecc_record(3, b"old");
        old.generation = 1;
        let mut replacement = ecc_record(3, b"new");
        replacement.generation = 2;

        gate.acquire(SessionId(1), &old, b"old").unwrap();
        let ticket = gate.check(SessionId(1), KeyType::Ecc, 3).unwrap();
        assert_eq!(ticket.generation, 1);
        assert!(ticket.covers(&old));
        assert!(!ticket.covers(&replacement));
    }

    #[test]
    fn concurrent_wrong_guesses_respect_the_limit() {
        let gate = AccessGate::new(None, 2);
        let record = ecc_record(1, b"right");
        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| gate.acquire(SessionId(1), &record, b"wrong")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let wrong = outcomes
            .iter()
            .filter(|r| **r == Err(HsmError::WrongPassword))
            .count();
        assert_eq!(wrong, 2);
        assert!(outcomes
            .iter()
            .all(|r| matches!(r, Err(HsmError::WrongPassword | HsmError::AccessDenied))));
    }

    #[test]
    fn destroying_a_key_revokes_its_grants() {
        let gate = AccessGate::new(None, 3);
        let record = ecc_record(2, b"pw");
        gate.acquire(SessionId(1), &record, b"pw").unwrap();
        gate.acquire(SessionId(2), &record, b"pw").unwrap();
        gate.revoke_index(KeyType::Ecc, 2);
        assert!(gate.is_empty());
    }
}
