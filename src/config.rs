//! Device configuration.
//!
//! Limits that the original device hard-codes (chunk cap, label length,
//! index range) are carried here so deployments and tests can tune them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HsmError, Result};

/// Configuration for an [`Hsm`](crate::session::Hsm) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    /// Max input bytes per one-shot call and per streaming update.
    pub chunk_cap: usize,
    /// Max label length in bytes.
    pub label_max: usize,
    /// Highest usable index in each key namespace. Indices run `1..=max_index`.
    pub max_index: u32,
    /// Lifetime of a private-key access grant. `None` keeps grants until
    /// release or session close.
    pub grant_ttl_secs: Option<u64>,
    /// Consecutive wrong passwords tolerated per session and key before the
    /// session is refused outright.
    pub max_password_attempts: u32,
    /// PBKDF2-HMAC-SHA256 rounds for stored key passwords.
    pub credential_iterations: u32,
    /// Max bytes a GCM/CCM streaming context may buffer.
    pub stream_buffer_cap: usize,
    /// Upper bound for caller-requested PBKDF iteration counts.
    pub pbkdf_max_iterations: u32,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            chunk_cap: 8192,
            label_max: 128,
            max_index: 4096,
            grant_ttl_secs: Some(300),
            max_password_attempts: 5,
            credential_iterations: 10_000,
            stream_buffer_cap: 1 << 20,
            pbkdf_max_iterations: 10_000_000,
        }
    }
}

impl HsmConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| HsmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file in JSON format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| HsmError::Config(e.to_string()))?;
        Self::from_json_str(&text)
    }

    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_cap == 0 {
            return Err(HsmError::Config("chunk_cap must be positive".into()));
        }
        if self.label_max == 0 {
            return Err(HsmError::Config("label_max must be positive".into()));
        }
        if self.max_index == 0 {
            return Err(HsmError::Config("max_index must be positive".into()));
        }
        if self.credential_iterations == 0 || self.pbkdf_max_iterations == 0 {
            return Err(HsmError::Config("iteration counts must be positive".into()));
        }
        if self.stream_buffer_cap < self.chunk_cap {
            return Err(HsmError::Config(
                "stream_buffer_cap must hold at least one chunk".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn grant_ttl(&self) -> Option<Duration> {
        self.grant_ttl_secs.map(Duration::from_secs)
    }
}
