//! Engine configuration.
//!
//! Settings can be built in code with the `with_*` builders or loaded from a
//! TOML file. Every field has a default, so a file only lists what it
//! changes:
//!
//! ```toml
//! relays = ["proxy.example.com"]
//! relay_connect_timeout = 10
//!
//! [stream_management]
//! ack_every = 10
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::caps::{DEFAULT_FEATURE_BLACKLIST, HashAlgorithm};
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Configuration for the protocol engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidate bytestream relay addresses, tried in order.
    pub relays: Vec<String>,

    /// Relay preferred when an account has not chosen one.
    pub default_relay: Option<String>,

    /// Seconds to wait for a relay's TCP connect and handshake.
    pub relay_connect_timeout: u64,

    /// Probe relays with a throwaway handshake before caching them.
    pub test_relays: bool,

    /// Milliseconds between event loop passes.
    pub process_interval_ms: u64,

    /// `xml:lang` announced on the stream header.
    pub lang: String,

    /// Stream management settings.
    pub stream_management: StreamManagementSettings,

    /// Capability cache settings.
    pub caps: CapsSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            default_relay: None,
            relay_connect_timeout: 20,
            test_relays: true,
            process_interval_ms: 200,
            lang: "en".to_string(),
            stream_management: StreamManagementSettings::default(),
            caps: CapsSettings::default(),
        }
    }
}

/// Stream management settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamManagementSettings {
    /// Ask the server for a resumable session.
    pub resume: bool,

    /// Request an ack after this many unacknowledged stanzas (0 disables).
    pub ack_every: usize,

    /// Seconds to wait for an answer to enable or resume.
    pub negotiation_timeout: u64,
}

impl Default for StreamManagementSettings {
    fn default() -> Self {
        Self {
            resume: true,
            ack_every: palaver_protocol::sm::DEFAULT_ACK_EVERY,
            negotiation_timeout: 30,
        }
    }
}

/// Capability cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsSettings {
    /// Hash algorithm used when we compute our own caps (`sha-1`,
    /// `sha-256` or `md5`).
    pub hash_algorithm: String,

    /// Features never assumed supported by entities with unknown caps.
    pub feature_blacklist: Vec<String>,
}

impl Default for CapsSettings {
    fn default() -> Self {
        Self {
            hash_algorithm: "sha-1".to_string(),
            feature_blacklist: DEFAULT_FEATURE_BLACKLIST
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    pub fn load_from(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from TOML text and validates it.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> EngineResult<()> {
        if self.process_interval_ms == 0 {
            return Err(EngineError::config("process_interval_ms must be positive"));
        }
        if self.relay_connect_timeout == 0 {
            return Err(EngineError::config("relay_connect_timeout must be positive"));
        }
        if HashAlgorithm::from_name(&self.caps.hash_algorithm).is_none() {
            return Err(EngineError::config(format!(
                "unknown caps hash algorithm: {}",
                self.caps.hash_algorithm
            )));
        }
        Ok(())
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_connect_timeout)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_management.negotiation_timeout)
    }

    /// Builder: set candidate relays.
    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the default relay.
    pub fn with_default_relay(mut self, relay: impl Into<String>) -> Self {
        self.default_relay = Some(relay.into());
        self
    }

    /// Builder: set the relay connect timeout.
    pub fn with_relay_connect_timeout(mut self, timeout: Duration) -> Self {
        self.relay_connect_timeout = timeout.as_secs().max(1);
        self
    }

    /// Builder: enable or disable relay probing.
    pub fn with_test_relays(mut self, test: bool) -> Self {
        self.test_relays = test;
        self
    }

    /// Builder: set the event loop period.
    pub fn with_process_interval(mut self, interval: Duration) -> Self {
        self.process_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Builder: set stream management resumption.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.stream_management.resume = resume;
        self
    }

    /// Builder: set the periodic ack request threshold.
    pub fn with_ack_every(mut self, every: usize) -> Self {
        self.stream_management.ack_every = every;
        self
    }

    /// Builder: set the caps hash algorithm.
    pub fn with_hash_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.caps.hash_algorithm = algorithm.into();
        self
    }
}
