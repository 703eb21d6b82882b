//! Node configuration.
//!
//! Every tunable of the DHT lives in [`DhtConfig`]. Durations are stored as
//! milliseconds so the struct maps one-to-one onto its JSON form; accessors
//! hand out [`Duration`]s.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ID_BITS;
use crate::error::ConfigError;

/// Default bucket capacity and lookup result size.
pub const DEFAULT_K: usize = 20;

/// Default number of peers queried concurrently per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// Default replica lifetime (10 minutes).
pub const DEFAULT_REPLICA_TTL_MS: u64 = 10 * 60 * 1000;

/// Default period of the republish/garbage-collect task (10 seconds).
pub const DEFAULT_REPUBLISH_INTERVAL_MS: u64 = 10 * 1000;

/// Default client-side timeout for a single RPC.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 2_000;

/// Hard cap on the number of rounds an iterative lookup may run.
pub const DEFAULT_MAX_LOOKUP_ROUNDS: usize = 20;

/// Tunables of a DHT node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Width of the identifier space in bits (`1..=160`).
    pub id_bits: usize,
    /// Bucket capacity; also the number of results a lookup returns.
    pub k: usize,
    /// Lookup fan-out per round.
    pub alpha: usize,
    /// Lifetime of replica entries in milliseconds.
    pub replica_ttl_ms: u64,
    /// Period of the republish/garbage-collect task in milliseconds.
    pub republish_interval_ms: u64,
    /// Client-side RPC timeout in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Maximum number of rounds per iterative lookup.
    pub max_lookup_rounds: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            id_bits: ID_BITS,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            replica_ttl_ms: DEFAULT_REPLICA_TTL_MS,
            republish_interval_ms: DEFAULT_REPUBLISH_INTERVAL_MS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            max_lookup_rounds: DEFAULT_MAX_LOOKUP_ROUNDS,
        }
    }
}

impl DhtConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: DhtConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Replica lifetime as a [`Duration`].
    pub fn replica_ttl(&self) -> Duration {
        Duration::from_millis(self.replica_ttl_ms)
    }

    /// Republish period as a [`Duration`].
    pub fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms)
    }

    /// RPC timeout as a [`Duration`].
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_bits == 0 || self.id_bits > ID_BITS {
            return Err(ConfigError::IdBits(self.id_bits));
        }
        let counts = [
            ("k", self.k),
            ("alpha", self.alpha),
            ("max_lookup_rounds", self.max_lookup_rounds),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        let durations = [
            ("replica_ttl_ms", self.replica_ttl_ms),
            ("republish_interval_ms", self.republish_interval_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    /// Raise zero counts and durations to 1 and clamp `id_bits` into
    /// `1..=160`, so the result always passes [`validate`](Self::validate).
    pub fn clamped(mut self) -> Self {
        self.id_bits = self.id_bits.clamp(1, ID_BITS);
        for count in [&mut self.k, &mut self.alpha, &mut self.max_lookup_rounds] {
            *count = (*count).max(1);
        }
        for millis in [
            &mut self.replica_ttl_ms,
            &mut self.republish_interval_ms,
            &mut self.rpc_timeout_ms,
        ] {
            *millis = (*millis).max(1);
        }
        self
    }
}
