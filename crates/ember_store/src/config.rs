//! Runtime configuration for a master, with environment overrides.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunables for one master process. Every field has a default; `from_env`
/// lets deployments override them without a config file.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Capacity of one log segment in bytes.
    pub segment_size: usize,
    /// Upper bound on committed segments before appends report RETRY.
    pub max_segments: usize,
    /// Stripe counts for the hash index buckets and per-key write locks.
    pub hash_index_stripes: usize,
    pub key_lock_stripes: usize,
    /// Concurrent backup fetches during crash recovery.
    pub recovery_fetch_fanout: usize,
    /// Deadline for the migration phase-2 write drain.
    pub migration_drain_deadline: Duration,
    /// How often the expired-lease cleaner runs.
    pub lease_cleaner_interval: Duration,
    /// Soft cap on bytes returned by bulk reads (read_hashes, enumerate).
    pub max_response_bytes: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            segment_size: 1 << 20,
            max_segments: 1024,
            hash_index_stripes: 64,
            key_lock_stripes: 256,
            recovery_fetch_fanout: 4,
            migration_drain_deadline: Duration::from_secs(30),
            lease_cleaner_interval: Duration::from_secs(1),
            max_response_bytes: 8 << 20,
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            segment_size: read_env_usize("EMBER_SEGMENT_SIZE", defaults.segment_size),
            max_segments: read_env_usize("EMBER_MAX_SEGMENTS", defaults.max_segments),
            hash_index_stripes: read_env_usize("EMBER_HASH_INDEX_STRIPES", defaults.hash_index_stripes),
            key_lock_stripes: read_env_usize("EMBER_KEY_LOCK_STRIPES", defaults.key_lock_stripes),
            recovery_fetch_fanout: read_env_usize(
                "EMBER_RECOVERY_FETCH_FANOUT",
                defaults.recovery_fetch_fanout,
            )
            .max(1),
            migration_drain_deadline: Duration::from_millis(read_env_u64(
                "EMBER_MIGRATION_DRAIN_DEADLINE_MS",
                defaults.migration_drain_deadline.as_millis() as u64,
            )),
            lease_cleaner_interval: Duration::from_millis(read_env_u64(
                "EMBER_LEASE_CLEANER_INTERVAL_MS",
                defaults.lease_cleaner_interval.as_millis() as u64,
            )),
            max_response_bytes: read_env_usize("EMBER_MAX_RESPONSE_BYTES", defaults.max_response_bytes),
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}
