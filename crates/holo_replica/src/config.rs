//! Runtime configuration for replicated services.

use std::time::Duration;

use anyhow::{Context, Result};

/// Default consumer wait for the next state chunk.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(15_000);
/// Default chunk size used when streaming per-key state.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 16;
/// Default bound on the initial-state fetch performed while joining.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Tunables shared by the transfer and routing layers.
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// How long a state loader waits for the next chunk before the transfer fails.
    pub receive_timeout: Duration,
    /// Maximum payload of one chunk message.
    pub chunk_size: usize,
    /// Upper bound for fetching the whole-object state while joining.
    pub join_timeout: Duration,
    /// Whether a joining member pulls the whole-object state from a peer.
    pub requires_initial_state: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            requires_initial_state: true,
        }
    }
}

impl ReplicationConfig {
    /// Builds configuration from `HOLO_REPLICA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let receive_timeout_ms = parse_u64(
            std::env::var("HOLO_REPLICA_RECEIVE_TIMEOUT_MS").ok(),
            DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64,
        )?;
        let chunk_size = parse_usize(
            std::env::var("HOLO_REPLICA_CHUNK_SIZE_BYTES").ok(),
            DEFAULT_CHUNK_SIZE,
        )?
        .max(1);
        let join_timeout_ms = parse_u64(
            std::env::var("HOLO_REPLICA_JOIN_TIMEOUT_MS").ok(),
            DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
        )?;
        let requires_initial_state = parse_bool(
            std::env::var("HOLO_REPLICA_REQUIRE_INITIAL_STATE").ok(),
            true,
        )?;

        Ok(Self {
            receive_timeout: Duration::from_millis(receive_timeout_ms),
            chunk_size,
            join_timeout: Duration::from_millis(join_timeout_ms),
            requires_initial_state,
        })
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => raw
            .parse::<bool>()
            .with_context(|| format!("invalid bool value: {raw}")),
        None => Ok(default_value),
    }
}
