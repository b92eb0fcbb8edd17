//! Layered configuration: an optional file, then a `PUBTX`-prefixed
//! environment layer, deserialized into the typed [`Config`] below. Mirrors
//! the way configuration is loaded elsewhere in this codebase (`config`
//! crate builder, `humantime_serde` for durations).

use std::path::Path;
use std::time::Duration;

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use url::Url;

/// Loads configuration from an optional file plus the `PUBTX__`-prefixed
/// environment, the way every other entrypoint in this codebase does.
pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("PUBTX")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub fueling: FuelingConfig,
    #[serde(default)]
    pub transaction_cache: TransactionCacheConfig,
}

/// Options for the engine's pool manager (C5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pool size ceiling.
    pub max_in_flight_orchestrators: usize,
    /// Engine tick.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Orchestrator reap threshold when Stale.
    #[serde(with = "humantime_serde")]
    pub max_stale_time: Duration,
    /// Orchestrator reap threshold when Idle.
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    /// Fairness eviction threshold and pause duration.
    #[serde(with = "humantime_serde")]
    pub max_overload_process_time: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight_orchestrators: 50,
            interval: Duration::from_secs(5),
            max_stale_time: Duration::from_secs(60),
            max_idle_time: Duration::from_secs(10),
            max_overload_process_time: Duration::from_secs(600),
        }
    }
}

/// Options for a single orchestrator (C4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Broadcast attempts tolerated before a transaction goes Suspended.
    pub max_attempts: u32,
    /// Per-orchestrator bounded in-flight queue capacity.
    pub max_in_flight_queue: usize,
    /// Suspended nonces tolerated before the orchestrator itself pauses.
    pub suspended_gap_limit: u32,
    /// `k`-block confirmation threshold, chain-specific.
    pub confirmation_blocks: u64,
    /// Per-broadcast deadline, separate from the engine loop's deadline.
    #[serde(with = "humantime_serde")]
    pub broadcast_deadline: Duration,
    /// Gas oracle cache TTL.
    #[serde(with = "humantime_serde")]
    pub gas_price_ttl: Duration,
    /// Minimum percentage bump required to replace an underpriced pending
    /// broadcast.
    pub replacement_threshold_pct: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_in_flight_queue: 200,
            suspended_gap_limit: 1,
            confirmation_blocks: 3,
            broadcast_deadline: Duration::from_secs(30),
            gas_price_ttl: Duration::from_secs(5),
            replacement_threshold_pct: 10,
        }
    }
}

/// Exponential backoff applied to indefinitely-retried store operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default::max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub migrate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: Url,
    pub chain_id: u64,
    /// True for chains without EIP-1559 support.
    #[serde(default)]
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: std::net::SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::net::SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Bounds for the engine-wide completed-nonce cache (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionCacheConfig {
    /// LRU hot-swap capacity: signers tracked before the least-recently
    /// used entry is evicted.
    pub capacity: usize,
}

impl Default for TransactionCacheConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelingConfig {
    /// Address that fuels other signing addresses when their balance drops
    /// below `minimum_balance`.
    pub funding_address: Address,
    pub minimum_balance: String,
}

mod default {
    pub const fn max_connections() -> u32 {
        10
    }
}

/// Process-level CLI flags, layered on top of [`Config`].
#[derive(Debug, Clone, clap::Parser)]
pub struct Cli {
    /// Path to a configuration file; falls back to `PUBTX__*` env vars.
    #[clap(long, env)]
    pub config: Option<std::path::PathBuf>,

    /// `RUST_LOG`-style filter directive.
    #[clap(long, env, default_value = "pubtxmgr=info,tower_http=info")]
    pub log_filter: String,
}
