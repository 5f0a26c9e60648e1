//! Dwell - attention synopsis engine
//!
//! A long-running engine that:
//! - Attributes dwell time to visited publishers (sites)
//! - Normalizes attention scores into an exact-100 percentage distribution
//! - Periodically synchronizes and reconciles with a remote ledger client
//!
//! The engine is driven entirely by events: callers send `visit(location)`
//! notifications and read status snapshots; timers and I/O completions
//! re-enter the same event loop.

pub mod engine;
pub mod remote;
pub mod scheduler;
pub mod status;
pub mod synopsis;
pub mod tracker;
pub mod writer;

pub use engine::{Engine, EngineHandle};
pub use remote::{
    BytesFetcher, ClientFactory, ClientState, DomainResolver, HttpFetcher, LedgerClient, LogEntry,
    MockLedgerClient, PublisherResolver, SyncResponse,
};
pub use status::StatusSnapshot;
pub use synopsis::{NormalizedEntry, PublisherRecord, Synopsis, TopPublisher};
pub use writer::{DurableWriter, WriteMode};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of publishers considered for payout selection by default.
const DEFAULT_TOP_PUBLISHERS: usize = 25;

/// How often the payment notice flag is re-raised once payment info exists.
const DEFAULT_PAYMENT_NOTICE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding all persisted engine state
    pub data_dir: PathBuf,

    /// How many publishers the normalized view and reconciliation consider
    pub top_publishers: usize,

    /// Period of the recurring payment notice timer
    pub payment_notice_interval: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            top_publishers: DEFAULT_TOP_PUBLISHERS,
            payment_notice_interval: DEFAULT_PAYMENT_NOTICE_INTERVAL,
        }
    }

    /// Merge settings from a TOML config file over the defaults.
    pub fn from_toml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: ConfigFile =
            toml::from_str(&text).map_err(|e| DwellError::Config(e.to_string()))?;
        let data_dir = file
            .data_dir
            .ok_or_else(|| DwellError::Config("data_dir missing from config file".to_string()))?;
        let mut config = Self::new(data_dir);
        if let Some(n) = file.top_publishers {
            config.top_publishers = n;
        }
        Ok(config)
    }

    pub fn with_top_publishers(mut self, n: usize) -> Self {
        self.top_publishers = n;
        self
    }

    pub fn with_payment_notice_interval(mut self, interval: Duration) -> Self {
        self.payment_notice_interval = interval;
        self
    }

    /// Latest remote client state, fully overwritten on every sync result.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// Legacy bootstrap file, read-only fallback when no state file exists.
    pub fn alpha_path(&self) -> PathBuf {
        self.data_dir.join("alpha.json")
    }

    /// Append-only sync log; retained content is bounded to a 7-day window.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("sync-log.json")
    }

    /// Publisher attention snapshot, fully overwritten after each mutation.
    pub fn synopsis_path(&self) -> PathBuf {
        self.data_dir.join("synopsis.json")
    }

    /// Publisher-to-locations debug index, fully overwritten.
    pub fn publishers_path(&self) -> PathBuf {
        self.data_dir.join("publishers.json")
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    top_publishers: Option<usize>,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, DwellError>;

/// Errors that can occur in the engine
#[derive(Debug, thiserror::Error)]
pub enum DwellError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("publisher resolution error: {0}")]
    Resolve(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("ledger client error: {0}")]
    Remote(String),

    #[error("engine unavailable: {0}")]
    Engine(String),
}
