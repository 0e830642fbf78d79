//! Runtime tunables, read once from the environment.

use std::env;
use std::sync::Arc;

use tracing::warn;

/// How the progress engine is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// A dedicated progress thread polls transmit and receive contexts.
    Auto,
    /// The caller drives `progress_tx_ctx` / `progress_rx_ctx` directly.
    Manual,
}

impl ProgressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressMode::Auto => "auto",
            ProgressMode::Manual => "manual",
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProgressMode::Auto),
            "manual" => Ok(ProgressMode::Manual),
            _ => Err(()),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub progress_mode: ProgressMode,
    /// Progress-thread cpu set, `a[-b[:stride]][,...]` (see `affinity`).
    pub pe_affinity: Option<String>,
    /// Minimum interval between sleeps of the progress thread.
    pub pe_waittime_ms: u64,
    /// Maximum transport ops outstanding per entry per state-machine tick.
    pub max_io_ops: u32,
    /// Byte budget per state-machine tick.
    pub max_io_bytes: u64,
    /// Largest unexpected message fetched into a provider buffer.
    pub max_eager_sz: u64,
    /// Multi-receive watermark: below this the posted buffer is retired.
    pub min_multi_recv: u64,
    /// Aggregate cap on provider-buffered unexpected data per RX context.
    pub total_buffered_recv: u64,
    /// TX engine entry count (power of two).
    pub tx_depth: u16,
    /// Incoming descriptor ring entries per connection (power of two).
    pub rx_ring_entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            progress_mode: ProgressMode::Auto,
            pe_affinity: None,
            pe_waittime_ms: 10,
            max_io_ops: 8,
            max_io_bytes: 1 << 20,
            max_eager_sz: 16 * 1024,
            min_multi_recv: 64,
            total_buffered_recv: 1 << 20,
            tx_depth: 64,
            rx_ring_entries: 64,
        }
    }
}

impl Config {
    /// Build a config from `BRAID_*` environment variables, falling back to
    /// defaults (with a warning) on anything unparsable.
    pub fn from_env() -> Arc<Config> {
        let d = Config::default();
        let cfg = Config {
            progress_mode: env_parse("BRAID_PROGRESS_MODE", d.progress_mode),
            pe_affinity: env::var("BRAID_PE_AFFINITY").ok(),
            pe_waittime_ms: env_parse("BRAID_PE_WAITTIME", d.pe_waittime_ms),
            max_io_ops: env_parse("BRAID_EP_MAX_IO_OPS", d.max_io_ops).max(1),
            max_io_bytes: env_parse("BRAID_EP_MAX_IO_BYTES", d.max_io_bytes).max(1),
            max_eager_sz: env_parse("BRAID_MAX_EAGER_SZ", d.max_eager_sz),
            min_multi_recv: env_parse("BRAID_MIN_MULTI_RECV", d.min_multi_recv),
            total_buffered_recv: env_parse("BRAID_TOTAL_BUFFERED_RECV", d.total_buffered_recv),
            tx_depth: env_parse("BRAID_TX_DEPTH", d.tx_depth).next_power_of_two(),
            rx_ring_entries: env_parse("BRAID_RX_RING_ENTRIES", d.rx_ring_entries)
                .next_power_of_two(),
        };
        Arc::new(cfg)
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(var = name, value = %v, "Unparsable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
