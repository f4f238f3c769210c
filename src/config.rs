//! Server configuration, from the command line or `FERROKV_*` variables.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Default listen address, the standard Redis port on loopback
pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";

/// Default interval between active expiry sweeps
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Parser)]
#[command(name = "ferrokv", version, about = "In-memory RESP key-value server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "FERROKV_BIND", default_value = DEFAULT_ADDR)]
    pub bind: SocketAddr,

    /// Event-loop threads; defaults to the number of CPUs
    #[arg(long, env = "FERROKV_WORKERS")]
    pub workers: Option<usize>,

    /// Milliseconds between expiry sweeps, 0 disables the sweeper
    #[arg(long, env = "FERROKV_SWEEP_INTERVAL_MS", default_value_t = DEFAULT_SWEEP_INTERVAL_MS)]
    pub sweep_interval_ms: u64,
}

impl Config {
    /// Number of event-loop threads to run
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().map(|n| n.get()).ok())
            .unwrap_or(4)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.sweep_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 6379)),
            workers: None,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}
