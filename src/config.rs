//! Configuration parsing for the tether driver.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Defaults matching a small demonstration run

use clap::Parser;

use crate::error::Result;
use crate::window::WindowConfig;

/// Tether: run jobs through a sliding submission window.
#[derive(Parser, Debug, Clone)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Total number of jobs to run
    #[arg(short = 'n', long, env = "TETHER_JOBS", default_value_t = 10)]
    pub jobs: u64,

    /// Maximum number of jobs outstanding at once
    #[arg(short, long, env = "TETHER_FANOUT", default_value_t = 2)]
    pub fanout: usize,

    /// Command each job runs
    #[arg(short, long, env = "TETHER_COMMAND", default_value = "/bin/true")]
    pub command: String,

    /// Simulated run time of each job in milliseconds
    #[arg(long, env = "TETHER_DURATION_MS", default_value_t = 50)]
    pub duration_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TETHER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validated window parameters.
    pub fn window(&self) -> Result<WindowConfig> {
        WindowConfig::new(self.jobs, self.fanout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: 10,
            fanout: 2,
            command: "/bin/true".into(),
            duration_ms: 50,
            log_level: "info".into(),
            otel_endpoint: None,
        }
    }
}
