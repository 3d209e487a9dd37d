//! Structured logging for clawlink.
//!
//! Logs go to stderr so command output on stdout stays clean.
//!
//! ## Environment Variables
//!
//! - `CLAWLINK_LOG` or `RUST_LOG`: filter directives (e.g. `clawlink=debug,warn`)
//! - `CLAWLINK_LOG_FORMAT`: `pretty`, `compact` (default) or `json`
//!
//! ```bash
//! # Frame-level traffic from the gateway client
//! CLAWLINK_LOG=clawlink::gateway=debug clawlink status
//! ```

use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

pub const DEFAULT_FILTER: &str = "clawlink=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Pretty,
    /// Single line per event.
    #[default]
    Compact,
    /// One JSON object per event, for log aggregation.
    Json,
}

impl LogFormat {
    /// Case-insensitive; unknown names fall back to the default.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    pub format: LogFormat,
    /// Include file and line.
    pub with_file: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            with_file: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup("CLAWLINK_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .filter(|filter| !filter.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = lookup("CLAWLINK_LOG_FORMAT")
            .map(|name| LogFormat::parse(&name))
            .unwrap_or_default();
        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// Raise the crate's level for `-v` (debug) and `-vv` (trace).
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.filter = "clawlink=debug,info".to_string(),
            _ => {
                self.filter = "clawlink=trace,debug".to_string();
                self.with_file = true;
            }
        }
        self
    }

    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init(config: LogConfig) -> bool {
    let filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);
    let layer = match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    };

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(filter).with(layer))
        .is_ok()
}
