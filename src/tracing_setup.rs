//! Subscriber installation for the bench binary.
//!
//! `RUST_LOG` wins over the configured level. Installing twice is not an
//! error, so tests and embedding applications can call [`init`] freely.
//!
//! ```no_run
//! use spectral_cal::{config::BenchConfig, tracing_setup};
//!
//! let config = BenchConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!(bench = %config.application.name, "started");
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::config::BenchConfig;
use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line with colors
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => bail!("Invalid log format '{}'. Must be one of: pretty, compact, json", other),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Log span open/close (state actions are spans)
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Options taken from `[application]`.
    pub fn from_bench_config(config: &BenchConfig) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install a subscriber configured from `[application]`.
pub fn init_from_config(config: &BenchConfig) -> Result<()> {
    init(TracingConfig::from_bench_config(config)?)
}

/// Install a global subscriber. A no-op if one is already installed.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    tolerate_existing(tracing_subscriber::registry().with(layer).try_init())
}

fn tolerate_existing(result: Result<(), TryInitError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(anyhow!("Failed to initialize tracing: {}", e)),
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => bail!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ),
    }
}
