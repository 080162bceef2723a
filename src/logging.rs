//! Log levels, worker log categories and forwarding of worker output
//!
//! The orchestrator logs through `tracing`. Workers keep their own log files;
//! which categories they write is described by [`LogCategories`] and handed
//! to them on the command line.

use crate::config::LoggingConfig;
use serde::Deserialize;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::fmt::time::{ChronoLocal, SystemTime, Uptime};
use tracing_subscriber::EnvFilter;

/// Severity used for orchestrator console output and forwarded worker output
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    /// Disables the output this level is attached to
    Off,
}

impl LogLevel {
    /// The `tracing` filter level this maps to
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Verbose => "debug",
            LogLevel::Debug => "trace",
            LogLevel::Off => "off",
        }
    }
}

/// Timestamp style for console logging
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogTimeFormat {
    /// RFC 3339 in UTC
    #[default]
    Iso,
    /// RFC 3339 in the local time zone
    Local,
    /// Seconds since startup
    Delta,
}

/// A single named worker log category as written in the config file
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    None,
    Error,
    Warn,
    Info,
    Debug,
    All,
}

/// Set of worker log categories.
///
/// Combine with `|`. The raw bits are what the worker receives.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "Vec<LogCategory>")]
pub struct LogCategories(u8);

impl LogCategories {
    pub const NONE: Self = Self(0);
    pub const ERROR: Self = Self(1);
    pub const WARN: Self = Self(1 << 1);
    pub const INFO: Self = Self(1 << 2);
    pub const DEBUG: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl From<LogCategory> for LogCategories {
    fn from(category: LogCategory) -> Self {
        match category {
            LogCategory::None => Self::NONE,
            LogCategory::Error => Self::ERROR,
            LogCategory::Warn => Self::WARN,
            LogCategory::Info => Self::INFO,
            LogCategory::Debug => Self::DEBUG,
            LogCategory::All => Self::ALL,
        }
    }
}

impl From<Vec<LogCategory>> for LogCategories {
    fn from(categories: Vec<LogCategory>) -> Self {
        categories
            .into_iter()
            .fold(Self::NONE, |acc, c| acc | Self::from(c))
    }
}

impl BitOr for LogCategories {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LogCategories {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LogCategories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [
            (Self::ERROR, "error"),
            (Self::WARN, "warn"),
            (Self::INFO, "info"),
            (Self::DEBUG, "debug"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Install the global `tracing` subscriber for the orchestrator.
///
/// `RUST_LOG` is honoured; the configured console level is added for this
/// crate on top of it.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let directive = format!("scspawn={}", config.console_level.as_filter_directive());
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.console_time_format {
        LogTimeFormat::Iso => builder.with_timer(SystemTime).try_init(),
        LogTimeFormat::Local => builder.with_timer(ChronoLocal::rfc_3339()).try_init(),
        LogTimeFormat::Delta => builder.with_timer(Uptime::default()).try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Forward each line of a worker output stream to the log at `level`
pub fn forward_lines<R>(reader: R, level: LogLevel, slot_id: String, source: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => emit(level, &slot_id, &source, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!(slot_id, source, error = %e, "Worker output stream closed with error");
                    break;
                }
            }
        }
    })
}

fn emit(level: LogLevel, slot_id: &str, source: &str, line: &str) {
    match level {
        LogLevel::Error => error!(slot_id, source, "{}", line),
        LogLevel::Warn => warn!(slot_id, source, "{}", line),
        LogLevel::Info => info!(slot_id, source, "{}", line),
        LogLevel::Verbose => debug!(slot_id, source, "{}", line),
        LogLevel::Debug => trace!(slot_id, source, "{}", line),
        LogLevel::Off => {}
    }
}
