//! Shared tracing/logging initialization.
//!
//! Every `relaygate-admin` subcommand installs the same subscriber: an
//! env-filter (honouring `RUST_LOG`) plus either human-readable or JSON lines.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub const fn from_flag(log_json: bool) -> Self {
        if log_json { Self::Json } else { Self::Pretty }
    }
}

/// Resolve the filter directive: `RUST_LOG` wins, then the configured level
/// scoped to our crates, then `default_filter`.
pub fn filter_directive(default_filter: &str, log_level: Option<&str>) -> String {
    if let Ok(env) = std::env::var("RUST_LOG")
        && !env.trim().is_empty()
    {
        return env;
    }
    match log_level {
        Some(level) if !level.trim().is_empty() => {
            format!("relaygate_admin={level},relaygate_core={level}")
        }
        _ => default_filter.to_string(),
    }
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- filter used when neither `RUST_LOG` nor `log_level`
///   is set (e.g. `"relaygate_admin=info"`).
/// * `log_level` -- level from the config file, applied to our own crates.
/// * `format` -- human-readable or structured JSON lines.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, log_level: Option<&str>, format: LogFormat) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter_directive(
        default_filter,
        log_level,
    ))
    .map_err(|e| Error::Config(format!("Invalid log filter: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| Error::Config(format!("Tracing already initialised: {e}")))
}
