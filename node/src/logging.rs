//! # Logging
//!
//! One `tracing` subscriber per process, writing to stderr. Stdout is kept
//! for what `init` and `version` print for the operator.
//!
//! Each role gets its own default filter. A device logs every HTTP request
//! it serves at debug level because its API is the operator's console; the
//! authority answers every device's sync and keeps request logs at info.
//! `RUST_LOG` replaces the role default entirely:
//!
//! ```text
//! RUST_LOG=tally_ledger::sync=debug,tally_node=info tally-node device
//! ```
//!
//! Ledger events carry `tx_id`, `device` and `sequence` fields, so the JSON
//! format can be filtered per transfer downstream.

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Which process is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Device,
    Authority,
    /// One-shot commands such as `init`.
    Setup,
}

impl NodeRole {
    pub fn default_filter(self) -> &'static str {
        match self {
            NodeRole::Device => "tally_node=info,tally_ledger=info,tower_http=debug",
            NodeRole::Authority => "tally_node=info,tally_ledger=info,tower_http=info",
            NodeRole::Setup => "tally_node=info",
        }
    }

    fn name(self) -> &'static str {
        match self {
            NodeRole::Device => "device",
            NodeRole::Authority => "authority",
            NodeRole::Setup => "setup",
        }
    }
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Colored lines with file and line number.
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Install the global subscriber for `role`. Call once, before anything
/// logs; a second call panics.
pub fn init_logging(role: NodeRole, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(role.default_filter()));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .init(),
    }

    tracing::debug!(role = role.name(), ?format, "logging ready");
}
