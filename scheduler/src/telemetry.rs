//! Utilities for reporting what a simulation is doing.

use crate::Error;
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter, Registry};

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines.
    Plain,
    /// One JSON object per line.
    Json,
}

/// Parse a log level name (`trace`, `debug`, `info`, `warn`, `error`).
pub fn parse_level(level: &str) -> Result<Level, Error> {
    level
        .parse::<Level>()
        .map_err(|_| Error::InvalidLevel(level.to_string()))
}

/// Install a global subscriber that emits events at `level` and above.
///
/// `RUST_LOG` directives, when present, are layered on top of `level`.
pub fn init(level: Level, format: Format) -> Result<(), Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    match format {
        Format::Plain => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true);
            let subscriber = Registry::default().with(filter).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|err| Error::Subscriber(err.to_string()))
        }
        Format::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_file(true);
            let subscriber = Registry::default().with(filter).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|err| Error::Subscriber(err.to_string()))
        }
    }
}
