//! Shared `tracing-subscriber` setup for both binaries (§4.9).

use tracing_subscriber::EnvFilter;

/// Text or JSON log rendering, selected by `--log-format`.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text, the default.
    #[default]
    Text,
    /// Newline-delimited JSON, for log aggregation.
    Json,
}

/// Installs the global subscriber. `verbose` bumps the default level past
/// whatever `QMPBACKUP_LOG` requests, one step per occurrence.
pub fn init(verbose: u8, format: LogFormat) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("QMPBACKUP_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
