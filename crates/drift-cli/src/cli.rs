use std::path::PathBuf;

use clap::{Parser, Subcommand};
use drift_core::RandomKeySource;

/// Reconcile a web-app target's configuration
#[derive(Debug, Parser)]
#[command(name = "drift", version, about)]
pub(crate) struct Cli {
    /// Target configuration file
    #[arg(short, long, global = true, env = "DRIFT_CONFIG", default_value = "drift.toml")]
    pub(crate) config: PathBuf,

    /// Control-plane base URL, overrides the config file
    #[arg(long, global = true, env = "DRIFT_CONTROL_PLANE_URL")]
    pub(crate) control_plane_url: Option<String>,

    /// Print machine-readable output
    #[arg(long, global = true)]
    pub(crate) json: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub(crate) log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub(crate) log_json: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Command {
    /// Build and diff without changing the target
    Plan,
    /// Reconcile the target (exit 0 converged, 2 partial, 1 failed)
    Apply,
    /// Print the desired state with secrets redacted
    Render,
    /// Print a fresh random key
    GenKey {
        /// Key length in bytes (minimum 16)
        #[arg(long, default_value_t = RandomKeySource::DEFAULT_BYTES)]
        bytes: usize,
    },
}
