//! Command-line surface.
//!
//! Only the flags named in the external-interfaces contract are recognized;
//! everything else about invocation (shell completion, subcommand trees,
//! discovery of multiple config formats beyond the documented order) is left
//! to callers that wrap this binary.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "waylay", about = "Intercepting HTTP/HTTPS MITM proxy")]
pub struct Cli {
    /// Path to a YAML or JSON config file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Bootstrap the root CA under `proxy.caCertDir` and exit.
    #[arg(long)]
    pub create_cert: bool,

    /// Override the rules directory.
    #[arg(long, value_name = "PATH")]
    pub rules: Option<PathBuf>,

    /// Override the log level (0=errors, 1=basic, 2=debug).
    #[arg(long, value_name = "LEVEL")]
    pub log: Option<u8>,

    /// Enable the structured event stream for an external UI.
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub ui: Option<bool>,

    /// Enable verbose rule-loader diagnostics.
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub debug: Option<bool>,
}

/// The subset of `Cli` that overrides file-based configuration; kept as a
/// separate struct so `Config::apply_overrides` doesn't depend on `clap`.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub rules_dir: Option<PathBuf>,
    pub log_level: Option<u8>,
    pub ui: Option<bool>,
    pub debug: Option<bool>,
}

impl From<&Cli> for Overrides {
    fn from(cli: &Cli) -> Self {
        Self {
            rules_dir: cli.rules.clone(),
            log_level: cli.log,
            ui: cli.ui,
            debug: cli.debug,
        }
    }
}
