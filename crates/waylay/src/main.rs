//! Waylay: an intercepting HTTP/HTTPS MITM proxy driven by hot-reloadable
//! Rhai rules.
//!
//! ```bash
//! waylay                          # bind 127.0.0.1:8080, rules/ in cwd
//! waylay --config /etc/waylay/config.yaml
//! waylay --create-cert            # bootstrap the root CA and exit
//! ```

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use waylay::cli::Cli;
use waylay::config::Config;
use waylay::proxy::ProxyServer;
use waylay::stats::StatsSink;
use waylay::{cert, cli, rules, stats};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("failed to install default rustls crypto provider: {e:?}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(&cli::Overrides::from(&cli));

    init_tracing(config.proxy.log_level);

    if cli.create_cert {
        return match cert::CertStore::bootstrap(&config.proxy.ca_cert_dir) {
            Ok(_) => {
                tracing::info!(
                    path = %cert::CertStore::root_cert_path(&config.proxy.ca_cert_dir).display(),
                    "root CA ready"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bootstrap root CA");
                ExitCode::FAILURE
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

/// `proxy.logLevel` (0=errors, 1=basic, 2=debug) picks the default filter;
/// `RUST_LOG` always wins if set, matching this codebase's existing
/// env-override-first convention.
fn init_tracing(log_level: u8) {
    let default_filter = match log_level {
        0 => "warn",
        2 => "debug",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cert_store = Arc::new(
        cert::CertStore::bootstrap(&config.proxy.ca_cert_dir)
            .map_err(|e| anyhow::anyhow!("failed to bootstrap root CA: {e}"))?,
    );

    std::fs::create_dir_all(&config.rules_dir)
        .map_err(|e| anyhow::anyhow!("failed to create rules directory {}: {e}", config.rules_dir.display()))?;
    let rule_store = rules::open(&config.rules_dir)?;

    let stats = StatsSink::new(config.proxy.log_level);
    let _snapshot_task = stats::spawn_periodic_snapshot(stats.clone(), config.proxy.stats_interval_minutes);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(wait_for_signal(shutdown_tx));

    let server = ProxyServer::new(config, cert_store, rule_store, stats);
    server.run(shutdown_rx).await
}

#[cfg(unix)]
async fn wait_for_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
    let _ = shutdown_tx.send(true);
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received ctrl-c");
        let _ = shutdown_tx.send(true);
    }
}
