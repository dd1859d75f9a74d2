//! fieldnode-uplink - store-and-forward telemetry uplink
//!
//! Runs on the sensor node next to the measurement loop and ships its
//! packets to the archive server.
//!
//! # Usage
//!
//! ```bash
//! # Packets from the measurement loop, one JSON object per line
//! ./logger | fieldnode-uplink --stdin
//!
//! # Bench test: synthetic packets, no network or server touched
//! fieldnode-uplink --dry-run --interval-secs 5
//!
//! # Validate and print the effective configuration
//! fieldnode-uplink --config /etc/fieldnode/uplink_config.toml --print-config
//! ```
//!
//! # Environment Variables
//!
//! - `FIELDNODE_CONFIG`: config file path (default: ./uplink_config.toml)
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fieldnode_uplink::config::UplinkConfig;
use fieldnode_uplink::connectivity::NmcliAdmin;
use fieldnode_uplink::context::UplinkContext;
use fieldnode_uplink::diagnostics::DiagnosticLog;
use fieldnode_uplink::dry_run;
use fieldnode_uplink::lockfile::ProcessLock;
use fieldnode_uplink::remote::{OpenSshConnector, RemoteTarget, RsyncSync, SshSettings};
use fieldnode_uplink::source::{JsonLinesSource, PacketEvent, PacketSource, SyntheticSource};
use fieldnode_uplink::system::SystemdReboot;
use fieldnode_uplink::types::SiteMetadata;
use fieldnode_uplink::uplink::{DispatcherExit, Uplink, UplinkParts};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fieldnode-uplink")]
#[command(about = "Store-and-forward telemetry uplink for field sensor nodes")]
#[command(version)]
struct CliArgs {
    /// Config file (overrides FIELDNODE_CONFIG and ./uplink_config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read packets from stdin (JSON, one per line). Required outside --dry-run
    #[arg(long)]
    stdin: bool,

    /// Fake network and server; nothing leaves the process
    #[arg(long)]
    dry_run: bool,

    /// Seconds between synthetic packets (--dry-run without --stdin)
    #[arg(long, default_value = "600")]
    interval_secs: u64,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &CliArgs) -> Result<UplinkConfig> {
    let config = match &args.config {
        Some(path) => UplinkConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => UplinkConfig::load(),
    };
    config.validate().context("Invalid uplink configuration")?;
    Ok(config)
}

/// Where packets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceMode {
    Stdin,
    Synthetic,
}

/// Synthetic packets are for bench tests; they must never reach the archive.
fn source_mode(args: &CliArgs) -> Result<SourceMode> {
    match (args.stdin, args.dry_run) {
        (true, _) => Ok(SourceMode::Stdin),
        (false, true) => Ok(SourceMode::Synthetic),
        (false, false) => anyhow::bail!("--stdin is required unless --dry-run is set"),
    }
}

fn production_parts(config: &UplinkConfig) -> UplinkParts {
    let settings = SshSettings::from_config(config);
    let target = RemoteTarget {
        host: config.server.host.clone(),
        user: config.server.user.clone(),
        port: config.server.port,
    };
    UplinkParts {
        admin: Arc::new(NmcliAdmin::new()),
        connector: Arc::new(OpenSshConnector::new(settings.clone())),
        bulk: Arc::new(RsyncSync::new(target, settings)),
        system: Arc::new(SystemdReboot),
    }
}

/// Feed packets from `source` into the uplink until EOF, cancellation, or
/// the dispatcher stopping.
async fn run_producer<S: PacketSource>(mut source: S, uplink: &Uplink, cancel: CancellationToken) -> Result<u64> {
    info!(source = source.source_name(), "Producer started");
    let mut count = 0u64;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = uplink.stopped() => {
                warn!(source = source.source_name(), "Dispatcher stopped, producer exiting");
                break;
            }
            event = source.next_packet() => event?,
        };
        match event {
            PacketEvent::Packet(packet) => {
                uplink.enqueue(packet);
                count += 1;
            }
            PacketEvent::Eof => {
                info!(source = source.source_name(), "Source exhausted");
                break;
            }
        }
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }
    let mode = source_mode(&args)?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  fieldnode-uplink {}", env!("CARGO_PKG_VERSION"));
    info!("  Node: {} | Server: {}@{}:{}", config.node.name, config.server.user, config.server.host, config.server.port);
    if args.dry_run {
        info!("  Mode: DRY RUN (no network, no server)");
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let _process_lock = ProcessLock::acquire(&config.paths.staging_dir).context("Failed to acquire process lock")?;

    let lock_timeout = config.timing.log_lock_timeout();
    let log = if args.dry_run {
        DiagnosticLog::console_only(lock_timeout)
    } else {
        match DiagnosticLog::open(&config.paths.diagnostic_log, lock_timeout).await {
            Ok(log) => log,
            Err(e) => {
                warn!(path = %config.paths.diagnostic_log.display(), error = %e, "Diagnostic log unavailable, console only");
                DiagnosticLog::console_only(lock_timeout)
            }
        }
    };
    let ctx = UplinkContext::new(config.node.name.as_str(), Arc::new(log));
    ctx.log().log("uplink starting").await;

    let parts = if args.dry_run { dry_run::parts() } else { production_parts(&config) };
    let uplink = Uplink::start(&config, ctx.clone(), parts);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, draining uplink queue...");
        shutdown.cancel();
    });

    let produced = if mode == SourceMode::Stdin {
        run_producer(JsonLinesSource::stdin(), &uplink, cancel.clone()).await
    } else {
        let site = SiteMetadata {
            site_name: config.node.name.clone(),
            ..Default::default()
        };
        let source = SyntheticSource::new(
            Duration::from_secs(args.interval_secs.max(1)),
            config.paths.local_highres_root.clone(),
            site,
        );
        run_producer(source, &uplink, cancel.clone()).await
    };
    match produced {
        Ok(n) => info!(packets = n, "Producer finished"),
        Err(e) => error!(error = %e, "Producer failed"),
    }

    // Drain, unless the dispatcher already stopped or a second Ctrl+C arrives
    if !uplink.is_finished() {
        tokio::select! {
            _ = uplink.request_shutdown_drain() => info!("Uplink queue drained"),
            _ = tokio::signal::ctrl_c() => uplink.abort(),
        }
    }

    let stats = uplink.stats();
    let exit = uplink.wait().await;
    let stats = stats.read().await.clone();
    info!(%stats, "Uplink statistics");
    ctx.log().log(&format!("uplink stopped ({:?}): {}", exit, stats)).await;

    match exit {
        DispatcherExit::Shutdown => {}
        DispatcherExit::RebootRequested => warn!("Stopped after requesting a reboot"),
        // Non-zero exit hands recovery to the service supervisor
        DispatcherExit::RebootFailed => anyhow::bail!("total outage limit exceeded and the reboot request failed"),
    }
    info!("✓ fieldnode-uplink shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("fieldnode-uplink").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_stdin_source_in_production() {
        assert_eq!(source_mode(&parse(&["--stdin"])).unwrap(), SourceMode::Stdin);
        assert_eq!(source_mode(&parse(&["--stdin", "--dry-run"])).unwrap(), SourceMode::Stdin);
    }

    #[test]
    fn test_synthetic_source_only_in_dry_run() {
        assert_eq!(source_mode(&parse(&["--dry-run"])).unwrap(), SourceMode::Synthetic);
        assert!(source_mode(&parse(&[])).is_err());
    }
}
