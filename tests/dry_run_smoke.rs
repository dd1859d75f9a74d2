//! Dry-run smoke test
//!
//! Drives the uplink with the bench capabilities used by `--dry-run` and a
//! synthetic packet source, end to end through the public API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fieldnode_uplink::config::UplinkConfig;
use fieldnode_uplink::context::UplinkContext;
use fieldnode_uplink::diagnostics::DiagnosticLog;
use fieldnode_uplink::dry_run;
use fieldnode_uplink::source::{PacketEvent, PacketSource, SyntheticSource};
use fieldnode_uplink::types::SiteMetadata;
use fieldnode_uplink::uplink::{DispatcherExit, Uplink};

#[tokio::test(start_paused = true)]
async fn dry_run_delivers_synthetic_packets() {
    let config = UplinkConfig::default();
    let ctx = UplinkContext::new(
        config.node.name.as_str(),
        Arc::new(DiagnosticLog::console_only(Duration::from_secs(10))),
    );
    let uplink = Uplink::start(&config, ctx, dry_run::parts());

    let mut source = SyntheticSource::new(
        Duration::from_secs(60),
        PathBuf::from("/nonexistent/highres"),
        SiteMetadata::default(),
    );
    for _ in 0..4 {
        match source.next_packet().await.unwrap() {
            PacketEvent::Packet(p) => uplink.enqueue(p),
            PacketEvent::Eof => unreachable!("synthetic source never ends"),
        }
    }

    tokio::time::timeout(Duration::from_secs(3_600), uplink.request_shutdown_drain())
        .await
        .expect("dry run should drain");

    let stats = uplink.stats();
    assert_eq!(uplink.wait().await, DispatcherExit::Shutdown);

    let stats = stats.read().await.clone();
    assert_eq!(stats.delivered, 4);
    assert_eq!(stats.requeued, 0);
    assert!(stats.last_delivery.is_some());
    // High-res file does not exist locally, so nothing was synced
    assert_eq!(stats.highres_syncs, 0);
}

#[tokio::test]
async fn diagnostic_log_file_receives_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("uplink.log");
    let log = DiagnosticLog::open(&path, Duration::from_secs(10)).await.unwrap();

    log.log("first").await;
    log.log("second").await;

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(" first"));
    assert!(lines[1].ends_with(" second"));
}
