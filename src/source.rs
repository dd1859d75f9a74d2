//! Packet sources feeding the uplink from outside the process.
//!
//! The measurement loop is a separate program. It either pipes
//! newline-delimited JSON packets into the uplink (`--stdin`), or, on a
//! bench node, the uplink generates synthetic packets on a fixed cadence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::types::{DeliveryPacket, LowResSample, SiteMetadata};

/// Events produced by a packet source.
#[derive(Debug)]
pub enum PacketEvent {
    Packet(DeliveryPacket),
    /// No more packets will come
    Eof,
}

#[async_trait]
pub trait PacketSource: Send + 'static {
    async fn next_packet(&mut self) -> Result<PacketEvent>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

// ============================================================================
// JSON lines (stdin)
// ============================================================================

/// Reads one JSON `DeliveryPacket` per line. Malformed lines are skipped.
pub struct JsonLinesSource<R> {
    reader: R,
    line_buffer: String,
    name: &'static str,
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl<R: AsyncBufRead + Unpin + Send + 'static> JsonLinesSource<R> {
    pub fn new(reader: R, name: &'static str) -> Self {
        Self {
            reader,
            line_buffer: String::with_capacity(4096),
            name,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send + 'static> PacketSource for JsonLinesSource<R> {
    async fn next_packet(&mut self) -> Result<PacketEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(PacketEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<DeliveryPacket>(line) {
                Ok(packet) => return Ok(PacketEvent::Packet(packet)),
                Err(e) => warn!(source = self.name, error = %e, "Skipping malformed packet line"),
            }
        }
    }

    fn source_name(&self) -> &str {
        self.name
    }
}

// ============================================================================
// Synthetic (bench testing)
// ============================================================================

/// Emits one packet per window with a flat synthetic batch.
pub struct SyntheticSource {
    interval: Duration,
    samples_per_packet: usize,
    high_res_dir: PathBuf,
    site: SiteMetadata,
    emitted: u64,
}

impl SyntheticSource {
    pub fn new(interval: Duration, high_res_dir: PathBuf, site: SiteMetadata) -> Self {
        Self {
            interval,
            samples_per_packet: 10,
            high_res_dir,
            site,
            emitted: 0,
        }
    }

    fn build(&self) -> DeliveryPacket {
        let now = Local::now();
        let base = now.timestamp() - self.samples_per_packet as i64 * 60;
        let low_res_batch = (0..self.samples_per_packet)
            .map(|i| LowResSample {
                timestamp: base + i as i64 * 60,
                co2_ppm: 415.0 + i as f64 * 0.5,
                pressure_hpa: 1013.2,
                temperature_c: 18.5,
                relative_humidity: 62.0,
                ir: 1200.0,
                aux_status: 0,
            })
            .collect();

        DeliveryPacket {
            created_at: now,
            local_high_res_path: self.high_res_dir.clone(),
            local_high_res_filename: format!("{}.csv", now.format("%Y-%m-%d")),
            file_day: now.date_naive(),
            low_res_batch,
            site: self.site.clone(),
        }
    }
}

#[async_trait]
impl PacketSource for SyntheticSource {
    async fn next_packet(&mut self) -> Result<PacketEvent> {
        if self.emitted > 0 {
            tokio::time::sleep(self.interval).await;
        }
        self.emitted += 1;
        Ok(PacketEvent::Packet(self.build()))
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_lines_skips_garbage() {
        let good = r#"{"created_at":"2024-05-17T10:30:00+02:00","local_high_res_path":"/data/hr","local_high_res_filename":"2024-05-17.csv","file_day":"2024-05-17","site":{"site_name":"ridge","serial_id":"SN1","latitude":46.5,"longitude":7.9}}"#;
        let input = format!("not json\n\n{}\n", good);
        let mut source = JsonLinesSource::new(BufReader::new(std::io::Cursor::new(input.into_bytes())), "test");

        match source.next_packet().await.unwrap() {
            PacketEvent::Packet(p) => {
                assert_eq!(p.site.site_name, "ridge");
                assert!(p.low_res_batch.is_empty());
                assert_eq!(p.file_day.to_string(), "2024-05-17");
            }
            PacketEvent::Eof => panic!("expected a packet"),
        }
        assert!(matches!(source.next_packet().await.unwrap(), PacketEvent::Eof));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_source_paces_packets() {
        let mut source = SyntheticSource::new(
            Duration::from_secs(600),
            PathBuf::from("/data/hr"),
            SiteMetadata::default(),
        );
        let start = tokio::time::Instant::now();

        source.next_packet().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        match source.next_packet().await.unwrap() {
            PacketEvent::Packet(p) => assert_eq!(p.low_res_batch.len(), 10),
            PacketEvent::Eof => panic!("synthetic source never ends"),
        }
        assert!(start.elapsed() >= Duration::from_secs(600));
    }
}
