//! Delivery packet types

use chrono::{DateTime, Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One aggregated low-resolution sample (typically a 1-minute mean).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LowResSample {
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    /// CO2 concentration (ppm)
    pub co2_ppm: f64,
    /// Barometric pressure (hPa)
    pub pressure_hpa: f64,
    /// Air temperature (°C)
    pub temperature_c: f64,
    /// Relative humidity (%)
    pub relative_humidity: f64,
    /// IR channel, raw sensor counts
    pub ir: f64,
    /// Auxiliary status bits reported by the sensor
    #[serde(default)]
    pub aux_status: u8,
}

/// Location and identity captured when the packet is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadata {
    pub site_name: String,
    pub serial_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Unit of work placed on the uplink queue.
///
/// Immutable once enqueued. The dispatcher only ever moves it back onto the
/// queue unchanged after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPacket {
    /// Local wall-clock time the batch was closed; names the low-res object
    pub created_at: DateTime<Local>,
    /// Directory holding the day's raw CSV file
    pub local_high_res_path: PathBuf,
    pub local_high_res_filename: String,
    /// Calendar day the high-res file belongs to
    pub file_day: NaiveDate,
    #[serde(default)]
    pub low_res_batch: Vec<LowResSample>,
    pub site: SiteMetadata,
}

impl DeliveryPacket {
    /// Full local path of the day's high-res file.
    pub fn high_res_file(&self) -> PathBuf {
        self.local_high_res_path.join(&self.local_high_res_filename)
    }

    /// Minute-resolution stamp used in logs and object names (`YYYYMMDDHHMM`).
    pub fn minute_stamp(&self) -> String {
        self.created_at.format("%Y%m%d%H%M").to_string()
    }

    /// Remote directory holding this packet's low-res object.
    pub fn lowres_dir(&self, root: &str, node: &str) -> String {
        format!(
            "{}/{}/{:04}/{:02}/{:02}",
            root.trim_end_matches('/'),
            node,
            self.file_day.year(),
            self.file_day.month(),
            self.file_day.day()
        )
    }

    /// Remote object path of this packet's compressed low-res payload.
    pub fn lowres_object_path(&self, root: &str, node: &str) -> String {
        format!(
            "{}/{}_{}.bin.zst",
            self.lowres_dir(root, node),
            node,
            self.minute_stamp()
        )
    }
}

/// Remote high-res directory for the month containing `day`.
pub fn highres_month_dir(root: &str, node: &str, day: NaiveDate) -> String {
    format!(
        "{}/{}/{:04}/{:02}",
        root.trim_end_matches('/'),
        node,
        day.year(),
        day.month()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn packet() -> DeliveryPacket {
        DeliveryPacket {
            created_at: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap(),
            local_high_res_path: PathBuf::from("/data/highres/2024/03"),
            local_high_res_filename: "HPP_00042_20240309.csv".to_string(),
            file_day: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            low_res_batch: Vec::new(),
            site: SiteMetadata {
                site_name: "RIDGE".to_string(),
                serial_id: "00042".to_string(),
                latitude: 45.5,
                longitude: -73.6,
            },
        }
    }

    #[test]
    fn test_remote_paths() {
        let p = packet();
        assert_eq!(p.lowres_dir("/srv/lowres/", "node7"), "/srv/lowres/node7/2024/03/09");
        assert_eq!(
            p.lowres_object_path("/srv/lowres", "node7"),
            "/srv/lowres/node7/2024/03/09/node7_202403091405.bin.zst"
        );
        assert_eq!(
            highres_month_dir("/srv/highres", "node7", p.file_day),
            "/srv/highres/node7/2024/03"
        );
    }

    #[test]
    fn test_high_res_file_joins_path() {
        assert_eq!(
            packet().high_res_file(),
            PathBuf::from("/data/highres/2024/03/HPP_00042_20240309.csv")
        );
    }

    #[test]
    fn test_json_roundtrip_without_batch_field() {
        let json = r#"{
            "created_at": "2024-03-09T14:05:00+00:00",
            "local_high_res_path": "/data",
            "local_high_res_filename": "a.csv",
            "file_day": "2024-03-09",
            "site": {"site_name": "X", "serial_id": "1", "latitude": 0.0, "longitude": 0.0}
        }"#;
        let p: DeliveryPacket = serde_json::from_str(json).unwrap();
        assert!(p.low_res_batch.is_empty());
        assert_eq!(p.local_high_res_filename, "a.csv");
    }
}
