//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// A monitored endpoint. The `ip` column is the unique key; thresholds are
/// per-device with schema defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub ip: String,
    pub name: String,
    pub comment: String,
    pub location: String,
    pub owner: String,
    pub yellow_to_red_secs: i64,
    pub yellow_notify_after_secs: i64,
    pub ping_timeout_ms: i64,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            ip: String::new(),
            name: String::new(),
            comment: String::new(),
            location: String::new(),
            owner: String::new(),
            yellow_to_red_secs: 120,
            yellow_notify_after_secs: 30,
            ping_timeout_ms: 1000,
        }
    }
}

/// One per-device probing round, persisted as a `raw_tick` row.
///
/// `rtt_last_ms` and `rtt_avg_ms` are computed over successful probes only
/// and are absent when `loss_pct` is 100.
#[derive(Debug, Clone)]
pub struct TickResult {
    pub device_id: i64,
    pub ts_utc: DateTime<Utc>,
    /// Quantized to 0/33/66/100 (3 probes per tick).
    pub loss_pct: u8,
    pub rtt_last_ms: Option<i64>,
    pub rtt_avg_ms: Option<i64>,
    pub status: Status,
    pub unstable: bool,
}

/// One row per device per closed minute, folded from that minute's raw ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteAggregate {
    pub id: i64,
    pub device_id: i64,
    pub minute_ts_utc: DateTime<Utc>,
    pub avg_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<i64>,
    pub loss_avg: f64,
    pub uptime_ratio: f64,
}

/// Append-only lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub ts_utc: DateTime<Utc>,
    pub device_id: Option<i64>,
    pub kind: String,
    pub detail: String,
}

/// A persisted alert row. One active row per device + level + episode.
#[derive(Debug, Clone)]
pub struct AlertRow {
    pub id: i64,
    pub device_id: i64,
    pub level: String,
    pub started_at_utc: DateTime<Utc>,
    pub last_fired_at_utc: DateTime<Utc>,
    pub acked_at_utc: Option<DateTime<Utc>>,
    pub resolved_at_utc: Option<DateTime<Utc>>,
    pub message: String,
}

/// Outcome of a device-list CSV import.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub reasons: Vec<String>,
}
