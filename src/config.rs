//! Runtime configuration.
//!
//! Loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "pulsewatch.db")
    pub db_path: String,
    /// Root directory for rotation CSV exports (default: "exports")
    pub exports_dir: PathBuf,
    /// Maximum number of monitored devices (default: 20)
    pub max_devices: usize,
    /// Probing cadence (default: 1s)
    pub tick_period: Duration,
    /// Raw tick retention window in hours (default: 72)
    pub raw_keep_hours: i64,
    /// Minute-aggregate and event retention window in days (default: 90)
    pub archive_keep_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "pulsewatch.db".to_string(),
            exports_dir: PathBuf::from("exports"),
            max_devices: 20,
            tick_period: Duration::from_secs(1),
            raw_keep_hours: 72,
            archive_keep_days: 90,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PULSEWATCH_DB_PATH`: database file path
    /// - `PULSEWATCH_EXPORTS_DIR`: rotation export directory
    /// - `PULSEWATCH_RAW_KEEP_HOURS`: raw tick retention window
    /// - `PULSEWATCH_ARCHIVE_KEEP_DAYS`: aggregate/event retention window
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("PULSEWATCH_DB_PATH") {
            cfg.db_path = path;
        }

        if let Ok(dir) = env::var("PULSEWATCH_EXPORTS_DIR") {
            cfg.exports_dir = PathBuf::from(dir);
        }

        if let Ok(hours) = env::var("PULSEWATCH_RAW_KEEP_HOURS") {
            if let Ok(h) = hours.parse() {
                cfg.raw_keep_hours = h;
            }
        }

        if let Ok(days) = env::var("PULSEWATCH_ARCHIVE_KEEP_DAYS") {
            if let Ok(d) = days.parse() {
                cfg.archive_keep_days = d;
            }
        }

        cfg
    }
}
