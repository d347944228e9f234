//! Daily retention rotation: prune raw ticks, export-then-delete archives.
//!
//! Minute aggregates and events past retention are appended to monthly CSV
//! files before their rows are deleted. The export cursor makes the delete
//! crash-safe: the cursor only advances in the same transaction as the
//! delete, so an interrupted run re-selects the same rows next time.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::csvio;
use crate::db::{DbError, ExportTable, Store};

/// Background manager that runs the rotation once per local calendar day.
pub struct RotationManager {
    store: Store,
    config: Config,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RotationManager {
    pub fn new(store: Store, config: Config) -> Self {
        Self {
            store,
            config,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background task. It wakes hourly and runs the rotation on
    /// the first wake of each new local day (including the first wake after
    /// startup, which catches up missed days).
    pub fn start(&self) {
        let store = self.store.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            let mut last_run: Option<NaiveDate> = None;

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let today = Local::now().date_naive();
                        if last_run == Some(today) {
                            continue;
                        }
                        run_daily_rotation(
                            &store,
                            &config.exports_dir,
                            config.raw_keep_hours,
                            config.archive_keep_days,
                            Utc::now(),
                        );
                        last_run = Some(today);
                    }
                }
            }
        });
    }

    /// Stop the background task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// One full rotation pass. Each step is independent; a failing step is
/// logged and the others still run.
pub fn run_daily_rotation(
    store: &Store,
    exports_root: &Path,
    raw_keep_hours: i64,
    archive_keep_days: i64,
    now: DateTime<Utc>,
) {
    let raw_cutoff = now - ChronoDuration::hours(raw_keep_hours);
    match store.delete_raw_before(raw_cutoff) {
        Ok(n) if n > 0 => info!(deleted = n, "pruned raw ticks past retention"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "failed to prune raw ticks"),
    }

    let archive_cutoff = now - ChronoDuration::days(archive_keep_days);
    if let Err(e) = rotate_aggregates(store, exports_root, archive_cutoff) {
        error!(error = %e, "minute aggregate rotation failed");
    }
    if let Err(e) = rotate_events(store, exports_root, archive_cutoff) {
        error!(error = %e, "event rotation failed");
    }
}

const AGG_HEADER: &str = "id,device_id,minute_ts_utc,avg_rtt_ms,max_rtt_ms,loss_avg,uptime_ratio";
const EVENTS_HEADER: &str = "id,ts_utc,device_id,kind,detail";

fn rotate_aggregates(
    store: &Store,
    exports_root: &Path,
    cutoff: DateTime<Utc>,
) -> Result<(), DbError> {
    let after_id = store.export_cursor(ExportTable::AggMinute)?;
    let rows = store.select_agg_export_batch(cutoff, after_id)?;
    if rows.is_empty() {
        return Ok(());
    }

    // Rows are appended month by month, in id order within each month.
    let mut through_id = after_id;
    for row in &rows {
        let line = csvio::format_row(&[
            row.id.to_string(),
            row.device_id.to_string(),
            fmt_export_ts(row.minute_ts_utc),
            row.avg_rtt_ms.map(|v| v.to_string()).unwrap_or_default(),
            row.max_rtt_ms.map(|v| v.to_string()).unwrap_or_default(),
            row.loss_avg.to_string(),
            row.uptime_ratio.to_string(),
        ]);
        append_line(
            &month_file(exports_root, row.minute_ts_utc, "agg_minute"),
            AGG_HEADER,
            &line,
        )?;
        through_id = through_id.max(row.id);
    }

    let deleted = store.commit_export(ExportTable::AggMinute, through_id, cutoff)?;
    info!(exported = rows.len(), deleted, "rotated minute aggregates");
    Ok(())
}

fn rotate_events(store: &Store, exports_root: &Path, cutoff: DateTime<Utc>) -> Result<(), DbError> {
    let after_id = store.export_cursor(ExportTable::Events)?;
    let rows = store.select_events_export_batch(cutoff, after_id)?;
    if rows.is_empty() {
        return Ok(());
    }

    let mut through_id = after_id;
    for row in &rows {
        let line = csvio::format_row(&[
            row.id.to_string(),
            fmt_export_ts(row.ts_utc),
            row.device_id.map(|v| v.to_string()).unwrap_or_default(),
            row.kind.clone(),
            row.detail.clone(),
        ]);
        append_line(
            &month_file(exports_root, row.ts_utc, "events"),
            EVENTS_HEADER,
            &line,
        )?;
        through_id = through_id.max(row.id);
    }

    let deleted = store.commit_export(ExportTable::Events, through_id, cutoff)?;
    info!(exported = rows.len(), deleted, "rotated events");
    Ok(())
}

fn fmt_export_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// exports/<YYYY-MM>/<table>.csv, keyed by the row's own timestamp.
fn month_file(root: &Path, ts: DateTime<Utc>, table: &str) -> PathBuf {
    root.join(format!("{:04}-{:02}", ts.year(), ts.month()))
        .join(format!("{}.csv", table))
}

/// Append one row, creating the file with a BOM and header on first touch.
fn append_line(path: &Path, header: &str, line: &str) -> Result<(), DbError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = if path.exists() {
        OpenOptions::new().append(true).open(path)?
    } else {
        let mut f = fs::File::create(path)?;
        f.write_all(csvio::BOM)?;
        writeln!(f, "{}", header)?;
        f
    };
    writeln!(file, "{}", line)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Device, MinuteAggregate, TickResult};
    use crate::status::Status;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store, i64) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        let (_, did) = store
            .upsert_device(
                &Device {
                    ip: "10.0.0.1".to_string(),
                    name: "gw".to_string(),
                    ..Default::default()
                },
                20,
            )
            .unwrap();
        (dir, store, did)
    }

    fn read_lines(path: &Path) -> Vec<String> {
        let text = fs::read_to_string(path).unwrap();
        let text = csvio::strip_bom(&text);
        text.lines().map(String::from).collect()
    }

    #[test]
    fn test_rotation_exports_then_deletes() {
        let (dir, store, did) = setup();
        let exports = dir.path().join("exports");

        let old_minute = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        for m in 0..3 {
            store
                .upsert_minute_agg(&MinuteAggregate {
                    id: 0,
                    device_id: did,
                    minute_ts_utc: old_minute + ChronoDuration::minutes(m),
                    avg_rtt_ms: Some(12.5),
                    max_rtt_ms: Some(30),
                    loss_avg: 11.0,
                    uptime_ratio: 1.0,
                })
                .unwrap();
        }
        store
            .insert_event(old_minute, Some(did), "status_transition", "old event")
            .unwrap();

        let old_tick = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        store
            .insert_tick(&TickResult {
                device_id: did,
                ts_utc: old_tick,
                loss_pct: 0,
                rtt_last_ms: Some(5),
                rtt_avg_ms: Some(5),
                status: Status::Green,
                unstable: false,
            })
            .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 30, 0).unwrap();
        run_daily_rotation(&store, &exports, 72, 90, now);

        // Raw ticks past 72h are pruned.
        assert!(store.select_raw_range(did, old_tick).unwrap().is_empty());

        // Aggregates landed in the January file and are gone from the table.
        let agg_file = exports.join("2024-01").join("agg_minute.csv");
        let lines = read_lines(&agg_file);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], AGG_HEADER);
        assert!(store
            .select_agg_export_batch(now, 0)
            .unwrap()
            .is_empty());

        let event_file = exports.join("2024-01").join("events.csv");
        let event_lines = read_lines(&event_file);
        assert_eq!(event_lines[0], EVENTS_HEADER);
        let fields = csvio::parse_line(&event_lines[1]);
        assert_eq!(fields[3], "status_transition");
        assert_eq!(fields[4], "old event");

        // BOM at the very start of each file.
        let bytes = fs::read(&agg_file).unwrap();
        assert_eq!(&bytes[..3], csvio::BOM);
    }

    #[test]
    fn test_rotation_is_idempotent() {
        let (dir, store, did) = setup();
        let exports = dir.path().join("exports");

        let old_minute = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        store
            .upsert_minute_agg(&MinuteAggregate {
                id: 0,
                device_id: did,
                minute_ts_utc: old_minute,
                avg_rtt_ms: None,
                max_rtt_ms: None,
                loss_avg: 100.0,
                uptime_ratio: 0.0,
            })
            .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 30, 0).unwrap();
        run_daily_rotation(&store, &exports, 72, 90, now);
        run_daily_rotation(&store, &exports, 72, 90, now);

        let lines = read_lines(&exports.join("2024-01").join("agg_minute.csv"));
        // Header plus exactly one row after two runs.
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_exported_aggregate_fields_roundtrip() {
        let (dir, store, did) = setup();
        let exports = dir.path().join("exports");

        let minute = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 0).unwrap();
        let original = MinuteAggregate {
            id: 0,
            device_id: did,
            minute_ts_utc: minute,
            avg_rtt_ms: Some(18.25),
            max_rtt_ms: Some(42),
            loss_avg: 33.0,
            uptime_ratio: 0.75,
        };
        store.upsert_minute_agg(&original).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        run_daily_rotation(&store, &exports, 72, 90, now);

        let lines = read_lines(&exports.join("2024-02").join("agg_minute.csv"));
        let fields = csvio::parse_line(&lines[1]);
        assert_eq!(fields[1], did.to_string());
        assert_eq!(
            DateTime::parse_from_rfc3339(&fields[2]).unwrap().with_timezone(&Utc),
            minute
        );
        assert_eq!(fields[3].parse::<f64>().unwrap(), 18.25);
        assert_eq!(fields[4].parse::<i64>().unwrap(), 42);
        assert_eq!(fields[5].parse::<f64>().unwrap(), 33.0);
        assert_eq!(fields[6].parse::<f64>().unwrap(), 0.75);
    }

    #[test]
    fn test_fresh_rows_stay_in_place() {
        let (dir, store, did) = setup();
        let exports = dir.path().join("exports");

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        store
            .upsert_minute_agg(&MinuteAggregate {
                id: 0,
                device_id: did,
                minute_ts_utc: now - ChronoDuration::days(1),
                avg_rtt_ms: Some(5.0),
                max_rtt_ms: Some(5),
                loss_avg: 0.0,
                uptime_ratio: 1.0,
            })
            .unwrap();

        run_daily_rotation(&store, &exports, 72, 90, now);

        assert!(!exports.exists());
        assert_eq!(store.select_agg_range(did, now - ChronoDuration::days(2)).unwrap().len(), 1);
    }
}
