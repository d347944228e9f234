//! SQLite store implementation.
//!
//! A single connection behind a mutex; tick writes, aggregation, and
//! rotation all serialize on it, and each call holds the lock only for the
//! duration of one statement or transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;
use crate::csvio;
use crate::probe::valid_target;
use crate::status::Status;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("device limit of {0} reached")]
    DeviceLimit(usize),
    #[error("not found")]
    NotFound,
}

/// Which archived table a rotation export targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTable {
    AggMinute,
    Events,
}

impl ExportTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            ExportTable::AggMinute => "agg_minute",
            ExportTable::Events => "events",
        }
    }

    fn ts_column(&self) -> &'static str {
        match self {
            ExportTable::AggMinute => "minute_ts_utc",
            ExportTable::Events => "ts_utc",
        }
    }
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}

impl Store {
    /// Open (or create) the database at the given path and apply the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("schema init failed: {}", e)))?;
        Ok(())
    }

    // --- Devices ---

    /// All configured devices, ordered by id. Read at each tick boundary.
    pub fn list_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ip, name, comment, location, owner,
                    yellow_to_red_secs, yellow_notify_after_secs, ping_timeout_ms
             FROM devices ORDER BY id",
        )?;

        let devices = stmt
            .query_map([], |row| {
                Ok(Device {
                    id: row.get(0)?,
                    ip: row.get(1)?,
                    name: row.get(2)?,
                    comment: row.get(3)?,
                    location: row.get(4)?,
                    owner: row.get(5)?,
                    yellow_to_red_secs: row.get(6)?,
                    yellow_notify_after_secs: row.get(7)?,
                    ping_timeout_ms: row.get(8)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }

    /// Insert or update a device, keyed by `ip`. Returns ("added"|"updated", id)
    /// and writes the matching lifecycle event.
    pub fn upsert_device(
        &self,
        device: &Device,
        max_devices: usize,
    ) -> Result<(&'static str, i64), DbError> {
        let ip = device.ip.trim();
        if !valid_target(ip) {
            return Err(DbError::InvalidAddress(ip.to_string()));
        }

        let conn = self.conn.lock().unwrap();
        let now = fmt_ts(Utc::now());

        let existing: Option<i64> = conn
            .query_row("SELECT id FROM devices WHERE ip = ?1", params![ip], |r| {
                r.get(0)
            })
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE devices SET
                   name=?1, comment=?2, location=?3, owner=?4,
                   yellow_to_red_secs=?5, yellow_notify_after_secs=?6, ping_timeout_ms=?7,
                   updated_at_utc=?8
                 WHERE id=?9",
                params![
                    device.name,
                    device.comment,
                    device.location,
                    device.owner,
                    device.yellow_to_red_secs,
                    device.yellow_notify_after_secs,
                    device.ping_timeout_ms,
                    now,
                    id,
                ],
            )?;
            conn.execute(
                "INSERT INTO events(ts_utc, device_id, kind, detail) VALUES (?1, ?2, ?3, ?4)",
                params![now, id, "device_updated", format!("device updated ip={}", ip)],
            )?;
            return Ok(("updated", id));
        }

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?;
        if count as usize >= max_devices {
            return Err(DbError::DeviceLimit(max_devices));
        }

        conn.execute(
            "INSERT INTO devices(
               ip, name, comment, location, owner,
               yellow_to_red_secs, yellow_notify_after_secs, ping_timeout_ms,
               created_at_utc, updated_at_utc
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ip,
                device.name,
                device.comment,
                device.location,
                device.owner,
                device.yellow_to_red_secs,
                device.yellow_notify_after_secs,
                device.ping_timeout_ms,
                now,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO events(ts_utc, device_id, kind, detail) VALUES (?1, ?2, ?3, ?4)",
            params![now, id, "device_added", format!("device added ip={}", ip)],
        )?;
        Ok(("added", id))
    }

    /// Delete a device. Telemetry rows cascade.
    pub fn delete_device(&self, device_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events(ts_utc, device_id, kind, detail) VALUES (?1, ?2, ?3, ?4)",
            params![fmt_ts(Utc::now()), device_id, "device_deleted", "device deleted"],
        )?;
        let n = conn.execute("DELETE FROM devices WHERE id = ?1", params![device_id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Export the device list to a BOM-prefixed CSV with a header row.
    pub fn export_devices_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), DbError> {
        let devices = self.list_devices()?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::File::create(path)?;
        f.write_all(csvio::BOM)?;
        writeln!(
            f,
            "ip,name,comment,location,owner,yellow_to_red_secs,yellow_notify_after_secs,ping_timeout_ms"
        )?;
        for d in devices {
            let row = csvio::format_row(&[
                d.ip,
                d.name,
                d.comment,
                d.location,
                d.owner,
                d.yellow_to_red_secs.to_string(),
                d.yellow_notify_after_secs.to_string(),
                d.ping_timeout_ms.to_string(),
            ]);
            writeln!(f, "{}", row)?;
        }
        f.flush()?;
        Ok(())
    }

    /// Import devices from CSV, upserting by `ip`. Malformed lines are
    /// rejected with a per-line reason and never reach the device table.
    pub fn import_devices_csv<P: AsRef<Path>>(
        &self,
        path: P,
        max_devices: usize,
    ) -> Result<ImportReport, DbError> {
        let text = fs::read_to_string(path)?;
        let text = csvio::strip_bom(&text);
        let mut lines = text.lines();

        let header = match lines.next() {
            Some(h) => csvio::parse_line(h),
            None => return Ok(ImportReport::default()),
        };
        let col = |name: &str| header.iter().position(|h| h == name);
        let ip_col = col("ip");

        let mut report = ImportReport::default();

        for (lineno, line) in lines.enumerate() {
            let lineno = lineno + 2;
            if line.trim().is_empty() {
                continue;
            }
            let fields = csvio::parse_line(line);
            let field = |idx: Option<usize>| -> &str {
                idx.and_then(|i| fields.get(i)).map(String::as_str).unwrap_or("")
            };

            let ip = field(ip_col).trim().to_string();
            if ip.is_empty() {
                report.skipped += 1;
                report.reasons.push(format!("line {}: missing ip", lineno));
                continue;
            }

            let parse_num = |idx: Option<usize>, default: i64| -> Result<i64, String> {
                let raw = field(idx).trim();
                if raw.is_empty() {
                    Ok(default)
                } else {
                    raw.parse().map_err(|_| format!("bad number '{}'", raw))
                }
            };

            let device = Device {
                id: 0,
                ip,
                name: field(col("name")).trim().to_string(),
                comment: field(col("comment")).trim().to_string(),
                location: field(col("location")).trim().to_string(),
                owner: field(col("owner")).trim().to_string(),
                yellow_to_red_secs: match parse_num(col("yellow_to_red_secs"), 120) {
                    Ok(v) => v,
                    Err(e) => {
                        report.skipped += 1;
                        report.reasons.push(format!("line {}: {}", lineno, e));
                        continue;
                    }
                },
                yellow_notify_after_secs: match parse_num(col("yellow_notify_after_secs"), 30) {
                    Ok(v) => v,
                    Err(e) => {
                        report.skipped += 1;
                        report.reasons.push(format!("line {}: {}", lineno, e));
                        continue;
                    }
                },
                ping_timeout_ms: match parse_num(col("ping_timeout_ms"), 1000) {
                    Ok(v) => v,
                    Err(e) => {
                        report.skipped += 1;
                        report.reasons.push(format!("line {}: {}", lineno, e));
                        continue;
                    }
                },
            };

            match self.upsert_device(&device, max_devices) {
                Ok(("added", _)) => report.added += 1,
                Ok(_) => report.updated += 1,
                Err(e) => {
                    report.skipped += 1;
                    report.reasons.push(format!("line {}: {}", lineno, e));
                }
            }
        }

        Ok(report)
    }

    // --- Telemetry ---

    /// Append one tick's raw record. Called synchronously on the tick path.
    pub fn insert_tick(&self, tick: &TickResult) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO raw_tick(device_id, ts_utc, loss_pct, rtt_last_ms, rtt_avg_ms, status, unstable)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tick.device_id,
                fmt_ts(tick.ts_utc),
                tick.loss_pct,
                tick.rtt_last_ms,
                tick.rtt_avg_ms,
                tick.status.as_str(),
                tick.unstable as i64,
            ],
        )?;
        Ok(())
    }

    /// Append a lifecycle event.
    pub fn insert_event(
        &self,
        ts: DateTime<Utc>,
        device_id: Option<i64>,
        kind: &str,
        detail: &str,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events(ts_utc, device_id, kind, detail) VALUES (?1, ?2, ?3, ?4)",
            params![fmt_ts(ts), device_id, kind, detail],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Raw ticks for one device since a timestamp, oldest first.
    pub fn select_raw_range(
        &self,
        device_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TickResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT device_id, ts_utc, loss_pct, rtt_last_ms, rtt_avg_ms, status, unstable
             FROM raw_tick WHERE device_id = ?1 AND ts_utc >= ?2 ORDER BY ts_utc",
        )?;

        let rows = stmt
            .query_map(params![device_id, fmt_ts(since)], |row| {
                let ts: String = row.get(1)?;
                let status: String = row.get(5)?;
                let unstable: i64 = row.get(6)?;
                Ok(TickResult {
                    device_id: row.get(0)?,
                    ts_utc: parse_ts(&ts).unwrap_or_else(Utc::now),
                    loss_pct: row.get(2)?,
                    rtt_last_ms: row.get(3)?,
                    rtt_avg_ms: row.get(4)?,
                    status: status.parse().unwrap_or(Status::Green),
                    unstable: unstable != 0,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Upsert one minute aggregate. Re-running aggregation for an already
    /// aggregated minute updates the row in place, never duplicates it.
    pub fn upsert_minute_agg(&self, agg: &MinuteAggregate) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agg_minute(device_id, minute_ts_utc, avg_rtt_ms, max_rtt_ms, loss_avg, uptime_ratio)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id, minute_ts_utc) DO UPDATE SET
               avg_rtt_ms=excluded.avg_rtt_ms,
               max_rtt_ms=excluded.max_rtt_ms,
               loss_avg=excluded.loss_avg,
               uptime_ratio=excluded.uptime_ratio",
            params![
                agg.device_id,
                fmt_ts(agg.minute_ts_utc),
                agg.avg_rtt_ms,
                agg.max_rtt_ms,
                agg.loss_avg,
                agg.uptime_ratio,
            ],
        )?;
        Ok(())
    }

    /// Minute aggregates for one device since a timestamp, oldest first.
    pub fn select_agg_range(
        &self,
        device_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<MinuteAggregate>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_id, minute_ts_utc, avg_rtt_ms, max_rtt_ms, loss_avg, uptime_ratio
             FROM agg_minute WHERE device_id = ?1 AND minute_ts_utc >= ?2 ORDER BY minute_ts_utc",
        )?;
        let rows = stmt
            .query_map(params![device_id, fmt_ts(since)], map_agg_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Rotation ---

    /// Prune raw ticks older than the cutoff. Returns the deleted row count.
    pub fn delete_raw_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM raw_tick WHERE ts_utc < ?1",
            params![fmt_ts(cutoff)],
        )?;
        Ok(n)
    }

    /// Highest row id already exported for a table (0 when none).
    pub fn export_cursor(&self, table: ExportTable) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT exported_through_id FROM export_cursor WHERE table_name = ?1",
                params![table.table_name()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    /// Minute aggregates past retention that have not been exported yet.
    pub fn select_agg_export_batch(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
    ) -> Result<Vec<MinuteAggregate>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_id, minute_ts_utc, avg_rtt_ms, max_rtt_ms, loss_avg, uptime_ratio
             FROM agg_minute WHERE minute_ts_utc < ?1 AND id > ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![fmt_ts(cutoff), after_id], map_agg_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Events past retention that have not been exported yet.
    pub fn select_events_export_batch(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
    ) -> Result<Vec<EventRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts_utc, device_id, kind, detail
             FROM events WHERE ts_utc < ?1 AND id > ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![fmt_ts(cutoff), after_id], |row| {
                let ts: String = row.get(1)?;
                Ok(EventRecord {
                    id: row.get(0)?,
                    ts_utc: parse_ts(&ts).unwrap_or_else(Utc::now),
                    device_id: row.get(2)?,
                    kind: row.get(3)?,
                    detail: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Commit an export batch: advance the table's high-water mark and delete
    /// the exported rows, in one transaction. A rerun after a crash before
    /// this commit re-selects the same rows; after it, they are gone and the
    /// cursor skips them.
    pub fn commit_export(
        &self,
        table: ExportTable,
        through_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO export_cursor(table_name, exported_through_id) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET
               exported_through_id = MAX(exported_through_id, excluded.exported_through_id)",
            params![table.table_name(), through_id],
        )?;
        let n = tx.execute(
            &format!(
                "DELETE FROM {} WHERE id <= ?1 AND {} < ?2",
                table.table_name(),
                table.ts_column()
            ),
            params![through_id, fmt_ts(cutoff)],
        )?;
        tx.commit()?;
        Ok(n)
    }

    // --- Alerts ---

    /// One active row per device + level + episode. Repeats update
    /// `last_fired_at_utc` on the existing row.
    pub fn fire_or_update_alert(
        &self,
        device_id: i64,
        level: &str,
        started_at: DateTime<Utc>,
        message: &str,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let now = fmt_ts(Utc::now());

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM alerts
                 WHERE device_id=?1 AND level=?2 AND started_at_utc=?3
                   AND acked_at_utc IS NULL AND resolved_at_utc IS NULL",
                params![device_id, level, fmt_ts(started_at)],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE alerts SET last_fired_at_utc=?1 WHERE id=?2",
                params![now, id],
            )?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO alerts(device_id, level, started_at_utc, last_fired_at_utc,
                                acked_at_utc, resolved_at_utc, message)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)",
            params![device_id, level, fmt_ts(started_at), now, message],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark an alert acknowledged. Device status is unaffected.
    pub fn ack_alert(&self, alert_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE alerts SET acked_at_utc=?1 WHERE id=?2 AND acked_at_utc IS NULL",
            params![fmt_ts(Utc::now()), alert_id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Silently resolve every open alert for a device (status back to GREEN).
    pub fn resolve_device_alerts(&self, device_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET resolved_at_utc=?1 WHERE device_id=?2 AND resolved_at_utc IS NULL",
            params![fmt_ts(Utc::now()), device_id],
        )?;
        Ok(())
    }

    /// Silently resolve one severity's open alerts for a device.
    pub fn resolve_level(&self, device_id: i64, level: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET resolved_at_utc=?1
             WHERE device_id=?2 AND level=?3 AND resolved_at_utc IS NULL",
            params![fmt_ts(Utc::now()), device_id, level],
        )?;
        Ok(())
    }

    /// Open (unacked, unresolved) alerts, newest first.
    pub fn list_active_alerts(&self) -> Result<Vec<AlertRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_id, level, started_at_utc, last_fired_at_utc,
                    acked_at_utc, resolved_at_utc, message
             FROM alerts
             WHERE acked_at_utc IS NULL AND resolved_at_utc IS NULL
             ORDER BY last_fired_at_utc DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let started: String = row.get(3)?;
                let fired: String = row.get(4)?;
                let acked: Option<String> = row.get(5)?;
                let resolved: Option<String> = row.get(6)?;
                Ok(AlertRow {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    level: row.get(2)?,
                    started_at_utc: parse_ts(&started).unwrap_or_else(Utc::now),
                    last_fired_at_utc: parse_ts(&fired).unwrap_or_else(Utc::now),
                    acked_at_utc: acked.as_deref().and_then(parse_ts),
                    resolved_at_utc: resolved.as_deref().and_then(parse_ts),
                    message: row.get(7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }
}

fn map_agg_row(row: &rusqlite::Row<'_>) -> SqlResult<MinuteAggregate> {
    let ts: String = row.get(2)?;
    Ok(MinuteAggregate {
        id: row.get(0)?,
        device_id: row.get(1)?,
        minute_ts_utc: parse_ts(&ts).unwrap_or_else(Utc::now),
        avg_rtt_ms: row.get(3)?,
        max_rtt_ms: row.get(4)?,
        loss_avg: row.get(5)?,
        uptime_ratio: row.get(6)?,
    })
}
