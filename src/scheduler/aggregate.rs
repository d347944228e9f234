//! Per-minute aggregation of raw ticks.
//!
//! Ticks are folded into in-memory buckets; when the wall-clock minute
//! rolls over, the closed minute's buckets become `MinuteAggregate` rows.
//! The store upsert is idempotent, so re-aggregating a minute is safe.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::db::{MinuteAggregate, TickResult};

/// Truncate a timestamp to the start of its minute.
pub fn minute_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(ts)
}

#[derive(Debug, Default)]
struct Bucket {
    ticks: u32,
    ok_ticks: u32,
    loss_sum: u64,
    rtt_sum: f64,
    rtt_count: u32,
    rtt_max: Option<i64>,
}

/// Folds ticks into per-device minute buckets.
#[derive(Debug, Default)]
pub struct MinuteAggregator {
    current_minute: Option<DateTime<Utc>>,
    buckets: HashMap<i64, Bucket>,
}

impl MinuteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one tick. When the tick belongs to a later minute than the open
    /// one, the closed minute's rows are returned for persistence.
    pub fn observe(&mut self, tick: &TickResult) -> Vec<MinuteAggregate> {
        let minute = minute_start(tick.ts_utc);
        let mut flushed = Vec::new();

        match self.current_minute {
            None => self.current_minute = Some(minute),
            Some(open) if minute > open => {
                flushed = self.drain(open);
                self.current_minute = Some(minute);
            }
            _ => {}
        }

        let bucket = self.buckets.entry(tick.device_id).or_default();
        bucket.ticks += 1;
        bucket.loss_sum += tick.loss_pct as u64;
        if tick.loss_pct < 100 {
            bucket.ok_ticks += 1;
        }
        if let Some(rtt) = tick.rtt_avg_ms {
            bucket.rtt_sum += rtt as f64;
            bucket.rtt_count += 1;
            bucket.rtt_max = Some(bucket.rtt_max.map_or(rtt, |m| m.max(rtt)));
        }

        flushed
    }

    /// Drain whatever is buffered, including a partial minute. Used on
    /// shutdown so buffered persistence is never lost.
    pub fn flush_all(&mut self) -> Vec<MinuteAggregate> {
        match self.current_minute.take() {
            Some(open) => self.drain(open),
            None => Vec::new(),
        }
    }

    fn drain(&mut self, minute: DateTime<Utc>) -> Vec<MinuteAggregate> {
        let mut rows: Vec<MinuteAggregate> = self
            .buckets
            .drain()
            .map(|(device_id, b)| {
                let ticks = b.ticks.max(1);
                MinuteAggregate {
                    id: 0,
                    device_id,
                    minute_ts_utc: minute,
                    avg_rtt_ms: if b.rtt_count > 0 {
                        Some(b.rtt_sum / b.rtt_count as f64)
                    } else {
                        None
                    },
                    max_rtt_ms: b.rtt_max,
                    loss_avg: b.loss_sum as f64 / ticks as f64,
                    uptime_ratio: b.ok_ticks as f64 / ticks as f64,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.device_id);
        rows
    }
}
