//! Tick processing: status machine, persistence, alerting, aggregation.
//!
//! The engine owns one `Monitor` and calls it from a single task, so no
//! locking happens here. A store failure on the tick path is logged and the
//! tick is dropped; probing never stops because persistence hiccuped.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::alerts::{AckOutcome, AlertAction, AlertBook, Severity};
use crate::db::{Device, Store, TickResult};
use crate::notify::{Notification, NotifySender};
use crate::scheduler::aggregate::MinuteAggregator;
use crate::status::{apply_tick, DeviceRuntimeState, Status};

pub struct Monitor {
    store: Store,
    notify: NotifySender,
    states: HashMap<i64, DeviceRuntimeState>,
    book: AlertBook,
    aggregator: MinuteAggregator,
}

impl Monitor {
    pub fn new(store: Store, notify: NotifySender) -> Self {
        Self {
            store,
            notify,
            states: HashMap::new(),
            book: AlertBook::new(),
            aggregator: MinuteAggregator::new(),
        }
    }

    /// Reconcile runtime state with the configured device set. New devices
    /// start with no status; removed devices lose their state and any open
    /// alert entries.
    pub fn sync_devices(&mut self, devices: &[Device], now: DateTime<Utc>) {
        let live: HashSet<i64> = devices.iter().map(|d| d.id).collect();
        let gone: Vec<i64> = self
            .states
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in gone {
            debug!(device_id = id, "device removed, dropping runtime state");
            self.states.remove(&id);
            self.book.forget_device(id);
        }
        for d in devices {
            self.states
                .entry(d.id)
                .or_insert_with(|| DeviceRuntimeState::new(d.id, now));
        }
    }

    /// Process one device's probing round.
    pub fn handle_sample(
        &mut self,
        device: &Device,
        ts: DateTime<Utc>,
        loss_pct: u8,
        rtt_last_ms: Option<i64>,
        rtt_avg_ms: Option<i64>,
    ) {
        let state = self
            .states
            .entry(device.id)
            .or_insert_with(|| DeviceRuntimeState::new(device.id, ts));
        let outcome = apply_tick(state, device.yellow_to_red_secs, ts, loss_pct);
        let episode_start = state
            .downtime_started_at
            .or(state.status_since)
            .unwrap_or(ts);

        let tick = TickResult {
            device_id: device.id,
            ts_utc: ts,
            loss_pct,
            rtt_last_ms,
            rtt_avg_ms,
            status: outcome.status,
            unstable: outcome.unstable,
        };
        if let Err(e) = self.store.insert_tick(&tick) {
            warn!(device_id = device.id, error = %e, "failed to persist tick");
        }

        if outcome.color_changed {
            info!(
                device_id = device.id,
                ip = %device.ip,
                old = ?outcome.previous,
                new = %outcome.status,
                "status changed"
            );
            let detail = serde_json::json!({
                "old": outcome.previous.map(|s| s.as_str()),
                "new": outcome.status.as_str(),
                "unstable": outcome.unstable,
            })
            .to_string();
            if let Err(e) = self
                .store
                .insert_event(ts, Some(device.id), "status_transition", &detail)
            {
                warn!(device_id = device.id, error = %e, "failed to persist status event");
            }
            let _ = self.notify.send(Notification::StatusChanged {
                device_id: device.id,
                old: outcome.previous,
                new: outcome.status,
                ts_utc: ts,
            });
        } else if outcome.unstable_toggled {
            let detail = serde_json::json!({ "unstable": outcome.unstable }).to_string();
            if let Err(e) = self
                .store
                .insert_event(ts, Some(device.id), "instability", &detail)
            {
                warn!(device_id = device.id, error = %e, "failed to persist instability event");
            }
        }

        for action in self.book.evaluate(device, outcome.status, episode_start, ts) {
            self.apply_alert_action(device, ts, action);
        }

        for row in self.aggregator.observe(&tick) {
            if let Err(e) = self.store.upsert_minute_agg(&row) {
                warn!(device_id = row.device_id, error = %e, "failed to persist minute aggregate");
            }
        }
    }

    fn apply_alert_action(&mut self, device: &Device, ts: DateTime<Utc>, action: AlertAction) {
        match action {
            AlertAction::CloseAll => {
                // Recovery closes silently; no notification by design of the
                // alert lifecycle.
                if let Err(e) = self.store.resolve_device_alerts(device.id) {
                    warn!(device_id = device.id, error = %e, "failed to resolve alerts");
                }
            }
            AlertAction::CloseLevel(severity) => {
                if let Err(e) = self.store.resolve_level(device.id, severity.as_str()) {
                    warn!(device_id = device.id, error = %e, "failed to resolve alert level");
                }
            }
            AlertAction::Fire {
                severity,
                episode_start,
                repeat,
            } => {
                let message = match severity {
                    Severity::Yellow => format!(
                        "YELLOW: {} ({}) 100% packet loss",
                        device.name, device.ip
                    ),
                    Severity::Red => format!(
                        "RED: {} ({}) unreachable for over {}s",
                        device.name, device.ip, device.yellow_to_red_secs
                    ),
                };
                let alert_id = match self.store.fire_or_update_alert(
                    device.id,
                    severity.as_str(),
                    episode_start,
                    &message,
                ) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(device_id = device.id, error = %e, "failed to persist alert");
                        return;
                    }
                };
                self.book.note_alert_id(device.id, severity, alert_id);

                if let Err(e) =
                    self.store
                        .insert_event(ts, Some(device.id), "alert_fired", &message)
                {
                    warn!(device_id = device.id, error = %e, "failed to persist alert event");
                }
                info!(device_id = device.id, alert_id, severity = %severity, repeat, "alert fired");

                let notification = if repeat {
                    Notification::AlertRepeat {
                        device_id: device.id,
                        alert_id,
                        severity,
                        ts_utc: ts,
                    }
                } else {
                    Notification::AlertFired {
                        device_id: device.id,
                        alert_id,
                        severity,
                        ts_utc: ts,
                    }
                };
                let _ = self.notify.send(notification);
            }
        }
    }

    /// Acknowledge one alert instance. Repeats stop for that alert only;
    /// device status is untouched.
    pub fn ack(&mut self, device_id: i64, alert_id: i64) -> AckOutcome {
        let outcome = self.book.ack(device_id, alert_id);
        if let AckOutcome::Acked(severity) = outcome {
            if let Err(e) = self.store.ack_alert(alert_id) {
                warn!(device_id, alert_id, error = %e, "failed to persist ack");
            }
            if let Err(e) = self.store.insert_event(
                Utc::now(),
                Some(device_id),
                "alert_ack",
                &format!("alert {} ({}) acknowledged", alert_id, severity),
            ) {
                warn!(device_id, error = %e, "failed to persist ack event");
            }
        }
        outcome
    }

    /// Current status color for a device, if it has been probed at least once.
    pub fn device_status(&self, device_id: i64) -> Option<Status> {
        self.states.get(&device_id).and_then(|s| s.current_status)
    }

    /// Persist the partial aggregation minute. Called on shutdown.
    pub fn flush(&mut self) {
        for row in self.aggregator.flush_all() {
            if let Err(e) = self.store.upsert_minute_agg(&row) {
                warn!(device_id = row.device_id, error = %e, "failed to flush minute aggregate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{self, NotifyReceiver};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Monitor, NotifyReceiver, Device) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        let mut device = Device {
            ip: "10.0.0.9".to_string(),
            name: "gw".to_string(),
            yellow_to_red_secs: 30,
            yellow_notify_after_secs: 10,
            ..Default::default()
        };
        let (_, id) = store.upsert_device(&device, 20).unwrap();
        device.id = id;

        let (tx, rx) = notify::channel();
        let monitor = Monitor::new(store, tx);
        (dir, monitor, rx, device)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn drain(rx: &mut NotifyReceiver) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_green_tick_persists_and_notifies_initial_status() {
        let (_dir, mut monitor, mut rx, device) = setup();

        monitor.handle_sample(&device, at(0), 0, Some(12), Some(11));
        assert_eq!(monitor.device_status(device.id), Some(Status::Green));

        let events = drain(&mut rx);
        assert!(matches!(
            events[..],
            [Notification::StatusChanged {
                old: None,
                new: Status::Green,
                ..
            }]
        ));

        let ticks = monitor.store.select_raw_range(device.id, at(0)).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].rtt_last_ms, Some(12));
    }

    #[test]
    fn test_full_loss_fires_yellow_after_notify_delay() {
        let (_dir, mut monitor, mut rx, device) = setup();

        for t in 0..10 {
            monitor.handle_sample(&device, at(t), 100, None, None);
        }
        // Status flipped to YELLOW at t=0 but the alert waits 10s.
        let fired: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, Notification::AlertFired { .. }))
            .collect();
        assert!(fired.is_empty());

        monitor.handle_sample(&device, at(10), 100, None, None);
        let fired = drain(&mut rx);
        assert!(fired.iter().any(|n| matches!(
            n,
            Notification::AlertFired {
                severity: Severity::Yellow,
                ..
            }
        )));
        assert_eq!(monitor.store.list_active_alerts().unwrap().len(), 1);
    }

    #[test]
    fn test_red_supersedes_yellow_and_recovery_is_silent() {
        let (_dir, mut monitor, mut rx, device) = setup();

        for t in 0..=31 {
            monitor.handle_sample(&device, at(t), 100, None, None);
        }
        assert_eq!(monitor.device_status(device.id), Some(Status::Red));

        let active = monitor.store.list_active_alerts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].level, "RED");

        drain(&mut rx);
        monitor.handle_sample(&device, at(32), 0, Some(9), Some(9));
        assert_eq!(monitor.device_status(device.id), Some(Status::Green));
        assert!(monitor.store.list_active_alerts().unwrap().is_empty());

        // Recovery produces a status notification but never an alert one.
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|n| matches!(n, Notification::StatusChanged { .. })));
    }

    #[test]
    fn test_ack_stops_repeats_and_persists() {
        let (_dir, mut monitor, mut rx, device) = setup();

        for t in 0..=10 {
            monitor.handle_sample(&device, at(t), 100, None, None);
        }
        let alert_id = drain(&mut rx)
            .iter()
            .find_map(|n| match n {
                Notification::AlertFired { alert_id, .. } => Some(*alert_id),
                _ => None,
            })
            .unwrap();

        assert_eq!(
            monitor.ack(device.id, alert_id),
            AckOutcome::Acked(Severity::Yellow)
        );
        assert_eq!(monitor.ack(device.id, alert_id), AckOutcome::AlreadyAcked);
        assert!(monitor.store.list_active_alerts().unwrap().is_empty());

        // Repeat window passes with no further notifications.
        for t in 11..=200 {
            monitor.handle_sample(&device, at(t), 100, None, None);
        }
        assert!(drain(&mut rx)
            .iter()
            .all(|n| !matches!(n, Notification::AlertFired { .. } | Notification::AlertRepeat { .. })));
    }

    #[test]
    fn test_partial_loss_marks_unstable_without_alerting() {
        let (_dir, mut monitor, mut rx, device) = setup();

        monitor.handle_sample(&device, at(0), 0, Some(5), Some(5));
        monitor.handle_sample(&device, at(1), 33, Some(8), Some(8));
        assert_eq!(monitor.device_status(device.id), Some(Status::Green));

        let ticks = monitor.store.select_raw_range(device.id, at(0)).unwrap();
        assert!(ticks[1].unstable);
        assert!(monitor.store.list_active_alerts().unwrap().is_empty());

        // Only the initial GREEN transition was notified.
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_device_removal_drops_state() {
        let (_dir, mut monitor, _rx, device) = setup();

        monitor.handle_sample(&device, at(0), 0, Some(5), Some(5));
        assert!(monitor.device_status(device.id).is_some());

        monitor.sync_devices(&[], at(1));
        assert!(monitor.device_status(device.id).is_none());
    }

    #[test]
    fn test_flush_persists_partial_minute() {
        let (_dir, mut monitor, _rx, device) = setup();

        monitor.handle_sample(&device, at(0), 0, Some(10), Some(10));
        monitor.handle_sample(&device, at(1), 0, Some(20), Some(20));
        monitor.flush();

        let rows = monitor
            .store
            .select_agg_range(device.id, at(0) - Duration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_rtt_ms, Some(15.0));
        assert_eq!(rows[0].uptime_ratio, 1.0);
    }
}
