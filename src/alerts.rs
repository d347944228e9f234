//! Alert lifecycle: fire, repeat, acknowledge, silent close.
//!
//! Decisions are evaluated on every tick (check-on-wake), so a close or ack
//! is always observed before the next notification could be emitted. There
//! is no "recovered" notification on any transition back to GREEN; that is a
//! product rule, not an omission.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::db::Device;
use crate::status::Status;

/// Repeat cadence while a YELLOW alert stays open and unacked.
pub const YELLOW_REPEAT_SECS: i64 = 120;
/// Repeat cadence while a RED alert stays open and unacked.
pub const RED_REPEAT_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Yellow,
    Red,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Yellow => "YELLOW",
            Severity::Red => "RED",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a YELLOW notification is due. Fires once the episode has lasted
/// at least `notify_after_secs`, then repeats every two minutes from the
/// last notification.
pub fn yellow_due(
    now: DateTime<Utc>,
    episode_start: DateTime<Utc>,
    notify_after_secs: i64,
    last_fired: Option<DateTime<Utc>>,
    acked: bool,
) -> bool {
    if acked {
        return false;
    }
    if now - episode_start < Duration::seconds(notify_after_secs) {
        return false;
    }
    match last_fired {
        None => true,
        Some(last) => now - last >= Duration::seconds(YELLOW_REPEAT_SECS),
    }
}

/// Whether a RED notification is due: immediate on entry, then every five
/// minutes from the last notification.
pub fn red_due(now: DateTime<Utc>, last_fired: Option<DateTime<Utc>>, acked: bool) -> bool {
    if acked {
        return false;
    }
    match last_fired {
        None => true,
        Some(last) => now - last >= Duration::seconds(RED_REPEAT_SECS),
    }
}

/// What the book decided this tick; persistence and notification are the
/// caller's job.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertAction {
    /// Status left all alerting severities; close everything silently.
    CloseAll,
    /// The given severity's open alert is closed silently (superseded or
    /// the status moved away from it).
    CloseLevel(Severity),
    /// Emit a notification for this severity's current episode.
    Fire {
        severity: Severity,
        episode_start: DateTime<Utc>,
        repeat: bool,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    episode_start: DateTime<Utc>,
    alert_id: Option<i64>,
    acked: bool,
    last_fired: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(episode_start: DateTime<Utc>) -> Self {
        Self {
            episode_start,
            alert_id: None,
            acked: false,
            last_fired: None,
        }
    }
}

/// Outcome of an acknowledge command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked(Severity),
    AlreadyAcked,
    NotFound,
}

/// Per-device open-alert index keyed by (device_id, severity). At most one
/// open entry per device and severity at a time.
#[derive(Debug, Default)]
pub struct AlertBook {
    entries: HashMap<(i64, Severity), Entry>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one device's tick. `episode_start` is when the current
    /// status color was entered.
    pub fn evaluate(
        &mut self,
        device: &Device,
        status: Status,
        episode_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<AlertAction> {
        let did = device.id;
        let mut actions = Vec::new();

        match status {
            Status::Green => {
                let had_yellow = self.entries.remove(&(did, Severity::Yellow)).is_some();
                let had_red = self.entries.remove(&(did, Severity::Red)).is_some();
                if had_yellow || had_red {
                    actions.push(AlertAction::CloseAll);
                }
            }
            Status::Yellow => {
                if self.entries.remove(&(did, Severity::Red)).is_some() {
                    actions.push(AlertAction::CloseLevel(Severity::Red));
                }
                let entry = self.episode_entry(did, Severity::Yellow, episode_start);
                if yellow_due(
                    now,
                    entry.episode_start,
                    device.yellow_notify_after_secs,
                    entry.last_fired,
                    entry.acked,
                ) {
                    let repeat = entry.last_fired.is_some();
                    entry.last_fired = Some(now);
                    actions.push(AlertAction::Fire {
                        severity: Severity::Yellow,
                        episode_start: entry.episode_start,
                        repeat,
                    });
                }
            }
            Status::Red => {
                // RED supersedes an open YELLOW for the same device; the
                // yellow alert is closed without any notification.
                if self.entries.remove(&(did, Severity::Yellow)).is_some() {
                    actions.push(AlertAction::CloseLevel(Severity::Yellow));
                }
                let entry = self.episode_entry(did, Severity::Red, episode_start);
                if red_due(now, entry.last_fired, entry.acked) {
                    let repeat = entry.last_fired.is_some();
                    entry.last_fired = Some(now);
                    actions.push(AlertAction::Fire {
                        severity: Severity::Red,
                        episode_start: entry.episode_start,
                        repeat,
                    });
                }
            }
        }

        actions
    }

    fn episode_entry(
        &mut self,
        device_id: i64,
        severity: Severity,
        episode_start: DateTime<Utc>,
    ) -> &mut Entry {
        let entry = self
            .entries
            .entry((device_id, severity))
            .or_insert_with(|| Entry::new(episode_start));
        if entry.episode_start != episode_start {
            // A new episode for the same severity gets a fresh alert.
            *entry = Entry::new(episode_start);
        }
        entry
    }

    /// Record the persisted alert id for the open entry after a fire.
    pub fn note_alert_id(&mut self, device_id: i64, severity: Severity, alert_id: i64) {
        if let Some(entry) = self.entries.get_mut(&(device_id, severity)) {
            entry.alert_id = Some(alert_id);
        }
    }

    /// Acknowledge the open alert with the given id for the given device.
    /// Stops repeats for exactly that alert instance; acking one severity
    /// leaves the other severity's alert open.
    pub fn ack(&mut self, device_id: i64, alert_id: i64) -> AckOutcome {
        for severity in [Severity::Yellow, Severity::Red] {
            if let Some(entry) = self.entries.get_mut(&(device_id, severity)) {
                if entry.alert_id == Some(alert_id) {
                    if entry.acked {
                        return AckOutcome::AlreadyAcked;
                    }
                    entry.acked = true;
                    return AckOutcome::Acked(severity);
                }
            }
        }
        AckOutcome::NotFound
    }

    /// Drop all entries for a removed device. No store side effects; the
    /// caller resolves persisted rows if it wants to.
    pub fn forget_device(&mut self, device_id: i64) {
        self.entries
            .retain(|(did, _), _| *did != device_id);
    }
}
