//! In-process notification events for the UI collaborator.
//!
//! The engine is authoritative for alert state; delivery here is best-effort
//! and a missing receiver never affects the engine.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::alerts::Severity;
use crate::status::Status;

#[derive(Debug, Clone)]
pub enum Notification {
    AlertFired {
        device_id: i64,
        alert_id: i64,
        severity: Severity,
        ts_utc: DateTime<Utc>,
    },
    AlertRepeat {
        device_id: i64,
        alert_id: i64,
        severity: Severity,
        ts_utc: DateTime<Utc>,
    },
    StatusChanged {
        device_id: i64,
        old: Option<Status>,
        new: Status,
        ts_utc: DateTime<Utc>,
    },
}

pub type NotifySender = mpsc::UnboundedSender<Notification>;
pub type NotifyReceiver = mpsc::UnboundedReceiver<Notification>;

pub fn channel() -> (NotifySender, NotifyReceiver) {
    mpsc::unbounded_channel()
}
