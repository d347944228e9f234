//! Per-device status state machine.
//!
//! A device is GREEN whenever the current tick saw at least one reply,
//! YELLOW while a full-loss run is within the device's yellow_to_red window,
//! and RED once the run exceeds it. The orthogonal `unstable` flag marks a
//! partial-loss tick (33/66%) and is meaningful only while GREEN.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Green,
    Yellow,
    Red,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Green => "GREEN",
            Status::Yellow => "YELLOW",
            Status::Red => "RED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GREEN" => Ok(Status::Green),
            "YELLOW" => Ok(Status::Yellow),
            "RED" => Ok(Status::Red),
            _ => Err(()),
        }
    }
}

/// Quantize probe successes into the fixed loss grid {0,33,66,100}.
pub fn quantize_loss(successes: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    match total.saturating_sub(successes) {
        0 => 0,
        1 => 33,
        2 => 66,
        _ => 100,
    }
}

/// Mutable runtime state for one configured device. Exactly one instance per
/// live device; torn down when the device is removed.
#[derive(Debug, Clone)]
pub struct DeviceRuntimeState {
    pub device_id: i64,
    pub first_seen_at: DateTime<Utc>,
    pub current_status: Option<Status>,
    pub unstable: bool,
    /// When the current status color was entered.
    pub status_since: Option<DateTime<Utc>>,
    /// First tick of the current full-loss run. Preserved across partial-loss
    /// ticks: partial loss mid-episode is continued instability, not recovery.
    pub downtime_started_at: Option<DateTime<Utc>>,
    pub last_ok_at: Option<DateTime<Utc>>,
}

impl DeviceRuntimeState {
    pub fn new(device_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            first_seen_at: now,
            current_status: None,
            unstable: false,
            status_since: None,
            downtime_started_at: None,
            last_ok_at: None,
        }
    }
}

/// What one tick did to a device's status.
#[derive(Debug, Clone, Copy)]
pub struct TickOutcome {
    pub status: Status,
    pub unstable: bool,
    pub previous: Option<Status>,
    pub color_changed: bool,
    pub unstable_toggled: bool,
}

/// Apply one tick's loss figure to the device state.
pub fn apply_tick(
    state: &mut DeviceRuntimeState,
    yellow_to_red_secs: i64,
    ts: DateTime<Utc>,
    loss_pct: u8,
) -> TickOutcome {
    let (status, unstable) = if loss_pct == 0 {
        state.downtime_started_at = None;
        state.last_ok_at = Some(ts);
        (Status::Green, false)
    } else if loss_pct < 100 {
        // Partial loss: the tick had replies, so the device is reachable, but
        // an ongoing downtime anchor is kept.
        state.last_ok_at = Some(ts);
        (Status::Green, true)
    } else {
        let started = *state.downtime_started_at.get_or_insert(ts);
        let down = ts - started;
        if down <= Duration::seconds(yellow_to_red_secs) {
            (Status::Yellow, false)
        } else {
            (Status::Red, false)
        }
    };

    let previous = state.current_status;
    let color_changed = previous != Some(status);
    let unstable_toggled = state.unstable != unstable;

    if color_changed {
        state.status_since = Some(ts);
    }
    state.current_status = Some(status);
    state.unstable = unstable;

    TickOutcome {
        status,
        unstable,
        previous,
        color_changed,
        unstable_toggled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_quantize_loss() {
        assert_eq!(quantize_loss(3, 3), 0);
        assert_eq!(quantize_loss(2, 3), 33);
        assert_eq!(quantize_loss(1, 3), 66);
        assert_eq!(quantize_loss(0, 3), 100);
        assert_eq!(quantize_loss(0, 0), 100);
    }

    #[test]
    fn test_yellow_then_red_at_threshold() {
        let mut st = DeviceRuntimeState::new(1, at(0));

        // 100% loss from t=0 with yellow_to_red=30
        for t in 0..=29 {
            let out = apply_tick(&mut st, 30, at(t), 100);
            assert_eq!(out.status, Status::Yellow, "t={}", t);
        }
        let out = apply_tick(&mut st, 30, at(31), 100);
        assert_eq!(out.status, Status::Red);
        assert_eq!(out.previous, Some(Status::Yellow));
        assert!(out.color_changed);
    }

    #[test]
    fn test_recovery_clears_downtime() {
        let mut st = DeviceRuntimeState::new(1, at(0));
        apply_tick(&mut st, 30, at(0), 100);
        assert!(st.downtime_started_at.is_some());

        let out = apply_tick(&mut st, 30, at(1), 0);
        assert_eq!(out.status, Status::Green);
        assert!(!out.unstable);
        assert!(st.downtime_started_at.is_none());

        // A fresh full-loss run anchors at its own first tick.
        let out = apply_tick(&mut st, 30, at(40), 100);
        assert_eq!(out.status, Status::Yellow);
        assert_eq!(st.downtime_started_at, Some(at(40)));
    }

    #[test]
    fn test_partial_loss_flip_stays_green() {
        let mut st = DeviceRuntimeState::new(1, at(0));

        let out = apply_tick(&mut st, 30, at(0), 0);
        assert_eq!(out.status, Status::Green);
        assert!(!out.unstable);

        let out = apply_tick(&mut st, 30, at(1), 33);
        assert_eq!(out.status, Status::Green);
        assert!(out.unstable);
        assert!(out.unstable_toggled);
        assert!(!out.color_changed);

        let out = apply_tick(&mut st, 30, at(2), 0);
        assert_eq!(out.status, Status::Green);
        assert!(!out.unstable);
        assert!(out.unstable_toggled);
    }

    #[test]
    fn test_partial_loss_preserves_downtime_anchor() {
        let mut st = DeviceRuntimeState::new(1, at(0));

        // Downtime from t=0, threshold 10s.
        for t in 0..5 {
            apply_tick(&mut st, 10, at(t), 100);
        }
        // Partial tick: green+unstable, but the anchor survives.
        let out = apply_tick(&mut st, 10, at(5), 66);
        assert_eq!(out.status, Status::Green);
        assert!(out.unstable);
        assert_eq!(st.downtime_started_at, Some(at(0)));

        // Back to full loss past the threshold: straight to RED.
        let out = apply_tick(&mut st, 10, at(12), 100);
        assert_eq!(out.status, Status::Red);
    }

    #[test]
    fn test_red_requires_continuous_downtime() {
        let mut st = DeviceRuntimeState::new(1, at(0));
        // A lone full-loss tick can never be RED.
        let out = apply_tick(&mut st, 30, at(0), 100);
        assert_eq!(out.status, Status::Yellow);
    }
}
