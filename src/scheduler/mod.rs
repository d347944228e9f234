//! Probing engine: one tick per second, three probes per device per tick.
//!
//! The engine task owns the `Monitor` and processes everything — samples,
//! ack commands, shutdown — on a single select loop, so tick handling never
//! races with command handling. Probing itself runs in per-device spawned
//! tasks; a device whose round is still in flight is skipped on the next
//! tick with no backlog.

pub mod aggregate;
pub mod rotation;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::alerts::AckOutcome;
use crate::config::Config;
use crate::db::{Device, Store};
use crate::monitor::Monitor;
use crate::notify::NotifySender;
use crate::probe::{ping_once, resolve_address, ProbeError};
use crate::status::quantize_loss;

/// One device's completed probing round.
#[derive(Debug)]
struct TickSample {
    device: Device,
    ts: DateTime<Utc>,
    loss_pct: u8,
    rtt_last_ms: Option<i64>,
    rtt_avg_ms: Option<i64>,
}

enum EngineCommand {
    Ack {
        device_id: i64,
        alert_id: i64,
        reply: oneshot::Sender<AckOutcome>,
    },
}

/// Handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    stop_tx: broadcast::Sender<()>,
}

impl EngineHandle {
    /// Acknowledge an alert. `None` means the engine has already stopped.
    pub async fn ack(&self, device_id: i64, alert_id: i64) -> Option<AckOutcome> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Ack {
                device_id,
                alert_id,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Request a graceful stop; buffered aggregation is flushed on exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

pub struct Engine {
    store: Store,
    config: Config,
    monitor: Monitor,
    command_rx: mpsc::Receiver<EngineCommand>,
    stop_rx: broadcast::Receiver<()>,
}

impl Engine {
    pub fn new(store: Store, config: Config, notify: NotifySender) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let monitor = Monitor::new(store.clone(), notify);
        (
            Self {
                store,
                config,
                monitor,
                command_rx,
                stop_rx,
            },
            EngineHandle {
                command_tx,
                stop_tx,
            },
        )
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (sample_tx, mut sample_rx) = mpsc::channel::<TickSample>(64);
        let mut in_flight: HashSet<i64> = HashSet::new();
        let mut live_ids: HashSet<i64> = HashSet::new();

        info!("engine started, tick period {:?}", self.config.tick_period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // The device list is re-read at each tick boundary, so
                    // adds/edits/removes take effect on the next tick.
                    let devices = match self.store.list_devices() {
                        Ok(d) => d,
                        Err(e) => {
                            error!(error = %e, "failed to load device list");
                            continue;
                        }
                    };
                    let now = Utc::now();
                    self.monitor.sync_devices(&devices, now);
                    live_ids = devices.iter().map(|d| d.id).collect();
                    in_flight.retain(|id| live_ids.contains(id));

                    for device in devices {
                        if !in_flight.insert(device.id) {
                            debug!(device_id = device.id, "round still in flight, skipping tick");
                            continue;
                        }
                        tokio::spawn(probe_device(device, sample_tx.clone()));
                    }
                }
                Some(sample) = sample_rx.recv() => {
                    in_flight.remove(&sample.device.id);
                    // A round that completed after its device was removed is
                    // dropped, not recorded.
                    if !live_ids.contains(&sample.device.id) {
                        debug!(device_id = sample.device.id, "sample for removed device dropped");
                        continue;
                    }
                    self.monitor.handle_sample(
                        &sample.device,
                        sample.ts,
                        sample.loss_pct,
                        sample.rtt_last_ms,
                        sample.rtt_avg_ms,
                    );
                }
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        EngineCommand::Ack { device_id, alert_id, reply } => {
                            let _ = reply.send(self.monitor.ack(device_id, alert_id));
                        }
                    }
                }
                _ = self.stop_rx.recv() => {
                    info!("engine stopping");
                    break;
                }
            }
        }

        self.monitor.flush();
    }
}

/// Run one device's probing round: three concurrent echoes, folded into a
/// quantized loss figure and RTT stats.
async fn probe_device(device: Device, tx: mpsc::Sender<TickSample>) {
    let ts = Utc::now();
    let timeout = Duration::from_millis(device.ping_timeout_ms.max(1) as u64);

    let results = match resolve_address(&device.ip).await {
        Ok(ip) => {
            tokio::join!(
                timed_ping(ip, timeout),
                timed_ping(ip, timeout),
                timed_ping(ip, timeout),
            )
        }
        Err(e) => {
            // Resolution failure counts as a fully lost tick.
            debug!(device_id = device.id, ip = %device.ip, error = %e, "resolution failed");
            let now = Instant::now();
            (
                (Err(ProbeError::Unreachable(e.to_string())), now),
                (Err(ProbeError::Unreachable(e.to_string())), now),
                (Err(ProbeError::Unreachable(e.to_string())), now),
            )
        }
    };

    let (loss_pct, rtt_last_ms, rtt_avg_ms) =
        fold_round(vec![results.0, results.1, results.2]);

    let sample = TickSample {
        device,
        ts,
        loss_pct,
        rtt_last_ms,
        rtt_avg_ms,
    };
    if tx.send(sample).await.is_err() {
        debug!("engine gone, dropping sample");
    }
}

async fn timed_ping(
    ip: std::net::IpAddr,
    timeout: Duration,
) -> (Result<Duration, ProbeError>, Instant) {
    let result = ping_once(ip, timeout).await;
    (result, Instant::now())
}

/// Fold one round's probe results. `rtt_last_ms` is the RTT of the success
/// that completed most recently; `rtt_avg_ms` averages all successes.
fn fold_round(
    results: Vec<(Result<Duration, ProbeError>, Instant)>,
) -> (u8, Option<i64>, Option<i64>) {
    let total = results.len();
    let successes: Vec<(Duration, Instant)> = results
        .into_iter()
        .filter_map(|(r, done)| r.ok().map(|rtt| (rtt, done)))
        .collect();

    let loss_pct = quantize_loss(successes.len(), total);
    if successes.is_empty() {
        return (loss_pct, None, None);
    }

    let rtt_last = successes
        .iter()
        .max_by_key(|(_, done)| *done)
        .map(|(rtt, _)| rtt.as_millis() as i64);
    let sum: u128 = successes.iter().map(|(rtt, _)| rtt.as_millis()).sum();
    let rtt_avg = (sum / successes.len() as u128) as i64;

    (loss_pct, rtt_last, Some(rtt_avg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify;
    use tempfile::TempDir;

    #[test]
    fn test_fold_round_all_success() {
        let base = Instant::now();
        let results = vec![
            (Ok(Duration::from_millis(10)), base),
            (Ok(Duration::from_millis(30)), base + Duration::from_millis(5)),
            (Ok(Duration::from_millis(20)), base + Duration::from_millis(2)),
        ];
        let (loss, last, avg) = fold_round(results);
        assert_eq!(loss, 0);
        // Latest completion wins, not the largest RTT.
        assert_eq!(last, Some(30));
        assert_eq!(avg, Some(20));
    }

    #[test]
    fn test_fold_round_partial_and_total_loss() {
        let base = Instant::now();
        let results = vec![
            (Ok(Duration::from_millis(15)), base),
            (Err(ProbeError::Timeout(Duration::from_secs(1))), base),
            (Err(ProbeError::Timeout(Duration::from_secs(1))), base),
        ];
        let (loss, last, avg) = fold_round(results);
        assert_eq!(loss, 66);
        assert_eq!(last, Some(15));
        assert_eq!(avg, Some(15));

        let results = vec![
            (Err(ProbeError::Timeout(Duration::from_secs(1))), base),
            (Err(ProbeError::Timeout(Duration::from_secs(1))), base),
            (Err(ProbeError::Timeout(Duration::from_secs(1))), base),
        ];
        let (loss, last, avg) = fold_round(results);
        assert_eq!(loss, 100);
        assert_eq!(last, None);
        assert_eq!(avg, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_ack_command_and_stop() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        let (tx, _rx) = notify::channel();
        let (engine, handle) = Engine::new(store, Config::default(), tx);

        let task = tokio::spawn(engine.run());

        // No such alert anywhere.
        let outcome = handle.ack(1, 999).await;
        assert_eq!(outcome, Some(AckOutcome::NotFound));

        handle.stop();
        task.await.unwrap();
    }
}
