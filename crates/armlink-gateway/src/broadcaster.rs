//! [`TelemetryBroadcaster`] – the polling loop that fans actuator state out
//! to every connected client.
//!
//! Each cycle:
//!
//! 1. Reads the shared [`ReachabilityState`] and broadcasts `True`/`False`
//!    when it differs from the last value sent.
//! 2. Samples joints, pose and the optional digital signal through the
//!    [`ArmHandle`], formats the telemetry line and broadcasts it when it
//!    differs byte-for-byte from the last line sent.
//!
//! The two tracks are de-duplicated independently.  Both "last sent" values
//! live in a [`TelemetryCache`] shared with the accept loop so that a client
//! admitted between two cycles first receives the current state and then
//! every later change, with nothing missed in between.
//!
//! [`ReachabilityState`]: armlink_hal::ReachabilityState

use std::sync::Arc;
use std::time::Duration;

use armlink_hal::ArmHandle;
use armlink_types::reachability_line;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{BroadcastReport, ClientConnection, ConnectionRegistry};

// ────────────────────────────────────────────────────────────────────────────
// TelemetryCache
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LastSent {
    reachable: Option<bool>,
    telemetry: Option<String>,
}

/// Last reachability value and telemetry line put on the wire.
///
/// Broadcasts and admissions both run under the cache lock, so membership
/// changes and "last sent" updates are observed in one order by everyone.
#[derive(Debug, Default)]
pub struct TelemetryCache {
    last: Mutex<LastSent>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send the cached lines to `conn`, then register it for broadcasts.
    ///
    /// A connection that fails this first write is never registered.
    pub async fn admit(&self, registry: &ConnectionRegistry, conn: Arc<ClientConnection>) -> bool {
        let last = self.last.lock().await;
        let mut greeting = String::new();
        if let Some(reachable) = last.reachable {
            greeting.push_str(reachability_line(reachable));
            greeting.push('\n');
        }
        if let Some(line) = &last.telemetry {
            greeting.push_str(line);
            greeting.push('\n');
        }
        if !greeting.is_empty()
            && let Err(e) = conn.send(greeting.as_bytes(), registry.write_timeout()).await
        {
            warn!(conn_id = %conn.id(), error = %e, "client dropped before admission");
            return false;
        }
        registry.add(conn);
        true
    }

    pub async fn last_reachability(&self) -> Option<bool> {
        self.last.lock().await.reachable
    }

    pub async fn last_telemetry(&self) -> Option<String> {
        self.last.lock().await.telemetry.clone()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TelemetryBroadcaster
// ────────────────────────────────────────────────────────────────────────────

/// What one [`TelemetryBroadcaster::cycle`] put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Delivery of the reachability line, if it changed this cycle.
    pub reachability: Option<BroadcastReport>,
    /// Delivery of the telemetry line, if it changed this cycle.
    pub telemetry: Option<BroadcastReport>,
    /// The actuator could not be sampled this cycle.
    pub sample_failed: bool,
}

pub struct TelemetryBroadcaster {
    arm: ArmHandle,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<TelemetryCache>,
    cycle_delay: Duration,
    signal: Option<u32>,
    failing: bool,
}

impl TelemetryBroadcaster {
    pub fn new(arm: ArmHandle, registry: Arc<ConnectionRegistry>, cache: Arc<TelemetryCache>) -> Self {
        Self {
            arm,
            registry,
            cache,
            cycle_delay: Duration::ZERO,
            signal: None,
            failing: false,
        }
    }

    /// Pause between cycles.  Zero polls as fast as the actuator answers.
    pub fn with_cycle_delay(mut self, delay: Duration) -> Self {
        self.cycle_delay = delay;
        self
    }

    /// Append digital output `index` to every telemetry line.
    pub fn with_signal(mut self, index: Option<u32>) -> Self {
        self.signal = index;
        self
    }

    /// Run one `Sampling → DiffCheck → (Broadcast | Skip)` pass.
    pub async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let reachable = self.arm.reachability().get();
        let sample = self.arm.sample(self.signal).await;

        let mut last = self.cache.last.lock().await;

        if last.reachable != Some(reachable) {
            let payload = format!("{}\n", reachability_line(reachable));
            report.reachability = Some(self.registry.broadcast_all(&payload).await);
            last.reachable = Some(reachable);
            debug!(reachable, "reachability change broadcast");
        }

        match sample {
            Ok(frame) => {
                if self.failing {
                    info!("actuator sampling recovered");
                    self.failing = false;
                }
                let line = frame.to_line();
                if last.telemetry.as_deref() != Some(line.as_str()) {
                    let payload = format!("{line}\n");
                    report.telemetry = Some(self.registry.broadcast_all(&payload).await);
                    last.telemetry = Some(line);
                }
            }
            Err(e) => {
                report.sample_failed = true;
                if self.failing {
                    debug!(error = %e, "actuator sampling still failing");
                } else {
                    warn!(error = %e, "actuator sampling failed; telemetry paused");
                    self.failing = true;
                }
            }
        }

        report
    }

    /// Loop until `cancel` fires.  Cancellation is observed at the delay
    /// boundary; a broadcast already under way completes first.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            delay_ms = self.cycle_delay.as_millis() as u64,
            signal = ?self.signal,
            "telemetry broadcaster started"
        );
        loop {
            self.cycle().await;
            if self.cycle_delay.is_zero() {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.cycle_delay) => {}
                }
            }
        }
        info!("telemetry broadcaster stopped");
    }
}
