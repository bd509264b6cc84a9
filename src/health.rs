//! Connection health state machine shared by both ends of a connection.
//!
//! A single failure report wins the `Connected -> Reconnecting` transition
//! and runs the recovery; every concurrent report waits for that recovery and
//! observes its outcome. A failed recovery stops the connection and the
//! monitor terminates for good.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{config::ForwarderConfig, transport::TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Connection lifecycle as seen by the monitor.
pub enum HealthState {
    /// Usable.
    Connected,
    /// One caller is running recovery.
    Reconnecting,
    /// Recovery failed; the connection is being stopped.
    Failed,
    /// Absorbing.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Outcome of a failure report or admission on a dead monitor.
pub enum MonitorError {
    /// The monitor was already terminated.
    #[error("connection monitor terminated")]
    Terminated,
    /// Recovery failed; carries the reporter's original error.
    #[error("connection failed: {0}")]
    Failed(TransportError),
}

/// Callbacks the monitor drives.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    /// Cheap round trip proving the peer is alive.
    async fn check_alive(&self) -> Result<(), TransportError>;
    /// Re-establishes the connection after an I/O failure.
    async fn reconnect(&self) -> Result<(), TransportError>;
    /// Tears the connection down. Failures are logged, never propagated.
    async fn stop(&self) -> Result<(), TransportError>;
}

struct Admission {
    in_flight: usize,
    idle_since: Instant,
}

/// Recovery arbiter and idle/liveness watchdog for one connection.
pub struct HealthMonitor {
    state: watch::Sender<HealthState>,
    probe: Arc<dyn ConnectionProbe>,
    admission: Mutex<Admission>,
    probe_period: Duration,
    idle_timeout: Option<Duration>,
}

impl HealthMonitor {
    /// Creates a connected monitor.
    ///
    /// `idle_timeout` of `None` disables the idle stop.
    pub fn new(probe: Arc<dyn ConnectionProbe>, probe_period: Duration, idle_timeout: Option<Duration>) -> Arc<Self> {
        let (state, _) = watch::channel(HealthState::Connected);
        Arc::new(Self {
            state,
            probe,
            admission: Mutex::new(Admission {
                in_flight: 0,
                idle_since: Instant::now(),
            }),
            probe_period,
            idle_timeout,
        })
    }

    /// Builds a monitor from the `connection.*` settings of `config`.
    pub fn from_config(probe: Arc<dyn ConnectionProbe>, config: &ForwarderConfig) -> Arc<Self> {
        Self::new(probe, config.probe_period(), config.idle_timeout())
    }

    /// Current state.
    pub fn state(&self) -> HealthState {
        *self.state.borrow()
    }

    /// True once terminated.
    pub fn is_terminated(&self) -> bool {
        self.state() == HealthState::Terminated
    }

    /// Routes an I/O failure through recovery.
    ///
    /// Returns `Ok` once the connection is usable again, whether this call or
    /// a concurrent one performed the recovery.
    pub async fn report_failure(&self, err: TransportError) -> Result<(), MonitorError> {
        let won = self.state.send_if_modified(|s| {
            if *s == HealthState::Connected {
                *s = HealthState::Reconnecting;
                true
            } else {
                false
            }
        });

        if !won {
            let mut rx = self.state.subscribe();
            let current = *rx.borrow_and_update();
            return match current {
                HealthState::Terminated => Err(MonitorError::Terminated),
                HealthState::Failed => Err(MonitorError::Failed(err)),
                HealthState::Connected => Ok(()),
                HealthState::Reconnecting => match wait_settled(&mut rx).await {
                    Some(HealthState::Connected) => Ok(()),
                    _ => Err(MonitorError::Failed(err)),
                },
            };
        }

        warn!(%err, "connection failure, attempting recovery");
        match self.probe.reconnect().await {
            Ok(()) => {
                if self.settle(HealthState::Connected) {
                    info!("connection recovered");
                    Ok(())
                } else {
                    Err(MonitorError::Terminated)
                }
            }
            Err(recovery_err) => {
                error!(%err, %recovery_err, "connection recovery failed");
                self.settle(HealthState::Failed);
                if let Err(stop_err) = self.probe.stop().await {
                    warn!(%stop_err, "error while stopping failed connection");
                }
                self.terminate();
                Err(MonitorError::Failed(err))
            }
        }
    }

    /// Moves to the absorbing state. Returns true on the first call.
    pub fn terminate(&self) -> bool {
        let prev = self.state.send_replace(HealthState::Terminated);
        if prev != HealthState::Terminated {
            debug!(?prev, "connection monitor terminated");
            true
        } else {
            false
        }
    }

    /// Admits one request; the guard marks the response on drop.
    pub fn begin_request(self: &Arc<Self>) -> Result<RequestGuard, MonitorError> {
        if self.is_terminated() {
            return Err(MonitorError::Terminated);
        }
        self.request_incoming();
        Ok(RequestGuard {
            monitor: Arc::clone(self),
        })
    }

    /// Counts one request as in flight.
    pub fn request_incoming(&self) {
        self.admission.lock().in_flight += 1;
    }

    /// Counts one response; the last one restarts the idle clock.
    pub fn response_outgoing(&self) {
        let mut adm = self.admission.lock();
        adm.in_flight = adm.in_flight.saturating_sub(1);
        if adm.in_flight == 0 {
            adm.idle_since = Instant::now();
        }
    }

    /// Requests admitted and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.admission.lock().in_flight
    }

    fn idle_expired(&self) -> bool {
        let Some(limit) = self.idle_timeout else {
            return false;
        };
        let adm = self.admission.lock();
        adm.in_flight == 0 && adm.idle_since.elapsed() > limit
    }

    /// Starts the periodic liveness probe on the current runtime.
    pub fn spawn_probe(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run_probe().await })
    }

    async fn run_probe(&self) {
        let mut rx = self.state.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.probe_period) => {}
                _ = wait_terminated(&mut rx) => break,
            }
            if self.is_terminated() {
                break;
            }

            match self.probe.check_alive().await {
                Ok(()) => {
                    if self.idle_expired() {
                        info!(timeout = ?self.idle_timeout, "connection idle, stopping");
                        if let Err(err) = self.probe.stop().await {
                            warn!(%err, "error while stopping idle connection");
                        }
                        self.terminate();
                        break;
                    }
                }
                Err(TransportError::Terminated) => {
                    self.terminate();
                    break;
                }
                Err(err) if err.is_io() => {
                    if self.report_failure(err).await.is_err() {
                        break;
                    }
                }
                Err(err) => debug!(%err, "liveness probe rejected"),
            }
        }
        debug!("liveness probe stopped");
    }

    // Leaves `Reconnecting` unless something else already terminated us.
    fn settle(&self, to: HealthState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == HealthState::Reconnecting {
                *s = to;
                true
            } else {
                false
            }
        })
    }
}

/// Marks a request's response when dropped.
pub struct RequestGuard {
    monitor: Arc<HealthMonitor>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.monitor.response_outgoing();
    }
}

async fn wait_settled(rx: &mut watch::Receiver<HealthState>) -> Option<HealthState> {
    rx.wait_for(|s| *s != HealthState::Reconnecting)
        .await
        .ok()
        .map(|s| *s)
}

async fn wait_terminated(rx: &mut watch::Receiver<HealthState>) {
    let _ = rx.wait_for(|s| *s == HealthState::Terminated).await;
}
