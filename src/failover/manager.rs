// src/failover/manager.rs

//! The failover driving loop.
//!
//! Candidate hosts are tried in subnet-configured order. Each host advances
//! through the verification stages in [`super::state`], with per-stage
//! retry budgets and a delayed reconnect after any stage error. Probe steps
//! run as spawned tasks reporting into a bounded event queue; the loop
//! polls that queue with a timeout so the wall-clock deadline is honored
//! even when no events arrive.

use super::probe::{ProbeSession, Prober};
use super::state::{HostStatus, ProgressTracker, VerificationState};
use crate::config::{FailoverConfig, HostInfo};
use crate::core::FabricError;
use crate::core::events::EventBus;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the per-host probe event queue.
const PROBE_QUEUE_CAPACITY: usize = 16;

/// The winning host of a completed failover.
#[derive(Debug, Clone)]
pub struct FailoverOutcome {
    /// Index of the new active host in the subnet's host list.
    pub host_index: usize,
    /// SM identities observed on the winner; they seed the correct-subnet
    /// check of the next failover.
    pub sm_identities: Vec<u64>,
}

/// One completed probe step, delivered to the driving loop. Events carry
/// the session so the next step can be issued against it.
enum ProbeEvent {
    Connected(Result<Box<dyn ProbeSession>, FabricError>),
    SmChecked(Box<dyn ProbeSession>, Result<Vec<u64>, FabricError>),
    PmChecked(Box<dyn ProbeSession>, Result<(), FabricError>),
    CapacityChecked(Result<(), FabricError>),
    /// The retry delay elapsed; reconnect.
    RetryReady,
}

/// The stage a probe error is charged against.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Connect,
    SmList,
    Pm,
}

/// Why one candidate host's probe loop ended without a winner.
enum ProbeEnd {
    HostExhausted,
    DeadlineExceeded,
}

/// Runs one failover: finds a replacement host or reports that none of the
/// candidates is usable.
pub struct FailoverManager {
    config: FailoverConfig,
    prober: Arc<dyn Prober>,
    events: Arc<EventBus>,
    /// SM identities observed before connectivity was lost. Empty on the
    /// first connection ever, which makes any subnet automatically correct.
    known_sms: Vec<u64>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        prober: Arc<dyn Prober>,
        events: Arc<EventBus>,
        known_sms: Vec<u64>,
    ) -> Self {
        Self {
            config,
            prober,
            events,
            known_sms,
        }
    }

    /// Tries every candidate in order until one verifies fully. Exactly one
    /// terminal progress report (100) is emitted, whatever the outcome.
    pub async fn run(
        self,
        candidates: Vec<(usize, HostInfo)>,
    ) -> Result<FailoverOutcome, FabricError> {
        let deadline = Instant::now() + self.config.deadline;
        let total = candidates.len();
        let mut progress = ProgressTracker::new(self.events.clone());

        if candidates.is_empty() {
            progress.finish("failover failed: no candidate hosts");
            return Err(FabricError::FailoverFailed("no candidate hosts".into()));
        }
        info!("Failover started with {total} candidate host(s)");

        for (ordinal, (host_index, host)) in candidates.into_iter().enumerate() {
            let mut status = HostStatus::new(ordinal, host_index, host, &self.config);
            progress.report(
                status.percent(),
                format!(
                    "probing {} ({}/{})",
                    status.host.endpoint(),
                    ordinal + 1,
                    total
                ),
            );

            match self.probe_host(&mut status, &mut progress, deadline).await {
                Ok(sm_identities) => {
                    progress.finish(format!(
                        "failover complete: active host is now {}",
                        status.host.endpoint()
                    ));
                    return Ok(FailoverOutcome {
                        host_index,
                        sm_identities,
                    });
                }
                Err(ProbeEnd::HostExhausted) => {
                    warn!(
                        "Failover: candidate {} eliminated: {}",
                        status.host.endpoint(),
                        status
                            .last_error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown error".into())
                    );
                }
                Err(ProbeEnd::DeadlineExceeded) => {
                    progress.finish("failover failed: deadline exceeded");
                    return Err(FabricError::FailoverFailed(format!(
                        "deadline of {:?} exceeded",
                        self.config.deadline
                    )));
                }
            }
        }

        progress.finish("failover failed: all candidate hosts exhausted");
        Err(FabricError::FailoverFailed(
            "all candidate hosts exhausted".into(),
        ))
    }

    /// Drives one host through its verification stages. Returns the SM
    /// identities observed on success.
    async fn probe_host(
        &self,
        status: &mut HostStatus,
        progress: &mut ProgressTracker,
        deadline: Instant,
    ) -> Result<Vec<u64>, ProbeEnd> {
        let (tx, mut rx) = mpsc::channel::<ProbeEvent>(PROBE_QUEUE_CAPACITY);
        self.start_connect(status.host.clone(), tx.clone());
        let mut sm_identities = Vec::new();

        loop {
            // Poll with a timeout so the deadline is checked even when no
            // probe events arrive.
            let event = match tokio::time::timeout_at(
                Instant::now() + self.config.poll_interval,
                rx.recv(),
            )
            .await
            {
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(ProbeEnd::DeadlineExceeded);
                    }
                    continue;
                }
                Ok(None) => {
                    status.last_error = Some(FabricError::Internal(
                        "probe event queue closed unexpectedly".into(),
                    ));
                    status.state = VerificationState::Unsuccessful;
                    return Err(ProbeEnd::HostExhausted);
                }
                Ok(Some(event)) => event,
            };
            if Instant::now() >= deadline {
                return Err(ProbeEnd::DeadlineExceeded);
            }

            match event {
                ProbeEvent::Connected(Ok(session)) => {
                    status.state = VerificationState::Connected;
                    progress.report(
                        status.percent(),
                        format!("connected to {}", status.host.endpoint()),
                    );
                    self.start_sm_check(session, tx.clone());
                }
                ProbeEvent::Connected(Err(e)) => {
                    self.stage_failed(status, progress, Stage::Connect, e, &tx)?;
                }

                ProbeEvent::SmChecked(session, Ok(sms)) => {
                    if !self.correct_subnet(&sms) {
                        let cause = FabricError::FailoverFailed(format!(
                            "{} serves a different subnet",
                            status.host.endpoint()
                        ));
                        self.stage_failed(status, progress, Stage::SmList, cause, &tx)?;
                        continue;
                    }
                    sm_identities = sms;
                    status.state = VerificationState::SmListChecked;
                    progress.report(
                        status.percent(),
                        format!("subnet verified on {}", status.host.endpoint()),
                    );
                    self.start_pm_check(session, tx.clone());
                }
                ProbeEvent::SmChecked(_, Err(e)) => {
                    self.stage_failed(status, progress, Stage::SmList, e, &tx)?;
                }

                ProbeEvent::PmChecked(session, Ok(())) => {
                    status.state = VerificationState::PmChecked;
                    progress.report(
                        status.percent(),
                        format!("performance manager verified on {}", status.host.endpoint()),
                    );
                    // The probe session has served its purpose; capacity is
                    // verified with fresh simultaneous connections.
                    drop(session);
                    self.start_capacity_check(status.host.clone(), tx.clone());
                }
                ProbeEvent::PmChecked(_, Err(e)) => {
                    self.stage_failed(status, progress, Stage::Pm, e, &tx)?;
                }

                ProbeEvent::CapacityChecked(Ok(())) => {
                    status.state = VerificationState::Successful;
                    return Ok(sm_identities);
                }
                ProbeEvent::CapacityChecked(Err(e)) => {
                    warn!(
                        "Failover: {} failed the capacity check: {}",
                        status.host.endpoint(),
                        e
                    );
                    status.last_error = Some(e);
                    status.state = VerificationState::Unsuccessful;
                    return Err(ProbeEnd::HostExhausted);
                }

                ProbeEvent::RetryReady => {
                    self.start_connect(status.host.clone(), tx.clone());
                }
            }
        }
    }

    /// Charges a stage error against its retry budget. Any stage error
    /// invalidates the probe session, so the state resets to `NotConnected`
    /// and the retry reconnects from scratch.
    fn stage_failed(
        &self,
        status: &mut HostStatus,
        progress: &mut ProgressTracker,
        stage: Stage,
        cause: FabricError,
        tx: &mpsc::Sender<ProbeEvent>,
    ) -> Result<(), ProbeEnd> {
        debug!(
            "Failover: {} failed its {:?} stage (state {}): {}",
            status.host.endpoint(),
            stage,
            status.state,
            cause
        );
        status.last_error = Some(cause);
        status.state = VerificationState::NotConnected;

        let exhausted = match stage {
            Stage::Connect => {
                status.connect_attempts += 1;
                status.connect_attempts >= self.config.connect_retries.max(1)
            }
            Stage::SmList => {
                status.sm_attempts += 1;
                status.sm_attempts >= self.config.sm_list_retries.max(1)
            }
            Stage::Pm => {
                status.pm_attempts += 1;
                status.pm_attempts >= self.config.pm_retries.max(1)
            }
        };
        if exhausted {
            status.state = VerificationState::Unsuccessful;
            return Err(ProbeEnd::HostExhausted);
        }

        progress.report(
            status.percent(),
            format!("retrying {} after {:?} failure", status.host.endpoint(), stage),
        );
        // Up to 25% jitter so retries against a recovering host spread out.
        let base = self.config.retry_delay;
        let jitter_ms = SmallRng::from_entropy().gen_range(0..=base.as_millis() as u64 / 4);
        let delay = base + std::time::Duration::from_millis(jitter_ms);
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ProbeEvent::RetryReady).await;
        });
        Ok(())
    }

    /// An empty known set is automatically correct (first connection ever);
    /// otherwise at least one observed SM identity must already be known.
    fn correct_subnet(&self, observed: &[u64]) -> bool {
        self.known_sms.is_empty() || observed.iter().any(|id| self.known_sms.contains(id))
    }

    fn start_connect(&self, host: HostInfo, tx: mpsc::Sender<ProbeEvent>) {
        let prober = self.prober.clone();
        tokio::spawn(async move {
            let result = prober.open(&host).await;
            let _ = tx.send(ProbeEvent::Connected(result)).await;
        });
    }

    fn start_sm_check(&self, mut session: Box<dyn ProbeSession>, tx: mpsc::Sender<ProbeEvent>) {
        tokio::spawn(async move {
            let result = session.sm_identities().await;
            let _ = tx.send(ProbeEvent::SmChecked(session, result)).await;
        });
    }

    fn start_pm_check(&self, mut session: Box<dyn ProbeSession>, tx: mpsc::Sender<ProbeEvent>) {
        tokio::spawn(async move {
            let result = session.check_pm().await;
            let _ = tx.send(ProbeEvent::PmChecked(session, result)).await;
        });
    }

    fn start_capacity_check(&self, host: HostInfo, tx: mpsc::Sender<ProbeEvent>) {
        let prober = self.prober.clone();
        let count = self.config.min_connections;
        tokio::spawn(async move {
            let result = prober.verify_capacity(&host, count).await;
            let _ = tx.send(ProbeEvent::CapacityChecked(result)).await;
        });
    }
}
