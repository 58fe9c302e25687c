use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use trakx_core::clock::Clock;
use trakx_core::error::TrackerError;
use trakx_core::types::LockStatus;

use crate::provider::{AcquireOutcome, LockProvider};

/// Redlock-style acquisition over N independent nodes.
///
/// The reservation counts only when a majority of nodes granted it and the
/// acquisition round finished with validity left on the TTL after the
/// clock-drift allowance. Anything less releases the partial grants and
/// reports `NoQuorum` (or `Conflicted` when no node granted at all).
pub struct QuorumLockProvider {
    nodes: Vec<Arc<dyn LockProvider>>,
    clock: Arc<dyn Clock>,
    drift_factor: f64,
    monitors: Mutex<HashMap<String, CancellationToken>>,
}

impl QuorumLockProvider {
    pub fn new(nodes: Vec<Arc<dyn LockProvider>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes,
            clock,
            drift_factor: 0.01,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_drift_factor(mut self, drift_factor: f64) -> Self {
        self.drift_factor = drift_factor;
        self
    }

    fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    fn drift_allowance(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + Duration::from_millis(2)
    }

    /// Merges member lost signals: the first member to drop its grant makes
    /// the quorum unguaranteed.
    fn spawn_merge(
        &self,
        members: Vec<watch::Receiver<bool>>,
        lost_tx: watch::Sender<bool>,
        stop: CancellationToken,
    ) {
        if members.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let waits = members.into_iter().map(|mut rx| {
                Box::pin(async move {
                    loop {
                        if *rx.borrow() {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                })
            });
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = futures::future::select_all(waits) => {
                    let _ = lost_tx.send(true);
                }
            }
        });
    }
}

#[async_trait]
impl LockProvider for QuorumLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, TrackerError> {
        let started = self.clock.now();
        let outcomes = join_all(
            self.nodes
                .iter()
                .map(|node| node.try_acquire(resource, id, ttl)),
        )
        .await;

        let mut granted = Vec::new();
        let mut member_lost = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            // A node that errored simply does not count towards the majority.
            if let Ok(outcome) = outcome {
                if outcome.status == LockStatus::Acquired {
                    granted.push(index);
                    if let Some(rx) = outcome.lost {
                        member_lost.push(rx);
                    }
                }
            }
        }

        let elapsed = (self.clock.now() - started)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let validity_left = elapsed + self.drift_allowance(ttl) < ttl;

        if granted.len() >= self.majority() && validity_left {
            let (lost_tx, lost_rx) = watch::channel(false);
            let stop = CancellationToken::new();
            self.monitors
                .lock()
                .unwrap()
                .insert(format!("{resource}\u{0}{id}"), stop.clone());
            self.spawn_merge(member_lost, lost_tx, stop);
            return Ok(AcquireOutcome::acquired(lost_rx));
        }

        // Majority failed: give back what was taken so the losers do not
        // block the current holder's competitors for a whole TTL.
        join_all(
            granted
                .iter()
                .map(|&index| self.nodes[index].release(resource, id)),
        )
        .await;

        let status = if granted.is_empty() {
            LockStatus::Conflicted
        } else {
            LockStatus::NoQuorum
        };
        Ok(AcquireOutcome::unavailable(status))
    }

    async fn release(&self, resource: &str, id: &str) -> Result<(), TrackerError> {
        if let Some(stop) = self
            .monitors
            .lock()
            .unwrap()
            .remove(&format!("{resource}\u{0}{id}"))
        {
            stop.cancel();
        }
        let results = join_all(self.nodes.iter().map(|node| node.release(resource, id))).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}
