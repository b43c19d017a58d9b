//! Counter reconciliation background job
//!
//! Each cycle recounts the users queued by partially failed operations plus
//! one batch of a slow sweep over every user, and overwrites counters that
//! drifted from the edge set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::CounterCache;
use crate::config::ReconciliationConfig;
use crate::error::ReconcileError;
use crate::metrics;
use crate::repository::UserDirectory;
use crate::services::{CounterMaintainer, DriftQueue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub corrected: usize,
    pub failed: usize,
}

pub struct ReconciliationWorker {
    maintainer: CounterMaintainer,
    directory: Arc<dyn UserDirectory>,
    drift: DriftQueue,
    cache: Option<CounterCache>,
    interval: Duration,
    sweep_batch: u32,
    /// Last user id visited by the sweep; `None` restarts from the beginning
    sweep_after: Option<Uuid>,
}

impl ReconciliationWorker {
    pub fn new(
        maintainer: CounterMaintainer,
        directory: Arc<dyn UserDirectory>,
        drift: DriftQueue,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            maintainer,
            directory,
            drift,
            cache: None,
            interval: config.interval(),
            sweep_batch: config.sweep_batch,
            sweep_after: None,
        }
    }

    /// Invalidate cached counters of corrected users
    pub fn with_cache(mut self, cache: Option<CounterCache>) -> Self {
        self.cache = cache;
        self
    }

    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            sweep_batch = self.sweep_batch,
            "Starting counter reconciliation background job"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            if report.corrected > 0 || report.failed > 0 {
                tracing::info!(
                    checked = report.checked,
                    corrected = report.corrected,
                    failed = report.failed,
                    "Counter reconciliation cycle finished"
                );
            } else {
                tracing::debug!(checked = report.checked, "Counter reconciliation cycle: OK");
            }
        }
    }

    /// One reconciliation pass: drift queue first, then the next sweep batch.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut seen = HashSet::new();
        let mut users: Vec<Uuid> = self
            .drift
            .drain()
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        users.extend(
            self.next_sweep_batch()
                .await
                .into_iter()
                .filter(|id| seen.insert(*id)),
        );

        let mut report = CycleReport::default();
        let mut corrected_users = Vec::new();

        for user_id in users {
            match self.maintainer.recompute_counters(user_id).await {
                Ok(result) => {
                    report.checked += 1;
                    if result.corrected() {
                        report.corrected += 1;
                        corrected_users.push(user_id);
                        metrics::record_reconciliation("corrected", result.drift());
                    } else {
                        metrics::record_reconciliation("unchanged", 0);
                    }
                }
                Err(ReconcileError::UnknownUser(id)) => {
                    tracing::debug!(
                        user = %id,
                        "Skipping reconciliation for user without counters"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::record_reconciliation("failed", 0);
                    tracing::warn!(
                        user = %user_id,
                        error = %e,
                        "Counter reconciliation failed; re-queued"
                    );
                    self.drift.mark(&[user_id]);
                }
            }
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate(&corrected_users).await {
                tracing::warn!(error = %e, "Failed to invalidate reconciled counters in Redis");
            }
        }

        report
    }

    async fn next_sweep_batch(&mut self) -> Vec<Uuid> {
        match self
            .directory
            .list_user_ids(self.sweep_after, self.sweep_batch)
            .await
        {
            Ok(ids) => {
                // a short batch means the sweep reached the end
                self.sweep_after = if ids.len() < self.sweep_batch as usize {
                    None
                } else {
                    ids.last().copied()
                };
                ids
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list users for reconciliation sweep");
                Vec::new()
            }
        }
    }
}
