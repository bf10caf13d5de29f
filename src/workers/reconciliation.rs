use crate::database::repository::TransactionStore;
use crate::database::transaction::{PaymentTransaction, TransactionState};
use crate::error::{LifecycleError, LifecycleResult};
use crate::services::payment_lifecycle::{PaymentLifecycleManager, NO_RESPONSE_RECEIVED};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often the worker wakes up.
    pub poll_interval: Duration,
    /// Minimum age of a submission before it is queried; callbacks normally
    /// arrive well inside this.
    pub query_grace: Duration,
    /// Maximum number of records queried per cycle.
    pub batch_size: usize,
    /// Pause between provider queries.
    pub inter_item_delay: Duration,
    /// Maximum number of records expired per cycle.
    pub expiry_batch_size: usize,
    pub stats_interval: Duration,
    /// Look-back covered by each statistics report.
    pub stats_window: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120),
            query_grace: Duration::from_secs(30),
            batch_size: 50,
            inter_item_delay: Duration::from_millis(500),
            expiry_batch_size: 200,
            stats_interval: Duration::from_secs(86400),
            stats_window: Duration::from_secs(86400),
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            std::env::var("RECON_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.query_grace = Duration::from_secs(
            std::env::var("RECON_QUERY_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.query_grace.as_secs()),
        );
        cfg.batch_size = std::env::var("RECON_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(cfg.batch_size);
        cfg.inter_item_delay = Duration::from_millis(
            std::env::var("RECON_INTER_ITEM_DELAY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(500),
        );
        cfg.expiry_batch_size = std::env::var("RECON_EXPIRY_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(cfg.expiry_batch_size);
        cfg.stats_interval = Duration::from_secs(
            std::env::var("RECON_STATS_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.stats_interval.as_secs()),
        );
        cfg.stats_window = Duration::from_secs(
            std::env::var("RECON_STATS_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.stats_window.as_secs()),
        );
        cfg
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPassReport {
    pub queried: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_processing: usize,
    /// Provider unreachable; records left untouched
    pub transport_errors: usize,
    pub other_errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTotals {
    pub count: u64,
    pub amount: i64,
}

impl StateTotals {
    fn add(&mut self, amount: i64) {
        self.count += 1;
        self.amount = self.amount.saturating_add(amount);
    }
}

/// Informational aggregate over records created in a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub completed: StateTotals,
    pub failed: StateTotals,
    pub expired: StateTotals,
    pub pending: u64,
    pub recovered_via_query: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub query: QueryPassReport,
    pub expired: usize,
    pub stats: Option<ReconciliationStats>,
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// AWAITING records old enough to query and still inside their deadline.
pub fn select_query_candidates(
    now: DateTime<Utc>,
    grace: Duration,
    records: &[PaymentTransaction],
) -> Vec<&PaymentTransaction> {
    let cutoff = now - to_chrono(grace);
    records
        .iter()
        .filter(|tx| tx.state == TransactionState::AwaitingConfirmation)
        .filter(|tx| tx.submitted_at.is_some_and(|at| at <= cutoff))
        .filter(|tx| !tx.is_past_deadline(now))
        .collect()
}

/// Non-terminal records whose deadline has passed. Includes CREATED records
/// orphaned before their submission completed.
pub fn select_expired(now: DateTime<Utc>, records: &[PaymentTransaction]) -> Vec<&PaymentTransaction> {
    records
        .iter()
        .filter(|tx| !tx.is_terminal() && tx.is_past_deadline(now))
        .collect()
}

pub fn compute_stats(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    records: &[PaymentTransaction],
) -> ReconciliationStats {
    let mut stats = ReconciliationStats {
        window_start,
        window_end,
        completed: StateTotals::default(),
        failed: StateTotals::default(),
        expired: StateTotals::default(),
        pending: 0,
        recovered_via_query: 0,
    };

    for tx in records
        .iter()
        .filter(|tx| tx.created_at >= window_start && tx.created_at < window_end)
    {
        match tx.state {
            TransactionState::Completed => {
                stats.completed.add(tx.amount);
                if tx.recovered_via_query {
                    stats.recovered_via_query += 1;
                }
            }
            TransactionState::Failed => stats.failed.add(tx.amount),
            TransactionState::Expired => stats.expired.add(tx.amount),
            TransactionState::Created | TransactionState::AwaitingConfirmation => {
                stats.pending += 1
            }
        }
    }
    stats
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ReconciliationWorker {
    store: Arc<dyn TransactionStore>,
    lifecycle: Arc<PaymentLifecycleManager>,
    config: ReconciliationConfig,
    last_stats_at: Option<DateTime<Utc>>,
}

impl ReconciliationWorker {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        lifecycle: Arc<PaymentLifecycleManager>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            config,
            last_stats_at: None,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            query_grace_secs = self.config.query_grace.as_secs(),
            batch_size = self.config.batch_size,
            stats_interval_secs = self.config.stats_interval.as_secs(),
            "payment reconciliation worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment reconciliation worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle_at(Utc::now()).await {
                        warn!(error = %e, "reconciliation cycle failed");
                    }
                }
            }
        }

        info!("payment reconciliation worker stopped");
    }

    /// One full cycle. The expiry pass runs even when the query pass fails so
    /// deadlines never depend on the provider or on query bookkeeping.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> anyhow::Result<CycleReport> {
        let query = match self.run_query_pass(now).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "active query pass failed");
                QueryPassReport::default()
            }
        };
        let expired = self.run_expiry_pass(now).await?;
        let stats = self.maybe_run_stats_pass(now).await?;

        if query.queried > 0 || expired > 0 {
            info!(
                queried = query.queried,
                completed = query.completed,
                failed = query.failed,
                still_processing = query.still_processing,
                transport_errors = query.transport_errors,
                expired,
                "reconciliation cycle complete"
            );
        }

        Ok(CycleReport {
            query,
            expired,
            stats,
        })
    }

    // -----------------------------------------------------------------------
    // Active-query pass
    // -----------------------------------------------------------------------

    pub async fn run_query_pass(&self, now: DateTime<Utc>) -> LifecycleResult<QueryPassReport> {
        let submitted_before = now - to_chrono(self.config.query_grace);
        let awaiting = self
            .store
            .list_awaiting_submitted_before(submitted_before, now, self.config.batch_size)
            .await?;
        let candidates = select_query_candidates(now, self.config.query_grace, &awaiting);

        let mut report = QueryPassReport::default();
        for (index, tx) in candidates.into_iter().enumerate() {
            if index > 0 && !self.config.inter_item_delay.is_zero() {
                tokio::time::sleep(self.config.inter_item_delay).await;
            }
            report.queried += 1;

            match self.lifecycle.reconcile_with_query(tx.clone(), now).await {
                Ok(updated) => match updated.state {
                    TransactionState::Completed => report.completed += 1,
                    TransactionState::Failed => report.failed += 1,
                    TransactionState::AwaitingConfirmation => report.still_processing += 1,
                    _ => {}
                },
                Err(LifecycleError::Transport { source, .. }) => {
                    report.transport_errors += 1;
                    warn!(
                        transaction_id = %tx.id,
                        error = %source,
                        "status query failed; transaction left unchanged"
                    );
                }
                Err(e) => {
                    report.other_errors += 1;
                    warn!(transaction_id = %tx.id, error = %e, "status query could not be applied");
                }
            }
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Expiry pass
    // -----------------------------------------------------------------------

    pub async fn run_expiry_pass(&self, now: DateTime<Utc>) -> LifecycleResult<usize> {
        let candidates = self
            .store
            .list_expired_candidates(now, self.config.expiry_batch_size)
            .await?;

        let mut expired = 0;
        for tx in select_expired(now, &candidates) {
            match self
                .lifecycle
                .expire_transaction(tx, NO_RESPONSE_RECEIVED, now)
                .await
            {
                Ok(Some(saved)) => {
                    expired += 1;
                    info!(
                        transaction_id = %saved.id,
                        expires_at = %saved.expires_at,
                        previous_state = ?saved.previous_state,
                        "transaction expired without a response"
                    );
                }
                Ok(None) => debug!(transaction_id = %tx.id, "expiry lost to concurrent transition"),
                Err(e) => warn!(transaction_id = %tx.id, error = %e, "failed to expire transaction"),
            }
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Statistics pass
    // -----------------------------------------------------------------------

    async fn maybe_run_stats_pass(
        &mut self,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Option<ReconciliationStats>> {
        let due = match self.last_stats_at {
            Some(last) => now - last >= to_chrono(self.config.stats_interval),
            None => true,
        };
        if !due {
            return Ok(None);
        }
        let stats = self.run_stats_pass(now).await?;
        self.last_stats_at = Some(now);
        Ok(Some(stats))
    }

    /// Read-only; never changes transaction state.
    pub async fn run_stats_pass(&self, now: DateTime<Utc>) -> LifecycleResult<ReconciliationStats> {
        let window_start = now - to_chrono(self.config.stats_window);
        let records = self.store.list_created_between(window_start, now).await?;
        let stats = compute_stats(window_start, now, &records);

        info!(
            window_start = %stats.window_start,
            completed = stats.completed.count,
            completed_amount = stats.completed.amount,
            failed = stats.failed.count,
            failed_amount = stats.failed.amount,
            expired = stats.expired.count,
            expired_amount = stats.expired.amount,
            pending = stats.pending,
            recovered_via_query = stats.recovered_via_query,
            "payment reconciliation statistics"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::transaction::NewTransaction;

    fn record(now: DateTime<Utc>, amount: i64) -> PaymentTransaction {
        PaymentTransaction::new(
            NewTransaction {
                idempotency_key: uuid::Uuid::new_v4().to_string(),
                tenant_id: "t".to_string(),
                order_id: "o".to_string(),
                order_reference: "o".to_string(),
                phone_number: "254708374149".to_string(),
                amount,
                description: "d".to_string(),
                max_retries: 3,
                retry_count: 0,
                retry_of: None,
            },
            now,
            chrono::Duration::minutes(5),
        )
    }

    fn awaiting(created: DateTime<Utc>) -> PaymentTransaction {
        let mut tx = record(created, 100)
            .transitioned(TransactionState::AwaitingConfirmation, created)
            .unwrap();
        tx.submitted_at = Some(created);
        tx
    }

    #[test]
    fn query_candidates_respect_grace_and_deadline() {
        let now = Utc::now();
        let fresh = awaiting(now - chrono::Duration::seconds(10));
        let due = awaiting(now - chrono::Duration::seconds(90));
        let overdue = awaiting(now - chrono::Duration::minutes(6));
        let created = record(now - chrono::Duration::minutes(2), 100);
        let records = vec![fresh, due.clone(), overdue, created];

        let selected = select_query_candidates(now, Duration::from_secs(30), &records);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, due.id);
    }

    #[test]
    fn expiry_selects_only_live_records_past_deadline() {
        let now = Utc::now();
        let overdue = awaiting(now - chrono::Duration::minutes(6));
        let orphaned = record(now - chrono::Duration::minutes(7), 100);
        let live = awaiting(now - chrono::Duration::minutes(1));
        let failed = record(now - chrono::Duration::minutes(9), 100)
            .transitioned(TransactionState::Failed, now)
            .unwrap();
        let records = vec![overdue.clone(), orphaned.clone(), live, failed];

        let ids: Vec<_> = select_expired(now, &records).iter().map(|tx| tx.id).collect();
        assert_eq!(ids, vec![overdue.id, orphaned.id]);
    }

    #[test]
    fn stats_group_counts_and_amounts_by_state() {
        let now = Utc::now();
        let start = now - chrono::Duration::hours(24);
        let t = now - chrono::Duration::hours(1);

        let mut recovered = awaiting(t)
            .transitioned(TransactionState::Completed, t)
            .unwrap();
        recovered.recovered_via_query = true;
        let completed = awaiting(t).transitioned(TransactionState::Completed, t).unwrap();
        let failed = record(t, 250).transitioned(TransactionState::Failed, t).unwrap();
        let pending = awaiting(t);
        let outside = record(now - chrono::Duration::hours(30), 999)
            .transitioned(TransactionState::Failed, t)
            .unwrap();

        let stats = compute_stats(start, now, &[recovered, completed, failed, pending, outside]);
        assert_eq!(stats.completed, StateTotals { count: 2, amount: 200 });
        assert_eq!(stats.failed, StateTotals { count: 1, amount: 250 });
        assert_eq!(stats.expired, StateTotals::default());
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.recovered_via_query, 1);
    }

    #[test]
    fn config_defaults() {
        let cfg = ReconciliationConfig::default();
        assert_eq!(cfg.query_grace, Duration::from_secs(30));
        assert_eq!(cfg.batch_size, 50);
        assert!(cfg.poll_interval >= cfg.query_grace);
    }
}
