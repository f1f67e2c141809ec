use crate::database::repository::TransactionStore;
use crate::payments::error::PaymentError;
use crate::services::reconciliation::ReconciliationCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub enabled: bool,
    /// How often the worker wakes up to look for stale pending transactions.
    pub interval: Duration,
    /// Maximum number of transactions polled per cycle.
    pub batch_size: i64,
    /// A pending transaction must be at least this old (and not checked
    /// within this window) before the sweep queries the gateway for it.
    pub min_age: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 50,
            min_age: Duration::from_secs(120),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.enabled = std::env::var("RECONCILE_SWEEP_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(cfg.enabled);
        cfg.interval = Duration::from_secs(
            std::env::var("RECONCILE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.interval.as_secs()),
        );
        cfg.batch_size = std::env::var("RECONCILE_SWEEP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg.min_age = Duration::from_secs(
            std::env::var("RECONCILE_SWEEP_MIN_AGE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.min_age.as_secs()),
        );
        cfg
    }
}

/// Counters for one sweep cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reconciled: usize,
    pub still_pending: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Background fallback for lost callbacks: periodically polls the gateway
/// for pending transactions that have gone quiet.
pub struct ReconciliationSweepWorker {
    store: Arc<dyn TransactionStore>,
    coordinator: ReconciliationCoordinator,
    config: SweepConfig,
}

impl ReconciliationSweepWorker {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        coordinator: ReconciliationCoordinator,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            min_age_secs = self.config.min_age.as_secs(),
            "reconciliation sweep worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation sweep worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle().await {
                        Ok(report) if report.examined > 0 => info!(
                            examined = report.examined,
                            reconciled = report.reconciled,
                            still_pending = report.still_pending,
                            failed = report.failed,
                            "reconciliation sweep cycle complete"
                        ),
                        Ok(_) => debug!("reconciliation sweep found nothing to do"),
                        Err(e) => warn!(error = %e, "reconciliation sweep cycle failed"),
                    }
                }
            }
        }

        info!("reconciliation sweep worker stopped");
    }

    /// Polls one batch of stale pending transactions. A failure on one
    /// transaction never stops the rest of the batch.
    pub async fn run_cycle(&self) -> Result<SweepReport, PaymentError> {
        let min_age = chrono::Duration::from_std(self.config.min_age).unwrap_or_else(|_| {
            chrono::Duration::seconds(SweepConfig::default().min_age.as_secs() as i64)
        });
        let older_than = chrono::Utc::now() - min_age;

        let stale = self
            .store
            .find_stale_pending(older_than, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for tx in stale {
            match self.coordinator.poll_status(&tx.checkout_request_id).await {
                Ok(result) if result.status.is_terminal() => {
                    report.reconciled += 1;
                    info!(
                        transaction_id = %tx.id,
                        checkout_request_id = %tx.checkout_request_id,
                        status = %result.status,
                        "sweep reconciled pending transaction"
                    );
                }
                Ok(_) => report.still_pending += 1,
                Err(PaymentError::GatewayRejected { description, .. }) => {
                    report.still_pending += 1;
                    debug!(
                        checkout_request_id = %tx.checkout_request_id,
                        description = %description,
                        "transaction still pending at gateway"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        checkout_request_id = %tx.checkout_request_id,
                        error = %e,
                        "sweep status query failed"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let cfg = SweepConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.min_age, Duration::from_secs(120));
    }
}
