//! Periodic sweeps that keep the reservation and job tables healthy.

use crate::config::{MaintenanceConfig, QueueConfig};
use crate::store::{JobStore, LockStore, StoreError};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// What one sweep removed or recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_purged: u64,
    pub jobs_requeued: u64,
    pub jobs_purged: u64,
}

pub struct MaintenanceRunner<S> {
    store: Arc<S>,
    schedule: MaintenanceConfig,
    queue: QueueConfig,
}

impl<S: LockStore + JobStore + 'static> MaintenanceRunner<S> {
    pub fn new(store: Arc<S>, schedule: MaintenanceConfig, queue: QueueConfig) -> Self {
        Self {
            store,
            schedule,
            queue,
        }
    }

    /// Purge expired reservations and hand stale Processing jobs back.
    pub async fn sweep_reservations(&self) -> Result<SweepReport, StoreError> {
        let reservations_purged = self.store.purge_expired().await?;
        let jobs_requeued = self
            .store
            .requeue_stale(OffsetDateTime::now_utc() - self.queue.stale_after)
            .await?;
        if jobs_requeued > 0 {
            info!(count = jobs_requeued, "Requeued stale jobs");
        }
        Ok(SweepReport {
            reservations_purged,
            jobs_requeued,
            ..SweepReport::default()
        })
    }

    /// Drop Completed and Failed jobs older than the retention window.
    pub async fn purge_jobs(&self) -> Result<SweepReport, StoreError> {
        let jobs_purged = self
            .store
            .purge_finished(OffsetDateTime::now_utc() - self.queue.retention)
            .await?;
        Ok(SweepReport {
            jobs_purged,
            ..SweepReport::default()
        })
    }

    /// Both sweeps run once immediately, then on their own intervals.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.schedule.reservation_sweep);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval(self.schedule.queue_purge);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Maintenance runner started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = sweep.tick() => {
                    match self.sweep_reservations().await {
                        Ok(report) => info!(
                            reservations = report.reservations_purged,
                            jobs = report.jobs_requeued,
                            "Reservation sweep finished"
                        ),
                        Err(e) => error!(error = %e, "Reservation sweep failed"),
                    }
                }

                _ = purge.tick() => {
                    match self.purge_jobs().await {
                        Ok(report) => info!(jobs = report.jobs_purged, "Job purge finished"),
                        Err(e) => error!(error = %e, "Job purge failed"),
                    }
                }
            }
        }

        info!("Maintenance runner shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{ReservationKey, SettlementAmount};
    use crate::entities::JobStatus;
    use crate::entities::queue_jobs::NewJob;
    use crate::store::memory::MemoryStore;
    use paywatch_sdk::objects::ChainType;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn key(amount: i64) -> ReservationKey {
        ReservationKey::new(
            "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE",
            SettlementAmount::normalize(Decimal::new(amount, 4)),
            ChainType::Trc20,
        )
    }

    #[tokio::test]
    async fn test_sweep_purges_and_requeues() {
        let store = Arc::new(MemoryStore::new());
        store.reserve(&key(1), "t1", Duration::ZERO).await.unwrap();
        store
            .reserve(&key(2), "t2", Duration::from_secs(600))
            .await
            .unwrap();
        let id = store
            .enqueue(NewJob::new("default", "test:task", "x"))
            .await
            .unwrap();
        store
            .claim_next("default", OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        store
            .touch_job(id, OffsetDateTime::now_utc() - Duration::from_secs(3600))
            .await;

        let runner = MaintenanceRunner::new(
            store.clone(),
            MaintenanceConfig::default(),
            QueueConfig::default(),
        );
        let report = runner.sweep_reservations().await.unwrap();
        assert_eq!(report.reservations_purged, 1);
        assert_eq!(report.jobs_requeued, 1);
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert!(store.exists(&key(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_jobs() {
        let store = Arc::new(MemoryStore::new());
        let old = store
            .enqueue(NewJob::new("default", "test:task", "x"))
            .await
            .unwrap();
        let recent = store
            .enqueue(NewJob::new("default", "test:task", "y"))
            .await
            .unwrap();
        for _ in 0..2 {
            let job = store
                .claim_next("default", OffsetDateTime::now_utc())
                .await
                .unwrap()
                .unwrap();
            store.complete(job.id).await.unwrap();
        }
        store
            .touch_job(old, OffsetDateTime::now_utc() - Duration::from_secs(8 * 24 * 3600))
            .await;

        let runner = MaintenanceRunner::new(
            store.clone(),
            MaintenanceConfig::default(),
            QueueConfig::default(),
        );
        assert_eq!(runner.purge_jobs().await.unwrap().jobs_purged, 1);
        assert!(store.get_job(old).await.unwrap().is_none());
        assert!(store.get_job(recent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_runner_sweeps_at_startup() {
        let store = Arc::new(MemoryStore::new());
        store.reserve(&key(1), "t1", Duration::ZERO).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = MaintenanceRunner::new(
            store.clone(),
            MaintenanceConfig::default(),
            QueueConfig::default(),
        );
        let handle = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}
