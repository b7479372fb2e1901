use super::{
    AddressPool, JobStore, LockStore, NewOrder, OrderRecord, OrderStore, PaidOutcome, StoreError,
};
use crate::amount::ReservationKey;
use crate::entities::JobStatus;
use crate::entities::order_records::{
    DeleteOrder, GetOrderByExternalId, GetOrderByTradeId, InsertOrder, MarkOrderExpired,
    MarkOrderPaid, RecordCallbackAttempt,
};
use crate::entities::queue_jobs::{
    ClaimNextJob, CompleteJob, EnqueueJob, FailJob, GetJob, NewJob, PurgeFinishedJobs, QueueJob,
    RequeueStaleJobs,
};
use crate::entities::receiving_address::{
    GetEnabledAddresses, ReceivingAddress, SetAddressEnabled, UpdateAddressBalance, UpsertAddress,
};
use crate::entities::reservations::{
    HasLiveReservation, LookupReservation, PurgeExpiredReservations, ReleaseReservation,
    ReserveSlot,
};
use crate::framework::{DatabaseProcessor, is_unique_violation};
use async_trait::async_trait;
use kanau::processor::Processor;
use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::time::Duration;
use time::OffsetDateTime;

/// All store traits on top of one Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    db: DatabaseProcessor,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db.pool
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn reserve(
        &self,
        key: &ReservationKey,
        trade_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let inserted = self
            .db
            .process(ReserveSlot {
                key: key.clone(),
                value: trade_id.to_string(),
                ttl,
            })
            .await?;
        if inserted {
            Ok(())
        } else {
            Err(StoreError::AlreadyReserved)
        }
    }

    async fn release(&self, key: &ReservationKey) -> Result<(), StoreError> {
        self.db
            .process(ReleaseReservation { key: key.clone() })
            .await?;
        Ok(())
    }

    async fn lookup(&self, key: &ReservationKey) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .process(LookupReservation { key: key.clone() })
            .await?)
    }

    async fn has_live_reservation(
        &self,
        address: &str,
        chain: ChainType,
    ) -> Result<bool, StoreError> {
        Ok(self
            .db
            .process(HasLiveReservation {
                address: address.to_string(),
                chain,
            })
            .await?)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Ok(self.db.process(PurgeExpiredReservations).await?)
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, order: NewOrder) -> Result<OrderRecord, StoreError> {
        let external_order_id = order.external_order_id.clone();
        match self.db.process(InsertOrder { order }).await {
            Ok(record) => Ok(record),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateOrder(external_order_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self
            .db
            .process(GetOrderByTradeId {
                trade_id: trade_id.to_string(),
            })
            .await?)
    }

    async fn get_by_external_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self
            .db
            .process(GetOrderByExternalId {
                external_order_id: external_order_id.to_string(),
            })
            .await?)
    }

    async fn mark_paid(
        &self,
        trade_id: &str,
        tx_hash: &str,
        follow_ups: Vec<NewJob>,
    ) -> Result<PaidOutcome, StoreError> {
        Ok(self
            .db
            .process(MarkOrderPaid {
                trade_id: trade_id.to_string(),
                tx_hash: tx_hash.to_string(),
                follow_ups,
            })
            .await?)
    }

    async fn mark_expired(&self, trade_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .db
            .process(MarkOrderExpired {
                trade_id: trade_id.to_string(),
            })
            .await?)
    }

    async fn delete_order(&self, trade_id: &str) -> Result<(), StoreError> {
        Ok(self
            .db
            .process(DeleteOrder {
                trade_id: trade_id.to_string(),
            })
            .await?)
    }

    async fn record_callback_attempt(
        &self,
        trade_id: &str,
        acknowledged: bool,
    ) -> Result<(), StoreError> {
        Ok(self
            .db
            .process(RecordCallbackAttempt {
                trade_id: trade_id.to_string(),
                acknowledged,
            })
            .await?)
    }
}

#[async_trait]
impl AddressPool for PgStore {
    async fn enabled_addresses(
        &self,
        chain: ChainType,
    ) -> Result<Vec<ReceivingAddress>, StoreError> {
        Ok(self.db.process(GetEnabledAddresses { chain }).await?)
    }

    async fn upsert_address(
        &self,
        address: &str,
        chain: ChainType,
        remark: &str,
    ) -> Result<(), StoreError> {
        Ok(self
            .db
            .process(UpsertAddress {
                address: address.to_string(),
                chain,
                remark: remark.to_string(),
            })
            .await?)
    }

    async fn set_enabled(
        &self,
        address: &str,
        chain: ChainType,
        enabled: bool,
    ) -> Result<bool, StoreError> {
        Ok(self
            .db
            .process(SetAddressEnabled {
                address: address.to_string(),
                chain,
                enabled,
            })
            .await?)
    }

    async fn update_balance(
        &self,
        address: &str,
        chain: ChainType,
        balance: Decimal,
    ) -> Result<bool, StoreError> {
        Ok(self
            .db
            .process(UpdateAddressBalance {
                address: address.to_string(),
                chain,
                balance,
            })
            .await?)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        Ok(self.db.process(EnqueueJob { job }).await?)
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        now: OffsetDateTime,
    ) -> Result<Option<QueueJob>, StoreError> {
        Ok(self
            .db
            .process(ClaimNextJob {
                queue_name: queue_name.to_string(),
                now,
            })
            .await?)
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        if self.db.process(CompleteJob { id }).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn fail(&self, id: i64, backoff_unit: Duration) -> Result<JobStatus, StoreError> {
        self.db
            .process(FailJob { id, backoff_unit })
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn get_job(&self, id: i64) -> Result<Option<QueueJob>, StoreError> {
        Ok(self.db.process(GetJob { id }).await?)
    }

    async fn requeue_stale(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(self.db.process(RequeueStaleJobs { older_than }).await?)
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(self.db.process(PurgeFinishedJobs { older_than }).await?)
    }
}
