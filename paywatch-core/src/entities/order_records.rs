use super::OrderStatus;
use crate::amount::{ReservationKey, SettlementAmount};
use crate::entities::queue_jobs::{NewJob, insert_job};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use paywatch_sdk::objects::{ChainType, OrderNotifyPayload};
use rust_decimal::Decimal;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrderRecord {
    pub trade_id: String,
    pub external_order_id: String,
    pub requested_fiat_amount: Decimal,
    pub settlement_amount: Decimal,
    pub receiving_address: String,
    #[sqlx(try_from = "String")]
    pub chain_type: ChainType,
    pub status: OrderStatus,
    pub callback_url: Option<String>,
    pub redirect_url: Option<String>,
    pub callback_delivery_count: i32,
    pub callback_acknowledged: bool,
    pub matched_tx_hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl OrderRecord {
    pub fn settlement(&self) -> SettlementAmount {
        SettlementAmount::normalize(self.settlement_amount)
    }

    pub fn reservation_key(&self) -> ReservationKey {
        ReservationKey::new(&self.receiving_address, self.settlement(), self.chain_type)
    }

    pub fn expires_at(&self, window: Duration) -> OffsetDateTime {
        self.created_at + window
    }

    pub fn is_past_window(&self, window: Duration, now: OffsetDateTime) -> bool {
        now > self.expires_at(window)
    }

    pub fn has_callback(&self) -> bool {
        self.callback_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    pub fn notify_payload(&self) -> OrderNotifyPayload {
        OrderNotifyPayload {
            trade_id: self.trade_id.clone(),
            order_id: self.external_order_id.clone(),
            amount: self.requested_fiat_amount,
            actual_amount: self.settlement().value(),
            receiving_address: self.receiving_address.clone(),
            chain_type: self.chain_type,
            block_transaction_id: self.matched_tx_hash.clone(),
            status: self.status.into(),
        }
    }
}

/// Data for inserting a new order. Status starts at AwaitingPayment.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub trade_id: String,
    pub external_order_id: String,
    pub requested_fiat_amount: Decimal,
    pub settlement_amount: SettlementAmount,
    pub receiving_address: String,
    pub chain_type: ChainType,
    pub callback_url: Option<String>,
    pub redirect_url: Option<String>,
}

/// Result of trying to move an order to Paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaidOutcome {
    Paid,
    /// The transaction hash already settled some order.
    AlreadyClaimed,
    /// The order is gone or no longer AwaitingPayment.
    NotAwaitingPayment,
}

#[derive(Debug, Clone)]
pub struct InsertOrder {
    pub order: NewOrder,
}

impl Processor<InsertOrder> for DatabaseProcessor {
    type Output = OrderRecord;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertOrder")]
    async fn process(&self, insert: InsertOrder) -> Result<OrderRecord, sqlx::Error> {
        let order = insert.order;
        sqlx::query_as::<_, OrderRecord>(
            r#"
            INSERT INTO orders (
                trade_id, external_order_id, requested_fiat_amount, settlement_amount,
                receiving_address, chain_type, status, callback_url, redirect_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'awaiting_payment', $7, $8)
            RETURNING *
            "#,
        )
        .bind(order.trade_id)
        .bind(order.external_order_id)
        .bind(order.requested_fiat_amount)
        .bind(order.settlement_amount.value())
        .bind(order.receiving_address)
        .bind(order.chain_type.as_str())
        .bind(order.callback_url)
        .bind(order.redirect_url)
        .fetch_one(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetOrderByTradeId {
    pub trade_id: String,
}

impl Processor<GetOrderByTradeId> for DatabaseProcessor {
    type Output = Option<OrderRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetOrderByTradeId")]
    async fn process(&self, query: GetOrderByTradeId) -> Result<Option<OrderRecord>, sqlx::Error> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE trade_id = $1")
            .bind(query.trade_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct GetOrderByExternalId {
    pub external_order_id: String,
}

impl Processor<GetOrderByExternalId> for DatabaseProcessor {
    type Output = Option<OrderRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetOrderByExternalId")]
    async fn process(
        &self,
        query: GetOrderByExternalId,
    ) -> Result<Option<OrderRecord>, sqlx::Error> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE external_order_id = $1")
            .bind(query.external_order_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Settle an order with a transaction hash.
///
/// Runs in one transaction: the hash uniqueness check, the guarded
/// AwaitingPayment -> Paid update and the insertion of `follow_ups` either
/// all happen or none do. The unique index on `matched_tx_hash` backs the
/// check under concurrency.
pub struct MarkOrderPaid {
    pub trade_id: String,
    pub tx_hash: String,
    pub follow_ups: Vec<NewJob>,
}

impl Processor<MarkOrderPaid> for DatabaseProcessor {
    type Output = PaidOutcome;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:MarkOrderPaid")]
    async fn process(&self, cmd: MarkOrderPaid) -> Result<PaidOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let claimed: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM orders WHERE matched_tx_hash = $1)")
                .bind(&cmd.tx_hash)
                .fetch_one(&mut *tx)
                .await?;
        if claimed {
            tx.rollback().await?;
            return Ok(PaidOutcome::AlreadyClaimed);
        }

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'paid', matched_tx_hash = $2, callback_acknowledged = FALSE, updated_at = NOW()
            WHERE trade_id = $1 AND status = 'awaiting_payment'
            "#,
        )
        .bind(&cmd.trade_id)
        .bind(&cmd.tx_hash)
        .execute(&mut *tx)
        .await;

        let updated = match updated {
            Ok(result) => result.rows_affected(),
            Err(e) if crate::framework::is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(PaidOutcome::AlreadyClaimed);
            }
            Err(e) => return Err(e),
        };
        if updated == 0 {
            tx.rollback().await?;
            return Ok(PaidOutcome::NotAwaitingPayment);
        }

        for job in cmd.follow_ups {
            insert_job(&mut *tx, job).await?;
        }

        tx.commit().await?;
        Ok(PaidOutcome::Paid)
    }
}

#[derive(Debug, Clone)]
pub struct MarkOrderExpired {
    pub trade_id: String,
}

impl Processor<MarkOrderExpired> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:MarkOrderExpired")]
    async fn process(&self, cmd: MarkOrderExpired) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = 'expired', updated_at = NOW()
            WHERE trade_id = $1 AND status = 'awaiting_payment'
            "#,
        )
        .bind(cmd.trade_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOrder {
    pub trade_id: String,
}

impl Processor<DeleteOrder> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeleteOrder")]
    async fn process(&self, cmd: DeleteOrder) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM orders WHERE trade_id = $1")
            .bind(cmd.trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordCallbackAttempt {
    pub trade_id: String,
    pub acknowledged: bool,
}

impl Processor<RecordCallbackAttempt> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RecordCallbackAttempt")]
    async fn process(&self, cmd: RecordCallbackAttempt) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE orders
            SET callback_delivery_count = callback_delivery_count + 1,
                callback_acknowledged = $2,
                updated_at = NOW()
            WHERE trade_id = $1
            "#,
        )
        .bind(cmd.trade_id)
        .bind(cmd.acknowledged)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
