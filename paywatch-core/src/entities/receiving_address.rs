use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use time::OffsetDateTime;

/// A wallet address payments are received on. Never deleted, only disabled.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReceivingAddress {
    pub address: String,
    #[sqlx(try_from = "String")]
    pub chain_type: ChainType,
    pub remark: String,
    pub enabled: bool,
    pub cached_balance: Decimal,
    pub balance_updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct GetEnabledAddresses {
    pub chain: ChainType,
}

impl Processor<GetEnabledAddresses> for DatabaseProcessor {
    type Output = Vec<ReceivingAddress>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetEnabledAddresses")]
    async fn process(
        &self,
        query: GetEnabledAddresses,
    ) -> Result<Vec<ReceivingAddress>, sqlx::Error> {
        sqlx::query_as::<_, ReceivingAddress>(
            r#"
            SELECT address, chain_type, remark, enabled, cached_balance, balance_updated_at
            FROM receiving_addresses
            WHERE chain_type = $1 AND enabled
            ORDER BY created_at, address
            "#,
        )
        .bind(query.chain.as_str())
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Insert an enabled address, or refresh the remark of an existing one.
/// An operator's disable is left untouched.
pub struct UpsertAddress {
    pub address: String,
    pub chain: ChainType,
    pub remark: String,
}

impl Processor<UpsertAddress> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertAddress")]
    async fn process(&self, cmd: UpsertAddress) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO receiving_addresses (address, chain_type, remark)
            VALUES ($1, $2, $3)
            ON CONFLICT (address, chain_type) DO UPDATE SET remark = EXCLUDED.remark
            "#,
        )
        .bind(cmd.address)
        .bind(cmd.chain.as_str())
        .bind(cmd.remark)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SetAddressEnabled {
    pub address: String,
    pub chain: ChainType,
    pub enabled: bool,
}

impl Processor<SetAddressEnabled> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SetAddressEnabled")]
    async fn process(&self, cmd: SetAddressEnabled) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE receiving_addresses SET enabled = $3 WHERE address = $1 AND chain_type = $2",
        )
        .bind(cmd.address)
        .bind(cmd.chain.as_str())
        .bind(cmd.enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateAddressBalance {
    pub address: String,
    pub chain: ChainType,
    pub balance: Decimal,
}

impl Processor<UpdateAddressBalance> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpdateAddressBalance")]
    async fn process(&self, cmd: UpdateAddressBalance) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE receiving_addresses
            SET cached_balance = $3, balance_updated_at = NOW()
            WHERE address = $1 AND chain_type = $2
            "#,
        )
        .bind(cmd.address)
        .bind(cmd.chain.as_str())
        .bind(cmd.balance)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
