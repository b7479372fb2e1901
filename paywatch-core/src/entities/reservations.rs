//! Reservation rows backing the LockStore.
//!
//! A row whose `expires_at` has passed is treated as absent by every read
//! and may be overwritten by a new reservation.

use crate::amount::ReservationKey;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use paywatch_sdk::objects::ChainType;
use std::time::Duration;

#[derive(Debug, Clone)]
/// Insert-if-absent. Returns `false` when a live row already holds the key.
pub struct ReserveSlot {
    pub key: ReservationKey,
    pub value: String,
    pub ttl: Duration,
}

impl Processor<ReserveSlot> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ReserveSlot")]
    async fn process(&self, cmd: ReserveSlot) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO reservations (cache_key, cache_value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (cache_key) DO UPDATE
                SET cache_value = EXCLUDED.cache_value, expires_at = EXCLUDED.expires_at
                WHERE reservations.expires_at <= NOW()
            "#,
        )
        .bind(cmd.key.as_str())
        .bind(cmd.value)
        .bind(cmd.ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseReservation {
    pub key: ReservationKey,
}

impl Processor<ReleaseReservation> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ReleaseReservation")]
    async fn process(&self, cmd: ReleaseReservation) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM reservations WHERE cache_key = $1")
            .bind(cmd.key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LookupReservation {
    pub key: ReservationKey,
}

impl Processor<LookupReservation> for DatabaseProcessor {
    type Output = Option<String>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:LookupReservation")]
    async fn process(&self, query: LookupReservation) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT cache_value FROM reservations WHERE cache_key = $1 AND expires_at > NOW()",
        )
        .bind(query.key.as_str())
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Whether any live reservation exists for the address on the chain.
pub struct HasLiveReservation {
    pub address: String,
    pub chain: ChainType,
}

impl Processor<HasLiveReservation> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:HasLiveReservation")]
    async fn process(&self, query: HasLiveReservation) -> Result<bool, sqlx::Error> {
        let prefix = format!(
            "{}%",
            escape_like(&ReservationKey::address_prefix(&query.address))
        );
        let suffix = format!("%{}", escape_like(&ReservationKey::chain_suffix(query.chain)));
        sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM reservations
                WHERE cache_key LIKE $1 ESCAPE '\' AND cache_key LIKE $2 ESCAPE '\'
                  AND expires_at > NOW()
            )
            "#,
        )
        .bind(prefix)
        .bind(suffix)
        .fetch_one(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct PurgeExpiredReservations;

impl Processor<PurgeExpiredReservations> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PurgeExpiredReservations")]
    async fn process(&self, _: PurgeExpiredReservations) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM reservations WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("T_a%b|"), "T\\_a\\%b|");
    }
}
