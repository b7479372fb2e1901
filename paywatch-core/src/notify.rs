//! Outgoing notifications: merchant webhooks and operator alerts.

use crate::config::TelegramConfig;
use crate::entities::order_records::OrderRecord;
use async_trait::async_trait;
use paywatch_sdk::objects::OrderNotifyPayload;
use paywatch_sdk::signature::{SIGNATURE_HEADER, SignedObject};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("alert channel rejected the message: {0}")]
    AlertRejected(String),
}

/// What the merchant endpoint answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    /// A delivery counts only when the body is exactly `ok` or `success`.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self.body.trim(), "ok" | "success")
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver_webhook(
        &self,
        url: &str,
        payload: &SignedObject<OrderNotifyPayload>,
    ) -> Result<WebhookResponse, NotifyError>;

    async fn send_operator_alert(&self, text: &str) -> Result<(), NotifyError>;
}

/// Webhooks over plain HTTP POST, alerts through the Telegram Bot API.
pub struct HttpNotificationSink {
    http_client: reqwest::Client,
    telegram: Option<TelegramConfig>,
}

impl HttpNotificationSink {
    const TELEGRAM_API: &str = "https://api.telegram.org";

    pub fn new(telegram: Option<TelegramConfig>) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            telegram,
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver_webhook(
        &self,
        url: &str,
        payload: &SignedObject<OrderNotifyPayload>,
    ) -> Result<WebhookResponse, NotifyError> {
        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, payload.to_header())
            .body(payload.json.clone())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(WebhookResponse { status, body })
    }

    async fn send_operator_alert(&self, text: &str) -> Result<(), NotifyError> {
        let Some(telegram) = &self.telegram else {
            debug!("No operator alert channel configured");
            return Ok(());
        };
        let url = format!(
            "{}/bot{}/sendMessage",
            Self::TELEGRAM_API,
            telegram.bot_token
        );
        let response = self
            .http_client
            .post(url)
            .json(&serde_json::json!({
                "chat_id": telegram.chat_id,
                "text": text,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Telegram rejected operator alert");
            return Err(NotifyError::AlertRejected(format!("{status}: {body}")));
        }
        Ok(())
    }
}

/// Operator-facing summary of a settled order.
#[derive(Debug, Clone)]
pub struct PaymentAlert<'a> {
    pub order: &'a OrderRecord,
    pub tx_hash: &'a str,
    /// Token symbol of the paying transfer.
    pub token: &'a str,
    pub paid_at: OffsetDateTime,
}

impl fmt::Display for PaymentAlert<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = self.order;
        let created = order
            .created_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| order.created_at.to_string());
        let paid = self
            .paid_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.paid_at.to_string());
        writeln!(f, "Payment received")?;
        writeln!(f, "Chain: {}", order.chain_type)?;
        writeln!(f, "Trade ID: {}", order.trade_id)?;
        writeln!(f, "Order ID: {}", order.external_order_id)?;
        writeln!(f, "Amount: {}", order.requested_fiat_amount)?;
        writeln!(f, "Paid: {} {}", order.settlement(), self.token)?;
        writeln!(f, "Address: {}", order.receiving_address)?;
        writeln!(f, "Tx: {}", self.tx_hash)?;
        writeln!(f, "Explorer: {}", order.chain_type.explorer_url(self.tx_hash))?;
        writeln!(f, "Created: {created}")?;
        write!(f, "Paid at: {paid}")
    }
}
