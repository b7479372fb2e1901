//! Service API handlers.
//!
//! These endpoints are called by the merchant backend and require a signed
//! body verified via the `Paywatch-Signature` header.
//!
//! # Endpoints
//!
//! - `POST /orders`        – create an order and allocate its payment amount
//! - `POST /orders/status` – current status of an order

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use paywatch_core::allocator::AllocationError;
use paywatch_core::orders::CreateOrder;
use paywatch_core::store::{OrderRecord, PaymentStore, StoreError};
use paywatch_sdk::objects::{
    CreateOrderRequest, CreateOrderResponse, OrderStatusRequest, OrderStatusResponse,
};
use rust_decimal::Decimal;

use crate::api::extractors::SignedBody;
use crate::state::AppState;

pub fn router<S: PaymentStore>() -> Router<AppState<S>> {
    Router::new()
        .route("/orders", post(create_order::<S>))
        .route("/orders/status", post(get_order_status::<S>))
}

fn to_status_response(record: OrderRecord) -> OrderStatusResponse {
    OrderStatusResponse {
        actual_amount: record.settlement().value(),
        status: record.status.into(),
        trade_id: record.trade_id,
        order_id: record.external_order_id,
        receiving_address: record.receiving_address,
        chain_type: record.chain_type,
        block_transaction_id: record.matched_tx_hash,
        redirect_url: record.redirect_url,
    }
}

/// Only absolute http(s) URLs are accepted for callbacks and redirects.
fn check_url(field: &'static str, value: Option<String>) -> Result<Option<String>, ServiceApiError> {
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    match url::Url::parse(value.trim()) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(Some(parsed.to_string())),
        _ => Err(ServiceApiError::BadRequest(format!("{field} is not a valid http(s) URL"))),
    }
}

/// `POST /orders`
async fn create_order<S: PaymentStore>(
    State(state): State<AppState<S>>,
    SignedBody(payload): SignedBody<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceApiError> {
    if payload.order_id.trim().is_empty() {
        return Err(ServiceApiError::BadRequest("order_id must not be empty".into()));
    }
    if payload.amount <= Decimal::ZERO {
        return Err(ServiceApiError::BadRequest("amount must be positive".into()));
    }
    let callback_url = check_url("notify_url", payload.notify_url)?;
    let redirect_url = check_url("redirect_url", payload.redirect_url)?;

    let record = state
        .orders
        .create_order(CreateOrder {
            external_order_id: payload.order_id,
            fiat_amount: payload.amount,
            chain: payload.chain_type,
            callback_url,
            redirect_url,
        })
        .await?;

    let expiration_time = record
        .expires_at(state.orders.config().window)
        .unix_timestamp();
    let response = CreateOrderResponse {
        actual_amount: record.settlement().value(),
        trade_id: record.trade_id,
        order_id: record.external_order_id,
        amount: record.requested_fiat_amount,
        receiving_address: record.receiving_address,
        chain_type: record.chain_type,
        expiration_time,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// `POST /orders/status`
async fn get_order_status<S: PaymentStore>(
    State(state): State<AppState<S>>,
    SignedBody(payload): SignedBody<OrderStatusRequest>,
) -> Result<impl IntoResponse, ServiceApiError> {
    let record = state
        .orders
        .get_order(&payload.trade_id)
        .await?
        .ok_or(ServiceApiError::NotFound)?;
    Ok(Json(to_status_response(record)))
}

/// Errors that can occur in Service API handlers.
#[derive(Debug)]
pub enum ServiceApiError {
    BadRequest(String),
    Allocation(AllocationError),
    Store(StoreError),
    NotFound,
}

impl From<AllocationError> for ServiceApiError {
    fn from(value: AllocationError) -> Self {
        Self::Allocation(value)
    }
}

impl From<StoreError> for ServiceApiError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl IntoResponse for ServiceApiError {
    fn into_response(self) -> Response {
        match self {
            ServiceApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            ServiceApiError::NotFound => (StatusCode::NOT_FOUND, "order not found").into_response(),
            ServiceApiError::Allocation(e) => {
                let status = match &e {
                    AllocationError::BelowMinimum { .. } => StatusCode::BAD_REQUEST,
                    AllocationError::DuplicateOrder(_) => StatusCode::CONFLICT,
                    AllocationError::NoAvailableAddress(_)
                    | AllocationError::NoAvailableCapacity(_)
                    | AllocationError::AllocatorClosed => StatusCode::SERVICE_UNAVAILABLE,
                    AllocationError::Store(_) | AllocationError::Aborted => {
                        tracing::error!(error = %e, "Order creation failed");
                        return (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
                            .into_response();
                    }
                };
                tracing::warn!(error = %e, status = %status, "Order creation rejected");
                (status, e.to_string()).into_response()
            }
            ServiceApiError::Store(e) => {
                tracing::error!(error = %e, "Service API store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}
