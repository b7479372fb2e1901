//! Unique settlement-amount allocation.
//!
//! Orders on the same address are told apart by amount alone, so no two
//! live reservations may share `(address, amount, chain)`. Allocation runs
//! inside a single actor task: requests are answered one at a time, so two
//! orders can never probe the same free slot concurrently. The reservation
//! write is still insert-if-absent, which keeps the slot exclusive even
//! against another process sharing the store.

use crate::amount::{ReservationKey, SettlementAmount};
use crate::config::PaymentConfig;
use crate::store::{AddressPool, LockStore, StoreError};
use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("amount {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },

    #[error("no enabled receiving address for chain {0}")]
    NoAvailableAddress(ChainType),

    #[error("no free amount slot on chain {0}, address pool exhausted")]
    NoAvailableCapacity(ChainType),

    #[error("order {0} already exists")]
    DuplicateOrder(String),

    #[error("allocator is not running")]
    AllocatorClosed,

    #[error("order creation was aborted")]
    Aborted,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Stored as the reservation value.
    pub trade_id: String,
    pub fiat_amount: Decimal,
    pub chain: ChainType,
}

/// A reserved `(address, amount)` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub address: String,
    pub amount: SettlementAmount,
    pub key: ReservationKey,
}

struct AllocatorCommand {
    request: AllocationRequest,
    reply: oneshot::Sender<Result<Allocation, AllocationError>>,
}

pub struct AmountAllocator<S> {
    store: Arc<S>,
    config: PaymentConfig,
}

/// Cheap to clone; every clone feeds the same actor.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<AllocatorCommand>,
}

impl AllocatorHandle {
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Allocation, AllocationError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(AllocatorCommand { request, reply })
            .await
            .map_err(|_| AllocationError::AllocatorClosed)?;
        response
            .await
            .map_err(|_| AllocationError::AllocatorClosed)?
    }
}

impl<S> AmountAllocator<S>
where
    S: LockStore + AddressPool + 'static,
{
    const MAILBOX: usize = 256;

    pub fn new(store: Arc<S>, config: PaymentConfig) -> Self {
        Self { store, config }
    }

    /// Start the actor. It stops when shutdown is signalled or every
    /// handle has been dropped.
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> (AllocatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(Self::MAILBOX);
        let task = tokio::spawn(self.run(rx, shutdown_rx));
        (AllocatorHandle { tx }, task)
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<AllocatorCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("AmountAllocator started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("AmountAllocator received shutdown signal");
                        break;
                    }
                }

                command = rx.recv() => {
                    let Some(AllocatorCommand { request, reply }) = command else {
                        info!("Allocation channel closed");
                        break;
                    };
                    let result = self.probe_and_reserve(&request).await;
                    if let Err(e) = &result {
                        warn!(
                            trade_id = %request.trade_id,
                            chain = %request.chain,
                            error = %e,
                            "Allocation failed"
                        );
                    }
                    if let Err(Ok(orphan)) = reply.send(result) {
                        // The caller stopped waiting; nothing will use the slot.
                        self.release_orphan(&request.trade_id, &orphan).await;
                    }
                }
            }
        }

        info!("AmountAllocator shutdown complete");
    }

    async fn release_orphan(&self, trade_id: &str, allocation: &Allocation) {
        match self.store.release(&allocation.key).await {
            Ok(()) => {
                info!(trade_id = %trade_id, key = %allocation.key, "Released slot of abandoned allocation");
            }
            Err(e) => {
                warn!(trade_id = %trade_id, key = %allocation.key, error = %e, "Failed to release abandoned slot");
            }
        }
    }

    async fn probe_and_reserve(
        &self,
        request: &AllocationRequest,
    ) -> Result<Allocation, AllocationError> {
        if request.fiat_amount < self.config.min_fiat_amount {
            return Err(AllocationError::BelowMinimum {
                amount: request.fiat_amount,
                minimum: self.config.min_fiat_amount,
            });
        }
        let base = SettlementAmount::from_fiat(request.fiat_amount, self.config.rate()).ok_or(
            AllocationError::BelowMinimum {
                amount: request.fiat_amount,
                minimum: self.config.min_fiat_amount,
            },
        )?;
        if base.value() < self.config.min_token_amount {
            return Err(AllocationError::BelowMinimum {
                amount: base.value(),
                minimum: self.config.min_token_amount,
            });
        }

        let addresses = self.store.enabled_addresses(request.chain).await?;
        if addresses.is_empty() {
            return Err(AllocationError::NoAvailableAddress(request.chain));
        }

        let mut candidate = base;
        for _ in 0..self.config.max_increments {
            for address in &addresses {
                let key = ReservationKey::new(&address.address, candidate, request.chain);
                if self.store.exists(&key).await? {
                    continue;
                }
                match self
                    .store
                    .reserve(&key, &request.trade_id, self.config.window)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            trade_id = %request.trade_id,
                            key = %key,
                            "Reserved amount slot"
                        );
                        return Ok(Allocation {
                            address: address.address.clone(),
                            amount: candidate,
                            key,
                        });
                    }
                    Err(StoreError::AlreadyReserved) => {
                        debug!(key = %key, "Slot taken between probe and reserve");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            candidate = candidate.increment();
        }

        Err(AllocationError::NoAvailableCapacity(request.chain))
    }
}
