#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod allocator;
pub mod amount;
pub mod chain;
pub mod config;
pub mod entities;
pub mod framework;
pub mod notify;
pub mod orders;
pub mod processors;
pub mod queue;
pub mod store;
pub mod tasks;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use paywatch_sdk::objects::ChainType;
