//! Wire types shared between the paywatch service and merchant integrations.
//!
//! Everything here is plain data plus the HMAC body-signing scheme; no
//! database or network code lives in this crate.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod objects;
pub mod signature;
