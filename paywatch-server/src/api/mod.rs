//! HTTP API.
//!
//! - [`service`]: Service API for merchant backends, under `/api/v1`
//! - [`extractors`]: signed-body authentication

pub mod extractors;
pub mod service;
