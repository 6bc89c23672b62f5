//! # tw-api
//!
//! HTTP binding for the remote optimizer: wire representations, hypermedia
//! link handling, the [`Optimizer`] operation trait with its reqwest-backed
//! implementation, and an in-memory fake for controller tests.

pub mod client;
pub mod error;
pub mod fake;
pub mod links;
pub mod model;

pub use client::{ApiConfig, HttpOptimizer, Optimizer};
pub use error::ApiError;
pub use fake::FakeOptimizer;
pub use model::*;
