//! HTTP surface of the veil DP query service.
//!
//! The router exposes the query, cost-estimation, dummy, budget and
//! archive contracts on top of a [`veil_core::QueryEngine`]. Identity
//! arrives through the `x-user-name` header; authentication itself is a
//! front-proxy concern.

pub mod api;
pub mod error;
pub mod seed;

pub use api::create_router;
