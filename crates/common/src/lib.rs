//! Common types and configuration shared across veil crates.
//!
//! This crate contains the base building blocks for the veil system, including:
//! - **Configuration**: Strongly typed service configuration and secrets (`config`).
//! - **Error Handling**: The client-visible error taxonomy (`error`).
//! - **Models**: Users, budgets, datasets, metadata and archives (`models`).
pub mod config;
pub mod error;
pub mod models;

pub use error::{QueryError, Result};
pub use models::{Cost, Library};
