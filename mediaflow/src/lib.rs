//! mediaflow library crate.
//!
//! Job orchestration and resilience core for staged media analysis: a
//! priority job queue with a worker pool, a staged pipeline, circuit
//! breakers, retry with dead-lettering, a multi-tier cache and a
//! reconciliation sweep over persisted state.

pub mod cache;
pub mod config;
pub mod database;
pub mod dead_letter;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod resilience;
pub mod services;

pub use error::{Error, Result};
