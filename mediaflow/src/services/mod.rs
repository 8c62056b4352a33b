//! Service layer module.
//!
//! The service container is the composition root: it builds every component
//! from an [`AppConfig`](crate::config::AppConfig) and owns their lifecycle.

pub mod container;

pub use container::{ServiceContainer, ServiceContainerBuilder};
