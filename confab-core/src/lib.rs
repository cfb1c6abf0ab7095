//! Core services for the confab collaboration backend.
//!
//! This crate holds everything the gateways and the media engine share:
//! configuration, structured logging, the workspace error type, id and
//! message models, and the store-backed coordination services (distributed
//! locks, session registry, per-conversation message ordering, durable
//! message enqueue, jobs-service client, token validation).

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;
pub mod validation;

pub use config::Config;
pub use error::{Error, Result};
