//! Port reservation service.
//!
//! Registered instances reserve single TCP ports or contiguous port ranges
//! from a bounded pool and later release them. State lives in SQLite; the
//! [`api`] module exposes it over HTTP.

pub mod allocator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod query;
pub mod reconcile;
pub mod registry;

pub use config::{OwnershipPolicy, PoolConfig, PortRange};
pub use error::{GatekeeperError, Result};
