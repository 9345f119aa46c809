//! Daemon configuration: CLI flags with environment variable fallbacks.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::db;
use crate::error::{GatekeeperError, Result};

/// Port reservation daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "gatekeeperd")]
#[command(about = "Hands out exclusive TCP ports and contiguous port ranges to registered instances")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "GATEKEEPER_LISTEN", default_value = "127.0.0.1:3030")]
    pub listen: SocketAddr,

    /// SQLite database file (default: ~/.portmanager/gatekeeper.db)
    #[arg(long, env = "GATEKEEPER_DB")]
    pub db_path: Option<PathBuf>,

    /// First port of the pool
    #[arg(long, env = "PORT_RANGE_START", default_value_t = 8000)]
    pub port_range_start: u16,

    /// End of the pool, exclusive
    #[arg(long, env = "PORT_RANGE_END", default_value_t = 9000)]
    pub port_range_end: u16,

    /// Create every port of the pool up front
    #[arg(long, env = "GATEKEEPER_SEED_POOL", default_value_t = false)]
    pub seed_pool: bool,

    /// Whether releases must name the owning instance
    #[arg(long, env = "GATEKEEPER_RELEASE_OWNERSHIP", value_enum, default_value_t = OwnershipPolicy::Optional)]
    pub release_ownership: OwnershipPolicy,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(db::default_db_path)
    }

    pub fn pool_config(&self) -> Result<PoolConfig> {
        Ok(PoolConfig {
            range: PortRange::new(self.port_range_start, self.port_range_end)?,
            release_ownership: self.release_ownership,
        })
    }
}

/// The half-open interval `[start, end)` of port numbers the pool manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(GatekeeperError::Config("port range cannot start at 0".to_string()));
        }
        if start >= end {
            return Err(GatekeeperError::Config(format!(
                "port range start {} must be below end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    /// Number of ports in the pool.
    pub fn size(&self) -> u32 {
        u32::from(self.end - self.start)
    }
}

/// Ownership check applied when a release names no instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OwnershipPolicy {
    /// A release without `instance_id` may release any instance's binding.
    #[default]
    Optional,
    /// A release must carry the owning `instance_id`.
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub range: PortRange,
    pub release_ownership: OwnershipPolicy,
}

impl PoolConfig {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        Ok(Self {
            range: PortRange::new(start, end)?,
            release_ownership: OwnershipPolicy::default(),
        })
    }

    pub fn with_release_ownership(mut self, policy: OwnershipPolicy) -> Self {
        self.release_ownership = policy;
        self
    }
}
