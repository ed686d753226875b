//! Packet-filter management for granting temporary subnet access.
//!
//! # Responsibilities
//! - Save and restore the host ruleset around the service lifetime
//! - Install the managed baseline ruleset on the public device
//! - Grant and revoke per-client allow rules under a bounded budget

pub mod manager;

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

pub use manager::{IpManager, ToolPaths};

/// Subnet widths applied to granted client addresses.
pub const IPV4_GRANT_PREFIX: u8 = 24;
pub const IPV6_GRANT_PREFIX: u8 = 64;

/// Errors from budget reservation and packet-filter tool invocation.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("max concurrent grants reached")]
    MaxConcurrent,
    #[error("{tool} exited with status {status}: {stderr}")]
    Tool {
        tool: String,
        status: i32,
        stderr: String,
    },
    #[error("{tool} did not complete within {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },
    #[error("cannot restore uninitialized rules")]
    NotStarted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Grants and revokes client access. The service selects [`IpManager`]
/// when tokens are required and [`NullManager`] otherwise.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Save the current ruleset and replace it with the managed baseline.
    async fn start(&self, port: u16, device: &str) -> Result<(), FirewallError>;

    /// Restore the ruleset saved by `start`, returning the restore tools'
    /// combined output.
    async fn stop(&self) -> Result<Vec<u8>, FirewallError>;

    /// Reserve one budget unit and insert allow rules for the client.
    async fn grant(&self, ip: IpAddr) -> Result<(), FirewallError>;

    /// Delete the rules inserted for the client and release the budget.
    async fn revoke(&self, ip: IpAddr) -> Result<(), FirewallError>;

    /// Wait until every outstanding grant has been revoked.
    async fn drain(&self) {}
}

/// A manager that accepts every operation without touching the host.
#[derive(Debug, Default)]
pub struct NullManager;

#[async_trait]
impl Manager for NullManager {
    async fn start(&self, _port: u16, _device: &str) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<u8>, FirewallError> {
        Ok(Vec::new())
    }

    async fn grant(&self, _ip: IpAddr) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn revoke(&self, _ip: IpAddr) -> Result<(), FirewallError> {
        Ok(())
    }
}
