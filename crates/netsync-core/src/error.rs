//! Error types for the provisioning core
//!
//! Allocation and lifecycle errors are returned synchronously to callers.
//! Device failures never leave the reconciler; they are recorded on the
//! sync job and counted against its retry bound.

use crate::model::{JobId, RouterId, SubnetId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for netsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the provisioning core
#[derive(Error, Debug)]
pub enum Error {
    /// A CIDR block intersects one or more registered subnets
    #[error("CIDR {cidr} overlaps existing subnet(s) {conflicting:?}")]
    Overlap {
        /// The rejected block
        cidr: String,
        /// Subnets whose ranges intersect it
        conflicting: Vec<SubnetId>,
    },

    /// Malformed or unsupported CIDR input
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    /// No available address left in the subnet
    #[error("Address pool exhausted for subnet {0}")]
    PoolExhausted(SubnetId),

    /// Address does not belong to any registered subnet
    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    /// Invalid state transition attempted
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Retry bound reached; only an operator force-retry can reset it
    #[error("Sync job {job} reached the retry bound ({retry_count} attempts)")]
    MaxRetriesExceeded {
        /// The job that was refused
        job: JobId,
        /// Its current retry count
        retry_count: u32,
    },

    /// Device driver did not answer within the push timeout
    #[error("Device {router} timed out after {after:?}")]
    DeviceTimeout {
        /// Router that was addressed
        router: RouterId,
        /// Configured timeout
        after: Duration,
    },

    /// Device driver reported a failure
    #[error("Device {router} rejected configuration: {reason}")]
    DeviceRejected {
        /// Router that was addressed
        router: RouterId,
        /// Driver-provided reason
        reason: String,
    },

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid CIDR error
    pub fn invalid_cidr(msg: impl Into<String>) -> Self {
        Self::InvalidCidr(msg.into())
    }

    /// Create an unknown address error
    pub fn unknown_address(addr: impl ToString) -> Self {
        Self::UnknownAddress(addr.to_string())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a device rejection error
    pub fn device_rejected(router: RouterId, reason: impl Into<String>) -> Self {
        Self::DeviceRejected {
            router,
            reason: reason.into(),
        }
    }

    /// Whether a failed push is worth retrying automatically
    ///
    /// Only device communication failures are. Anything else a driver
    /// returns would fail the same way again, so the job is parked
    /// `out_of_sync` after one attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceTimeout { .. } | Self::DeviceRejected { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_failures_are_retryable() {
        let timeout = Error::DeviceTimeout {
            router: RouterId(1),
            after: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert!(Error::device_rejected(RouterId(1), "bad secret").is_retryable());

        assert!(!Error::PoolExhausted(SubnetId(3)).is_retryable());
        assert!(!Error::conflict("already active").is_retryable());
    }

    #[test]
    fn overlap_message_names_conflicts() {
        let err = Error::Overlap {
            cidr: "10.0.0.128/25".to_string(),
            conflicting: vec![SubnetId(7)],
        };
        assert!(err.to_string().contains("10.0.0.128/25"));
        assert!(err.to_string().contains('7'));
    }
}
