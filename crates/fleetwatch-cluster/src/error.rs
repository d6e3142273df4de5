//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-related errors
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Cluster already exists: {0}")]
    ClusterAlreadyExists(String),

    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    #[error("Cannot resolve credentials for cluster {cluster}: {reason}")]
    Credentials { cluster: String, reason: String },

    #[error("Resource version {0} is too old")]
    Expired(String),

    #[error("Watch stream failed: {0}")]
    Watch(String),

    #[error("Initial list for cluster {cluster} failed after {attempts} attempts: {last_error}")]
    InitialListFailed {
        cluster: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Lease {0} was modified concurrently")]
    LeaseConflict(String),

    #[error("Cluster {0} already started")]
    AlreadyStarted(String),

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Errors the watch loop retries with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Unreachable(_)
                | ClusterError::Expired(_)
                | ClusterError::Watch(_)
                | ClusterError::Timeout(_)
                | ClusterError::LeaseConflict(_)
                | ClusterError::InitialListFailed { .. }
        )
    }

    /// Startup configuration errors surfaced synchronously from `start`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Credentials { .. } | ClusterError::InvalidConfig(_)
        )
    }
}

impl From<fleetwatch_core::Error> for ClusterError {
    fn from(err: fleetwatch_core::Error) -> Self {
        match err {
            fleetwatch_core::Error::DuplicateCluster(name) => ClusterError::ClusterAlreadyExists(name),
            fleetwatch_core::Error::UnknownCluster(name) => ClusterError::ClusterNotFound(name),
            other => ClusterError::InvalidConfig(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ClusterError::Unreachable("prod".into()).is_transient());
        assert!(ClusterError::Expired("5".into()).is_transient());
        assert!(!ClusterError::Unreachable("prod".into()).is_fatal());

        let creds = ClusterError::Credentials {
            cluster: "prod".into(),
            reason: "no context".into(),
        };
        assert!(creds.is_fatal());
        assert!(!creds.is_transient());
    }

    #[test]
    fn test_from_core_error() {
        let err: ClusterError = fleetwatch_core::Error::NoEnabledClusters.into();
        assert!(err.is_fatal());

        let err: ClusterError = fleetwatch_core::Error::DuplicateCluster("a".into()).into();
        assert!(matches!(err, ClusterError::ClusterAlreadyExists(name) if name == "a"));
    }
}
