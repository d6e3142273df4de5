//! Error types for Fleetwatch

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Fleet configuration errors
    #[error("No enabled clusters configured")]
    NoEnabledClusters,

    #[error("Duplicate cluster name: {0}")]
    DuplicateCluster(String),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("More than one primary cluster: {first} and {second}")]
    MultiplePrimaries { first: String, second: String },

    #[error("Invalid cluster name: {0}")]
    InvalidClusterName(String),

    // Tunable errors
    #[error("Invalid lease timings: {0}")]
    InvalidLeaseTimings(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Loader errors
    #[error("Failed to parse config: {0}")]
    ConfigParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoEnabledClusters => "NoEnabledClusters",
            Error::DuplicateCluster(_) => "DuplicateCluster",
            Error::UnknownCluster(_) => "UnknownCluster",
            Error::MultiplePrimaries { .. } => "MultiplePrimaries",
            Error::InvalidClusterName(_) => "InvalidClusterName",
            Error::InvalidLeaseTimings(_) => "InvalidLeaseTimings",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::ConfigParse(_) => "ConfigParse",
            Error::Io(_) => "Io",
            Error::Other(_) => "Internal",
        }
    }
}
