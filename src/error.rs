//! Error types for berth

use thiserror::Error;

/// Result type for berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    #[error("spec error: {0}")]
    Spec(String),

    #[error("dependency cycle involving services: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("volume {name} is in use by: {}", .used_by.join(", "))]
    VolumeInUse { name: String, used_by: Vec<String> },

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("instance not found for service: {0}")]
    InstanceNotFound(String),

    #[error("runtime driver error: {0}")]
    Driver(#[from] crate::runtime::DriverError),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
