//! Runtime driver boundary
//!
//! The orchestrator drives an external container engine through this narrow
//! interface: create/start/stop/kill/remove calls plus an event stream that
//! reports when instances come up or exit. Engine specifics (isolation,
//! images, networking) live entirely behind the trait.

use crate::spec::ServiceSpec;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque handle to a created instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef(pub String);

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a backing volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeRef(pub String);

impl std::fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mount resolved against the volume manager
#[derive(Debug, Clone)]
pub struct ResolvedMount {
    pub source: ResolvedSource,
    pub target: String,
    pub read_only: bool,
}

/// Resolved source side of a mount
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    /// Backing volume handle from the volume manager
    Volume(VolumeRef),
    /// Host path bind
    Bind(PathBuf),
}

/// Errors from the external engine
///
/// Transient failures are eligible for restart-policy-driven retry;
/// permanent ones (a missing image, an unknown handle) surface immediately.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown volume: {0}")]
    UnknownVolume(String),

    #[error("transient runtime failure: {0}")]
    Transient(String),

    #[error("permanent runtime failure: {0}")]
    Permanent(String),
}

impl DriverError {
    /// Whether a restart policy may retry past this failure
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }
}

/// Signal reported by the engine for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceSignal {
    /// The instance reached a running status
    Running,
    /// The instance exited with the given code
    Exited(i32),
}

/// One event on the engine's stream
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub instance: InstanceRef,
    pub signal: InstanceSignal,
}

/// Control interface to the external container engine
pub trait RuntimeDriver: Send + Sync {
    /// Create an instance for a service with resolved env and mounts
    fn create(
        &self,
        spec: &ServiceSpec,
        env: &HashMap<String, String>,
        mounts: &[ResolvedMount],
    ) -> Result<InstanceRef, DriverError>;

    /// Start a created instance
    fn start(&self, instance: &InstanceRef) -> Result<(), DriverError>;

    /// Request a graceful stop; termination is confirmed via the event stream
    fn stop(&self, instance: &InstanceRef, grace: Duration) -> Result<(), DriverError>;

    /// Terminate an instance immediately
    fn force_kill(&self, instance: &InstanceRef) -> Result<(), DriverError>;

    /// Remove an instance from the engine
    fn remove(&self, instance: &InstanceRef) -> Result<(), DriverError>;

    /// Create a named volume
    fn create_volume(&self, name: &str) -> Result<VolumeRef, DriverError>;

    /// Remove a volume
    fn remove_volume(&self, volume: &VolumeRef) -> Result<(), DriverError>;

    /// Subscribe to the engine's event stream
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RuntimeEvent>;
}
