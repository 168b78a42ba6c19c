//! Topology specification: document types, typed model and loader

pub mod loader;
pub mod model;
pub mod raw;

pub use loader::{SpecLoader, DEFAULT_TOPOLOGY_FILES};
pub use model::{
    MountSource, MountSpec, PortMapping, Protocol, RestartPolicy, ServiceSpec, Topology,
};
