//! Service lifecycle orchestration

pub mod controller;
pub mod instance;

pub use controller::Orchestrator;
pub use instance::{InstanceCommand, InstanceState, ServiceInstance, ServiceReport};
