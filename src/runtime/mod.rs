//! Runtime driver boundary and the built-in simulated engine

pub mod driver;
pub mod sim;

pub use driver::{
    DriverError, InstanceRef, InstanceSignal, ResolvedMount, ResolvedSource, RuntimeDriver,
    RuntimeEvent, VolumeRef,
};
pub use sim::{SimBehavior, SimulatedDriver};
