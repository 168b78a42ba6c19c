//! Berth - a minimal multi-service container orchestrator
//!
//! Berth takes a declarative YAML topology of services, volumes and
//! dependencies and drives an external container engine to make it so.
//! It provides:
//!
//! - Topology loading and validation from compose-style YAML
//! - Deterministic dependency-ordered startup and reverse teardown
//! - Per-service lifecycle supervision with restart policies
//! - Named volume management with in-use protection
//! - Service name resolution for inter-service addressing
//!
//! The engine itself stays behind the [`runtime::RuntimeDriver`] trait; a
//! simulated in-memory engine ships for development and testing.

pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod resolve;
pub mod runtime;
pub mod spec;
pub mod volume;

pub use error::{BerthError, Result};
