//! Serde types for the declarative topology document
//!
//! These mirror the compose-style file shape. Short and long syntax forms
//! are modeled as untagged enums; the loader normalizes them into the typed
//! model in `spec::model`.

use serde::Deserialize;
use std::collections::HashMap;

/// Top-level topology document
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyDoc {
    /// Schema version marker, accepted and ignored
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services, kept as a raw mapping to preserve declaration order
    #[serde(default)]
    pub services: serde_yaml::Mapping,
    /// Declared volumes
    #[serde(default)]
    pub volumes: serde_yaml::Mapping,
}

/// One service entry as written in the document
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawService {
    /// Image reference
    #[serde(default)]
    pub image: Option<String>,
    /// Build context path
    #[serde(default)]
    pub build: Option<String>,
    /// Command override
    #[serde(default)]
    pub command: Option<CommandField>,
    /// Port mappings, short syntax
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentField>,
    /// Volume mounts, short syntax
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Dependencies on other services
    #[serde(default)]
    pub depends_on: Option<DependsOnField>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Grace period before a stop escalates to a kill
    #[serde(default)]
    pub stop_grace_period: Option<String>,
}

/// Command in shell or exec form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandField {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment in array or map form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentField {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(HashMap<String, Option<String>>),
}

/// Dependencies in array or map form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOnField {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service name to condition
    Map(HashMap<String, DependsOnCondition>),
}

impl DependsOnField {
    /// Dependency names regardless of form
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOnField::Array(arr) => arr.clone(),
            DependsOnField::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Condition attached to a map-form dependency
#[derive(Debug, Clone, Deserialize)]
pub struct DependsOnCondition {
    pub condition: String,
}

/// One declared volume entry
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawVolume {
    /// Backend driver hint, passed through opaquely
    #[serde(default)]
    pub driver: Option<String>,
}
