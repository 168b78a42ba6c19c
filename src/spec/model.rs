//! Typed topology model produced by the spec loader

use crate::error::{BerthError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default retry ceiling for `on-failure` when no limit is given
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default stop grace period before escalating to a forced kill
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Restart policy for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never relaunch after exit
    Never,
    /// Relaunch only after a non-zero exit, up to `max_retries` times
    OnFailure { max_retries: u32 },
    /// Relaunch after any exit
    Always,
    /// Relaunch after any exit unless the last stop was user-issued
    UnlessStopped,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Never
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure { max_retries } => write!(f, "on-failure:{}", max_retries),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" | "never" => Ok(RestartPolicy::Never),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure {
                max_retries: DEFAULT_MAX_RETRIES,
            }),
            other => {
                if let Some(count) = other.strip_prefix("on-failure:") {
                    let max_retries = count.parse::<u32>().map_err(|_| {
                        BerthError::Spec(format!("invalid restart policy: {}", other))
                    })?;
                    Ok(RestartPolicy::OnFailure { max_retries })
                } else {
                    Err(BerthError::Spec(format!(
                        "invalid restart policy: {}",
                        other
                    )))
                }
            }
        }
    }
}

/// Network protocol for a published port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Host-to-container port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl FromStr for PortMapping {
    type Err = BerthError;

    /// Parse the short syntax "8080:80" or "8080:80/udp"
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || BerthError::Spec(format!("malformed port mapping: {}", s));

        let (mapping, protocol) = match s.split_once('/') {
            Some((m, "tcp")) => (m, Protocol::Tcp),
            Some((m, "udp")) => (m, Protocol::Udp),
            Some(_) => return Err(malformed()),
            None => (s, Protocol::Tcp),
        };

        let (host, container) = mapping.split_once(':').ok_or_else(malformed)?;
        Ok(PortMapping {
            host_port: host.parse().map_err(|_| malformed())?,
            container_port: container.parse().map_err(|_| malformed())?,
            protocol,
        })
    }
}

/// Source side of a mount: a named volume or a host path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Named volume managed by the volume manager
    Volume(String),
    /// Bind mount of a host path
    Bind(PathBuf),
}

/// A single mount entry on a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl FromStr for MountSpec {
    type Err = BerthError;

    /// Parse the short syntax "source:/target" or "source:/target:ro"
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || BerthError::Spec(format!("malformed volume mount: {}", s));

        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [source, target] => (*source, *target, "rw"),
            [source, target, mode] => (*source, *target, *mode),
            _ => return Err(malformed()),
        };

        if source.is_empty() || !target.starts_with('/') {
            return Err(malformed());
        }

        let read_only = match mode {
            "ro" => true,
            "rw" => false,
            _ => return Err(malformed()),
        };

        // Paths are bind mounts, bare names are managed volumes.
        let source = if source.starts_with('/') || source.starts_with('.') {
            MountSource::Bind(PathBuf::from(source))
        } else {
            MountSource::Volume(source.to_string())
        };

        Ok(MountSpec {
            source,
            target: target.to_string(),
            read_only,
        })
    }
}

/// Declarative description of one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    /// Service name, unique within the topology
    pub name: String,
    /// Image reference; absent when a build context is given
    pub image: Option<String>,
    /// Build context path; absent when an image is given
    pub build: Option<PathBuf>,
    /// Command override
    pub command: Vec<String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Environment variables
    pub environment: HashMap<String, String>,
    /// Mounts, in declaration order
    pub mounts: Vec<MountSpec>,
    /// Names of services this one depends on
    pub depends_on: Vec<String>,
    /// Restart policy
    pub restart: RestartPolicy,
    /// Grace period granted on stop before force-kill
    pub stop_grace_period: Duration,
}

impl ServiceSpec {
    /// Create a spec with defaults for everything but name and image
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: Some(image.to_string()),
            build: None,
            command: Vec::new(),
            ports: Vec::new(),
            environment: HashMap::new(),
            mounts: Vec::new(),
            depends_on: Vec::new(),
            restart: RestartPolicy::default(),
            stop_grace_period: DEFAULT_STOP_GRACE,
        }
    }

    /// Names of the managed volumes this service mounts
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().filter_map(|m| match &m.source {
            MountSource::Volume(name) => Some(name.as_str()),
            MountSource::Bind(_) => None,
        })
    }
}

/// The full declared set of services and volumes for one deployment
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Project name
    pub name: String,
    /// Services in declaration order
    services: Vec<ServiceSpec>,
    /// Name to declaration index
    index: HashMap<String, usize>,
    /// Declared volume names (including implicit declarations by reference)
    volumes: Vec<String>,
}

impl Topology {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a service, failing on a duplicate name
    pub fn add_service(&mut self, spec: ServiceSpec) -> Result<()> {
        if self.index.contains_key(&spec.name) {
            return Err(BerthError::Spec(format!(
                "duplicate service name: {}",
                spec.name
            )));
        }
        self.index.insert(spec.name.clone(), self.services.len());
        self.services.push(spec);
        Ok(())
    }

    /// Declare a volume; redeclaration is a no-op
    pub fn add_volume(&mut self, name: &str) {
        if !self.volumes.iter().any(|v| v == name) {
            self.volumes.push(name.to_string());
        }
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    /// Declaration index of a service
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Services in declaration order
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Declared volume names
    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_parsing() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!(
            "always".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            "unless-stopped".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: DEFAULT_MAX_RETRIES
            }
        );
        assert_eq!(
            "on-failure:5".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: 5 }
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("on-failure:many".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_port_mapping_parsing() {
        let p: PortMapping = "8080:80".parse().unwrap();
        assert_eq!(p.host_port, 8080);
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, Protocol::Tcp);

        let p: PortMapping = "53:53/udp".parse().unwrap();
        assert_eq!(p.protocol, Protocol::Udp);

        assert!("80".parse::<PortMapping>().is_err());
        assert!("eighty:80".parse::<PortMapping>().is_err());
        assert!("80:80/sctp".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_mount_parsing() {
        let m: MountSpec = "data:/var/lib/data".parse().unwrap();
        assert_eq!(m.source, MountSource::Volume("data".to_string()));
        assert!(!m.read_only);

        let m: MountSpec = "./conf:/etc/app:ro".parse().unwrap();
        assert_eq!(m.source, MountSource::Bind(PathBuf::from("./conf")));
        assert!(m.read_only);

        assert!("data".parse::<MountSpec>().is_err());
        assert!("data:relative/path".parse::<MountSpec>().is_err());
        assert!("data:/target:rx".parse::<MountSpec>().is_err());
    }

    #[test]
    fn test_topology_rejects_duplicates() {
        let mut topo = Topology::new("app");
        topo.add_service(ServiceSpec::new("db", "postgres:16")).unwrap();
        let err = topo.add_service(ServiceSpec::new("db", "mysql:8"));
        assert!(err.is_err());
    }

    #[test]
    fn test_topology_declaration_order() {
        let mut topo = Topology::new("app");
        topo.add_service(ServiceSpec::new("web", "nginx")).unwrap();
        topo.add_service(ServiceSpec::new("db", "postgres:16")).unwrap();

        assert_eq!(topo.position("web"), Some(0));
        assert_eq!(topo.position("db"), Some(1));
        assert_eq!(topo.services()[0].name, "web");
    }
}
