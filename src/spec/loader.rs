//! Topology file loading and validation
//!
//! Parsing is pure with respect to the runtime driver: the loader never
//! touches the container engine, it only produces (or refuses to produce)
//! a [`Topology`].

use super::model::{ServiceSpec, Topology, DEFAULT_STOP_GRACE};
use super::raw::{CommandField, EnvironmentField, RawService, RawVolume, TopologyDoc};
use crate::error::{BerthError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default topology file names, probed in order
pub const DEFAULT_TOPOLOGY_FILES: &[&str] = &[
    "berth.yaml",
    "berth.yml",
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Topology file loader
pub struct SpecLoader;

impl SpecLoader {
    /// Find a topology file in a directory
    pub fn find_file(dir: &Path) -> Option<std::path::PathBuf> {
        for name in DEFAULT_TOPOLOGY_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Load a topology from a file, interpolating from the process environment
    pub fn load_file(path: &Path) -> Result<Topology> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BerthError::Spec(format!("failed to read {}: {}", path.display(), e)))?;
        Self::load_str(&content)
    }

    /// Load a topology from a string, interpolating from the process environment
    pub fn load_str(content: &str) -> Result<Topology> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_str_with_env(content, &env)
    }

    /// Load a topology from a string with an explicit interpolation environment
    pub fn load_str_with_env(content: &str, env: &HashMap<String, String>) -> Result<Topology> {
        let doc: TopologyDoc = serde_yaml::from_str(content)
            .map_err(|e| BerthError::Spec(format!("failed to parse topology: {}", e)))?;

        let mut topology = Topology::new(doc.name.as_deref().unwrap_or("berth"));

        // Explicitly declared volumes first, in declaration order.
        for (key, value) in &doc.volumes {
            let name = mapping_key(key, "volume")?;
            if !value.is_null() {
                let _: RawVolume = serde_yaml::from_value(value.clone())
                    .map_err(|e| BerthError::Spec(format!("volume {}: {}", name, e)))?;
            }
            topology.add_volume(&name);
        }

        for (key, value) in &doc.services {
            let name = mapping_key(key, "service")?;
            let raw: RawService = serde_yaml::from_value(value.clone())
                .map_err(|e| BerthError::Spec(format!("service {}: {}", name, e)))?;
            let spec = Self::normalize(&name, raw, env)?;

            // Named volumes referenced without a declaration are declared
            // implicitly; they come into existence on first use either way.
            for volume in spec.volume_names() {
                topology.add_volume(volume);
            }

            topology.add_service(spec)?;
        }

        Self::validate(&topology)?;
        Ok(topology)
    }

    /// Convert a raw service entry into a [`ServiceSpec`]
    fn normalize(name: &str, raw: RawService, env: &HashMap<String, String>) -> Result<ServiceSpec> {
        if raw.image.is_none() && raw.build.is_none() {
            return Err(BerthError::Spec(format!(
                "service {} must have either 'image' or 'build'",
                name
            )));
        }

        let command = match raw.command {
            Some(CommandField::Shell(s)) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), s]
            }
            Some(CommandField::Exec(arr)) => arr,
            None => Vec::new(),
        };

        let mut environment = HashMap::new();
        match raw.environment {
            Some(EnvironmentField::Array(arr)) => {
                for item in arr {
                    let (key, value) = item.split_once('=').ok_or_else(|| {
                        BerthError::Spec(format!(
                            "service {}: malformed environment entry: {}",
                            name, item
                        ))
                    })?;
                    environment.insert(key.to_string(), interpolate(value, env));
                }
            }
            Some(EnvironmentField::Map(map)) => {
                for (key, value) in map {
                    let value = value.map(|v| interpolate(&v, env)).unwrap_or_default();
                    environment.insert(key, value);
                }
            }
            None => {}
        }

        let ports = raw
            .ports
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| BerthError::Spec(format!("service {}: {}", name, e)))?;

        let mounts = raw
            .volumes
            .iter()
            .map(|m| m.parse())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| BerthError::Spec(format!("service {}: {}", name, e)))?;

        let restart = match raw.restart.as_deref() {
            Some(policy) => policy
                .parse()
                .map_err(|e| BerthError::Spec(format!("service {}: {}", name, e)))?,
            None => Default::default(),
        };

        let stop_grace_period = match raw.stop_grace_period.as_deref() {
            Some(period) => parse_grace_period(period)
                .ok_or_else(|| {
                    BerthError::Spec(format!(
                        "service {}: malformed stop_grace_period: {}",
                        name, period
                    ))
                })?,
            None => DEFAULT_STOP_GRACE,
        };

        let mut depends_on = raw.depends_on.map(|d| d.names()).unwrap_or_default();
        depends_on.sort();
        depends_on.dedup();

        Ok(ServiceSpec {
            name: name.to_string(),
            image: raw.image.map(|i| interpolate(&i, env)),
            build: raw.build.map(Into::into),
            command,
            ports,
            environment,
            mounts,
            depends_on,
            restart,
            stop_grace_period,
        })
    }

    /// Cross-service checks over the assembled topology
    fn validate(topology: &Topology) -> Result<()> {
        for service in topology.services() {
            for dep in &service.depends_on {
                if topology.service(dep).is_none() {
                    return Err(BerthError::Spec(format!(
                        "service {} depends on undeclared service {}",
                        service.name, dep
                    )));
                }
            }
        }
        Ok(())
    }
}

fn mapping_key(key: &serde_yaml::Value, kind: &str) -> Result<String> {
    key.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| BerthError::Spec(format!("{} names must be strings", kind)))
}

/// Parse a grace period like "10s", "500ms" or "1m"
fn parse_grace_period(s: &str) -> Option<Duration> {
    let re = regex::Regex::new(r"^(\d+)(ms|s|m)$").expect("valid regex");
    let caps = re.captures(s)?;
    let count: u64 = caps[1].parse().ok()?;
    match &caps[2] {
        "ms" => Some(Duration::from_millis(count)),
        "s" => Some(Duration::from_secs(count)),
        "m" => Some(Duration::from_secs(count * 60)),
        _ => None,
    }
}

/// Interpolate `${VAR}`, `$VAR` and `${VAR:-default}` references
///
/// Variable names are matched whole, so `$PORT` never fires inside
/// `$PORTAL`. Unset variables resolve to their default or the empty string.
fn interpolate(s: &str, env: &HashMap<String, String>) -> String {
    let re = regex::Regex::new(
        r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("valid regex");

    re.replace_all(s, |caps: &regex::Captures| {
        let var = caps
            .get(1)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        env.get(var)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    })
    .to_string()
}
