//! Service name resolution
//!
//! Maps service names to addresses reachable by other services in the same
//! topology. Entries exist only while the service is Running; the startup
//! sequencing makes a miss the uncommon path, surfaced as
//! `DependencyNotReady` for callers that race it.

use crate::error::{BerthError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Private range the resolver allocates from
const ADDRESS_PREFIX: &str = "10.88";

/// Name-to-address registry for one topology
pub struct NameResolver {
    /// Live entries, present only while the service is Running
    entries: RwLock<HashMap<String, String>>,
    /// Sticky allocations so a service keeps its address across restarts
    assigned: Mutex<HashMap<String, String>>,
    next_host: Mutex<u32>,
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NameResolver {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            assigned: Mutex::new(HashMap::new()),
            // .0 and .1 are reserved for the network and gateway
            next_host: Mutex::new(2),
        }
    }

    /// Register a service that reached Running and return its address.
    ///
    /// A service keeps its address across restarts within one topology.
    pub fn register(&self, name: &str, port: Option<u16>) -> Result<String> {
        let mut assigned = self
            .assigned
            .lock()
            .map_err(|_| BerthError::Lock("failed to acquire allocator lock".to_string()))?;

        let address = match assigned.get(name) {
            Some(existing) => existing.clone(),
            None => {
                let host = {
                    let mut next = self.next_host.lock().map_err(|_| {
                        BerthError::Lock("failed to acquire allocator lock".to_string())
                    })?;
                    let host = *next;
                    *next += 1;
                    host
                };
                let ip = format!("{}.{}.{}", ADDRESS_PREFIX, host / 256, host % 256);
                let address = match port {
                    Some(port) => format!("{}:{}", ip, port),
                    None => ip,
                };
                assigned.insert(name.to_string(), address.clone());
                address
            }
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|_| BerthError::Lock("failed to acquire write lock".to_string()))?;
        entries.insert(name.to_string(), address.clone());
        Ok(address)
    }

    /// Resolve a service name to its address
    pub fn resolve(&self, name: &str) -> Result<String> {
        let entries = self
            .entries
            .read()
            .map_err(|_| BerthError::Lock("failed to acquire read lock".to_string()))?;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::DependencyNotReady(name.to_string()))
    }

    /// Drop a service's entry when it leaves Running
    pub fn deregister(&self, name: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BerthError::Lock("failed to acquire write lock".to_string()))?;
        entries.remove(name);
        Ok(())
    }
}
