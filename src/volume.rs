//! Named volume management
//!
//! Volumes are created lazily on first reference and never removed as a side
//! effect of removing the services that mount them; data outlives instances.

use crate::error::{BerthError, Result};
use crate::runtime::{RuntimeDriver, VolumeRef};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Handle to an ensured volume
#[derive(Debug, Clone)]
pub struct VolumeHandle {
    /// Volume name
    pub name: String,
    /// Backing reference, opaque to the orchestrator
    pub backing: VolumeRef,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Volume manager
pub struct VolumeManager {
    driver: Arc<dyn RuntimeDriver>,
    /// Ensured volumes indexed by name
    volumes: RwLock<HashMap<String, VolumeHandle>>,
    /// Services currently holding each volume (Starting or Running)
    references: RwLock<HashMap<String, HashSet<String>>>,
}

impl VolumeManager {
    pub fn new(driver: Arc<dyn RuntimeDriver>) -> Self {
        Self {
            driver,
            volumes: RwLock::new(HashMap::new()),
            references: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure a volume exists, creating it through the driver on first use.
    ///
    /// Idempotent: repeated calls return the same handle and issue exactly
    /// one creation call against the engine.
    pub fn ensure(&self, name: &str) -> Result<VolumeHandle> {
        {
            let volumes = self
                .volumes
                .read()
                .map_err(|_| BerthError::Lock("failed to acquire read lock".to_string()))?;
            if let Some(handle) = volumes.get(name) {
                return Ok(handle.clone());
            }
        }

        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("failed to acquire write lock".to_string()))?;

        // Raced ensure may have created it between the two locks.
        if let Some(handle) = volumes.get(name) {
            return Ok(handle.clone());
        }

        let backing = self.driver.create_volume(name)?;
        let handle = VolumeHandle {
            name: name.to_string(),
            backing,
            created_at: Utc::now(),
        };
        volumes.insert(name.to_string(), handle.clone());
        tracing::debug!("created volume {}", name);
        Ok(handle)
    }

    /// Get an already-ensured volume
    pub fn get(&self, name: &str) -> Result<VolumeHandle> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| BerthError::Lock("failed to acquire read lock".to_string()))?;
        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))
    }

    /// List ensured volumes
    pub fn list(&self) -> Result<Vec<VolumeHandle>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| BerthError::Lock("failed to acquire read lock".to_string()))?;
        Ok(volumes.values().cloned().collect())
    }

    /// Remove a volume, refusing while any live instance references it
    pub fn remove(&self, name: &str) -> Result<()> {
        {
            let references = self
                .references
                .read()
                .map_err(|_| BerthError::Lock("failed to acquire read lock".to_string()))?;
            if let Some(holders) = references.get(name) {
                if !holders.is_empty() {
                    let mut used_by: Vec<String> = holders.iter().cloned().collect();
                    used_by.sort();
                    return Err(BerthError::VolumeInUse {
                        name: name.to_string(),
                        used_by,
                    });
                }
            }
        }

        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("failed to acquire write lock".to_string()))?;
        let handle = volumes
            .remove(name)
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))?;

        self.driver.remove_volume(&handle.backing)?;
        tracing::debug!("removed volume {}", name);
        Ok(())
    }

    /// Record that a service holds a volume (entering Starting)
    pub fn add_reference(&self, volume: &str, service: &str) -> Result<()> {
        let mut references = self
            .references
            .write()
            .map_err(|_| BerthError::Lock("failed to acquire write lock".to_string()))?;
        references
            .entry(volume.to_string())
            .or_default()
            .insert(service.to_string());
        Ok(())
    }

    /// Record that a service released a volume (left Running)
    pub fn remove_reference(&self, volume: &str, service: &str) -> Result<()> {
        let mut references = self
            .references
            .write()
            .map_err(|_| BerthError::Lock("failed to acquire write lock".to_string()))?;
        if let Some(holders) = references.get_mut(volume) {
            holders.remove(service);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SimulatedDriver;

    fn manager() -> (Arc<SimulatedDriver>, VolumeManager) {
        let driver = Arc::new(SimulatedDriver::new());
        let manager = VolumeManager::new(driver.clone());
        (driver, manager)
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (driver, manager) = manager();

        let first = manager.ensure("data").unwrap();
        let second = manager.ensure("data").unwrap();

        assert_eq!(first.backing, second.backing);
        assert_eq!(driver.volume_create_count(), 1);
    }

    #[test]
    fn test_remove_in_use_fails() {
        let (_, manager) = manager();

        manager.ensure("data").unwrap();
        manager.add_reference("data", "db").unwrap();

        let err = manager.remove("data").unwrap_err();
        match err {
            BerthError::VolumeInUse { name, used_by } => {
                assert_eq!(name, "data");
                assert_eq!(used_by, vec!["db".to_string()]);
            }
            other => panic!("expected volume-in-use error, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_after_release_succeeds() {
        let (_, manager) = manager();

        manager.ensure("data").unwrap();
        manager.add_reference("data", "db").unwrap();
        manager.remove_reference("data", "db").unwrap();

        manager.remove("data").unwrap();
        assert!(manager.get("data").is_err());
    }

    #[test]
    fn test_remove_unknown_volume() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.remove("ghost"),
            Err(BerthError::VolumeNotFound(_))
        ));
    }
}
