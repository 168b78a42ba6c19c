//! Simulated runtime driver
//!
//! An in-memory engine with per-image scripted behaviour. It backs the test
//! suite and the CLI's development mode; no real containers are involved.

use super::driver::{
    DriverError, InstanceRef, InstanceSignal, ResolvedMount, RuntimeDriver, RuntimeEvent,
    VolumeRef,
};
use crate::spec::ServiceSpec;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Exit code reported for a force-killed instance
pub const KILLED_EXIT_CODE: i32 = 137;

/// Scripted behaviour for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    /// Report running and stay up until stopped
    Run,
    /// Report running after a delay
    DelayedRun(Duration),
    /// Report running, then exit immediately with the given code
    ExitWith(i32),
    /// Report running and ignore graceful stops; only a kill brings it down
    IgnoreStop,
    /// Refuse creation with an image-not-found error
    MissingImage,
    /// Refuse creation with a transient error this many times, then run
    TransientCreate(u32),
}

struct SimInstance {
    service: String,
    behavior: SimBehavior,
    running: bool,
}

/// In-memory runtime driver
#[derive(Default)]
pub struct SimulatedDriver {
    behaviors: Mutex<HashMap<String, SimBehavior>>,
    instances: Mutex<HashMap<InstanceRef, SimInstance>>,
    events: Mutex<Option<mpsc::UnboundedSender<RuntimeEvent>>>,
    volume_creates: Mutex<Vec<String>>,
    volume_removes: Mutex<Vec<VolumeRef>>,
    create_attempts: Mutex<HashMap<String, u32>>,
    create_log: Mutex<Vec<String>>,
    start_log: Mutex<Vec<String>>,
    stop_log: Mutex<Vec<String>>,
    kill_log: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour for instances of an image
    pub fn with_behavior(self, image: &str, behavior: SimBehavior) -> Self {
        lock(&self.behaviors).insert(image.to_string(), behavior);
        self
    }

    /// Number of create_volume calls issued so far
    pub fn volume_create_count(&self) -> usize {
        lock(&self.volume_creates).len()
    }

    /// Number of create calls issued for a service, refused ones included
    pub fn create_count(&self, service: &str) -> u32 {
        lock(&self.create_log).iter().filter(|s| *s == service).count() as u32
    }

    /// Service names in the order their instances were started
    pub fn start_log(&self) -> Vec<String> {
        lock(&self.start_log).clone()
    }

    /// Number of start calls issued for a service
    pub fn start_count(&self, service: &str) -> u32 {
        lock(&self.start_log).iter().filter(|s| *s == service).count() as u32
    }

    /// Service names in the order graceful stops were requested
    pub fn stop_log(&self) -> Vec<String> {
        lock(&self.stop_log).clone()
    }

    /// Number of force-kill calls issued so far
    pub fn kill_call_count(&self) -> usize {
        lock(&self.kill_log).len()
    }

    fn behavior_for(&self, image: &str) -> SimBehavior {
        lock(&self.behaviors)
            .get(image)
            .copied()
            .unwrap_or(SimBehavior::Run)
    }

    fn emit(&self, instance: &InstanceRef, signal: InstanceSignal) {
        if let Some(sender) = lock(&self.events).as_ref() {
            let _ = sender.send(RuntimeEvent {
                instance: instance.clone(),
                signal,
            });
        }
    }

    fn short_id() -> String {
        Uuid::new_v4().to_string().replace('-', "")[..12].to_string()
    }
}

impl RuntimeDriver for SimulatedDriver {
    fn create(
        &self,
        spec: &ServiceSpec,
        _env: &HashMap<String, String>,
        _mounts: &[ResolvedMount],
    ) -> Result<InstanceRef, DriverError> {
        let image = spec.image.clone().unwrap_or_default();
        let behavior = self.behavior_for(&image);
        lock(&self.create_log).push(spec.name.clone());

        if behavior == SimBehavior::MissingImage {
            return Err(DriverError::ImageNotFound(image));
        }

        let behavior = match behavior {
            SimBehavior::TransientCreate(failures) => {
                let mut attempts = lock(&self.create_attempts);
                let seen = attempts.entry(image.clone()).or_insert(0);
                *seen += 1;
                if *seen <= failures {
                    return Err(DriverError::Transient(format!(
                        "create failed for image {}",
                        image
                    )));
                }
                SimBehavior::Run
            }
            other => other,
        };

        let instance = InstanceRef(Self::short_id());
        lock(&self.instances).insert(
            instance.clone(),
            SimInstance {
                service: spec.name.clone(),
                behavior,
                running: false,
            },
        );
        Ok(instance)
    }

    fn start(&self, instance: &InstanceRef) -> Result<(), DriverError> {
        let (service, behavior) = {
            let mut instances = lock(&self.instances);
            let sim = instances
                .get_mut(instance)
                .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
            sim.running = true;
            (sim.service.clone(), sim.behavior)
        };

        lock(&self.start_log).push(service);

        match behavior {
            SimBehavior::Run | SimBehavior::IgnoreStop => {
                self.emit(instance, InstanceSignal::Running);
            }
            SimBehavior::DelayedRun(delay) => {
                let sender = lock(&self.events).clone();
                let instance = instance.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(sender) = sender {
                        let _ = sender.send(RuntimeEvent {
                            instance,
                            signal: InstanceSignal::Running,
                        });
                    }
                });
            }
            SimBehavior::ExitWith(code) => {
                self.emit(instance, InstanceSignal::Running);
                self.emit(instance, InstanceSignal::Exited(code));
                if let Some(sim) = lock(&self.instances).get_mut(instance) {
                    sim.running = false;
                }
            }
            SimBehavior::MissingImage | SimBehavior::TransientCreate(_) => {
                unreachable!("rejected or downgraded at create")
            }
        }

        Ok(())
    }

    fn stop(&self, instance: &InstanceRef, _grace: Duration) -> Result<(), DriverError> {
        let mut instances = lock(&self.instances);
        let sim = instances
            .get_mut(instance)
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
        lock(&self.stop_log).push(sim.service.clone());

        if sim.behavior == SimBehavior::IgnoreStop || !sim.running {
            return Ok(());
        }
        sim.running = false;
        drop(instances);

        self.emit(instance, InstanceSignal::Exited(0));
        Ok(())
    }

    fn force_kill(&self, instance: &InstanceRef) -> Result<(), DriverError> {
        let mut instances = lock(&self.instances);
        let sim = instances
            .get_mut(instance)
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
        lock(&self.kill_log).push(sim.service.clone());

        if sim.running {
            sim.running = false;
            drop(instances);
            self.emit(instance, InstanceSignal::Exited(KILLED_EXIT_CODE));
        }
        Ok(())
    }

    fn remove(&self, instance: &InstanceRef) -> Result<(), DriverError> {
        lock(&self.instances)
            .remove(instance)
            .map(|_| ())
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))
    }

    fn create_volume(&self, name: &str) -> Result<VolumeRef, DriverError> {
        lock(&self.volume_creates).push(name.to_string());
        Ok(VolumeRef(format!("vol-{}-{}", name, Self::short_id())))
    }

    fn remove_volume(&self, volume: &VolumeRef) -> Result<(), DriverError> {
        lock(&self.volume_removes).push(volume.clone());
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RuntimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        rx
    }
}
