//! Topology-level orchestration
//!
//! The orchestrator owns one topology end to end: it plans the startup
//! order, spawns one supervisor task per service, routes engine events to
//! the right supervisor, and drives collective teardown in reverse order.

use super::instance::{
    InstanceCommand, InstanceState, ReadySignal, RouteTable, ServiceInstance, ServiceReport,
    Supervisor,
};
use crate::error::{BerthError, Result};
use crate::plan;
use crate::resolve::NameResolver;
use crate::runtime::{RuntimeDriver, RuntimeEvent};
use crate::spec::Topology;
use crate::volume::VolumeManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Control handle for one supervised service
struct ServiceHandle {
    shared: Arc<Mutex<ServiceInstance>>,
    cmd_tx: mpsc::UnboundedSender<InstanceCommand>,
    ready_rx: watch::Receiver<ReadySignal>,
    join: Option<JoinHandle<ServiceReport>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Orchestrator for one topology
pub struct Orchestrator {
    topology: Topology,
    driver: Arc<dyn RuntimeDriver>,
    volumes: Arc<VolumeManager>,
    resolver: Arc<NameResolver>,
    handles: HashMap<String, ServiceHandle>,
    /// Startup order recorded by `up`, reversed for teardown
    startup: Option<Vec<String>>,
    cancel_tx: watch::Sender<bool>,
    routes: RouteTable,
    router: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(topology: Topology, driver: Arc<dyn RuntimeDriver>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            topology,
            volumes: Arc::new(VolumeManager::new(driver.clone())),
            resolver: Arc::new(NameResolver::new()),
            driver,
            handles: HashMap::new(),
            startup: None,
            cancel_tx,
            routes: Arc::new(RwLock::new(HashMap::new())),
            router: None,
        }
    }

    /// Volume manager for this topology
    pub fn volumes(&self) -> Arc<VolumeManager> {
        self.volumes.clone()
    }

    /// Startup order without starting anything
    pub fn plan(&self) -> Result<Vec<String>> {
        plan::startup_order(&self.topology)
    }

    /// Bring the whole topology up.
    ///
    /// Fails before any instance is created when the dependency graph has a
    /// cycle. Returns once every service has left Pending, either by
    /// reaching Running or by going terminal.
    pub async fn up(&mut self) -> Result<Vec<ServiceReport>> {
        if self.router.is_some() {
            return Err(BerthError::Spec(format!(
                "topology {} is already running",
                self.topology.name
            )));
        }

        let order = plan::startup_order(&self.topology)?;
        tracing::info!(
            "starting topology {} ({} services): {}",
            self.topology.name,
            order.len(),
            order.join(", ")
        );

        self.router = Some(self.spawn_router());

        // Readiness channels come first so dependents can subscribe to
        // dependencies regardless of spawn order.
        let mut ready_txs: HashMap<String, watch::Sender<ReadySignal>> = HashMap::new();
        let mut ready_rxs: HashMap<String, watch::Receiver<ReadySignal>> = HashMap::new();
        for name in &order {
            let (tx, rx) = watch::channel(ReadySignal::Pending);
            ready_txs.insert(name.clone(), tx);
            ready_rxs.insert(name.clone(), rx);
        }

        for name in &order {
            let spec = self
                .topology
                .service(name)
                .ok_or_else(|| BerthError::ServiceNotFound(name.clone()))?
                .clone();

            let deps = spec
                .depends_on
                .iter()
                .map(|dep| {
                    let rx = ready_rxs
                        .get(dep)
                        .cloned()
                        .ok_or_else(|| BerthError::ServiceNotFound(dep.clone()))?;
                    Ok((dep.clone(), rx))
                })
                .collect::<Result<Vec<_>>>()?;

            let shared = Arc::new(Mutex::new(ServiceInstance::new(name)));
            let (event_tx, events) = mpsc::unbounded_channel();
            let (cmd_tx, commands) = mpsc::unbounded_channel();
            let ready_tx = ready_txs
                .remove(name)
                .ok_or_else(|| BerthError::ServiceNotFound(name.clone()))?;
            let ready_rx = ready_rxs
                .get(name)
                .cloned()
                .ok_or_else(|| BerthError::ServiceNotFound(name.clone()))?;

            let supervisor = Supervisor {
                spec,
                driver: self.driver.clone(),
                volumes: self.volumes.clone(),
                resolver: self.resolver.clone(),
                shared: shared.clone(),
                routes: self.routes.clone(),
                event_tx,
                events,
                commands,
                ready_tx,
                deps,
                cancel: self.cancel_tx.subscribe(),
            };

            self.handles.insert(
                name.clone(),
                ServiceHandle {
                    shared,
                    cmd_tx,
                    ready_rx,
                    join: Some(tokio::spawn(supervisor.run())),
                },
            );
        }

        // Wait for each service, in plan order, to leave Pending.
        for name in &order {
            if let Some(handle) = self.handles.get(name) {
                let mut rx = handle.ready_rx.clone();
                while *rx.borrow() == ReadySignal::Pending {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }

        self.startup = Some(order);
        self.status()
    }

    /// Tear the topology down in reverse startup order.
    ///
    /// A `down` with nothing running reports nothing.
    pub async fn down(&mut self) -> Result<Vec<ServiceReport>> {
        let startup = match self.startup.take() {
            Some(order) => order,
            None => return Ok(Vec::new()),
        };
        tracing::info!("stopping topology {}", self.topology.name);

        let mut reports = Vec::with_capacity(startup.len());
        for name in plan::teardown_order(&startup) {
            if let Some(mut handle) = self.handles.remove(&name) {
                // Send errors just mean the supervisor already finished.
                let _ = handle.cmd_tx.send(InstanceCommand::Stop);
                match handle.join.take() {
                    Some(join) => match join.await {
                        Ok(report) => reports.push(report),
                        Err(e) => {
                            tracing::warn!("supervisor for {} panicked: {}", name, e);
                            reports.push(snapshot_report(&handle.shared));
                        }
                    },
                    // Already reaped by an individual stop; report as-is.
                    None => reports.push(snapshot_report(&handle.shared)),
                }
            }
        }

        if let Some(router) = self.router.take() {
            router.abort();
        }
        Ok(reports)
    }

    /// Stop one service without touching its dependents
    pub async fn stop_service(&mut self, name: &str) -> Result<ServiceReport> {
        let handle = self
            .handles
            .get_mut(name)
            .ok_or_else(|| BerthError::InstanceNotFound(name.to_string()))?;

        let _ = handle.cmd_tx.send(InstanceCommand::Stop);
        match handle.join.take() {
            Some(join) => join
                .await
                .map_err(|e| BerthError::Lock(format!("supervisor for {} panicked: {}", name, e))),
            None => Ok(snapshot_report(&handle.shared)),
        }
    }

    /// Signal every supervisor to wind down; used for interrupt handling
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Current per-service reports in declaration order
    pub fn status(&self) -> Result<Vec<ServiceReport>> {
        Ok(self
            .topology
            .services()
            .iter()
            .filter_map(|spec| self.handles.get(&spec.name))
            .map(|handle| snapshot_report(&handle.shared))
            .collect())
    }

    /// Current state of one service
    pub fn service_state(&self, name: &str) -> Result<InstanceState> {
        let handle = self
            .handles
            .get(name)
            .ok_or_else(|| BerthError::InstanceNotFound(name.to_string()))?;
        Ok(lock(&handle.shared).state)
    }

    /// Forward engine events to the supervisor owning each instance
    fn spawn_router(&self) -> JoinHandle<()> {
        let mut events = self.driver.subscribe();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(RuntimeEvent { instance, signal }) = events.recv().await {
                let target = routes.read().ok().and_then(|r| r.get(&instance).cloned());
                match target {
                    Some(tx) => {
                        let _ = tx.send(signal);
                    }
                    None => tracing::trace!("event for unrouted instance {}", instance),
                }
            }
        })
    }
}

fn snapshot_report(shared: &Arc<Mutex<ServiceInstance>>) -> ServiceReport {
    let shared = lock(shared);
    ServiceReport {
        service: shared.service.clone(),
        state: shared.state,
        error: shared.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{SimBehavior, SimulatedDriver};
    use crate::spec::SpecLoader;
    use std::time::Duration;

    fn load(yaml: &str) -> Topology {
        SpecLoader::load_str_with_env(yaml, &HashMap::new()).unwrap()
    }

    const CHAIN: &str = r#"
name: stack
services:
  web:
    image: nginx
    depends_on: [api]
  api:
    image: node
    depends_on: [db]
  db:
    image: postgres
"#;

    #[tokio::test]
    async fn test_up_starts_in_dependency_order() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(load(CHAIN), driver.clone());

        let reports = orch.up().await.unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.state == InstanceState::Running));
        assert_eq!(driver.start_log(), vec!["db", "api", "web"]);

        orch.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_down_stops_in_reverse_order() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(load(CHAIN), driver.clone());

        orch.up().await.unwrap();
        let reports = orch.down().await.unwrap();

        assert!(reports.iter().all(|r| r.state == InstanceState::Stopped));
        assert_eq!(driver.stop_log(), vec!["web", "api", "db"]);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_start() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(
            load(
                r#"
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: x
    depends_on: [a]
"#,
            ),
            driver.clone(),
        );

        let err = orch.up().await.unwrap_err();
        assert!(matches!(err, BerthError::Cycle(_)));
        assert!(driver.start_log().is_empty());
        assert!(orch.down().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent() {
        let driver =
            Arc::new(SimulatedDriver::new().with_behavior("ghost", SimBehavior::MissingImage));
        let mut orch = Orchestrator::new(
            load(
                r#"
services:
  api:
    image: node
    depends_on: [db]
  db:
    image: ghost
"#,
            ),
            driver.clone(),
        );

        let reports = orch.up().await.unwrap();
        assert!(reports.iter().all(|r| r.state == InstanceState::Failed));

        let api = reports.iter().find(|r| r.service == "api").unwrap();
        assert!(api
            .error
            .as_deref()
            .unwrap()
            .contains("dependency not ready: db"));
        // neither the dead dependency nor its dependent ever started
        assert!(driver.start_log().is_empty());

        orch.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_on_failure_gives_up_after_ceiling() {
        let driver =
            Arc::new(SimulatedDriver::new().with_behavior("crasher", SimBehavior::ExitWith(1)));
        let mut orch = Orchestrator::new(
            load(
                r#"
services:
  worker:
    image: crasher
    restart: on-failure:2
"#,
            ),
            driver.clone(),
        );

        orch.up().await.unwrap();
        while orch.service_state("worker").unwrap() != InstanceState::Failed {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(driver.start_count("worker"), 3);
        orch.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_service_leaves_the_rest_running() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(load(CHAIN), driver.clone());

        orch.up().await.unwrap();
        let report = orch.stop_service("web").await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);

        assert_eq!(orch.service_state("db").unwrap(), InstanceState::Running);
        assert_eq!(orch.service_state("api").unwrap(), InstanceState::Running);
        orch.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_down_reports_individually_stopped_services() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(load(CHAIN), driver.clone());

        orch.up().await.unwrap();
        orch.stop_service("web").await.unwrap();

        let reports = orch.down().await.unwrap();
        assert_eq!(reports.len(), 3);
        let web = reports.iter().find(|r| r.service == "web").unwrap();
        assert_eq!(web.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_volume_held_while_up_and_removable_after_down() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(
            load(
                r#"
services:
  db:
    image: postgres
    volumes:
      - data:/var/lib/postgresql/data
volumes:
  data:
"#,
            ),
            driver.clone(),
        );

        orch.up().await.unwrap();
        let volumes = orch.volumes();
        match volumes.remove("data") {
            Err(BerthError::VolumeInUse { used_by, .. }) => {
                assert_eq!(used_by, vec!["db".to_string()]);
            }
            other => panic!("expected volume-in-use error, got {:?}", other),
        }

        orch.down().await.unwrap();
        volumes.remove("data").unwrap();
    }

    #[tokio::test]
    async fn test_environment_carries_dependency_address() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(
            load(
                r#"
services:
  api:
    image: node
    depends_on: [db]
  db:
    image: postgres
    ports:
      - "5432:5432"
"#,
            ),
            driver.clone(),
        );

        let reports = orch.up().await.unwrap();
        assert!(reports.iter().all(|r| r.state == InstanceState::Running));
        assert_eq!(orch.resolver.resolve("db").unwrap(), "10.88.0.2:5432");

        orch.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_up_is_rejected() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut orch = Orchestrator::new(load(CHAIN), driver.clone());

        orch.up().await.unwrap();
        assert!(orch.up().await.is_err());
        orch.down().await.unwrap();
    }
}
