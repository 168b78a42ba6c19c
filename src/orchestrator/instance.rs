//! Per-service instance state machine and supervisor task
//!
//! Each service gets one supervisor task that owns every transition of its
//! instance: `Pending → Starting → Running → (Stopping → Stopped) | Failed`.
//! The task waits for dependency readiness, drives the runtime driver,
//! reacts to the engine's event stream and enforces the restart policy.
//! Transitions are serialized by construction; nothing else mutates the
//! instance.

use crate::error::{BerthError, Result};
use crate::resolve::NameResolver;
use crate::runtime::{
    InstanceRef, InstanceSignal, ResolvedMount, ResolvedSource, RuntimeDriver,
};
use crate::spec::{MountSource, RestartPolicy, ServiceSpec};
use crate::volume::VolumeManager;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Base delay for restart backoff
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Ceiling for restart backoff
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Current state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Not yet started
    Pending,
    /// Create+start issued, waiting for a running status
    Starting,
    /// The engine reported the instance running
    Running,
    /// Stop requested, waiting for termination
    Stopping,
    /// Terminated with a clean exit or by request
    Stopped,
    /// Terminated abnormally, or gave up relaunching
    Failed,
}

impl InstanceState {
    /// Whether the supervisor is done with this instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime binding of a service spec to a live (or exited) instance
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    /// Service name
    pub service: String,
    /// Current state
    pub state: InstanceState,
    /// Engine handle of the current or last instance
    pub instance_ref: Option<InstanceRef>,
    /// Last observed exit code
    pub exit_code: Option<i32>,
    /// Number of relaunches performed
    pub restart_count: u32,
    /// Timestamp of the last start call
    pub last_started_at: Option<DateTime<Utc>>,
    /// Whether the most recent stop was user-issued
    pub user_stopped: bool,
    /// Last error, if any
    pub error: Option<String>,
}

impl ServiceInstance {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: InstanceState::Pending,
            instance_ref: None,
            exit_code: None,
            restart_count: 0,
            last_started_at: None,
            user_stopped: false,
            error: None,
        }
    }
}

/// Readiness signal a supervisor publishes for its dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySignal {
    /// Not running yet (initial, or between relaunches)
    Pending,
    /// Reached Running; dependents may start
    Running,
    /// Terminal; dependents still waiting will never be unblocked
    Terminal,
}

/// Command sent to a supervisor
#[derive(Debug, Clone, Copy)]
pub enum InstanceCommand {
    /// Stop the instance; during Starting this becomes a pending intent
    Stop,
}

/// Per-service outcome of an `up` or `down`
#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub service: String,
    pub state: InstanceState,
    pub error: Option<String>,
}

/// Routing table from engine instance handles to supervisor event inboxes
pub(crate) type RouteTable =
    Arc<RwLock<HashMap<InstanceRef, mpsc::UnboundedSender<InstanceSignal>>>>;

/// Exponential backoff between relaunch attempts
pub(crate) fn restart_backoff(attempt: u32) -> Duration {
    let shift = attempt.min(16);
    BACKOFF_BASE.saturating_mul(1u32 << shift).min(BACKOFF_CAP)
}

/// Whether the restart policy mandates a relaunch after an exit
pub(crate) fn should_relaunch(
    policy: RestartPolicy,
    exited_clean: bool,
    restart_count: u32,
    user_stopped: bool,
) -> bool {
    match policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFailure { max_retries } => !exited_clean && restart_count < max_retries,
        RestartPolicy::Always | RestartPolicy::UnlessStopped => !user_stopped,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a supervisor task needs to run one service
pub(crate) struct Supervisor {
    pub spec: ServiceSpec,
    pub driver: Arc<dyn RuntimeDriver>,
    pub volumes: Arc<VolumeManager>,
    pub resolver: Arc<NameResolver>,
    pub shared: Arc<Mutex<ServiceInstance>>,
    pub routes: RouteTable,
    pub event_tx: mpsc::UnboundedSender<InstanceSignal>,
    pub events: mpsc::UnboundedReceiver<InstanceSignal>,
    pub commands: mpsc::UnboundedReceiver<InstanceCommand>,
    pub ready_tx: watch::Sender<ReadySignal>,
    pub deps: Vec<(String, watch::Receiver<ReadySignal>)>,
    pub cancel: watch::Receiver<bool>,
}

/// Shared half of the supervisor, usable from helper methods
struct Ctx {
    spec: ServiceSpec,
    driver: Arc<dyn RuntimeDriver>,
    volumes: Arc<VolumeManager>,
    resolver: Arc<NameResolver>,
    shared: Arc<Mutex<ServiceInstance>>,
    routes: RouteTable,
    event_tx: mpsc::UnboundedSender<InstanceSignal>,
    ready_tx: watch::Sender<ReadySignal>,
}

enum AwaitOutcome {
    Running,
    Exited(i32),
    Interrupted,
}

enum RunCause {
    Exited(i32),
    StopRequested,
}

impl Supervisor {
    pub(crate) async fn run(self) -> ServiceReport {
        let Supervisor {
            spec,
            driver,
            volumes,
            resolver,
            shared,
            routes,
            event_tx,
            mut events,
            mut commands,
            ready_tx,
            mut deps,
            mut cancel,
        } = self;

        let ctx = Ctx {
            spec,
            driver,
            volumes,
            resolver,
            shared,
            routes,
            event_tx,
            ready_tx,
        };

        // Gate on every dependency reaching Running before the first start.
        match wait_for_dependencies(&mut deps, &mut commands, &mut cancel).await {
            DepOutcome::Ready => {}
            DepOutcome::DepFailed(dep) => {
                tracing::warn!(
                    "service {} not started: dependency {} never became ready",
                    ctx.spec.name,
                    dep
                );
                ctx.record_error(&BerthError::DependencyNotReady(dep));
                ctx.set_state(InstanceState::Failed);
                return ctx.finish();
            }
            DepOutcome::Interrupted => {
                ctx.mark_user_stopped();
                ctx.set_state(InstanceState::Stopped);
                return ctx.finish();
            }
        }

        let mut pending_stop = false;

        loop {
            ctx.set_state(InstanceState::Starting);

            let instance = match ctx.launch() {
                Ok(instance) => instance,
                Err(e) => {
                    ctx.release_volumes();
                    ctx.record_error(&e);
                    ctx.set_state(InstanceState::Failed);

                    let retryable = match &e {
                        BerthError::Driver(d) => d.is_transient(),
                        BerthError::DependencyNotReady(_) => true,
                        _ => false,
                    };
                    let relaunch = retryable
                        && should_relaunch(ctx.spec.restart, false, ctx.restart_count(), false);
                    if !relaunch {
                        return ctx.finish();
                    }
                    // A failed launch spends a retry the same as a crash,
                    // so the ceiling and the backoff growth apply uniformly.
                    ctx.bump_restart_count();
                    match ctx.backoff(&mut commands, &mut cancel).await {
                        BackoffOutcome::Continue => continue,
                        BackoffOutcome::Interrupted => {
                            ctx.mark_user_stopped();
                            return ctx.finish();
                        }
                    }
                }
            };

            // Wait for the engine to report the instance running.
            let outcome = loop {
                tokio::select! {
                    signal = events.recv() => match signal {
                        Some(InstanceSignal::Running) => break AwaitOutcome::Running,
                        Some(InstanceSignal::Exited(code)) => break AwaitOutcome::Exited(code),
                        None => break AwaitOutcome::Interrupted,
                    },
                    command = commands.recv() => match command {
                        // No lost signals: a stop during Starting is applied
                        // the moment the instance reaches Running.
                        Some(InstanceCommand::Stop) => pending_stop = true,
                        None => break AwaitOutcome::Interrupted,
                    },
                    _ = wait_cancelled(&mut cancel) => break AwaitOutcome::Interrupted,
                }
            };

            let cause = match outcome {
                AwaitOutcome::Running => {
                    ctx.set_state(InstanceState::Running);
                    let port = ctx.spec.ports.first().map(|p| p.container_port);
                    if let Err(e) = ctx.resolver.register(&ctx.spec.name, port) {
                        tracing::warn!("failed to register {}: {}", ctx.spec.name, e);
                    }
                    let _ = ctx.ready_tx.send(ReadySignal::Running);

                    if pending_stop {
                        RunCause::StopRequested
                    } else {
                        // Steady state: wait for an exit, a stop or a cancel.
                        loop {
                            tokio::select! {
                                signal = events.recv() => match signal {
                                    Some(InstanceSignal::Exited(code)) => break RunCause::Exited(code),
                                    Some(InstanceSignal::Running) => continue,
                                    None => break RunCause::StopRequested,
                                },
                                command = commands.recv() => match command {
                                    Some(InstanceCommand::Stop) | None => break RunCause::StopRequested,
                                },
                                _ = wait_cancelled(&mut cancel) => break RunCause::StopRequested,
                            }
                        }
                    }
                }
                AwaitOutcome::Exited(code) => RunCause::Exited(code),
                AwaitOutcome::Interrupted => {
                    // A cancelled Starting goes straight to Stopping.
                    ctx.mark_user_stopped();
                    ctx.stop_sequence(&instance, &mut events).await;
                    return ctx.finish();
                }
            };

            match cause {
                RunCause::StopRequested => {
                    ctx.mark_user_stopped();
                    ctx.stop_sequence(&instance, &mut events).await;
                    return ctx.finish();
                }
                RunCause::Exited(code) => {
                    ctx.retire(&instance, code);
                    let exited_clean = code == 0;
                    ctx.set_state(if exited_clean {
                        InstanceState::Stopped
                    } else {
                        InstanceState::Failed
                    });

                    if !should_relaunch(ctx.spec.restart, exited_clean, ctx.restart_count(), false)
                    {
                        if !exited_clean {
                            tracing::warn!(
                                "service {} failed (exit code {}), not relaunching",
                                ctx.spec.name,
                                code
                            );
                        }
                        return ctx.finish();
                    }

                    ctx.bump_restart_count();
                    let _ = ctx.ready_tx.send(ReadySignal::Pending);
                    pending_stop = false;
                    match ctx.backoff(&mut commands, &mut cancel).await {
                        BackoffOutcome::Continue => continue,
                        BackoffOutcome::Interrupted => {
                            ctx.mark_user_stopped();
                            return ctx.finish();
                        }
                    }
                }
            }
        }
    }
}

enum DepOutcome {
    Ready,
    DepFailed(String),
    Interrupted,
}

enum BackoffOutcome {
    Continue,
    Interrupted,
}

impl Ctx {
    /// Ensure volumes, resolve mounts and dependency addresses, create+start
    fn launch(&self) -> Result<InstanceRef> {
        for volume in self.spec.volume_names() {
            self.volumes.ensure(volume)?;
            self.volumes.add_reference(volume, &self.spec.name)?;
        }

        let mounts = self.resolved_mounts()?;
        let env = self.resolved_env()?;

        let instance = self.driver.create(&self.spec, &env, &mounts)?;
        {
            let mut shared = lock(&self.shared);
            shared.instance_ref = Some(instance.clone());
            shared.last_started_at = Some(Utc::now());
        }
        self.add_route(&instance);

        if let Err(e) = self.driver.start(&instance) {
            self.remove_route(&instance);
            let _ = self.driver.remove(&instance);
            return Err(e.into());
        }

        tracing::info!("started service {} as {}", self.spec.name, instance);
        Ok(instance)
    }

    /// Mounts with named volumes swapped for their backing references
    fn resolved_mounts(&self) -> Result<Vec<ResolvedMount>> {
        self.spec
            .mounts
            .iter()
            .map(|mount| {
                let source = match &mount.source {
                    MountSource::Volume(name) => {
                        ResolvedSource::Volume(self.volumes.get(name)?.backing)
                    }
                    MountSource::Bind(path) => ResolvedSource::Bind(path.clone()),
                };
                Ok(ResolvedMount {
                    source,
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                })
            })
            .collect()
    }

    /// Service environment plus one `<DEP>_ADDR` entry per dependency
    fn resolved_env(&self) -> Result<HashMap<String, String>> {
        let mut env = self.spec.environment.clone();
        for dep in &self.spec.depends_on {
            let address = self.resolver.resolve(dep)?;
            let key = format!("{}_ADDR", dep.to_uppercase().replace('-', "_"));
            env.insert(key, address);
        }
        Ok(env)
    }

    /// Graceful stop with forced-kill escalation after the grace period
    async fn stop_sequence(
        &self,
        instance: &InstanceRef,
        events: &mut mpsc::UnboundedReceiver<InstanceSignal>,
    ) {
        self.set_state(InstanceState::Stopping);
        if let Err(e) = self.resolver.deregister(&self.spec.name) {
            tracing::warn!("failed to deregister {}: {}", self.spec.name, e);
        }

        let grace = self.spec.stop_grace_period;
        if let Err(e) = self.driver.stop(instance, grace) {
            tracing::warn!("stop call for {} failed: {}", self.spec.name, e);
        }

        match tokio::time::timeout(grace, wait_exit(events)).await {
            Ok(code) => {
                if let Some(code) = code {
                    lock(&self.shared).exit_code = Some(code);
                }
            }
            Err(_) => {
                tracing::warn!(
                    "grace period elapsed for service {}, escalating to kill",
                    self.spec.name
                );
                if let Err(e) = self.driver.force_kill(instance) {
                    tracing::warn!("kill call for {} failed: {}", self.spec.name, e);
                }
                if let Ok(Some(code)) = tokio::time::timeout(grace, wait_exit(events)).await {
                    lock(&self.shared).exit_code = Some(code);
                }
            }
        }

        self.release_volumes();
        self.remove_route(instance);
        let _ = self.driver.remove(instance);
        self.set_state(InstanceState::Stopped);
    }

    /// Clean up after a spontaneous exit
    fn retire(&self, instance: &InstanceRef, code: i32) {
        if let Err(e) = self.resolver.deregister(&self.spec.name) {
            tracing::warn!("failed to deregister {}: {}", self.spec.name, e);
        }
        self.release_volumes();
        self.remove_route(instance);
        let _ = self.driver.remove(instance);
        lock(&self.shared).exit_code = Some(code);
    }

    /// Sleep out the restart backoff, unless interrupted by stop or cancel
    async fn backoff(
        &self,
        commands: &mut mpsc::UnboundedReceiver<InstanceCommand>,
        cancel: &mut watch::Receiver<bool>,
    ) -> BackoffOutcome {
        let attempt = self.restart_count().saturating_sub(1);
        let delay = restart_backoff(attempt);
        tracing::debug!(
            "relaunching service {} in {:?} (attempt {})",
            self.spec.name,
            delay,
            attempt + 1
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => BackoffOutcome::Continue,
            _ = commands.recv() => BackoffOutcome::Interrupted,
            _ = wait_cancelled(cancel) => BackoffOutcome::Interrupted,
        }
    }

    fn set_state(&self, state: InstanceState) {
        let mut shared = lock(&self.shared);
        if shared.state != state {
            tracing::debug!("service {}: {} -> {}", self.spec.name, shared.state, state);
            shared.state = state;
        }
    }

    fn record_error(&self, error: &BerthError) {
        lock(&self.shared).error = Some(error.to_string());
    }

    fn mark_user_stopped(&self) {
        lock(&self.shared).user_stopped = true;
    }

    fn restart_count(&self) -> u32 {
        lock(&self.shared).restart_count
    }

    fn bump_restart_count(&self) {
        lock(&self.shared).restart_count += 1;
    }

    fn release_volumes(&self) {
        for volume in self.spec.volume_names() {
            if let Err(e) = self.volumes.remove_reference(volume, &self.spec.name) {
                tracing::warn!("failed to release volume {}: {}", volume, e);
            }
        }
    }

    fn add_route(&self, instance: &InstanceRef) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(instance.clone(), self.event_tx.clone());
        }
    }

    fn remove_route(&self, instance: &InstanceRef) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(instance);
        }
    }

    /// Publish the terminal signal and produce the final report
    fn finish(&self) -> ServiceReport {
        let _ = self.ready_tx.send(ReadySignal::Terminal);
        let shared = lock(&self.shared);
        ServiceReport {
            service: shared.service.clone(),
            state: shared.state,
            error: shared.error.clone(),
        }
    }
}

/// Wait until every dependency reports Running
async fn wait_for_dependencies(
    deps: &mut [(String, watch::Receiver<ReadySignal>)],
    commands: &mut mpsc::UnboundedReceiver<InstanceCommand>,
    cancel: &mut watch::Receiver<bool>,
) -> DepOutcome {
    for (name, rx) in deps.iter_mut() {
        loop {
            match *rx.borrow() {
                ReadySignal::Running => break,
                ReadySignal::Terminal => return DepOutcome::DepFailed(name.clone()),
                ReadySignal::Pending => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return DepOutcome::DepFailed(name.clone());
                    }
                }
                _ = commands.recv() => return DepOutcome::Interrupted,
                _ = wait_cancelled(cancel) => return DepOutcome::Interrupted,
            }
        }
    }
    DepOutcome::Ready
}

/// Resolve once the cancel flag is raised (or its sender is gone)
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for the next exit signal, skipping running notifications
async fn wait_exit(events: &mut mpsc::UnboundedReceiver<InstanceSignal>) -> Option<i32> {
    while let Some(signal) = events.recv().await {
        if let InstanceSignal::Exited(code) = signal {
            return Some(code);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeEvent, SimBehavior, SimulatedDriver};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(restart_backoff(0), Duration::from_millis(100));
        assert_eq!(restart_backoff(1), Duration::from_millis(200));
        assert_eq!(restart_backoff(2), Duration::from_millis(400));
        assert!(restart_backoff(6) < restart_backoff(7));
        assert_eq!(restart_backoff(20), Duration::from_secs(10));
        assert_eq!(restart_backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_should_relaunch_matrix() {
        use RestartPolicy::*;

        assert!(!should_relaunch(Never, false, 0, false));
        assert!(!should_relaunch(Never, true, 0, false));

        let on_failure = OnFailure { max_retries: 2 };
        assert!(should_relaunch(on_failure, false, 0, false));
        assert!(should_relaunch(on_failure, false, 1, false));
        assert!(!should_relaunch(on_failure, false, 2, false));
        // clean exits never trigger on-failure
        assert!(!should_relaunch(on_failure, true, 0, false));

        for policy in [Always, UnlessStopped] {
            assert!(should_relaunch(policy, false, 5, false));
            assert!(should_relaunch(policy, true, 5, false));
            assert!(!should_relaunch(policy, false, 0, true));
            assert!(!should_relaunch(policy, true, 0, true));
        }
    }

    /// Harness wiring one supervisor directly to a simulated driver
    struct Harness {
        shared: Arc<Mutex<ServiceInstance>>,
        cmd_tx: mpsc::UnboundedSender<InstanceCommand>,
        ready_rx: watch::Receiver<ReadySignal>,
        cancel_tx: watch::Sender<bool>,
        join: tokio::task::JoinHandle<ServiceReport>,
        _router: tokio::task::JoinHandle<()>,
    }

    fn spawn_supervisor(driver: Arc<SimulatedDriver>, spec: ServiceSpec) -> Harness {
        let routes: RouteTable = Arc::new(RwLock::new(HashMap::new()));
        let mut engine_events = driver.subscribe();

        let router_routes = routes.clone();
        let router = tokio::spawn(async move {
            while let Some(RuntimeEvent { instance, signal }) = engine_events.recv().await {
                let target = router_routes
                    .read()
                    .ok()
                    .and_then(|r| r.get(&instance).cloned());
                if let Some(tx) = target {
                    let _ = tx.send(signal);
                }
            }
        });

        let shared = Arc::new(Mutex::new(ServiceInstance::new(&spec.name)));
        let (event_tx, events) = mpsc::unbounded_channel();
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(ReadySignal::Pending);
        let (cancel_tx, cancel) = watch::channel(false);

        let supervisor = Supervisor {
            spec,
            driver: driver.clone(),
            volumes: Arc::new(VolumeManager::new(driver.clone())),
            resolver: Arc::new(NameResolver::new()),
            shared: shared.clone(),
            routes,
            event_tx,
            events,
            commands,
            ready_tx,
            deps: Vec::new(),
            cancel,
        };

        Harness {
            shared,
            cmd_tx,
            ready_rx,
            cancel_tx,
            join: tokio::spawn(supervisor.run()),
            _router: router,
        }
    }

    async fn wait_ready(rx: &mut watch::Receiver<ReadySignal>, target: ReadySignal) {
        while *rx.borrow() != target {
            rx.changed().await.expect("supervisor gone");
        }
    }

    #[tokio::test]
    async fn test_healthy_service_reaches_running_and_stops() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut harness = spawn_supervisor(driver.clone(), ServiceSpec::new("web", "nginx"));

        wait_ready(&mut harness.ready_rx, ReadySignal::Running).await;
        assert_eq!(lock(&harness.shared).state, InstanceState::Running);

        harness.cmd_tx.send(InstanceCommand::Stop).unwrap();
        let report = harness.join.await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);
        assert_eq!(lock(&harness.shared).exit_code, Some(0));
        assert_eq!(driver.stop_log(), vec!["web".to_string()]);
        assert_eq!(driver.kill_call_count(), 0);
    }

    #[tokio::test]
    async fn test_on_failure_relaunches_up_to_ceiling() {
        let driver =
            Arc::new(SimulatedDriver::new().with_behavior("crasher", SimBehavior::ExitWith(1)));
        let mut spec = ServiceSpec::new("worker", "crasher");
        spec.restart = RestartPolicy::OnFailure { max_retries: 2 };

        let harness = spawn_supervisor(driver.clone(), spec);
        let report = harness.join.await.unwrap();

        assert_eq!(report.state, InstanceState::Failed);
        // one initial launch plus two relaunches
        assert_eq!(driver.start_count("worker"), 3);
        assert_eq!(lock(&harness.shared).restart_count, 2);
        assert_eq!(lock(&harness.shared).exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_never_policy_is_terminal() {
        let driver =
            Arc::new(SimulatedDriver::new().with_behavior("oneshot", SimBehavior::ExitWith(0)));
        let harness = spawn_supervisor(driver.clone(), ServiceSpec::new("job", "oneshot"));

        let report = harness.join.await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);
        assert_eq!(driver.start_count("job"), 1);
    }

    #[tokio::test]
    async fn test_unless_stopped_does_not_relaunch_after_user_stop() {
        let driver = Arc::new(SimulatedDriver::new());
        let mut spec = ServiceSpec::new("web", "nginx");
        spec.restart = RestartPolicy::UnlessStopped;

        let mut harness = spawn_supervisor(driver.clone(), spec);
        wait_ready(&mut harness.ready_rx, ReadySignal::Running).await;

        harness.cmd_tx.send(InstanceCommand::Stop).unwrap();
        let report = harness.join.await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);
        assert!(lock(&harness.shared).user_stopped);
        assert_eq!(driver.start_count("web"), 1);
    }

    #[tokio::test]
    async fn test_stop_during_starting_is_applied_at_running() {
        let driver = Arc::new(SimulatedDriver::new().with_behavior(
            "slow",
            SimBehavior::DelayedRun(Duration::from_millis(50)),
        ));
        let harness = spawn_supervisor(driver.clone(), ServiceSpec::new("api", "slow"));

        // Let the supervisor issue the start call, then stop mid-Starting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock(&harness.shared).state, InstanceState::Starting);
        harness.cmd_tx.send(InstanceCommand::Stop).unwrap();

        let report = harness.join.await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);
        // the stop went through the driver only after Running was reached
        assert_eq!(driver.stop_log(), vec!["api".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_during_starting_goes_to_stopping() {
        let driver = Arc::new(SimulatedDriver::new().with_behavior(
            "slow",
            SimBehavior::DelayedRun(Duration::from_secs(5)),
        ));
        let mut spec = ServiceSpec::new("api", "slow");
        spec.stop_grace_period = Duration::from_millis(50);
        let harness = spawn_supervisor(driver.clone(), spec);

        tokio::time::sleep(Duration::from_millis(10)).await;
        harness.cancel_tx.send(true).unwrap();

        let report = harness.join.await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_grace_period_escalates_to_kill() {
        let driver =
            Arc::new(SimulatedDriver::new().with_behavior("stuck", SimBehavior::IgnoreStop));
        let mut spec = ServiceSpec::new("db", "stuck");
        spec.stop_grace_period = Duration::from_millis(50);

        let mut harness = spawn_supervisor(driver.clone(), spec);
        wait_ready(&mut harness.ready_rx, ReadySignal::Running).await;

        harness.cmd_tx.send(InstanceCommand::Stop).unwrap();
        let report = harness.join.await.unwrap();

        assert_eq!(report.state, InstanceState::Stopped);
        assert_eq!(driver.kill_call_count(), 1);
        assert_eq!(lock(&harness.shared).exit_code, Some(137));
    }

    #[tokio::test]
    async fn test_transient_create_failures_respect_retry_ceiling() {
        let driver = Arc::new(
            SimulatedDriver::new().with_behavior("flaky", SimBehavior::TransientCreate(u32::MAX)),
        );
        let mut spec = ServiceSpec::new("worker", "flaky");
        spec.restart = RestartPolicy::OnFailure { max_retries: 2 };

        let harness = spawn_supervisor(driver.clone(), spec);
        let report = harness.join.await.unwrap();

        assert_eq!(report.state, InstanceState::Failed);
        // one initial attempt plus two relaunches, never more
        assert_eq!(driver.create_count("worker"), 3);
        assert_eq!(driver.start_count("worker"), 0);
        assert_eq!(lock(&harness.shared).restart_count, 2);
    }

    #[tokio::test]
    async fn test_transient_create_failure_recovers_within_ceiling() {
        let driver = Arc::new(
            SimulatedDriver::new().with_behavior("flaky", SimBehavior::TransientCreate(2)),
        );
        let mut spec = ServiceSpec::new("worker", "flaky");
        spec.restart = RestartPolicy::OnFailure { max_retries: 3 };

        let mut harness = spawn_supervisor(driver.clone(), spec);
        wait_ready(&mut harness.ready_rx, ReadySignal::Running).await;

        assert_eq!(driver.create_count("worker"), 3);
        assert_eq!(lock(&harness.shared).state, InstanceState::Running);

        harness.cmd_tx.send(InstanceCommand::Stop).unwrap();
        let report = harness.join.await.unwrap();
        assert_eq!(report.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_image_fails_without_retry() {
        let driver =
            Arc::new(SimulatedDriver::new().with_behavior("ghost", SimBehavior::MissingImage));
        let mut spec = ServiceSpec::new("app", "ghost");
        spec.restart = RestartPolicy::OnFailure { max_retries: 3 };

        let harness = spawn_supervisor(driver.clone(), spec);
        let report = harness.join.await.unwrap();

        assert_eq!(report.state, InstanceState::Failed);
        assert!(report.error.unwrap().contains("image not found"));
        assert_eq!(driver.start_count("app"), 0);
    }
}
