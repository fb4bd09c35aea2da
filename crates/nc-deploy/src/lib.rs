//! Blue/green container deployment state machine.
//!
//! One [`DeployEngine`] instance owns every application's deploy state. Each
//! application gets its own exclusive lock (`Idle → PullingImage →
//! StartingShadow → Probing → Switching → Retiring → Idle`); a `Deploy`
//! arriving while the app's machine is non-`Idle` is rejected with `Busy`
//! rather than queued behind the lock, matching the spec's reject-don't-wait
//! policy. The container daemon, reverse-proxy reload hook, and health probe
//! are each a trait so the transition logic is unit-testable without a real
//! Docker socket — mirroring how the donor's `FailoverStateMachine::transition`
//! is pure decision logic driven by a caller-supplied health score, with all
//! I/O performed by the caller.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use nc_persist::JsonStore;
use nc_proto::{Color, DeploymentState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Retries for a transient `StartingShadow` failure before declaring
/// `DeployFailed{Start}`.
pub const SHADOW_START_RETRIES: u32 = 3;
pub const SHADOW_START_BACKOFF: Duration = Duration::from_secs(2);
/// Probe budget: 30 attempts at 2s apart (60s total).
pub const PROBE_ATTEMPTS: u32 = 30;
pub const PROBE_INTERVAL: Duration = Duration::from_secs(2);

pub const SSR_MEMORY_MIB: u32 = 512;
pub const DEFAULT_MEMORY_MIB: u32 = 256;

/// Memory cap for a shadow container, per the spec's SSR resource policy.
pub fn memory_cap_mib(ssr_heavy: bool) -> u32 {
    if ssr_heavy {
        SSR_MEMORY_MIB
    } else {
        DEFAULT_MEMORY_MIB
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("image pull failed: {0}")]
    Pull(String),
    #[error("shadow container failed to start: {0}")]
    Start(String),
    #[error("shadow container never became healthy")]
    Unhealthy,
    #[error("reverse-proxy swap failed: {0}")]
    ProxySwap(String),
}

/// Result of a `deploy`/`rollback` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The requested image is already current — no state change.
    AlreadyDeployed,
    /// The app's machine was not `Idle`.
    Busy,
    /// Swap completed; the shadow color is now current.
    Deployed { color: Color, container_id: String },
    /// Swap failed; app's machine returned to `Idle`.
    Failed(DeployError),
}

/// Per-application phase of the blue/green machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Idle,
    PullingImage,
    StartingShadow,
    Probing,
    Switching,
    Retiring,
}

struct AppSlot {
    phase: DeployPhase,
    deployment: DeploymentState,
}

/// Spawns and tears down containers. Implemented by a real Docker-daemon
/// client in production and by an in-memory fake in tests.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), String>;
    async fn start_container(
        &self,
        name: &str,
        image: &str,
        port: u16,
        memory_mib: u32,
        env: &HashMap<String, String>,
    ) -> Result<String, String>;
    async fn stop_and_remove(&self, container_id: &str) -> Result<(), String>;
    /// Last `lines` of a running container's stdout/stderr.
    async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String, String>;
}

/// Flips the reverse-proxy upstream for an app.
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    async fn switch_upstream(&self, app: &str, port: u16) -> Result<(), String>;
}

/// Polls a shadow container's `/health` endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

/// Owns every application's blue/green state and drives swaps against the
/// injected `ContainerDriver`/`ProxyDriver`/`HealthProbe`.
pub struct DeployEngine {
    apps: RwLock<HashMap<String, Arc<Mutex<AppSlot>>>>,
    containers: Arc<dyn ContainerDriver>,
    proxy: Arc<dyn ProxyDriver>,
    probe: Arc<dyn HealthProbe>,
    store: JsonStore,
}

impl DeployEngine {
    pub fn new(
        state_path: &std::path::Path,
        containers: Arc<dyn ContainerDriver>,
        proxy: Arc<dyn ProxyDriver>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let store = JsonStore::at_path(state_path.join("deployments.json"));
        let loaded: HashMap<String, DeploymentState> = store.load();
        let apps = loaded
            .into_iter()
            .map(|(app, deployment)| {
                (
                    app,
                    Arc::new(Mutex::new(AppSlot {
                        phase: DeployPhase::Idle,
                        deployment,
                    })),
                )
            })
            .collect();
        Self {
            apps: RwLock::new(apps),
            containers,
            proxy,
            probe,
            store,
        }
    }

    pub async fn current_state(&self, app: &str) -> Option<DeploymentState> {
        let slot = self.slot_for(app).await;
        let guard = slot.lock().await;
        Some(guard.deployment.clone())
    }

    /// Every known application's current `DeploymentState`, for the
    /// startup reconciliation sweep and `/status`-style listings.
    pub async fn list_apps(&self) -> Vec<DeploymentState> {
        let apps = self.apps.read().await;
        let mut out = Vec::with_capacity(apps.len());
        for slot in apps.values() {
            out.push(slot.lock().await.deployment.clone());
        }
        out
    }

    async fn slot_for(&self, app: &str) -> Arc<Mutex<AppSlot>> {
        if let Some(slot) = self.apps.read().await.get(app) {
            return slot.clone();
        }
        let mut apps = self.apps.write().await;
        apps.entry(app.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AppSlot {
                    phase: DeployPhase::Idle,
                    deployment: DeploymentState::new(app),
                }))
            })
            .clone()
    }

    /// Land `image` alongside the current color, probe it, flip traffic,
    /// retire the old color.
    pub async fn deploy(
        &self,
        app: &str,
        image: &str,
        ssr_heavy: bool,
        env: HashMap<String, String>,
    ) -> DeployOutcome {
        let slot = self.slot_for(app).await;
        let Ok(mut guard) = slot.try_lock() else {
            return DeployOutcome::Busy;
        };
        if guard.phase != DeployPhase::Idle {
            return DeployOutcome::Busy;
        }
        if guard.deployment.current_image.as_deref() == Some(image) {
            return DeployOutcome::AlreadyDeployed;
        }

        let outcome = self.run_swap(app, image, ssr_heavy, &env, &mut guard).await;
        guard.phase = DeployPhase::Idle;
        if let DeployOutcome::Deployed { .. } = &outcome {
            self.persist(app, &guard.deployment).await;
        }
        outcome
    }

    /// Re-run the swap algorithm against `DeploymentState.previous_image`.
    pub async fn rollback(&self, app: &str) -> DeployOutcome {
        let previous = {
            let slot = self.slot_for(app).await;
            let guard = slot.lock().await;
            guard.deployment.previous_image.clone()
        };
        match previous {
            Some(image) => self.deploy(app, &image, false, HashMap::new()).await,
            None => DeployOutcome::Failed(DeployError::Start("no previous image to roll back to".into())),
        }
    }

    /// Stop the app's current container without starting a replacement.
    /// `current_image`/`current_color` are left untouched so a later
    /// `restart` knows what to bring back up.
    pub async fn stop(&self, app: &str) -> Result<(), DeployError> {
        let slot = self.slot_for(app).await;
        let Ok(mut guard) = slot.try_lock() else {
            return Err(DeployError::Start("app busy".into()));
        };
        if let Some(container_id) = guard.deployment.current_container_id.take() {
            self.containers
                .stop_and_remove(&container_id)
                .await
                .map_err(DeployError::Start)?;
        }
        self.persist(app, &guard.deployment).await;
        Ok(())
    }

    /// Restart the current color by re-running the same image through the
    /// deploy algorithm, bypassing the `AlreadyDeployed` short-circuit.
    pub async fn restart(&self, app: &str) -> DeployOutcome {
        let slot = self.slot_for(app).await;
        let Ok(mut guard) = slot.try_lock() else {
            return DeployOutcome::Busy;
        };
        if guard.phase != DeployPhase::Idle {
            return DeployOutcome::Busy;
        }
        let Some(image) = guard.deployment.current_image.clone() else {
            return DeployOutcome::Failed(DeployError::Start("nothing deployed to restart".into()));
        };
        let outcome = self.run_swap(app, &image, false, &HashMap::new(), &mut guard).await;
        guard.phase = DeployPhase::Idle;
        if let DeployOutcome::Deployed { .. } = &outcome {
            self.persist(app, &guard.deployment).await;
        }
        outcome
    }

    /// Tail the current container's logs for `app`. `Err` if nothing is
    /// currently running.
    pub async fn logs(&self, app: &str, lines: usize) -> Result<String, DeployError> {
        let slot = self.slot_for(app).await;
        let container_id = {
            let guard = slot.lock().await;
            guard.deployment.current_container_id.clone()
        };
        let Some(container_id) = container_id else {
            return Err(DeployError::Start("no running container for this app".into()));
        };
        self.containers
            .tail_logs(&container_id, lines)
            .await
            .map_err(DeployError::Start)
    }

    async fn run_swap(
        &self,
        app: &str,
        image: &str,
        ssr_heavy: bool,
        env: &HashMap<String, String>,
        guard: &mut AppSlot,
    ) -> DeployOutcome {
        guard.phase = DeployPhase::PullingImage;
        if let Err(e) = self.containers.pull_image(image).await {
            warn!(app, error = %e, "image pull failed");
            return DeployOutcome::Failed(DeployError::Pull(e));
        }

        guard.phase = DeployPhase::StartingShadow;
        let shadow_color = guard.deployment.current_color.opposite();
        let port = shadow_color.port().expect("opposite of a real color always has a port");
        let container_name = format!("{app}-{shadow_color}");
        let memory_mib = memory_cap_mib(ssr_heavy);

        let container_id = match self
            .start_shadow_with_retry(&container_name, image, port, memory_mib, env)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(app, error = %e, "shadow container failed to start after retries");
                return DeployOutcome::Failed(DeployError::Start(e));
            }
        };

        guard.phase = DeployPhase::Probing;
        if !self.probe_until_healthy(port).await {
            warn!(app, "shadow container never became healthy, rolling back shadow");
            let _ = self.containers.stop_and_remove(&container_id).await;
            return DeployOutcome::Failed(DeployError::Unhealthy);
        }

        guard.phase = DeployPhase::Switching;
        if let Err(e) = self.proxy.switch_upstream(app, port).await {
            warn!(app, error = %e, "proxy swap failed, attempting revert");
            if let Some(old_port) = guard.deployment.current_color.port() {
                let _ = self.proxy.switch_upstream(app, old_port).await;
            }
            let _ = self.containers.stop_and_remove(&container_id).await;
            return DeployOutcome::Failed(DeployError::ProxySwap(e));
        }

        guard.phase = DeployPhase::Retiring;
        if let Some(old_container_id) = guard.deployment.current_container_id.clone() {
            if let Err(e) = self.containers.stop_and_remove(&old_container_id).await {
                warn!(app, error = %e, "old container removal failed, left for GC sweep");
            }
        }

        guard.deployment.previous_image = guard.deployment.current_image.clone();
        guard.deployment.current_image = Some(image.to_string());
        guard.deployment.current_color = shadow_color;
        guard.deployment.current_container_id = Some(container_id.clone());
        guard.deployment.last_healthy_at = Some(Utc::now());

        info!(app, color = %shadow_color, "deploy completed");
        DeployOutcome::Deployed {
            color: shadow_color,
            container_id,
        }
    }

    async fn start_shadow_with_retry(
        &self,
        name: &str,
        image: &str,
        port: u16,
        memory_mib: u32,
        env: &HashMap<String, String>,
    ) -> Result<String, String> {
        let mut last_err = String::new();
        for attempt in 1..=SHADOW_START_RETRIES {
            match self.containers.start_container(name, image, port, memory_mib, env).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    last_err = e;
                    if attempt < SHADOW_START_RETRIES {
                        tokio::time::sleep(SHADOW_START_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn probe_until_healthy(&self, port: u16) -> bool {
        for attempt in 0..PROBE_ATTEMPTS {
            if self.probe.probe(port).await {
                return true;
            }
            if attempt + 1 < PROBE_ATTEMPTS {
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        }
        false
    }

    async fn persist(&self, app: &str, deployment: &DeploymentState) {
        let snapshot: HashMap<String, DeploymentState> = {
            let apps = self.apps.read().await;
            let mut map = HashMap::with_capacity(apps.len());
            for (name, slot) in apps.iter() {
                if name == app {
                    map.insert(name.clone(), deployment.clone());
                } else {
                    map.insert(name.clone(), slot.lock().await.deployment.clone());
                }
            }
            map
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "failed to persist deployment state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeContainers {
        fail_pull: SyncMutex<bool>,
        fail_start_times: SyncMutex<u32>,
        started: SyncMutex<Vec<String>>,
        removed: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerDriver for FakeContainers {
        async fn pull_image(&self, _image: &str) -> Result<(), String> {
            if *self.fail_pull.lock() {
                Err("registry unreachable".into())
            } else {
                Ok(())
            }
        }

        async fn start_container(
            &self,
            name: &str,
            _image: &str,
            _port: u16,
            _memory_mib: u32,
            _env: &HashMap<String, String>,
        ) -> Result<String, String> {
            let mut remaining = self.fail_start_times.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err("transient daemon error".into());
            }
            self.started.lock().push(name.to_string());
            Ok(format!("container-{name}"))
        }

        async fn stop_and_remove(&self, container_id: &str) -> Result<(), String> {
            self.removed.lock().push(container_id.to_string());
            Ok(())
        }

        async fn tail_logs(&self, container_id: &str, _lines: usize) -> Result<String, String> {
            Ok(format!("fake logs for {container_id}"))
        }
    }

    struct FakeProxy {
        fail: bool,
    }

    #[async_trait]
    impl ProxyDriver for FakeProxy {
        async fn switch_upstream(&self, _app: &str, _port: u16) -> Result<(), String> {
            if self.fail {
                Err("nginx -s reload failed".into())
            } else {
                Ok(())
            }
        }
    }

    struct FakeProbe {
        healthy: bool,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, _port: u16) -> bool {
            self.healthy
        }
    }

    fn engine(dir: &std::path::Path, containers: FakeContainers, proxy_fails: bool, healthy: bool) -> DeployEngine {
        DeployEngine::new(
            dir,
            Arc::new(containers),
            Arc::new(FakeProxy { fail: proxy_fails }),
            Arc::new(FakeProbe { healthy }),
        )
    }

    #[tokio::test]
    async fn first_deploy_from_none_lands_on_blue() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert_eq!(
            outcome,
            DeployOutcome::Deployed {
                color: Color::Blue,
                container_id: "container-foo-blue".to_string(),
            }
        );
        let state = engine.current_state("foo").await.unwrap();
        assert_eq!(state.current_color, Color::Blue);
        assert_eq!(state.current_image.as_deref(), Some("foo:v1"));
    }

    #[tokio::test]
    async fn second_deploy_flips_to_opposite_color_and_retires_old() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        let outcome = engine.deploy("foo", "foo:v2", false, HashMap::new()).await;
        assert_eq!(
            outcome,
            DeployOutcome::Deployed {
                color: Color::Green,
                container_id: "container-foo-green".to_string(),
            }
        );
        let state = engine.current_state("foo").await.unwrap();
        assert_eq!(state.current_color, Color::Green);
        assert_eq!(state.previous_image.as_deref(), Some("foo:v1"));
    }

    #[tokio::test]
    async fn redeploying_the_same_image_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert_eq!(outcome, DeployOutcome::AlreadyDeployed);
    }

    #[tokio::test]
    async fn unhealthy_shadow_fails_and_app_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, false);
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert_eq!(outcome, DeployOutcome::Failed(DeployError::Unhealthy));
        let state = engine.current_state("foo").await.unwrap();
        assert_eq!(state.current_color, Color::None);
    }

    #[tokio::test]
    async fn proxy_swap_failure_reverts_and_removes_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), true, true);
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert_eq!(
            outcome,
            DeployOutcome::Failed(DeployError::ProxySwap("nginx -s reload failed".to_string()))
        );
    }

    #[tokio::test]
    async fn transient_start_failure_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let containers = FakeContainers {
            fail_start_times: SyncMutex::new(2),
            ..Default::default()
        };
        let engine = engine(&dir.path(), containers, false, true);
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert!(matches!(outcome, DeployOutcome::Deployed { .. }));
    }

    #[tokio::test]
    async fn pull_failure_leaves_app_idle_with_no_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let containers = FakeContainers {
            fail_pull: SyncMutex::new(true),
            ..Default::default()
        };
        let engine = engine(&dir.path(), containers, false, true);
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert_eq!(outcome, DeployOutcome::Failed(DeployError::Pull("registry unreachable".to_string())));
        assert_eq!(engine.current_state("foo").await.unwrap().current_color, Color::None);
    }

    #[tokio::test]
    async fn rollback_redeploys_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        engine.deploy("foo", "foo:v2", false, HashMap::new()).await;
        let outcome = engine.rollback("foo").await;
        assert!(matches!(outcome, DeployOutcome::Deployed { .. }));
        let state = engine.current_state("foo").await.unwrap();
        assert_eq!(state.current_image.as_deref(), Some("foo:v1"));
    }

    #[tokio::test]
    async fn concurrent_deploy_on_same_app_is_rejected_as_busy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine(&dir.path(), FakeContainers::default(), false, true));
        let slot = engine.slot_for("foo").await;
        let _held = slot.lock().await;
        let outcome = engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        assert_eq!(outcome, DeployOutcome::Busy);
    }

    #[test]
    fn memory_cap_reflects_ssr_flag() {
        assert_eq!(memory_cap_mib(true), SSR_MEMORY_MIB);
        assert_eq!(memory_cap_mib(false), DEFAULT_MEMORY_MIB);
    }

    #[tokio::test]
    async fn stop_clears_current_container_id_but_keeps_image() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;

        engine.stop("foo").await.unwrap();
        let state = engine.current_state("foo").await.unwrap();
        assert!(state.current_container_id.is_none());
        assert_eq!(state.current_image.as_deref(), Some("foo:v1"));
    }

    #[tokio::test]
    async fn restart_redeploys_current_image_to_the_opposite_color() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;

        let outcome = engine.restart("foo").await;
        assert_eq!(
            outcome,
            DeployOutcome::Deployed {
                color: Color::Green,
                container_id: "container-foo-green".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn restart_with_nothing_deployed_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        let outcome = engine.restart("never-deployed").await;
        assert!(matches!(outcome, DeployOutcome::Failed(DeployError::Start(_))));
    }

    #[tokio::test]
    async fn logs_tails_the_current_container() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;

        let logs = engine.logs("foo", 50).await.unwrap();
        assert_eq!(logs, "fake logs for container-foo-blue");
    }

    #[tokio::test]
    async fn logs_on_an_app_with_no_running_container_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        let result = engine.logs("never-deployed", 50).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_apps_reflects_every_known_application() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path(), FakeContainers::default(), false, true);
        engine.deploy("foo", "foo:v1", false, HashMap::new()).await;
        engine.deploy("bar", "bar:v1", false, HashMap::new()).await;

        let mut apps: Vec<String> = engine.list_apps().await.into_iter().map(|d| d.app).collect();
        apps.sort();
        assert_eq!(apps, vec!["bar".to_string(), "foo".to_string()]);
    }
}
