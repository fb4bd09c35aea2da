//! Shared fixture for the end-to-end tests under `tests/`: wires a real
//! `nodeagentd::state::AgentState` (every store backed by a tempdir, exactly
//! as `nodeagentd::main` wires it) against an in-memory `ContainerDriver`/
//! `ProxyDriver`/`HealthProbe`, and a real `dispatch::run_executor` task, so
//! a signed HTTP request can be driven end-to-end through
//! `nodeagentd::http::router` via `tower::ServiceExt::oneshot` without any
//! Docker socket or bound TCP listener. Mirrors the donor's `test_support`
//! fixtures, generalized from the VPS fleet to this agent's stores.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use nc_audit::AuditLog;
use nc_deploy::{ContainerDriver, DeployEngine, HealthProbe, ProxyDriver};
use nc_identity::{KeyPair, KeyStore};
use nc_metrics::OperationsMetrics;
use nc_proto::Role;
use nc_queue::CommandQueue;
use nc_secrets::ReceivedSecretStore;
use nc_trust::TrustStore;
use nodeagentd::state::{AgentState, SharedAgentState};
use nodeagentd::AgentConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tower::ServiceExt;

/// In-memory `ContainerDriver`: records every container it was asked to
/// start/stop and hands back a deterministic id, so assertions can check
/// exactly what the blue/green engine did without a Docker daemon.
#[derive(Default)]
pub struct FakeContainers {
    pub started: AsyncMutex<Vec<String>>,
    pub removed: AsyncMutex<Vec<String>>,
}

#[async_trait]
impl ContainerDriver for FakeContainers {
    async fn pull_image(&self, _image: &str) -> Result<(), String> {
        Ok(())
    }

    async fn start_container(
        &self,
        name: &str,
        _image: &str,
        _port: u16,
        _memory_mib: u32,
        _env: &HashMap<String, String>,
    ) -> Result<String, String> {
        self.started.lock().await.push(name.to_string());
        Ok(format!("container-{name}"))
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), String> {
        self.removed.lock().await.push(container_id.to_string());
        Ok(())
    }

    async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String, String> {
        Ok(format!("{lines} fake log lines for {container_id}"))
    }
}

/// Always-succeeds reverse-proxy fake.
pub struct FakeProxy;

#[async_trait]
impl ProxyDriver for FakeProxy {
    async fn switch_upstream(&self, _app: &str, _port: u16) -> Result<(), String> {
        Ok(())
    }
}

/// Health probe whose verdict is fixed at construction — `healthy: true` for
/// the blue/green happy path, `false` to drive the unhealthy-rollback
/// scenario through the engine's full 30-attempt probe budget.
pub struct FakeProbe {
    pub healthy: bool,
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, _port: u16) -> bool {
        self.healthy
    }
}

/// Everything a test needs to drive one agent process in-memory: the wired
/// `router`, the owning `AgentState` (for direct assertions against
/// `trust`/`audit`/`deploys`), and the bootstrap `KeyPair` already trusted
/// as `Owner`.
pub struct TestAgent {
    pub router: Router,
    pub state: SharedAgentState,
    pub owner_key: KeyPair,
    _shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl TestAgent {
    /// Sign `(method, path, body)` as `key` and send it through the router
    /// with `tower::oneshot`, exactly the path a real HTTP client takes.
    pub async fn send(&self, method: &str, path: &str, key: &KeyPair, body: serde_json::Value) -> Response<Body> {
        let body_bytes = serde_json::to_vec(&body).unwrap();
        let (fingerprint, signature) = nc_transport::sign_request(key, method, path, &body_bytes);
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .header(nc_transport::FINGERPRINT_HEADER, fingerprint)
            .header(nc_transport::SIGNATURE_HEADER, signature)
            .body(Body::from(body_bytes))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Same as [`Self::send`] but with no signature headers at all, for
    /// testing AuthGate step 1 (missing headers).
    pub async fn send_unsigned(&self, method: &str, path: &str, body: serde_json::Value) -> Response<Body> {
        let body_bytes = serde_json::to_vec(&body).unwrap();
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body_bytes))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Stand up one in-memory agent: every durable store rooted at `dir`, a
/// `DeployEngine` driven by [`FakeContainers`]/[`FakeProxy`]/[`FakeProbe`],
/// a real `dispatch::run_executor` task draining the queue, and an
/// already-bootstrapped `Owner` identity so callers can immediately sign
/// privileged requests.
pub async fn spin_up(dir: &std::path::Path, probe_healthy: bool) -> TestAgent {
    spin_up_with(dir, probe_healthy, Arc::new(FakeContainers::default()), true).await
}

/// Like [`spin_up`] but with an empty `TrustStore` — for exercising
/// `/bootstrap` itself, which is only reachable before any identity exists.
pub async fn spin_up_empty(dir: &std::path::Path) -> TestAgent {
    spin_up_with(dir, true, Arc::new(FakeContainers::default()), false).await
}

pub async fn spin_up_with_containers(
    dir: &std::path::Path,
    probe_healthy: bool,
    containers: Arc<FakeContainers>,
) -> TestAgent {
    spin_up_with(dir, probe_healthy, containers, true).await
}

async fn spin_up_with(dir: &std::path::Path, probe_healthy: bool, containers: Arc<FakeContainers>, seed_owner: bool) -> TestAgent {
    let config = AgentConfig {
        state_path: dir.to_path_buf(),
        ..AgentConfig::default()
    };
    let keys = Arc::new(KeyStore::load_or_create(dir).expect("key store"));
    let trust = Arc::new(TrustStore::new(dir));
    let audit = Arc::new(AuditLog::new(dir));
    let queue = Arc::new(CommandQueue::new(dir));
    let secrets = Arc::new(ReceivedSecretStore::new(dir));
    let metrics = Arc::new(OperationsMetrics::new());
    let deploys = Arc::new(DeployEngine::new(dir, containers, Arc::new(FakeProxy), Arc::new(FakeProbe { healthy: probe_healthy })));

    let owner_key = keys.current_key();
    if seed_owner {
        let owner_identity = nc_proto::Identity::new(
            owner_key.fingerprint(),
            owner_key.agreement_public_base64(),
            owner_key.signing_public_base64(),
            Role::Owner,
            "owner@nextcore.local",
            "bootstrap",
        );
        trust.add(owner_identity);
    }

    let state: SharedAgentState = Arc::new(AgentState::new(config, keys, trust, audit, queue, deploys, secrets, metrics));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(nodeagentd::dispatch::run_executor(state.clone(), shutdown_rx));

    let router = nodeagentd::http::router(state.clone());
    TestAgent {
        router,
        state,
        owner_key,
        _shutdown_tx: shutdown_tx,
    }
}

/// A freshly generated identity plus the signed-up `KeyPair` behind it,
/// ready to hand to `TestAgent::send`.
pub fn new_identity(role: Role, email: &str, added_by: &str) -> (KeyPair, nc_proto::Identity) {
    let key = KeyPair::generate();
    let identity = nc_proto::Identity::new(
        key.fingerprint(),
        key.agreement_public_base64(),
        key.signing_public_base64(),
        role,
        email,
        added_by,
    );
    (key, identity)
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    }
}
