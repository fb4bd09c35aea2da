//! The agent's HTTP surface (spec §6.1): one axum `Router`, privileged
//! routes gated by `nc_transport::auth_gate`, audit entries appended after
//! each privileged handler completes (step 5 of AuthGate, spec §4.7).

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nc_proto::{EncryptedEnvelope, Identity, Role};
use nc_transport::auth_gate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::dispatch::enqueue_and_await;
use crate::error::AgentError;
use crate::state::SharedAgentState;

pub fn router(state: SharedAgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/public-key", get(public_key))
        .route("/bootstrap", post(bootstrap))
        .route("/add-identity", post(add_identity))
        .route("/revoke-identity", post(revoke_identity))
        .route("/list-identities", get(list_identities))
        .route("/submit-env", post(submit_env))
        .route("/deploy", post(deploy))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/status", get(status))
        .route("/rollback", post(rollback))
        .route("/ws", get(crate::ws::handler))
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .with_state(state)
}

fn remote_of(addr: Option<ConnectInfo<SocketAddr>>) -> String {
    addr.map(|ConnectInfo(a)| a.to_string()).unwrap_or_default()
}

// ─── Unauthenticated ───────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(state): State<SharedAgentState>) -> impl IntoResponse {
    let exporter = nc_metrics::MetricsExporter::new(state.metrics.clone());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        exporter.render(),
    )
}

async fn public_key(State(state): State<SharedAgentState>) -> impl IntoResponse {
    Json(state.keys.public())
}

#[derive(Deserialize)]
struct BootstrapRequest {
    fingerprint: String,
    key_agreement_public: String,
    signing_public: String,
    email: String,
}

async fn bootstrap(
    State(state): State<SharedAgentState>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), AgentError> {
    if !state.trust.is_empty() {
        return Err(AgentError::BootstrapClosed);
    }
    let req: BootstrapRequest = serde_json::from_slice(&body)?;
    let identity = Identity::new(
        req.fingerprint.clone(),
        req.key_agreement_public,
        req.signing_public,
        Role::Owner,
        req.email,
        "bootstrap",
    );
    state.trust.add(identity);
    state
        .audit
        .append(&state.keys.current_key(), "bootstrap", &req.fingerprint, &req.fingerprint, "")?;
    Ok((StatusCode::CREATED, Json(json!({"ok": true, "role": "owner"}))))
}

// ─── Identity management ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AddIdentityRequest {
    fingerprint: String,
    key_agreement_public: String,
    signing_public: String,
    role: String,
    email: String,
}

async fn add_identity(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/add-identity", &body, Role::Owner)?;
    let req: AddIdentityRequest = serde_json::from_slice(&body)?;
    let role = Role::from_str(&req.role).map_err(|e| AgentError::BadRequest(e.to_string()))?;
    let new_identity = Identity::new(
        req.fingerprint.clone(),
        req.key_agreement_public,
        req.signing_public,
        role,
        req.email,
        identity.fingerprint.clone(),
    );
    state.trust.add(new_identity);
    state.audit.append(
        &state.keys.current_key(),
        "add-identity",
        &identity.fingerprint,
        &req.fingerprint,
        remote_of(addr),
    )?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct RevokeIdentityRequest {
    fingerprint: String,
}

async fn revoke_identity(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/revoke-identity", &body, Role::Admin)?;
    let req: RevokeIdentityRequest = serde_json::from_slice(&body)?;
    state.trust.remove(&req.fingerprint)?;
    state.audit.append(
        &state.keys.current_key(),
        "revoke-identity",
        &identity.fingerprint,
        &req.fingerprint,
        remote_of(addr),
    )?;
    Ok(Json(json!({"ok": true})))
}

async fn list_identities(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AgentError> {
    auth_gate(&state.trust, &headers, "GET", "/list-identities", b"", Role::Admin)?;
    Ok(Json(json!({"identities": state.trust.list()})))
}

// ─── Secrets ────────────────────────────────────────────────────────────────

async fn submit_env(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/submit-env", &body, Role::Admin)?;
    let envelope: EncryptedEnvelope = serde_json::from_slice(&body)?;
    let stored = state.secrets.store(&state.keys.current_key(), &envelope).map_err(|e| match e {
        nc_secrets::SecretsError::Io(e) => AgentError::Io(e),
        nc_secrets::SecretsError::Decrypt(e) => AgentError::Codec(e),
    });
    let path = match stored {
        Ok(path) => path,
        Err(e) => {
            state.audit.append(
                &state.keys.current_key(),
                "submit-env",
                &identity.fingerprint,
                "failure",
                remote_of(addr),
            )?;
            return Err(e);
        }
    };
    state.audit.append(
        &state.keys.current_key(),
        "submit-env",
        &identity.fingerprint,
        path.display().to_string(),
        remote_of(addr),
    )?;
    Ok(Json(json!({"ok": true, "path": path.display().to_string()})))
}

// ─── Deploy lifecycle ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DeployRequest {
    app: String,
    image: String,
    #[serde(default)]
    ssr_heavy: bool,
    #[serde(default)]
    env: HashMap<String, String>,
}

async fn deploy(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/deploy", &body, Role::Deployer)?;
    let req: DeployRequest = serde_json::from_slice(&body)?;
    let metadata = json!({"image": req.image, "ssr_heavy": req.ssr_heavy, "env": req.env});
    let result = enqueue_and_await(&state, &identity.fingerprint, "deploy", vec![req.app.clone()], Some(metadata)).await?;
    state.audit.append(&state.keys.current_key(), "deploy", &identity.fingerprint, &req.app, remote_of(addr))?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct AppRequest {
    app: String,
}

async fn stop(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/stop", &body, Role::Deployer)?;
    let req: AppRequest = serde_json::from_slice(&body)?;
    let result = enqueue_and_await(&state, &identity.fingerprint, "stop", vec![req.app.clone()], None).await?;
    state.audit.append(&state.keys.current_key(), "stop", &identity.fingerprint, &req.app, remote_of(addr))?;
    Ok(Json(result))
}

async fn restart(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/restart", &body, Role::Deployer)?;
    let req: AppRequest = serde_json::from_slice(&body)?;
    let result = enqueue_and_await(&state, &identity.fingerprint, "restart", vec![req.app.clone()], None).await?;
    state.audit.append(&state.keys.current_key(), "restart", &identity.fingerprint, &req.app, remote_of(addr))?;
    Ok(Json(result))
}

async fn rollback(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AgentError> {
    let identity = auth_gate(&state.trust, &headers, "POST", "/rollback", &body, Role::Deployer)?;
    let req: AppRequest = serde_json::from_slice(&body)?;
    let result = enqueue_and_await(&state, &identity.fingerprint, "rollback", vec![req.app.clone()], None).await?;
    state.audit.append(&state.keys.current_key(), "rollback", &identity.fingerprint, &req.app, remote_of(addr))?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct StatusQuery {
    app: Option<String>,
}

async fn status(
    State(state): State<SharedAgentState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Response, AgentError> {
    auth_gate(&state.trust, &headers, "GET", "/status", b"", Role::Reader)?;
    match query.app {
        Some(app) => match state.deploys.current_state(&app).await {
            Some(deployment) => Ok(Json(deployment).into_response()),
            None => Err(AgentError::UnknownApp(app)),
        },
        None => Ok(Json(state.deploys.list_apps().await).into_response()),
    }
}
