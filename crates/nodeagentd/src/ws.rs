//! `/ws` streaming endpoint (spec §6.2). Delegates the auth handshake and
//! keepalive loop to `nc_transport::run_server_session`; each subsequent
//! `command` frame is authenticated against its own signature (the initial
//! auth frame only covers the handshake) before being routed through the
//! same queue-and-await path the HTTP surface uses.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use nc_proto::{AgentMessage, MessageType};

use crate::dispatch::enqueue_and_await;
use crate::state::SharedAgentState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<SharedAgentState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let state = state.clone();
        let result = nc_transport::run_server_session(socket, &state.trust, move |msg| {
            let state = state.clone();
            async move { handle_frame(&state, msg).await }
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "stream session ended with error");
        }
    })
}

async fn handle_frame(state: &SharedAgentState, msg: AgentMessage) -> Option<AgentMessage> {
    if msg.message_type != MessageType::Command {
        return None;
    }
    let identity = state.trust.find(&msg.source)?;
    if nc_codec::verify_message(&msg, &identity.signing_public).is_err() {
        state.metrics.record_auth_failure();
        return Some(error_frame(state, "bad signature"));
    }
    if nc_codec::check_freshness(&msg).is_err() {
        return Some(error_frame(state, "stale command"));
    }

    let payload: nc_proto::CommandPayload = match serde_json::from_value(msg.payload) {
        Ok(p) => p,
        Err(e) => return Some(error_frame(state, &format!("malformed command payload: {e}"))),
    };

    if identity.role < nc_proto::Role::Deployer {
        return Some(error_frame(state, "role insufficient for this operation"));
    }

    let command_name = payload.name.clone();
    let app = payload.args.first().cloned().unwrap_or_default();
    let result = enqueue_and_await(state, &identity.fingerprint, &payload.name, payload.args, payload.metadata).await;
    let body = match result {
        Ok(value) => serde_json::json!({"id": payload.id, "result": value}),
        Err(e) => serde_json::json!({"id": payload.id, "error": e.to_string()}),
    };
    if let Err(e) = state.audit.append(
        &state.keys.current_key(),
        command_name,
        &identity.fingerprint,
        app,
        "ws-stream",
    ) {
        tracing::warn!(error = %e, "failed to append audit entry for stream command");
    }
    Some(AgentMessage::new(
        "nodeagentd",
        msg.source,
        MessageType::CommandResponse,
        body,
        state.keys.current_key().key_id,
    ))
}

fn error_frame(state: &SharedAgentState, reason: &str) -> AgentMessage {
    AgentMessage::new(
        "nodeagentd",
        "cli",
        MessageType::Error,
        serde_json::json!({"error": reason}),
        state.keys.current_key().key_id,
    )
}
