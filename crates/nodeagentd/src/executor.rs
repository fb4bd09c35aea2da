//! Dispatches a dequeued `CommandPayload` against the `DeployEngine` and
//! produces the JSON result carried back in the `command-response`
//! `AgentMessage`. The sole consumer of `CommandQueue::process` — this is
//! "the executor" the queue's doc comment refers to.

use nc_deploy::{DeployError, DeployOutcome};
use nc_proto::CommandPayload;
use serde_json::json;

use crate::state::AgentState;

/// Run one command to completion and render its outcome as JSON. Never
/// returns an `Err` — deploy-algorithm failures are reported in the body
/// (`"ok": false`) per spec §7's "Unhealthy" handling, not as a queue-level
/// failure (which would trigger a retry that re-runs a swap that may have
/// already partially applied).
pub async fn execute_command(state: &AgentState, payload: &CommandPayload) -> serde_json::Value {
    let app = match payload.args.first() {
        Some(app) => app.clone(),
        None => return json!({"ok": false, "error": "missing app argument"}),
    };

    match payload.name.as_str() {
        "deploy" => {
            let image = payload
                .metadata
                .as_ref()
                .and_then(|m| m.get("image"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let Some(image) = image else {
                return json!({"ok": false, "error": "missing image in metadata"});
            };
            let ssr_heavy = payload
                .metadata
                .as_ref()
                .and_then(|m| m.get("ssr_heavy"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let env = payload
                .metadata
                .as_ref()
                .and_then(|m| m.get("env"))
                .and_then(|v| v.as_object())
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            state.metrics.record_deploy_attempt();
            render_outcome(state.deploys.deploy(&app, &image, ssr_heavy, env).await, state)
        }
        "rollback" => {
            state.metrics.record_rollback();
            render_outcome(state.deploys.rollback(&app).await, state)
        }
        "restart" => render_outcome(state.deploys.restart(&app).await, state),
        "stop" => match state.deploys.stop(&app).await {
            Ok(()) => json!({"ok": true, "app": app}),
            Err(e) => {
                state.metrics.record_deploy_error();
                json!({"ok": false, "error": e.to_string()})
            }
        },
        "logs" => {
            let lines = payload
                .metadata
                .as_ref()
                .and_then(|m| m.get("lines"))
                .and_then(|v| v.as_u64())
                .unwrap_or(200) as usize;
            match state.deploys.logs(&app, lines).await {
                Ok(text) => json!({"ok": true, "app": app, "logs": text}),
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            }
        }
        other => json!({"ok": false, "error": format!("unknown command: {other}")}),
    }
}

fn render_outcome(outcome: DeployOutcome, state: &AgentState) -> serde_json::Value {
    match outcome {
        DeployOutcome::AlreadyDeployed => json!({"ok": true, "already_deployed": true}),
        DeployOutcome::Busy => json!({"ok": false, "busy": true}),
        DeployOutcome::Deployed { color, container_id } => json!({
            "ok": true,
            "color": color.to_string(),
            "container_id": container_id,
        }),
        DeployOutcome::Failed(err) => {
            state.metrics.record_deploy_error();
            let unhealthy = matches!(err, DeployError::Unhealthy);
            json!({"ok": false, "error": err.to_string(), "unhealthy": unhealthy})
        }
    }
}
