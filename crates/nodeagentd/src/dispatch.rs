//! Glue between the HTTP/stream surfaces and the durable `CommandQueue`:
//! callers enqueue a signed `AgentMessage` and await its correlated
//! `command-response` on the shared `PendingTable`; a single background task
//! (spawned by `main`) drains the queue through `executor::execute_command`
//! and delivers the result.

use nc_proto::{AgentMessage, CommandPayload, MessageType};
use nc_queue::QueueError;
use tokio::sync::watch;

use crate::error::AgentError;
use crate::executor::execute_command;
use crate::state::AgentState;

/// Sign, enqueue, and block until the executor delivers a response (or the
/// `nc_transport::WAIT_TIMEOUT` deadline passes).
pub async fn enqueue_and_await(
    state: &AgentState,
    source: &str,
    name: &str,
    args: Vec<String>,
    metadata: Option<serde_json::Value>,
) -> Result<serde_json::Value, AgentError> {
    let mut payload = CommandPayload::new(name, args);
    payload.metadata = metadata;
    let id = payload.id.clone();

    let mut message = AgentMessage::new(
        source,
        "nodeagentd",
        MessageType::Command,
        serde_json::to_value(&payload)?,
        state.keys.current_key().key_id,
    );
    nc_codec::sign_message(&state.keys.current_key(), &mut message)?;
    state.queue.enqueue(message);

    match nc_transport::wait_for_response(&state.pending, id).await {
        Ok(response) => Ok(response.payload),
        Err(nc_transport::TransportError::Timeout) => Err(AgentError::Timeout),
        Err(e) => Err(AgentError::BadRequest(e.to_string())),
    }
}

/// Background loop: dequeue, run the command against `DeployEngine`, deliver
/// the result to whichever HTTP/stream caller is waiting on its id.
pub async fn run_executor(state: std::sync::Arc<AgentState>, shutdown: watch::Receiver<bool>) {
    state
        .queue
        .process(
            |entry| {
                let state = state.clone();
                async move {
                    let payload: CommandPayload = serde_json::from_value(entry.message.payload)
                        .map_err(|e| QueueError::HandlerFailed(e.to_string()))?;
                    let result = execute_command(&state, &payload).await;
                    let response = AgentMessage::new(
                        "nodeagentd",
                        entry.message.source,
                        MessageType::CommandResponse,
                        serde_json::json!({"id": payload.id, "result": result}),
                        state.keys.current_key().key_id,
                    );
                    state.pending.deliver(&payload.id, response).await;
                    state.metrics.record_command_processed();
                    Ok(())
                }
            },
            shutdown,
        )
        .await;
}
