//! Bodies for the CLI subcommands that interact with the core: `ship`,
//! `rollback`, `status`, `logs`, `secrets push|pull`. `init`/`prepare`/`build`
//! are thin stubs (spec §6.4) documenting the collaborator they would
//! invoke rather than implementing it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use nc_identity::KeyPair;
use nc_proto::{AgentMessage, CommandPayload, MessageType};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::client::{get_signed, post_signed};
use crate::error::CliError;

pub async fn ship(
    client: &reqwest::Client,
    agent_url: &str,
    key: &KeyPair,
    app: &str,
    image: &str,
    ssr_heavy: bool,
    env_file: Option<&Path>,
) -> Result<Value, CliError> {
    let env: std::collections::HashMap<String, String> = match env_file {
        Some(path) => parse_env_file(path)?
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect(),
        None => std::collections::HashMap::new(),
    };
    let body = json!({"app": app, "image": image, "ssr_heavy": ssr_heavy, "env": env});
    post_signed(client, agent_url, key, "/deploy", &body).await
}

pub async fn rollback(client: &reqwest::Client, agent_url: &str, key: &KeyPair, app: &str) -> Result<Value, CliError> {
    let body = json!({"app": app});
    post_signed(client, agent_url, key, "/rollback", &body).await
}

pub async fn stop(client: &reqwest::Client, agent_url: &str, key: &KeyPair, app: &str) -> Result<Value, CliError> {
    let body = json!({"app": app});
    post_signed(client, agent_url, key, "/stop", &body).await
}

pub async fn restart(client: &reqwest::Client, agent_url: &str, key: &KeyPair, app: &str) -> Result<Value, CliError> {
    let body = json!({"app": app});
    post_signed(client, agent_url, key, "/restart", &body).await
}

pub async fn status(client: &reqwest::Client, agent_url: &str, key: &KeyPair, app: Option<&str>) -> Result<Value, CliError> {
    let query = app.map(|a| format!("app={a}"));
    get_signed(client, agent_url, key, "/status", query.as_deref()).await
}

/// `logs` has no HTTP route (spec §6.1's table omits it); it rides the `/ws`
/// stream surface as an ordinary `command` frame, same as `deploy`/`stop`.
pub async fn logs(agent_url: &str, key: &KeyPair, app: &str, lines: u64) -> Result<Value, CliError> {
    let ws_url = to_ws_url(agent_url);
    let mut auth = AgentMessage::new(key.fingerprint(), "nodeagentd", MessageType::Auth, json!({}), key.key_id.clone());
    nc_codec::sign_message(key, &mut auth)?;

    let (events_tx, _events_rx) = tokio::sync::mpsc::channel(8);
    let stream = nc_transport::ClientStream::connect(&ws_url, auth, events_tx)
        .await
        .map_err(|e| CliError::Unreachable(e.to_string()))?;

    let mut payload = CommandPayload::new("logs", vec![app.to_string()]);
    payload.metadata = Some(json!({"lines": lines}));
    let command_id = payload.id.clone();
    let mut message = AgentMessage::new(
        key.fingerprint(),
        "nodeagentd",
        MessageType::Command,
        serde_json::to_value(&payload)?,
        key.key_id.clone(),
    )
    .with_sequence(stream.next_sequence());
    nc_codec::sign_message(key, &mut message)?;

    let response = stream
        .send_command_and_wait(message, command_id)
        .await
        .map_err(|e| match e {
            nc_transport::TransportError::Timeout => CliError::Timeout,
            other => CliError::Other(other.to_string()),
        })?;
    Ok(response.payload["result"].clone())
}

pub async fn secrets_push(
    client: &reqwest::Client,
    agent_url: &str,
    key: &KeyPair,
    app: &str,
    env_file: &Path,
) -> Result<Value, CliError> {
    let view = crate::client::get_unsigned(client, agent_url, "/public-key").await?;
    let node_key_id = view["key_id"]
        .as_str()
        .ok_or_else(|| CliError::Other("agent's /public-key response missing key_id".into()))?;
    let node_public_b64 = view["public_key"]
        .as_str()
        .ok_or_else(|| CliError::Other("agent's /public-key response missing public_key".into()))?;
    let raw: [u8; 32] = URL_SAFE_NO_PAD
        .decode(node_public_b64)
        .map_err(|e| CliError::Other(format!("malformed agent public key: {e}")))?
        .try_into()
        .map_err(|_| CliError::Other("agent public key wrong length".into()))?;
    let node_public = x25519_dalek::PublicKey::from(raw);

    let variables = parse_env_file(env_file)?;
    let blob = std::fs::read(env_file)?;
    let envelope = nc_codec::encrypt_envelope(node_key_id, &node_public, &blob, &variables)?;

    let body = serde_json::to_value(&envelope)?;
    post_signed(client, agent_url, key, "/submit-env", &body)
        .await
        .map(|_| json!({"ok": true, "app": app}))
}

pub fn secrets_pull() -> Result<Value, CliError> {
    Err(CliError::Other(
        "secrets pull is not supported: the agent never decrypts an envelope back out to the CLI".into(),
    ))
}

pub fn init_stub() {
    println!("init: would invoke the Next.js metadata extractor and write a project descriptor (out of scope here).");
}

pub fn prepare_stub() {
    println!("prepare: would invoke the Dockerfile generator against the extracted metadata (out of scope here).");
}

pub fn build_stub() {
    println!("build: would invoke the Ansible provisioner / image build pipeline (out of scope here).");
}

fn to_ws_url(agent_url: &str) -> String {
    let base = agent_url
        .replacen("http://", "ws://", 1)
        .replacen("https://", "wss://", 1);
    format!("{base}/ws")
}

fn parse_env_file(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, CliError> {
    let content = std::fs::read_to_string(path)?;
    let mut vars = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.insert(key.trim().to_string(), value.trim().as_bytes().to_vec());
        }
    }
    Ok(vars)
}
