//! Thin signed-HTTP client. Every privileged call signs the exact bytes it
//! sends, over the literal route path (query strings are never part of the
//! signed path — `/status` is signed the same whether or not `?app=` is
//! present, matching `nodeagentd::http::status`'s convention).

use nc_identity::KeyPair;
use nc_transport::{sign_request, FINGERPRINT_HEADER, SIGNATURE_HEADER};
use serde_json::Value;

use crate::error::CliError;

fn classify(e: reqwest::Error, agent_url: &str) -> CliError {
    if e.is_connect() || e.is_timeout() {
        CliError::Unreachable(format!("{agent_url}: {e}"))
    } else {
        CliError::Http(e)
    }
}

pub async fn get_unsigned(client: &reqwest::Client, agent_url: &str, path: &str) -> Result<Value, CliError> {
    let resp = client
        .get(format!("{agent_url}{path}"))
        .send()
        .await
        .map_err(|e| classify(e, agent_url))?;
    handle_response(resp).await
}

pub async fn post_unsigned(client: &reqwest::Client, agent_url: &str, path: &str, body: &Value) -> Result<Value, CliError> {
    let resp = client
        .post(format!("{agent_url}{path}"))
        .json(body)
        .send()
        .await
        .map_err(|e| classify(e, agent_url))?;
    handle_response(resp).await
}

/// Signed GET. `query` is appended to the URL but excluded from the signed
/// bytes.
pub async fn get_signed(
    client: &reqwest::Client,
    agent_url: &str,
    key: &KeyPair,
    path: &str,
    query: Option<&str>,
) -> Result<Value, CliError> {
    let (fingerprint, signature) = sign_request(key, "GET", path, b"");
    let url = match query {
        Some(q) => format!("{agent_url}{path}?{q}"),
        None => format!("{agent_url}{path}"),
    };
    let resp = client
        .get(url)
        .header(FINGERPRINT_HEADER, fingerprint)
        .header(SIGNATURE_HEADER, signature)
        .send()
        .await
        .map_err(|e| classify(e, agent_url))?;
    handle_response(resp).await
}

/// Signed POST. `body` is serialized once; the exact bytes produced are both
/// signed and sent, so the agent's byte-for-byte signature check matches.
pub async fn post_signed(
    client: &reqwest::Client,
    agent_url: &str,
    key: &KeyPair,
    path: &str,
    body: &Value,
) -> Result<Value, CliError> {
    let bytes = serde_json::to_vec(body)?;
    let (fingerprint, signature) = sign_request(key, "POST", path, &bytes);
    let resp = client
        .post(format!("{agent_url}{path}"))
        .header(FINGERPRINT_HEADER, fingerprint)
        .header(SIGNATURE_HEADER, signature)
        .header("content-type", "application/json")
        .body(bytes)
        .send()
        .await
        .map_err(|e| classify(e, agent_url))?;
    handle_response(resp).await
}

async fn handle_response(resp: reqwest::Response) -> Result<Value, CliError> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        Err(CliError::AgentRejected(format!("{status}: {text}")))
    }
}
