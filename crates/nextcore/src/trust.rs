//! Trust-on-first-use: confirm the agent's fingerprint with the operator
//! before ever signing a request to it, and self-register against an empty
//! TrustStore the same way `/bootstrap` expects (spec §6.4 step 1-2).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use nc_identity::{fingerprint_of, KeyPair};
use nc_proto::{Identity, Role};
use nc_trust::TrustStore;
use serde_json::json;
use std::io::Write;

use crate::client::{get_unsigned, post_unsigned};
use crate::error::CliError;

/// Fetch `/public-key`, compare its fingerprint against the CLI's local
/// `TrustedKeys` store, and prompt the operator the first time a given
/// agent is seen. Returns once the operator has accepted (or the agent was
/// already trusted).
pub async fn ensure_agent_trusted(
    client: &reqwest::Client,
    agent_url: &str,
    trust: &TrustStore,
) -> Result<String, CliError> {
    let view = get_unsigned(client, agent_url, "/public-key").await?;
    let public_key = view["public_key"]
        .as_str()
        .ok_or_else(|| CliError::Other("agent's /public-key response missing public_key".into()))?;
    let sign_public = view["sign_public"]
        .as_str()
        .ok_or_else(|| CliError::Other("agent's /public-key response missing sign_public".into()))?;

    let raw = URL_SAFE_NO_PAD
        .decode(public_key)
        .map_err(|e| CliError::Other(format!("malformed agent public key: {e}")))?;
    let fingerprint = fingerprint_of(&raw);

    if trust.find(&fingerprint).is_some() {
        return Ok(fingerprint);
    }

    println!("The agent at {agent_url} presents fingerprint:");
    println!();
    println!("  {fingerprint}");
    println!();
    print!("Trust this agent? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
        return Err(CliError::TrustDeclined);
    }

    trust.add(Identity::new(
        fingerprint.clone(),
        public_key,
        sign_public,
        Role::Owner,
        "agent",
        "tofu",
    ));
    Ok(fingerprint)
}

/// Submit this CLI's own identity to `/bootstrap`. A no-op (not an error) if
/// the agent's TrustStore is already non-empty — bootstrap is only for the
/// very first identity; afterwards an existing owner must run `add-identity`.
pub async fn self_bootstrap(
    client: &reqwest::Client,
    agent_url: &str,
    key: &KeyPair,
    email: &str,
) -> Result<(), CliError> {
    let body = json!({
        "fingerprint": key.fingerprint(),
        "key_agreement_public": key.agreement_public_base64(),
        "signing_public": key.signing_public_base64(),
        "email": email,
    });
    match post_unsigned(client, agent_url, "/bootstrap", &body).await {
        Ok(_) => {
            println!("registered {} as owner", key.fingerprint());
            Ok(())
        }
        Err(CliError::AgentRejected(msg)) if msg.starts_with("403") => Ok(()),
        Err(e) => Err(e),
    }
}
