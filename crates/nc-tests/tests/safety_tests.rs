//! Adversarial HTTP-surface tests: verify the agent's trust/auth boundary
//! cannot be bypassed, even by a caller who almost gets it right. Companion
//! to `tests/integration.rs`'s happy-path scenarios — this file is the
//! "try to break it" counterpart, mirroring the donor's old
//! safety-constraint suite but checked against this domain's actual
//! invariants (spec §8) instead of the VPS fleet's teardown/cost/batch
//! guards.

use axum::http::StatusCode;
use nc_identity::KeyPair;
use nc_proto::Role;
use nc_tests::{body_json, new_identity, spin_up};
use serde_json::json;

/// A signature over the wrong path (request re-targeted after signing) is
/// rejected — AuthGate signs over `METHOD PATH BODY`, not just the body.
#[tokio::test]
async fn signature_over_a_different_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let body = json!({"app": "foo"});
    let body_bytes = serde_json::to_vec(&body).unwrap();
    // Sign for /stop but send the request to /restart.
    let (fingerprint, signature) = nc_transport::sign_request(&agent.owner_key, "POST", "/stop", &body_bytes);
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/restart")
        .header("content-type", "application/json")
        .header(nc_transport::FINGERPRINT_HEADER, fingerprint)
        .header(nc_transport::SIGNATURE_HEADER, signature)
        .body(axum::body::Body::from(body_bytes))
        .unwrap();
    let response = tower::ServiceExt::oneshot(agent.router.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// A tampered body (changed after signing) invalidates the signature.
#[tokio::test]
async fn tampered_body_after_signing_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let signed_body = serde_json::to_vec(&json!({"app": "foo"})).unwrap();
    let (fingerprint, signature) = nc_transport::sign_request(&agent.owner_key, "POST", "/stop", &signed_body);
    let sent_body = serde_json::to_vec(&json!({"app": "bar"})).unwrap();
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/stop")
        .header("content-type", "application/json")
        .header(nc_transport::FINGERPRINT_HEADER, fingerprint)
        .header(nc_transport::SIGNATURE_HEADER, signature)
        .body(axum::body::Body::from(sent_body))
        .unwrap();
    let response = tower::ServiceExt::oneshot(agent.router.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// An identity that was never trusted is refused before signature
/// verification even runs.
#[tokio::test]
async fn unknown_identity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;
    let stranger = KeyPair::generate();

    let response = agent.send("GET", "/status", &stranger, json!({})).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// A `reader` may call `/status` but not `/add-identity`, `/deploy`, or
/// `/revoke-identity` — role ordering is enforced per route, not just
/// per-identity "is trusted".
#[tokio::test]
async fn reader_cannot_escalate_to_privileged_routes() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let (reader_key, _) = new_identity(Role::Reader, "reader@x", &agent.owner_key.fingerprint());
    let add = agent
        .send(
            "POST",
            "/add-identity",
            &agent.owner_key,
            json!({
                "fingerprint": reader_key.fingerprint(),
                "key_agreement_public": reader_key.agreement_public_base64(),
                "signing_public": reader_key.signing_public_base64(),
                "role": "reader",
                "email": "reader@x",
            }),
        )
        .await;
    assert_eq!(add.status(), StatusCode::OK);

    let status = agent.send("GET", "/status", &reader_key, json!({})).await;
    assert_eq!(status.status(), StatusCode::OK);

    let deploy = agent
        .send("POST", "/deploy", &reader_key, json!({"app": "foo", "image": "foo:v1"}))
        .await;
    assert_eq!(deploy.status(), StatusCode::FORBIDDEN);

    let add_identity = agent
        .send(
            "POST",
            "/add-identity",
            &reader_key,
            json!({
                "fingerprint": "whatever",
                "key_agreement_public": "x",
                "signing_public": "x",
                "role": "reader",
                "email": "x@x",
            }),
        )
        .await;
    assert_eq!(add_identity.status(), StatusCode::FORBIDDEN);

    let revoke = agent
        .send(
            "POST",
            "/revoke-identity",
            &reader_key,
            json!({"fingerprint": agent.owner_key.fingerprint()}),
        )
        .await;
    assert_eq!(revoke.status(), StatusCode::FORBIDDEN);
}

/// A `deployer` may deploy but is still refused at `/add-identity` — the
/// role check is a strict floor, not "deployer and above can do
/// owner-level things too".
#[tokio::test]
async fn deployer_cannot_call_add_identity() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let (dev_key, _) = new_identity(Role::Deployer, "dev@x", &agent.owner_key.fingerprint());
    let add = agent
        .send(
            "POST",
            "/add-identity",
            &agent.owner_key,
            json!({
                "fingerprint": dev_key.fingerprint(),
                "key_agreement_public": dev_key.agreement_public_base64(),
                "signing_public": dev_key.signing_public_base64(),
                "role": "deployer",
                "email": "dev@x",
            }),
        )
        .await;
    assert_eq!(add.status(), StatusCode::OK);

    let deploy = agent
        .send("POST", "/deploy", &dev_key, json!({"app": "foo", "image": "foo:v1"}))
        .await;
    assert_eq!(deploy.status(), StatusCode::OK);

    let escalate = agent
        .send(
            "POST",
            "/add-identity",
            &dev_key,
            json!({
                "fingerprint": "another",
                "key_agreement_public": "x",
                "signing_public": "x",
                "role": "owner",
                "email": "x@x",
            }),
        )
        .await;
    assert_eq!(escalate.status(), StatusCode::FORBIDDEN);
}

/// Revoking the sole remaining owner is refused with 500 (`WouldOrphan`),
/// never silently dropping the last administrator.
#[tokio::test]
async fn removing_the_last_owner_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let revoke = agent
        .send(
            "POST",
            "/revoke-identity",
            &agent.owner_key,
            json!({"fingerprint": agent.owner_key.fingerprint()}),
        )
        .await;
    assert_eq!(revoke.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let identities = agent.send("GET", "/list-identities", &agent.owner_key, json!({})).await;
    let body = body_json(identities).await;
    assert_eq!(body["identities"].as_array().unwrap().len(), 1);
}

/// Revoking a second owner is fine as long as the first remains — the
/// guard is "at least one owner survives", not "owners are immutable".
#[tokio::test]
async fn removing_a_non_last_owner_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let (second_owner, _) = new_identity(Role::Owner, "owner2@x", &agent.owner_key.fingerprint());
    let add = agent
        .send(
            "POST",
            "/add-identity",
            &agent.owner_key,
            json!({
                "fingerprint": second_owner.fingerprint(),
                "key_agreement_public": second_owner.agreement_public_base64(),
                "signing_public": second_owner.signing_public_base64(),
                "role": "owner",
                "email": "owner2@x",
            }),
        )
        .await;
    assert_eq!(add.status(), StatusCode::OK);

    let revoke = agent
        .send(
            "POST",
            "/revoke-identity",
            &agent.owner_key,
            json!({"fingerprint": second_owner.fingerprint()}),
        )
        .await;
    assert_eq!(revoke.status(), StatusCode::OK);
}

/// `/bootstrap` is unreachable once any identity is trusted, regardless of
/// who is asking or whether the request is signed at all.
#[tokio::test]
async fn bootstrap_stays_closed_after_first_identity() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spin_up(dir.path(), true).await;

    let stranger = KeyPair::generate();
    let response = agent
        .send_unsigned(
            "POST",
            "/bootstrap",
            json!({
                "fingerprint": stranger.fingerprint(),
                "key_agreement_public": stranger.agreement_public_base64(),
                "signing_public": stranger.signing_public_base64(),
                "email": "intruder@x",
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

/// A command enqueued but not yet drained by the executor stays visible in
/// the durable queue file — restarting the process (a fresh `CommandQueue`
/// over the same state directory) must still see it.
#[tokio::test]
async fn unacknowledged_command_survives_a_simulated_restart() {
    let dir = tempfile::tempdir().unwrap();
    let message = nc_proto::AgentMessage::new(
        "cli",
        "nodeagentd",
        nc_proto::MessageType::Command,
        json!({"name": "deploy"}),
        "key-1",
    );

    {
        let queue = nc_queue::CommandQueue::new(dir.path());
        queue.enqueue(message);
        assert_eq!(queue.len(), 1);
    }

    let reopened = nc_queue::CommandQueue::new(dir.path());
    assert_eq!(reopened.len(), 1);
    let entry = reopened.dequeue().unwrap();
    assert_eq!(entry.message.source, "cli");
}
