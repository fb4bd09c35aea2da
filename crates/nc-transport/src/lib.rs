//! HTTP request signing/verification (`AuthGate`) and the persistent
//! bidirectional streaming surface (`/ws`) shared by the agent and the CLI.
//!
//! HTTP signatures cover `method ⊕ path ⊕ body` (ASCII-space-separated
//! octets) with Ed25519, independent of the AgentMessage canonical-encoding
//! scheme in `nc_codec` — that scheme instead covers every frame exchanged
//! over the stream surface, starting with the first `auth` frame.

#![forbid(unsafe_code)]

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine};
use nc_identity::KeyPair;
use nc_proto::{AgentMessage, Identity, MessageType, Role};
use nc_trust::TrustStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, warn};

pub const FINGERPRINT_HEADER: &str = "x-fingerprint";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Application-level keepalive ping cadence on the stream surface.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
/// A stream is considered dead after this long without a pong.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(20);
/// Default deadline for a single `Wait-for-response` on the pending table.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing X-Fingerprint/X-Signature headers")]
    MissingHeaders,
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("role insufficient for this operation")]
    InsufficientRole,
    #[error("signature verification failed")]
    BadSignature,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingHeaders | AuthError::UnknownIdentity | AuthError::BadSignature => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::InsufficientRole => StatusCode::FORBIDDEN,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation timed out waiting for a response")]
    Timeout,
    #[error("stream is not connected")]
    NotConnected,
    #[error("stream error: {0}")]
    Stream(String),
    #[error("http error: {0}")]
    Http(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Accept `incoming` as the next frame on a stream whose last accepted
/// sequence is tracked in `last`, iff it is strictly greater. Updates `last`
/// and returns `true` on acceptance; leaves `last` untouched and returns
/// `false` for a replay or reorder.
fn accepts_sequence(last: &AtomicU64, incoming: u64) -> bool {
    let seen = last.load(Ordering::SeqCst);
    if incoming <= seen {
        return false;
    }
    last.store(incoming, Ordering::SeqCst);
    true
}

/// The exact byte string an HTTP request is signed over: `METHOD PATH BODY`.
pub fn signing_bytes(method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(method.len() + path.len() + body.len() + 2);
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(body);
    buf
}

/// Sign an outgoing request as the CLI (or any caller holding a `KeyPair`):
/// returns `(fingerprint, base64-signature)` for the `X-Fingerprint` /
/// `X-Signature` headers.
pub fn sign_request(key: &KeyPair, method: &str, path: &str, body: &[u8]) -> (String, String) {
    let bytes = signing_bytes(method, path, body);
    let signature = key.sign(&bytes);
    (key.fingerprint(), STANDARD.encode(signature.to_bytes()))
}

/// Runs AuthGate steps 1-4 (headers present, identity known, role sufficient,
/// signature valid) against an inbound request. Step 5 (audit append) is the
/// caller's responsibility once the handler has actually completed, so that
/// audit-log order reflects completion order rather than arrival order.
pub fn auth_gate(
    trust: &TrustStore,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &[u8],
    min_role: Role,
) -> Result<Identity, AuthError> {
    let fingerprint = headers
        .get(FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingHeaders)?
        .to_string();
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingHeaders)?
        .to_string();

    let identity = trust.find(&fingerprint).ok_or(AuthError::UnknownIdentity)?;

    if identity.role < min_role {
        return Err(AuthError::InsufficientRole);
    }

    let signature = STANDARD
        .decode(signature_header)
        .map_err(|_| AuthError::BadSignature)?;
    let bytes = signing_bytes(method, path, body);
    if !nc_identity::verify_detached(&identity.signing_public, &bytes, &signature) {
        return Err(AuthError::BadSignature);
    }

    debug!(fingerprint = %identity.fingerprint, path, "auth gate passed");
    Ok(identity)
}

// ─── Pending-response correlation ─────────────────────────────────────────────

/// Keyed by `CommandPayload.id`. Guarded by a `tokio::sync::Mutex` with short
/// critical sections, per the spec's shared-resource policy.
pub struct PendingTable {
    waiters: Mutex<HashMap<String, oneshot::Sender<AgentMessage>>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, id: String) -> oneshot::Receiver<AgentMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        rx
    }

    /// Deliver a `command-response` to its waiter. Returns `false` if no
    /// waiter was registered (already reaped, or an unsolicited response).
    pub async fn deliver(&self, id: &str, message: AgentMessage) -> bool {
        match self.waiters.lock().await.remove(id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    async fn reap(&self, id: &str) {
        self.waiters.lock().await.remove(id);
    }
}

/// Register a waiter for `id` and block until delivered or `WAIT_TIMEOUT`
/// elapses, at which point the slot is reaped and `Timeout` is returned.
pub async fn wait_for_response(table: &PendingTable, id: String) -> Result<AgentMessage, TransportError> {
    let rx = table.register(id.clone()).await;
    match tokio::time::timeout(WAIT_TIMEOUT, rx).await {
        Ok(Ok(message)) => Ok(message),
        _ => {
            table.reap(&id).await;
            Err(TransportError::Timeout)
        }
    }
}

// ─── Server-side stream session (agent) ───────────────────────────────────────

/// Drive one accepted `/ws` connection: verify the first `auth` frame
/// against `trust`, then loop forwarding subsequent frames to `on_message`,
/// sending back whatever it returns, with a 15s ping / 20s pong-timeout
/// keepalive. Every frame after the auth frame must carry a `sequence`
/// strictly greater than the last accepted one on this connection; anything
/// else (a replay, a reorder) is dropped rather than forwarded.
pub async fn run_server_session<F, Fut>(
    mut socket: WebSocket,
    trust: &TrustStore,
    mut on_message: F,
) -> Result<(), TransportError>
where
    F: FnMut(AgentMessage) -> Fut,
    Fut: Future<Output = Option<AgentMessage>>,
{
    let first = tokio::time::timeout(PONG_TIMEOUT, socket.recv())
        .await
        .map_err(|_| TransportError::Timeout)?
        .ok_or(TransportError::NotConnected)?
        .map_err(|e| TransportError::Stream(e.to_string()))?;

    let auth_msg: AgentMessage = match first {
        WsMessage::Text(text) => {
            serde_json::from_str(&text).map_err(|e| TransportError::Stream(e.to_string()))?
        }
        _ => return Err(TransportError::Stream("expected a text auth frame first".into())),
    };
    if auth_msg.message_type != MessageType::Auth {
        return Err(TransportError::Stream("first frame must be type=auth".into()));
    }
    let identity = trust.find(&auth_msg.source).ok_or(AuthError::UnknownIdentity)?;
    nc_codec::verify_message(&auth_msg, &identity.signing_public).map_err(|_| AuthError::BadSignature)?;
    nc_codec::check_freshness(&auth_msg).map_err(|_| TransportError::Stream("stale auth frame".into()))?;
    debug!(fingerprint = %identity.fingerprint, "stream session authenticated");

    let last_sequence = AtomicU64::new(auth_msg.sequence);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    warn!(fingerprint = %identity.fingerprint, "stream silent past pong timeout, closing");
                    return Ok(());
                }
                if socket.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return Ok(());
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<AgentMessage>(&text) {
                            Ok(msg) => {
                                if !accepts_sequence(&last_sequence, msg.sequence) {
                                    warn!(
                                        fingerprint = %identity.fingerprint,
                                        sequence = msg.sequence,
                                        last_sequence = last_sequence.load(Ordering::SeqCst),
                                        "dropping out-of-order stream frame"
                                    );
                                    continue;
                                }
                                if let Some(response) = on_message(msg).await {
                                    let payload = serde_json::to_string(&response)
                                        .map_err(|e| TransportError::Stream(e.to_string()))?;
                                    if socket.send(WsMessage::Text(payload)).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed stream frame"),
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(TransportError::Stream(e.to_string())),
                    _ => {}
                }
            }
        }
    }
}

// ─── Client-side stream (CLI) ──────────────────────────────────────────────────

/// An open `/ws` connection to the agent, dialed by the CLI. Owns the
/// pending-response table; a background task drains incoming frames and
/// delivers `command-response` messages to their waiter.
pub struct ClientStream {
    outgoing: tokio::sync::mpsc::Sender<TungsteniteMessage>,
    pending: std::sync::Arc<PendingTable>,
    next_sequence: std::sync::Arc<AtomicU64>,
}

impl ClientStream {
    /// Dial `url` (`ws://` or `wss://`), send `auth` as the first frame, and
    /// spawn the read loop. `events` receives any frame that is not a
    /// `command-response` correlated to a pending waiter.
    ///
    /// `auth.sequence` is frame 0 on this connection; call
    /// [`Self::next_sequence`] to stamp every frame sent after it, so the
    /// server's monotonicity check in [`run_server_session`] accepts them.
    pub async fn connect(
        url: &str,
        auth: AgentMessage,
        events: tokio::sync::mpsc::Sender<AgentMessage>,
    ) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        use futures_util::{SinkExt, StreamExt};
        let (mut write, mut read) = ws_stream.split();

        let next_sequence = std::sync::Arc::new(AtomicU64::new(auth.sequence + 1));

        let auth_payload =
            serde_json::to_string(&auth).map_err(|e| TransportError::Stream(e.to_string()))?;
        write
            .send(TungsteniteMessage::Text(auth_payload))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        let pending = std::sync::Arc::new(PendingTable::new());
        let pending_reader = pending.clone();

        let (outgoing_tx, mut outgoing_rx) = tokio::sync::mpsc::channel::<TungsteniteMessage>(32);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(TungsteniteMessage::Text(text)) => {
                        if let Ok(msg) = serde_json::from_str::<AgentMessage>(&text) {
                            let id = msg
                                .payload
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let delivered = msg.message_type == MessageType::CommandResponse
                                && pending_reader.deliver(&id, msg.clone()).await;
                            if !delivered && events.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(TungsteniteMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Self {
            outgoing: outgoing_tx,
            pending,
            next_sequence,
        })
    }

    /// Next sequence number to stamp on an outgoing frame, in order, after
    /// the auth frame. Callers must assign this before signing a message —
    /// the signature covers the `sequence` field along with the rest of the
    /// envelope.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a message without waiting for a reply.
    pub async fn send(&self, message: &AgentMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_string(message).map_err(|e| TransportError::Stream(e.to_string()))?;
        self.outgoing
            .send(TungsteniteMessage::Text(payload))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Send a command and block for its `command-response`, up to
    /// [`WAIT_TIMEOUT`].
    pub async fn send_command_and_wait(
        &self,
        message: AgentMessage,
        command_id: String,
    ) -> Result<AgentMessage, TransportError> {
        self.send(&message).await?;
        wait_for_response(&self.pending, command_id).await
    }
}
