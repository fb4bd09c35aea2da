//! Wire protocol types shared by the node agent and the CLI controller.
//!
//! Defines the message envelope, command payloads, identity/role model, and
//! deployment state exchanged between `nextcore` and `nodeagentd`.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Role ─────────────────────────────────────────────────────────────────────

/// Totally ordered privilege level. `reader < deployer < admin < owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Role {
    Reader = 1,
    Deployer = 2,
    Admin = 3,
    Owner = 4,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Deployer => write!(f, "deployer"),
            Self::Admin => write!(f, "admin"),
            Self::Owner => write!(f, "owner"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Self::Reader),
            "deployer" => Ok(Self::Deployer),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(ProtoError::UnknownRole(other.to_string())),
        }
    }
}

// ─── Identity ─────────────────────────────────────────────────────────────────

/// A trusted counterpart, as held in the agent's TrustStore (or its dual, the
/// CLI's TrustedKeys file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub fingerprint: String,
    pub key_agreement_public: String,
    pub signing_public: String,
    pub role: Role,
    pub email: String,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(
        fingerprint: impl Into<String>,
        key_agreement_public: impl Into<String>,
        signing_public: impl Into<String>,
        role: Role,
        email: impl Into<String>,
        added_by: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            key_agreement_public: key_agreement_public.into(),
            signing_public: signing_public.into(),
            role,
            email: email.into(),
            added_by: added_by.into(),
            created_at: Utc::now(),
        }
    }
}

// ─── AgentMessage envelope ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Command,
    CommandResponse,
    Status,
    StatusAck,
    Auth,
    AuthResponse,
    Event,
    Log,
    Error,
}

/// The envelope exchanged on every hop, over HTTP or the `/ws` stream.
///
/// Signed over its canonical encoding with `signature` held empty; see
/// `nc-codec` for the signing/verification contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque payload bytes, base64-encoded on the wire via serde_json's
    /// default `Vec<u8>` handling being unsuitable for JSON we instead carry
    /// it as a JSON value produced by the caller and serialized verbatim.
    pub payload: serde_json::Value,
    pub timestamp: i64,
    pub agent_id: String,
    /// Per-connection monotonic counter on the `/ws` stream surface: frame 0
    /// is always the `auth` frame, each frame after it increments by one.
    /// Unused (left at 0) on the request/response HTTP surface, which has no
    /// notion of a connection to order frames within.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub signature: String,
}

impl AgentMessage {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            message_type,
            payload,
            timestamp: Utc::now().timestamp(),
            agent_id: agent_id.into(),
            sequence: 0,
            signature: String::new(),
        }
    }

    /// Stamp a stream sequence number, builder-style, before signing.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Returns a copy with the signature field cleared, as required before
    /// computing the canonical signing bytes.
    pub fn unsigned(&self) -> Self {
        let mut m = self.clone();
        m.signature.clear();
        m
    }
}

// ─── CommandPayload ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub name: String,
    pub args: Vec<String>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CommandPayload {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            id: uuid::Uuid::new_v4().to_string(),
            metadata: None,
        }
    }
}

// ─── EncryptedEnvelope ────────────────────────────────────────────────────────

/// A secret-transfer envelope. See `nc-codec::envelope` for the
/// ECDH + HKDF-SHA256 + AES-256-GCM contract that produces/consumes this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub key_id: String,
    pub cli_public_key: String,
    pub nonce: String,
    pub env_blob: String,
    pub variables: std::collections::BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

// ─── DeploymentState ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    #[default]
    None,
    Blue,
    Green,
}

impl Color {
    /// Opposite color; `None` flips to `Blue`.
    pub fn opposite(self) -> Self {
        match self {
            Self::None => Self::Blue,
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    /// Host port bound to this color's shadow container.
    pub fn port(self) -> Option<u16> {
        match self {
            Self::None => None,
            Self::Blue => Some(3001),
            Self::Green => Some(3002),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Blue => write!(f, "blue"),
            Self::Green => write!(f, "green"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentState {
    pub app: String,
    pub current_color: Color,
    pub current_image: Option<String>,
    pub previous_image: Option<String>,
    pub current_container_id: Option<String>,
    pub last_healthy_at: Option<DateTime<Utc>>,
}

impl DeploymentState {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            ..Default::default()
        }
    }
}

// ─── QueueEntry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message: AgentMessage,
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

// ─── AuditLogEntry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub action: String,
    pub actor: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    pub remote_address: String,
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate an application name (used as a path/container-name component).
pub fn validate_app_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a fingerprint: 64 lowercase hex chars (SHA-256).
pub fn validate_fingerprint(fp: &str) -> bool {
    fp.len() == 64 && fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
}
