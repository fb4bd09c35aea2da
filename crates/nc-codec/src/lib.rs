//! Canonical encoding, signing/verification, replay-window enforcement, and
//! secret-envelope encryption for the agent/CLI wire protocol.
//!
//! Signing contract: an [`AgentMessage`](nc_proto::AgentMessage) is signed
//! over the canonical (sorted-key, no whitespace) JSON encoding of itself
//! with `signature` cleared, hashed with SHA-256, then Ed25519-signed.
//!
//! Envelope contract: the sender generates an ephemeral X25519 key pair,
//! performs key agreement against the node's long-term key-agreement public
//! key, derives a session key via HKDF-SHA256 (empty salt, info
//! `"nextcore-env-v1"`), then encrypts the whole blob and each variable
//! under AES-256-GCM sharing one random nonce — safe only because every
//! ciphertext under that nonce carries distinct AAD (`"blob"`, or the
//! variable name).

#![forbid(unsafe_code)]

use aes_gcm::aead::{Aead, AeadCore, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use nc_identity::KeyPair;
use nc_proto::{AgentMessage, EncryptedEnvelope};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Replay window: a message whose timestamp differs from local time by more
/// than this many seconds is rejected as `Stale`.
pub const REPLAY_WINDOW_SECS: i64 = 300;

const ENVELOPE_HKDF_INFO: &[u8] = b"nextcore-env-v1";
const BLOB_AAD: &[u8] = b"blob";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bad signature")]
    BadSignature,
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),
    #[error("message timestamp outside replay window")]
    Stale,
    #[error("malformed encoding: {0}")]
    BadEncoding(String),
    #[error("decryption failed")]
    Decrypt,
}

// ─── Canonicalization ─────────────────────────────────────────────────────────

/// Render a `serde_json::Value` as minified JSON with object keys sorted
/// lexicographically at every level — the canonical form signatures are
/// computed over.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap());
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).unwrap()),
    }
}

fn canonical_bytes(msg: &AgentMessage) -> Result<Vec<u8>, CodecError> {
    let unsigned = msg.unsigned();
    let value = serde_json::to_value(&unsigned).map_err(|e| CodecError::BadEncoding(e.to_string()))?;
    Ok(canonical_json(&value).into_bytes())
}

// ─── Signing / verification ───────────────────────────────────────────────────

/// Sign `msg` in place with `signer`'s Ed25519 key, over SHA-256 of the
/// canonical encoding (signature field cleared beforehand).
pub fn sign_message(signer: &KeyPair, msg: &mut AgentMessage) -> Result<(), CodecError> {
    let bytes = canonical_bytes(msg)?;
    let digest = Sha256::digest(&bytes);
    let signature = signer.sign(&digest);
    msg.signature = STANDARD.encode(signature.to_bytes());
    Ok(())
}

/// Verify `msg`'s signature against the given base64 Ed25519 public key.
pub fn verify_message(msg: &AgentMessage, signing_public_b64: &str) -> Result<(), CodecError> {
    let bytes = canonical_bytes(msg)?;
    let digest = Sha256::digest(&bytes);
    let sig_bytes = STANDARD
        .decode(&msg.signature)
        .map_err(|_| CodecError::BadSignature)?;
    if nc_identity::verify_detached(signing_public_b64, &digest, &sig_bytes) {
        Ok(())
    } else {
        Err(CodecError::BadSignature)
    }
}

/// Reject messages whose timestamp has drifted outside the replay window.
pub fn check_freshness(msg: &AgentMessage) -> Result<(), CodecError> {
    check_freshness_at(msg, Utc::now())
}

pub fn check_freshness_at(msg: &AgentMessage, now: DateTime<Utc>) -> Result<(), CodecError> {
    let delta = (now.timestamp() - msg.timestamp).abs();
    if delta > REPLAY_WINDOW_SECS {
        Err(CodecError::Stale)
    } else {
        Ok(())
    }
}

// ─── Secret envelopes ─────────────────────────────────────────────────────────

/// Encrypt a `.env` blob plus its individual variables for the node whose
/// long-term key-agreement public key is `node_public` (identified on the
/// wire by `node_key_id`). Generates a fresh ephemeral key pair per call, so
/// the nonce is reused across ciphertexts only under a key that is itself
/// single-use — safe because every ciphertext carries distinct AAD.
pub fn encrypt_envelope(
    node_key_id: &str,
    node_public: &X25519Public,
    blob: &[u8],
    variables: &BTreeMap<String, Vec<u8>>,
) -> Result<EncryptedEnvelope, CodecError> {
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(node_public);

    let session_key = derive_session_key(shared.as_bytes())?;
    let cipher = Aes256Gcm::new(&session_key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let env_blob = seal(&cipher, &nonce, blob, BLOB_AAD)?;
    let mut enc_variables = std::collections::BTreeMap::new();
    for (name, value) in variables {
        let ciphertext = seal(&cipher, &nonce, value, name.as_bytes())?;
        enc_variables.insert(name.clone(), STANDARD.encode(ciphertext));
    }

    Ok(EncryptedEnvelope {
        key_id: node_key_id.to_string(),
        cli_public_key: STANDARD.encode(ephemeral_public.as_bytes()),
        nonce: STANDARD.encode(nonce),
        env_blob: STANDARD.encode(env_blob),
        variables: enc_variables,
        timestamp: Utc::now(),
    })
}

/// Decrypt an envelope using the node's own long-term key-agreement secret
/// (`node_key`). Returns the whole-blob plaintext and the per-variable
/// plaintexts.
pub fn decrypt_envelope(
    node_key: &KeyPair,
    envelope: &EncryptedEnvelope,
) -> Result<(Vec<u8>, BTreeMap<String, Vec<u8>>), CodecError> {
    let ephemeral_public_bytes: [u8; 32] = STANDARD
        .decode(&envelope.cli_public_key)
        .map_err(|_| CodecError::BadEncoding("cli_public_key".into()))?
        .try_into()
        .map_err(|_| CodecError::BadEncoding("cli_public_key length".into()))?;
    let ephemeral_public = X25519Public::from(ephemeral_public_bytes);

    let shared = node_key.agreement_secret().diffie_hellman(&ephemeral_public);
    let session_key = derive_session_key(shared.as_bytes())?;
    let cipher = Aes256Gcm::new(&session_key);

    let nonce_bytes = STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| CodecError::BadEncoding("nonce".into()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let blob_ct = STANDARD
        .decode(&envelope.env_blob)
        .map_err(|_| CodecError::BadEncoding("env_blob".into()))?;
    let blob = open(&cipher, nonce, &blob_ct, BLOB_AAD)?;

    let mut variables = BTreeMap::new();
    for (name, ciphertext_b64) in &envelope.variables {
        let ct = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| CodecError::BadEncoding(format!("variable {name}")))?;
        let plaintext = open(&cipher, nonce, &ct, name.as_bytes())?;
        variables.insert(name.clone(), plaintext);
    }

    Ok((blob, variables))
}

fn derive_session_key(shared_secret: &[u8]) -> Result<Key<Aes256Gcm>, CodecError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(ENVELOPE_HKDF_INFO, &mut okm)
        .map_err(|_| CodecError::Decrypt)?;
    Ok(Key::<Aes256Gcm>::from(okm))
}

fn seal(
    cipher: &Aes256Gcm,
    nonce: &Nonce<aes_gcm::aes::cipher::consts::U12>,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CodecError> {
    cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CodecError::Decrypt)
}

fn open(cipher: &Aes256Gcm, nonce: &Nonce<aes_gcm::aes::cipher::consts::U12>, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CodecError> {
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CodecError::Decrypt)
}
