//! CLI-side configuration: where local identity/trust state lives and which
//! agent to talk to. Mirrors the donor's `dirs::home_dir().join(".clawnode")`
//! convention for its own local state directory.

use std::path::PathBuf;

pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".nextcore")
}

pub fn default_agent_url() -> String {
    "http://127.0.0.1:7878".to_string()
}
