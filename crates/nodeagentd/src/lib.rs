//! nodeagentd — the long-running node agent: trusted keystore, identity
//! store, encrypted-secret intake, durable command queue, and blue/green
//! container deployment behind an authenticated HTTP/WS surface.

#![forbid(unsafe_code)]

pub mod config;
pub mod containers;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod http;
pub mod probe;
pub mod proxy;
pub mod reconcile;
pub mod rotation;
pub mod state;
pub mod ws;

pub use config::AgentConfig;
pub use state::{AgentState, SharedAgentState};
