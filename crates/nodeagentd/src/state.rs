//! Shared agent state — one instance wired up in `main`, cloned (as an
//! `Arc`) into every axum handler and background task. Mirrors the donor's
//! `SharedState`, minus the VPS-specific stores, plus the deploy/queue/trust
//! stores this domain actually needs.

use crate::config::AgentConfig;
use nc_audit::AuditLog;
use nc_deploy::DeployEngine;
use nc_identity::KeyStore;
use nc_metrics::OperationsMetrics;
use nc_queue::CommandQueue;
use nc_secrets::ReceivedSecretStore;
use nc_transport::PendingTable;
use nc_trust::TrustStore;
use std::sync::Arc;

pub struct AgentState {
    pub config: AgentConfig,
    pub keys: Arc<KeyStore>,
    pub trust: Arc<TrustStore>,
    pub audit: Arc<AuditLog>,
    pub queue: Arc<CommandQueue>,
    pub deploys: Arc<DeployEngine>,
    pub secrets: Arc<ReceivedSecretStore>,
    pub metrics: Arc<OperationsMetrics>,
    /// Correlates a queued `CommandPayload.id` to the HTTP/stream caller
    /// awaiting its result once the queue executor delivers a response.
    pub pending: Arc<PendingTable>,
}

impl AgentState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        keys: Arc<KeyStore>,
        trust: Arc<TrustStore>,
        audit: Arc<AuditLog>,
        queue: Arc<CommandQueue>,
        deploys: Arc<DeployEngine>,
        secrets: Arc<ReceivedSecretStore>,
        metrics: Arc<OperationsMetrics>,
    ) -> Self {
        Self {
            config,
            keys,
            trust,
            audit,
            queue,
            deploys,
            secrets,
            metrics,
            pending: Arc::new(PendingTable::new()),
        }
    }
}

pub type SharedAgentState = Arc<AgentState>;
