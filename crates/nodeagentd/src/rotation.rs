//! Key-rotation timer task: calls `KeyStore::rotate` on a fixed cadence
//! (default 24h, spec §4.1).

use nc_identity::KeyStore;
use nc_metrics::OperationsMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub fn spawn(keys: Arc<KeyStore>, metrics: Arc<OperationsMetrics>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            match keys.rotate() {
                Ok(key_id) => {
                    metrics.record_key_rotation();
                    info!(key_id = %key_id, "rotated node key");
                }
                Err(e) => {
                    error!(error = %e, "key rotation failed, will retry next tick");
                }
            }
        }
    });
}
