//! Startup reconciliation sweep (spec §5): a cancellation during
//! `StartingShadow` can leave a shadow container running but unreferenced by
//! any `DeploymentState`. On boot we list containers matching the
//! `<app>-blue`/`<app>-green` naming scheme and remove any that aren't the
//! app's current container.

use nc_deploy::DeployEngine;
use std::collections::HashSet;
use std::process::Command;
use tracing::{info, warn};

pub async fn reconcile_orphans(deploys: &DeployEngine) {
    let apps = deploys.list_apps().await;
    if apps.is_empty() {
        return;
    }

    let running = match list_running_container_names() {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "reconciliation sweep: could not list containers, skipping");
            return;
        }
    };

    let current_names: HashSet<String> = apps
        .iter()
        .map(|d| format!("{}-{}", d.app, d.current_color))
        .collect();

    for name in running {
        let looks_like_shadow = apps.iter().any(|d| {
            name == format!("{}-blue", d.app) || name == format!("{}-green", d.app)
        });
        if looks_like_shadow && !current_names.contains(&name) {
            info!(container = %name, "reconciliation sweep: removing orphaned shadow container");
            let mut cmd = Command::new("docker");
            cmd.args(["rm", "-f", &name]);
            if let Err(e) = cmd.output() {
                warn!(container = %name, error = %e, "failed to remove orphaned container");
            }
        }
    }
}

fn list_running_container_names() -> Result<Vec<String>, String> {
    let output = Command::new("docker")
        .args(["ps", "-a", "--format", "{{.Names}}"])
        .output()
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}
