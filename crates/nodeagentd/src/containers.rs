//! Real `ContainerDriver` implementation: shells out to the `docker` CLI.
//!
//! The container daemon is an external collaborator (spec §6.5); this driver
//! only needs "pull / start / stop-and-remove", so shelling out is simpler
//! and more portable than linking the daemon's HTTP API directly. Every call
//! runs on a blocking thread via `tokio::task::spawn_blocking`, matching the
//! spec's "blocking I/O never starves the scheduler" rule (§5).

use async_trait::async_trait;
use nc_deploy::ContainerDriver;
use std::collections::HashMap;
use std::process::Command;
use tracing::{info, warn};

pub struct DockerContainerDriver;

impl DockerContainerDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DockerContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn run(mut cmd: Command) -> Result<String, String> {
    let output = cmd.output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ContainerDriver for DockerContainerDriver {
    async fn pull_image(&self, image: &str) -> Result<(), String> {
        let image = image.to_string();
        tokio::task::spawn_blocking(move || {
            info!(image = %image, "pulling image");
            let mut cmd = Command::new("docker");
            cmd.args(["pull", &image]);
            run(cmd).map(|_| ())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn start_container(
        &self,
        name: &str,
        image: &str,
        port: u16,
        memory_mib: u32,
        env: &HashMap<String, String>,
    ) -> Result<String, String> {
        let name = name.to_string();
        let image = image.to_string();
        let env = env.clone();
        tokio::task::spawn_blocking(move || {
            info!(name = %name, image = %image, port, memory_mib, "starting shadow container");
            let mut cmd = Command::new("docker");
            cmd.args([
                "run",
                "-d",
                "--name",
                &name,
                "--restart",
                "unless-stopped",
                "--security-opt",
                "no-new-privileges",
                "-p",
                &format!("{port}:{port}"),
                "-m",
                &format!("{memory_mib}m"),
            ]);
            for (key, value) in &env {
                cmd.arg("-e").arg(format!("{key}={value}"));
            }
            cmd.arg(&image);
            run(cmd)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), String> {
        let container_id = container_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stop_cmd = Command::new("docker");
            stop_cmd.args(["stop", &container_id]);
            if let Err(e) = run(stop_cmd) {
                warn!(container_id = %container_id, error = %e, "stop failed, attempting remove anyway");
            }
            let mut rm_cmd = Command::new("docker");
            rm_cmd.args(["rm", "-f", &container_id]);
            run(rm_cmd).map(|_| ())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String, String> {
        let container_id = container_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut cmd = Command::new("docker");
            cmd.args(["logs", "--tail", &lines.to_string(), &container_id]);
            run(cmd)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}
