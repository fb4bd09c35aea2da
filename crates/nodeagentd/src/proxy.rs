//! Real `ProxyDriver` implementation: rewrites a per-app upstream include
//! file consumed by the reverse proxy, then reloads it. Reverse-proxy config
//! generation itself is out of scope (spec §1); this driver only performs the
//! abstract "swap upstream port, reload" operation (spec §6.5).

use async_trait::async_trait;
use nc_deploy::ProxyDriver;
use std::path::PathBuf;
use std::process::Command;
use tracing::info;

pub struct ReverseProxyDriver {
    upstreams_dir: PathBuf,
}

impl ReverseProxyDriver {
    pub fn new(upstreams_dir: PathBuf) -> Self {
        Self { upstreams_dir }
    }

    fn upstream_path(&self, app: &str) -> PathBuf {
        self.upstreams_dir.join(format!("{app}.conf"))
    }
}

#[async_trait]
impl ProxyDriver for ReverseProxyDriver {
    async fn switch_upstream(&self, app: &str, port: u16) -> Result<(), String> {
        let path = self.upstream_path(app);
        let contents = format!("server 127.0.0.1:{port};\n");
        let app = app.to_string();
        tokio::task::spawn_blocking(move || {
            info!(app = %app, port, "switching reverse-proxy upstream");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            nc_persist::atomic_write(&path, contents.as_bytes()).map_err(|e| e.to_string())?;
            reload().map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

fn reload() -> Result<(), String> {
    let output = Command::new("nginx")
        .args(["-s", "reload"])
        .output()
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(())
}
