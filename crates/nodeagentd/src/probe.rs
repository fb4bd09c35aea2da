//! Real `HealthProbe` implementation: a plain HTTP GET of the shadow
//! container's `/health` on localhost, success defined as HTTP 200.

use async_trait::async_trait;
use nc_deploy::HealthProbe;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("http client builds with a fixed timeout"),
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16) -> bool {
        self.client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .is_ok_and(|resp| resp.status().is_success())
    }
}
