use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Attempt, CheckContext, Probe, Service};

/// HTTP(S) content check.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Web {
    #[serde(flatten)]
    pub service: Service,
    pub path: String,
    pub https: bool,
    /// exact expected status; 0 accepts any 2xx
    pub status_code: u16,
}

#[async_trait]
impl Probe for Web {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Web"
    }

    fn default_display(&self) -> &'static str {
        "web"
    }

    fn default_port(&self) -> u16 {
        80
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        let scheme = if self.https { "https" } else { "http" };
        let path = if self.path.is_empty() { "/" } else { &self.path };
        let url = format!("{scheme}://{target}:{}{path}", self.service.port);

        // competition services routinely run self-signed certs
        let client = match reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
        {
            Ok(client) => client,
            Err(e) => return Attempt::fail("http client error", e.to_string()),
        };

        match client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status();
                let ok = if self.status_code == 0 {
                    status.is_success()
                } else {
                    status.as_u16() == self.status_code
                };
                if ok {
                    Attempt::pass(format!("{url} returned {status}"))
                } else {
                    Attempt::fail("unexpected status", format!("{url} returned {status}"))
                }
            }
            Err(e) => Attempt::fail("request failed", e.to_string()),
        }
    }
}
