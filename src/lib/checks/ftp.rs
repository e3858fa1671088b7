use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{read_banner, Attempt, CheckContext, Probe, Service};

/// FTP liveness via the service-ready greeting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Ftp {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Ftp {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Ftp"
    }

    fn default_display(&self) -> &'static str {
        "ftp"
    }

    fn default_port(&self) -> u16 {
        21
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        match read_banner(target, self.service.port).await {
            Ok(banner) if banner.starts_with("220") => Attempt::pass(banner),
            Ok(banner) => Attempt::fail("not an ftp server", banner),
            Err(e) => Attempt::fail("connection error", e.to_string()),
        }
    }
}
