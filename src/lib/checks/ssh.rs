use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{read_banner, Attempt, CheckContext, Probe, Service};

/// SSH liveness via the protocol banner.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Ssh {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Ssh {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Ssh"
    }

    fn default_display(&self) -> &'static str {
        "ssh"
    }

    fn default_port(&self) -> u16 {
        22
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        match read_banner(target, self.service.port).await {
            Ok(banner) if banner.starts_with("SSH-") => Attempt::pass(banner),
            Ok(banner) => Attempt::fail("not an ssh server", banner),
            Err(e) => Attempt::fail("connection error", e.to_string()),
        }
    }
}
