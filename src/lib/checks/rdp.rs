use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{dial, Attempt, CheckContext, Probe, Service};

// why are there no good rdp libraries?
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Rdp {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Rdp {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Rdp"
    }

    fn default_display(&self) -> &'static str {
        "rdp"
    }

    fn default_port(&self) -> u16 {
        3389
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        dial(target, self.service.port).await
    }
}
