use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{dial, Attempt, CheckContext, Probe, Service};

/// WinRM port liveness.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WinRm {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for WinRm {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "WinRm"
    }

    fn default_display(&self) -> &'static str {
        "winrm"
    }

    fn default_port(&self) -> u16 {
        5985
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        dial(target, self.service.port).await
    }
}
