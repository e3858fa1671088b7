use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{dial, Attempt, CheckContext, CheckError, Probe, Service};

/// Plain TCP connect check.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Tcp {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Tcp {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Tcp"
    }

    fn default_display(&self) -> &'static str {
        "tcp"
    }

    fn verify_extra(&mut self) -> Result<(), CheckError> {
        if self.service.port == 0 {
            return Err(CheckError::MissingField("port"));
        }
        Ok(())
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        dial(target, self.service.port).await
    }
}
