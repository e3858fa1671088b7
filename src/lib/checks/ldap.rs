use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{dial, Attempt, CheckContext, Probe, Service};

/// Directory service port liveness.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Ldap {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Ldap {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Ldap"
    }

    fn default_display(&self) -> &'static str {
        "ldap"
    }

    fn default_port(&self) -> u16 {
        389
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        dial(target, self.service.port).await
    }
}
