use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{dial, Attempt, CheckContext, Probe, Service};

/// Database port liveness.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Sql {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Sql {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Sql"
    }

    fn default_display(&self) -> &'static str {
        "sql"
    }

    fn default_port(&self) -> u16 {
        3306
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        dial(target, self.service.port).await
    }
}
