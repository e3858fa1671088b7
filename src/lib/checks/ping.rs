use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{Attempt, CheckContext, CheckError, Probe, Service};

/// ICMP reachability via the system ping binary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Ping {
    #[serde(flatten)]
    pub service: Service,
    /// echo requests per check
    pub count: u32,
}

#[async_trait]
impl Probe for Ping {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Ping"
    }

    fn default_display(&self) -> &'static str {
        "ping"
    }

    fn verify_extra(&mut self) -> Result<(), CheckError> {
        if self.count == 0 {
            self.count = 1;
        }
        Ok(())
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        let output = Command::new("ping")
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(self.service.timeout.to_string())
            .arg(target)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                Attempt::pass(format!("{target} responded to icmp echo"))
            }
            Ok(out) => Attempt::fail(
                "no ping response",
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ),
            Err(e) => Attempt::fail("failed to run ping", e.to_string()),
        }
    }
}
