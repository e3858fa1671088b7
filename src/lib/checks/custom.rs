use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{Attempt, CheckContext, CheckError, Probe, Service};

/// Operator-supplied shell command. `{TARGET}` and `{TEAM}` are substituted
/// before execution; exit status zero passes the check.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Custom {
    #[serde(flatten)]
    pub service: Service,
    pub command: String,
}

#[async_trait]
impl Probe for Custom {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Custom"
    }

    fn default_display(&self) -> &'static str {
        "custom"
    }

    fn verify_extra(&mut self) -> Result<(), CheckError> {
        if self.command.is_empty() {
            return Err(CheckError::MissingField("command"));
        }
        Ok(())
    }

    async fn attempt(&self, ctx: &CheckContext<'_>, target: &str) -> Attempt {
        let command = self
            .command
            .replace("{TARGET}", target)
            .replace("{TEAM}", ctx.team_identifier);

        match Command::new("sh").arg("-c").arg(&command).output().await {
            Ok(out) if out.status.success() => {
                Attempt::pass(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            Ok(out) => Attempt::fail(
                "command failed",
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ),
            Err(e) => Attempt::fail("failed to run command", e.to_string()),
        }
    }
}
