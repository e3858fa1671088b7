use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{Attempt, CheckContext, Probe, Service};

/// SMTP greeting + EHLO exchange.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Smtp {
    #[serde(flatten)]
    pub service: Service,
    /// appended to usernames, e.g. "@team.example"
    pub domain: String,
}

#[async_trait]
impl Probe for Smtp {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Smtp"
    }

    fn default_display(&self) -> &'static str {
        "smtp"
    }

    fn default_port(&self) -> u16 {
        25
    }

    async fn attempt(&self, ctx: &CheckContext<'_>, target: &str) -> Attempt {
        let stream = match TcpStream::connect((target, self.service.port)).await {
            Ok(stream) => stream,
            Err(e) => return Attempt::fail("connection to server failed", e.to_string()),
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut banner = String::new();
        if reader.read_line(&mut banner).await.is_err() || !banner.starts_with("220") {
            return Attempt::fail("unexpected smtp banner", banner.trim_end().to_string());
        }

        let sender = match self.mail_from(ctx).await {
            Ok(sender) => sender,
            Err(e) => return Attempt::fail("error getting creds", e),
        };

        if write_half
            .write_all(format!("EHLO {sender}\r\n").as_bytes())
            .await
            .is_err()
        {
            return Attempt::fail("write failed", "connection dropped during ehlo");
        }

        let mut reply = String::new();
        match reader.read_line(&mut reply).await {
            Ok(_) if reply.starts_with("250") => {
                Attempt::pass(format!("smtp server greeted {sender}"))
            }
            Ok(_) => Attempt::fail("ehlo rejected", reply.trim_end().to_string()),
            Err(e) => Attempt::fail("read failed", e.to_string()),
        }
    }
}

impl Smtp {
    async fn mail_from(&self, ctx: &CheckContext<'_>) -> Result<String, String> {
        if self.service.credlists.is_empty() {
            return Ok("scoring".to_string());
        }
        let (username, _) = ctx
            .creds(&self.service.credlists)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("{username}{}", self.domain))
    }
}
