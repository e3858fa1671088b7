use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{Attempt, CheckContext, Probe, Service};

/// IMAP greeting, with a LOGIN when credlists are configured.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Imap {
    #[serde(flatten)]
    pub service: Service,
    pub domain: String,
}

#[async_trait]
impl Probe for Imap {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Imap"
    }

    fn default_display(&self) -> &'static str {
        "imap"
    }

    fn default_port(&self) -> u16 {
        143
    }

    async fn attempt(&self, ctx: &CheckContext<'_>, target: &str) -> Attempt {
        let stream = match TcpStream::connect((target, self.service.port)).await {
            Ok(stream) => stream,
            Err(e) => return Attempt::fail("connection to server failed", e.to_string()),
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut banner = String::new();
        if reader.read_line(&mut banner).await.is_err() || !banner.starts_with("* OK") {
            return Attempt::fail("not an imap server", banner.trim_end().to_string());
        }

        if self.service.credlists.is_empty() {
            return Attempt::pass("imap server responded (anonymous)");
        }

        let (mut username, password) = match ctx.creds(&self.service.credlists).await {
            Ok(creds) => creds,
            Err(e) => return Attempt::fail("error getting creds", e.to_string()),
        };
        if !self.domain.is_empty() {
            username.push_str(&self.domain);
        }

        let login = format!("a1 LOGIN {username} {password}\r\n");
        if write_half.write_all(login.as_bytes()).await.is_err() {
            return Attempt::fail("write failed", "connection dropped during login");
        }

        // untagged responses may precede the tagged reply
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => {
                    return Attempt::fail("read failed", "connection closed during login")
                }
                Ok(_) if line.starts_with("a1 ") => break,
                Ok(_) => continue,
            }
        }

        if line.starts_with("a1 OK") {
            Attempt::pass(format!("logged in as {username}"))
        } else {
            Attempt::fail(
                "login failed",
                format!("creds {username}:{password}, reply: {}", line.trim_end()),
            )
        }
    }
}
