use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{Attempt, CheckContext, CheckError, Probe, Service};

/// Authoritative DNS check against the team's own name server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Dns {
    #[serde(flatten)]
    pub service: Service,
    pub record: String,
    pub recordtype: String,
    /// expected answer; empty accepts any answer
    pub answer: String,
}

#[async_trait]
impl Probe for Dns {
    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn type_name(&self) -> &'static str {
        "Dns"
    }

    fn default_display(&self) -> &'static str {
        "dns"
    }

    fn default_port(&self) -> u16 {
        53
    }

    fn verify_extra(&mut self) -> Result<(), CheckError> {
        if self.record.is_empty() {
            return Err(CheckError::MissingField("record"));
        }
        if self.recordtype.is_empty() {
            self.recordtype = "A".to_string();
        }
        if RecordType::from_str(&self.recordtype.to_uppercase()).is_err() {
            return Err(CheckError::InvalidField(
                self.recordtype.clone(),
                "recordtype",
            ));
        }
        Ok(())
    }

    async fn attempt(&self, _ctx: &CheckContext<'_>, target: &str) -> Attempt {
        let addr = match format!("{target}:{}", self.service.port).parse() {
            Ok(addr) => addr,
            Err(e) => return Attempt::fail("bad target address", format!("{target}: {e}")),
        };

        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());

        let rtype = RecordType::from_str(&self.recordtype.to_uppercase())
            .unwrap_or(RecordType::A);

        match resolver.lookup(self.record.as_str(), rtype).await {
            Ok(lookup) => {
                let answers: Vec<String> = lookup.iter().map(|r| r.to_string()).collect();
                if self.answer.is_empty() || answers.iter().any(|a| a == &self.answer) {
                    Attempt::pass(format!("{} -> {}", self.record, answers.join(", ")))
                } else {
                    Attempt::fail(
                        "wrong answer",
                        format!(
                            "expected {} for {}, got {}",
                            self.answer,
                            self.record,
                            answers.join(", ")
                        ),
                    )
                }
            }
            Err(e) => Attempt::fail("dns query failed", e.to_string()),
        }
    }
}
