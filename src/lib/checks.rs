use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::creds::{CredentialStore, CredsError};

// implementations
mod custom;
mod dns;
mod ftp;
mod imap;
mod ldap;
mod ping;
mod rdp;
mod smtp;
mod sql;
mod ssh;
mod tcp;
mod web;
mod winrm;

pub use custom::Custom;
pub use dns::Dns;
pub use ftp::Ftp;
pub use imap::Imap;
pub use ldap::Ldap;
pub use ping::Ping;
pub use rdp::Rdp;
pub use smtp::Smtp;
pub use sql::Sql;
pub use ssh::Ssh;
pub use tcp::Tcp;
pub use web::Web;
pub use winrm::WinRm;

/// Canonical error text for a probe that outlives its own timeout.
pub const TIMEOUT_ERROR: &str = "check timeout exceeded";

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{0} is not a valid value for {1}")]
    InvalidField(String, &'static str),
    #[error("unknown check type {0}")]
    UnknownType(String),
    #[error("bad check data: {0}")]
    BadData(#[from] serde_json::Error),
}

/// Event-wide fallbacks applied by `verify` wherever a probe leaves a knob
/// at zero.
#[derive(Debug, Clone, Copy)]
pub struct ServiceDefaults {
    pub points: i32,
    pub timeout: u64,
    pub sla_threshold: u32,
    pub sla_penalty: i32,
}

/// Shared probe configuration, embedded in every variant.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Service {
    /// stable service name, "{box}-{display}" unless configured
    pub name: String,
    pub display: String,
    /// ip template of the owning box, `_` replaced per team
    pub ip: String,
    pub port: u16,
    pub points: i32,
    /// probe timeout in seconds
    pub timeout: u64,
    pub sla_threshold: u32,
    pub sla_penalty: i32,
    /// names of the credlists this probe may authenticate with
    pub credlists: Vec<String>,
    pub disabled: bool,
}

impl Service {
    fn configure(&mut self, ip: &str, defaults: &ServiceDefaults) {
        self.ip = ip.to_string();
        if self.points == 0 {
            self.points = defaults.points;
        }
        if self.timeout == 0 {
            self.timeout = defaults.timeout;
        }
        if self.sla_threshold == 0 {
            self.sla_threshold = defaults.sla_threshold;
        }
        if self.sla_penalty == 0 {
            self.sla_penalty = defaults.sla_penalty;
        }
    }

    /// Per-team target address: every `_` in the box IP template becomes the
    /// team identifier.
    pub fn target_for(&self, identifier: &str) -> String {
        self.ip.replace('_', identifier)
    }
}

/// Everything a probe execution knows about the task it serves.
pub struct CheckContext<'a> {
    pub team_id: i32,
    pub team_identifier: &'a str,
    pub round_id: i64,
    pub task_id: Uuid,
    pub creds: Option<&'a CredentialStore>,
}

impl CheckContext<'_> {
    /// Random credentials for this team from one of the probe's credlists,
    /// taken under the team's credential mutex.
    pub async fn creds(&self, lists: &[String]) -> Result<(String, String), CredsError> {
        match self.creds {
            Some(store) => store.get_creds(self.team_id, lists).await,
            None => Err(CredsError::NoStore),
        }
    }
}

/// Verdict of a single probe body, before timeout accounting.
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    pub status: bool,
    pub error: String,
    pub debug: String,
}

impl Attempt {
    pub fn pass(debug: impl Into<String>) -> Self {
        Self {
            status: true,
            error: String::new(),
            debug: debug.into(),
        }
    }

    pub fn fail(error: impl Into<String>, debug: impl Into<String>) -> Self {
        Self {
            status: false,
            error: error.into(),
            debug: debug.into(),
        }
    }
}

/// Outcome of one task, as published on the results queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub task_id: Uuid,
    pub team_id: i32,
    #[serde(rename = "name")]
    pub service_name: String,
    pub service_type: String,
    pub round_id: i64,
    pub status: bool,
    pub points: i32,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub debug: String,
}

/// One service-health probe definition.
#[async_trait]
pub trait Probe {
    fn service(&self) -> &Service;
    fn service_mut(&mut self) -> &mut Service;
    fn type_name(&self) -> &'static str;
    fn default_display(&self) -> &'static str;
    fn default_port(&self) -> u16 {
        0
    }

    /// Variant-specific validation, after defaults are filled in.
    fn verify_extra(&mut self) -> Result<(), CheckError> {
        Ok(())
    }

    /// The probe body. The timeout race happens outside.
    async fn attempt(&self, ctx: &CheckContext<'_>, target: &str) -> Attempt;
}

/// Fill defaults and validate one probe against its box.
fn verify_probe<P: Probe + ?Sized>(
    probe: &mut P,
    box_name: &str,
    ip: &str,
    defaults: &ServiceDefaults,
) -> Result<(), CheckError> {
    probe.service_mut().configure(ip, defaults);
    if probe.service().display.is_empty() {
        probe.service_mut().display = probe.default_display().to_string();
    }
    if probe.service().name.is_empty() {
        probe.service_mut().name = format!("{box_name}-{}", probe.service().display);
    }
    if probe.service().port == 0 {
        probe.service_mut().port = probe.default_port();
    }
    probe.verify_extra()
}

/// Race a probe body against its timeout.
pub(crate) async fn race_timeout(
    timeout_secs: u64,
    body: impl Future<Output = Attempt>,
) -> Attempt {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), body).await {
        Ok(attempt) => attempt,
        Err(_) => Attempt::fail(TIMEOUT_ERROR, format!("no verdict within {timeout_secs}s")),
    }
}

/// Plain TCP dial, the verdict shared by every port-liveness probe.
pub(crate) async fn dial(target: &str, port: u16) -> Attempt {
    match TcpStream::connect((target, port)).await {
        Ok(_) => Attempt::pass("responded to request"),
        Err(e) => Attempt::fail("connection error", e.to_string()),
    }
}

/// Connect and read the first line the server says.
pub(crate) async fn read_banner(target: &str, port: u16) -> std::io::Result<String> {
    let stream = TcpStream::connect((target, port)).await?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim_end().to_string())
}

macro_rules! each_probe {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            Runner::Ping($p) => $body,
            Runner::Tcp($p) => $body,
            Runner::Ssh($p) => $body,
            Runner::Web($p) => $body,
            Runner::Dns($p) => $body,
            Runner::Smtp($p) => $body,
            Runner::Imap($p) => $body,
            Runner::Ftp($p) => $body,
            Runner::Rdp($p) => $body,
            Runner::Ldap($p) => $body,
            Runner::Sql($p) => $body,
            Runner::WinRm($p) => $body,
            Runner::Custom($p) => $body,
        }
    };
}

/// Tagged union over every probe variant. The engine serializes a variant's
/// configuration into a task's opaque `check_data`; workers rebuild it with
/// [`Runner::from_parts`].
#[derive(Debug, Clone)]
pub enum Runner {
    Ping(Ping),
    Tcp(Tcp),
    Ssh(Ssh),
    Web(Web),
    Dns(Dns),
    Smtp(Smtp),
    Imap(Imap),
    Ftp(Ftp),
    Rdp(Rdp),
    Ldap(Ldap),
    Sql(Sql),
    WinRm(WinRm),
    Custom(Custom),
}

impl Runner {
    pub fn service(&self) -> &Service {
        each_probe!(self, p => p.service())
    }

    pub fn service_type(&self) -> &'static str {
        each_probe!(self, p => p.type_name())
    }

    pub fn name(&self) -> &str {
        &self.service().name
    }

    pub fn runnable(&self) -> bool {
        !self.service().disabled
    }

    pub fn verify(
        &mut self,
        box_name: &str,
        ip: &str,
        defaults: &ServiceDefaults,
    ) -> Result<(), CheckError> {
        each_probe!(self, p => verify_probe(p, box_name, ip, defaults))
    }

    /// Opaque serialized configuration for the wire.
    pub fn check_data(&self) -> Result<Value, serde_json::Error> {
        each_probe!(self, p => serde_json::to_value(p))
    }

    /// Rebuild a probe from its type tag and serialized configuration.
    /// Unknown types are a hard error so bad configs die at load, not at run.
    pub fn from_parts(service_type: &str, check_data: Value) -> Result<Self, CheckError> {
        Ok(match service_type {
            "Ping" => Runner::Ping(serde_json::from_value(check_data)?),
            "Tcp" => Runner::Tcp(serde_json::from_value(check_data)?),
            "Ssh" => Runner::Ssh(serde_json::from_value(check_data)?),
            "Web" => Runner::Web(serde_json::from_value(check_data)?),
            "Dns" => Runner::Dns(serde_json::from_value(check_data)?),
            "Smtp" => Runner::Smtp(serde_json::from_value(check_data)?),
            "Imap" => Runner::Imap(serde_json::from_value(check_data)?),
            "Ftp" => Runner::Ftp(serde_json::from_value(check_data)?),
            "Rdp" => Runner::Rdp(serde_json::from_value(check_data)?),
            "Ldap" => Runner::Ldap(serde_json::from_value(check_data)?),
            "Sql" => Runner::Sql(serde_json::from_value(check_data)?),
            "WinRm" => Runner::WinRm(serde_json::from_value(check_data)?),
            "Custom" => Runner::Custom(serde_json::from_value(check_data)?),
            other => return Err(CheckError::UnknownType(other.to_string())),
        })
    }

    /// Execute the probe for one task and send exactly one result.
    pub async fn run(&self, ctx: &CheckContext<'_>, tx: &flume::Sender<CheckResult>) {
        let svc = self.service();
        let target = svc.target_for(ctx.team_identifier);

        let verdict =
            race_timeout(svc.timeout, each_probe!(self, p => p.attempt(ctx, &target))).await;

        let result = CheckResult {
            task_id: ctx.task_id,
            team_id: ctx.team_id,
            service_name: svc.name.clone(),
            service_type: self.service_type().to_string(),
            round_id: ctx.round_id,
            status: verdict.status,
            points: if verdict.status { svc.points } else { 0 },
            error: verdict.error,
            debug: verdict.debug,
        };

        if tx.send_async(result).await.is_err() {
            debug!(task = %ctx.task_id, "result receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const DEFAULTS: ServiceDefaults = ServiceDefaults {
        points: 5,
        timeout: 2,
        sla_threshold: 4,
        sla_penalty: 3,
    };

    fn ctx(task_id: Uuid) -> CheckContext<'static> {
        CheckContext {
            team_id: 1,
            team_identifier: "01",
            round_id: 1,
            task_id,
            creds: None,
        }
    }

    async fn run_once(runner: &Runner) -> CheckResult {
        let (tx, rx) = flume::bounded(1);
        runner.run(&ctx(Uuid::new_v4()), &tx).await;
        rx.recv_async().await.unwrap()
    }

    /// Accept one connection and greet it with `banner`.
    async fn banner_listener(banner: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(banner.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let verdict = race_timeout(1, async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Attempt::pass("too late")
        })
        .await;
        assert!(!verdict.status);
        assert_eq!(verdict.error, TIMEOUT_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_probe_beats_the_clock() {
        let verdict = race_timeout(5, async { Attempt::pass("done") }).await;
        assert!(verdict.status);
        assert!(verdict.error.is_empty());
    }

    #[test]
    fn ping_verify_defaults() {
        let mut ping = Ping::default();
        let mut runner = Runner::Ping(ping.clone());
        runner.verify("box", "1.1.1.1", &DEFAULTS).unwrap();
        assert_eq!(runner.service_type(), "Ping");
        assert_eq!(runner.service().display, "ping");
        assert_eq!(runner.service().name, "box-ping");
        assert_eq!(runner.service().points, 5);
        assert_eq!(runner.service().timeout, 2);

        ping.count = 0;
        let mut runner = Runner::Ping(ping);
        runner.verify("box", "1.1.1.1", &DEFAULTS).unwrap();
        match runner {
            Runner::Ping(p) => assert_eq!(p.count, 1),
            _ => unreachable!(),
        }
    }

    #[test]
    fn tcp_verify_requires_port() {
        let mut runner = Runner::Tcp(Tcp::default());
        let err = runner.verify("box", "1.1.1.1", &DEFAULTS).unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn default_ports() {
        let cases: Vec<(Runner, u16)> = vec![
            (Runner::Ssh(Ssh::default()), 22),
            (Runner::Smtp(Smtp::default()), 25),
            (Runner::Imap(Imap::default()), 143),
            (Runner::Ftp(Ftp::default()), 21),
            (Runner::Rdp(Rdp::default()), 3389),
            (Runner::Ldap(Ldap::default()), 389),
            (Runner::WinRm(WinRm::default()), 5985),
        ];
        for (mut runner, port) in cases {
            runner.verify("box", "1.1.1.1", &DEFAULTS).unwrap();
            assert_eq!(runner.service().port, port, "{}", runner.service_type());
        }
    }

    #[test]
    fn registry_round_trip() {
        let mut runner = Runner::Tcp(Tcp {
            service: Service {
                port: 8080,
                ..Service::default()
            },
        });
        runner.verify("box", "10.0._.1", &DEFAULTS).unwrap();

        let data = runner.check_data().unwrap();
        let rebuilt = Runner::from_parts(runner.service_type(), data.clone()).unwrap();
        assert_eq!(rebuilt.name(), "box-tcp");
        assert_eq!(rebuilt.service().port, 8080);
        // recognized fields survive a serialize/deserialize round trip
        assert_eq!(rebuilt.check_data().unwrap(), data);
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let err = Runner::from_parts("Gopher", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, CheckError::UnknownType(_)));
    }

    #[test]
    fn target_substitutes_identifier() {
        let svc = Service {
            ip: "10.100.1_.2".into(),
            ..Service::default()
        };
        assert_eq!(svc.target_for("01"), "10.100.101.2");
        assert_eq!(svc.target_for("12"), "10.100.112.2");
    }

    #[tokio::test]
    async fn tcp_check_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut runner = Runner::Tcp(Tcp {
            service: Service {
                port,
                ..Service::default()
            },
        });
        runner.verify("box", "127.0.0.1", &DEFAULTS).unwrap();

        let result = run_once(&runner).await;
        assert!(result.status, "{}: {}", result.error, result.debug);
        assert_eq!(result.points, 5);
        assert_eq!(result.service_name, "box-tcp");
    }

    #[tokio::test]
    async fn tcp_check_connection_refused() {
        let mut runner = Runner::Tcp(Tcp {
            service: Service {
                // bind-then-drop leaves the port closed
                port: {
                    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                    l.local_addr().unwrap().port()
                },
                ..Service::default()
            },
        });
        runner.verify("box", "127.0.0.1", &DEFAULTS).unwrap();

        let result = run_once(&runner).await;
        assert!(!result.status);
        assert_eq!(result.points, 0);
        assert_eq!(result.error, "connection error");
    }

    #[tokio::test]
    async fn ssh_check_wants_ssh_banner() {
        let port = banner_listener("SSH-2.0-Mock\r\n").await;
        let mut runner = Runner::Ssh(Ssh {
            service: Service {
                port,
                ..Service::default()
            },
        });
        runner.verify("box", "127.0.0.1", &DEFAULTS).unwrap();

        let result = run_once(&runner).await;
        assert!(result.status, "{}: {}", result.error, result.debug);
    }

    #[tokio::test]
    async fn smtp_check_rejects_wrong_banner() {
        let port = banner_listener("500 not an smtp server\r\n").await;
        let mut runner = Runner::Smtp(Smtp {
            service: Service {
                port,
                ..Service::default()
            },
            ..Smtp::default()
        });
        runner.verify("box", "127.0.0.1", &DEFAULTS).unwrap();

        let result = run_once(&runner).await;
        assert!(!result.status);
    }

    #[test]
    fn result_wire_format_uses_snake_case_tags() {
        let result = CheckResult {
            task_id: Uuid::nil(),
            team_id: 2,
            service_name: "web01-web".into(),
            service_type: "Web".into(),
            round_id: 7,
            status: true,
            points: 5,
            error: String::new(),
            debug: String::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["team_id"], 2);
        assert_eq!(json["name"], "web01-web");
        assert_eq!(json["round_id"], 7);
        assert_eq!(json["status"], true);
        assert_eq!(json["points"], 5);
    }
}
