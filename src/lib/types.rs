use chrono::{DateTime, Utc};

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct Team {
    pub id: i32,
    pub name: String,
    /// short string substituted into box IP templates
    pub identifier: String,
    pub active: bool,
    pub pw_hash: String,
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone, PartialEq)]
pub struct Round {
    pub id: i64,
    pub start_time: DateTime<Utc>,
}

/// Exactly one per (team, service, round) once the round is committed.
#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone, PartialEq)]
pub struct ServiceCheck {
    pub team_id: i32,
    pub round_id: i64,
    pub service_name: String,
    pub points: i32,
    pub result: bool,
    /// short operator-visible failure string
    pub error: String,
    /// operator detail, shown to blue teams only when configured
    pub debug: String,
}

/// Emitted only on the round where a consecutive-failure streak reaches the
/// service's threshold.
#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone, PartialEq)]
pub struct Sla {
    pub team_id: i32,
    pub round_id: i64,
    pub service_name: String,
    pub penalty: i32,
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct ManualAdjustment {
    pub id: i32,
    pub team_id: i32,
    pub created_at: DateTime<Utc>,
    pub amount: i32,
    pub reason: String,
}

/// Passed/total check counters for one (team, service) pair. The ratio is
/// undefined while total is zero.
#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime {
    pub passed: i64,
    pub total: i64,
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct UptimeRow {
    pub team_id: i32,
    pub service_name: String,
    pub passed: i64,
    pub total: i64,
}

/// (round, team, summed value) aggregation row shared by the score queries.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct RoundSum {
    pub round_id: i64,
    pub team_id: i32,
    pub total: i64,
}

/// Minimal check projection used to replay SLA counters after a restart.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CheckOutcome {
    pub team_id: i32,
    pub service_name: String,
    pub result: bool,
}
