use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::TeamConfig;
use crate::types::{
    CheckOutcome, ManualAdjustment, Round, RoundSum, ServiceCheck, Sla, Team, UptimeRow,
};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id INT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    identifier TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    pw_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS rounds (
    id BIGINT PRIMARY KEY,
    start_time TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS service_checks (
    team_id INT NOT NULL,
    round_id BIGINT NOT NULL,
    service_name TEXT NOT NULL,
    points INT NOT NULL,
    result BOOLEAN NOT NULL,
    error TEXT NOT NULL DEFAULT '',
    debug TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (team_id, round_id, service_name)
);
CREATE TABLE IF NOT EXISTS slas (
    team_id INT NOT NULL,
    round_id BIGINT NOT NULL,
    service_name TEXT NOT NULL,
    penalty INT NOT NULL
);
CREATE TABLE IF NOT EXISTS manual_adjustments (
    id SERIAL PRIMARY KEY,
    team_id INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    amount INT NOT NULL,
    reason TEXT NOT NULL DEFAULT ''
);
"#;

#[derive(Clone)]
pub struct Db {
    conn: sqlx::Pool<sqlx::Postgres>,
}

impl Db {
    pub fn wrap(conn: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self { conn }
    }

    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.conn).await?;
        }
        Ok(())
    }

    // == teams ==

    /// Upsert the configured teams. Ids are assigned densely from 1 in file
    /// order; identifiers and active flags survive reloads since admins own
    /// them after boot.
    pub async fn sync_teams(&self, teams: &[TeamConfig]) -> Result<(), DbError> {
        for (index, team) in teams.iter().enumerate() {
            let id = index as i32 + 1;
            let identifier = crate::config::ConfigSettings::default_identifier(index + 1);
            let pw_hash = hash_password(&team.pw);
            sqlx::query(
                "INSERT INTO teams (id, name, identifier, active, pw_hash)
                 VALUES ($1, $2, $3, TRUE, $4)
                 ON CONFLICT (id) DO UPDATE SET name = $2, pw_hash = $4",
            )
            .bind(id)
            .bind(&team.name)
            .bind(&identifier)
            .bind(&pw_hash)
            .execute(&self.conn)
            .await?;
        }
        Ok(())
    }

    pub async fn teams(&self) -> Result<Vec<Team>, DbError> {
        Ok(sqlx::query_as::<_, Team>("SELECT * FROM teams ORDER BY id")
            .fetch_all(&self.conn)
            .await?)
    }

    pub async fn active_teams(&self) -> Result<Vec<Team>, DbError> {
        Ok(
            sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE active ORDER BY id")
                .fetch_all(&self.conn)
                .await?,
        )
    }

    pub async fn update_team(
        &self,
        id: i32,
        identifier: &str,
        active: bool,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE teams SET identifier = $1, active = $2 WHERE id = $3")
            .bind(identifier)
            .bind(active)
            .bind(id)
            .execute(&self.conn)
            .await?;
        Ok(())
    }

    // == rounds ==

    pub async fn last_round_id(&self) -> Result<i64, DbError> {
        let (id,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM rounds")
            .fetch_one(&self.conn)
            .await?;
        Ok(id)
    }

    pub async fn last_round(&self) -> Result<Option<Round>, DbError> {
        Ok(
            sqlx::query_as::<_, Round>("SELECT * FROM rounds ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.conn)
                .await?,
        )
    }

    /// Persist a round with its checks and SLA entries in one transaction.
    /// Check rows are deduplicated on (team, round, service): the first write
    /// wins, replays are no-ops.
    pub async fn commit_round(
        &self,
        round: &Round,
        checks: &[ServiceCheck],
        slas: &[Sla],
    ) -> Result<(), DbError> {
        let mut tx = self.conn.begin().await?;

        sqlx::query("INSERT INTO rounds (id, start_time) VALUES ($1, $2)")
            .bind(round.id)
            .bind(round.start_time)
            .execute(&mut *tx)
            .await?;

        for check in checks {
            sqlx::query(
                "INSERT INTO service_checks
                     (team_id, round_id, service_name, points, result, error, debug)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (team_id, round_id, service_name) DO NOTHING",
            )
            .bind(check.team_id)
            .bind(check.round_id)
            .bind(&check.service_name)
            .bind(check.points)
            .bind(check.result)
            .bind(&check.error)
            .bind(&check.debug)
            .execute(&mut *tx)
            .await?;
        }

        for sla in slas {
            sqlx::query(
                "INSERT INTO slas (team_id, round_id, service_name, penalty)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(sla.team_id)
            .bind(sla.round_id)
            .bind(&sla.service_name)
            .bind(sla.penalty)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(round = round.id, checks = checks.len(), slas = slas.len(), "round committed");
        Ok(())
    }

    pub async fn checks_for_round(&self, round_id: i64) -> Result<Vec<ServiceCheck>, DbError> {
        Ok(sqlx::query_as::<_, ServiceCheck>(
            "SELECT * FROM service_checks WHERE round_id = $1 ORDER BY team_id, service_name",
        )
        .bind(round_id)
        .fetch_all(&self.conn)
        .await?)
    }

    pub async fn checks_for_service(
        &self,
        team_id: i32,
        service_name: &str,
    ) -> Result<Vec<ServiceCheck>, DbError> {
        Ok(sqlx::query_as::<_, ServiceCheck>(
            "SELECT * FROM service_checks
             WHERE team_id = $1 AND service_name = $2 ORDER BY round_id DESC",
        )
        .bind(team_id)
        .bind(service_name)
        .fetch_all(&self.conn)
        .await?)
    }

    // == scoring ==

    /// All check outcomes ordered by round, the replay stream for SLA counter
    /// reconstruction after a restart or an abandoned round.
    pub async fn replay_outcomes(&self) -> Result<Vec<CheckOutcome>, DbError> {
        Ok(sqlx::query_as::<_, CheckOutcome>(
            "SELECT team_id, service_name, result FROM service_checks ORDER BY round_id",
        )
        .fetch_all(&self.conn)
        .await?)
    }

    /// Points earned per (round, team), successes only.
    pub async fn round_points(&self) -> Result<Vec<RoundSum>, DbError> {
        Ok(sqlx::query_as::<_, RoundSum>(
            "SELECT round_id, team_id,
                    SUM(CASE WHEN result THEN points ELSE 0 END)::BIGINT AS total
             FROM service_checks GROUP BY round_id, team_id",
        )
        .fetch_all(&self.conn)
        .await?)
    }

    /// Penalties per (round, team).
    pub async fn round_penalties(&self) -> Result<Vec<RoundSum>, DbError> {
        Ok(sqlx::query_as::<_, RoundSum>(
            "SELECT round_id, team_id, SUM(penalty)::BIGINT AS total
             FROM slas GROUP BY round_id, team_id",
        )
        .fetch_all(&self.conn)
        .await?)
    }

    pub async fn adjustments(&self) -> Result<Vec<ManualAdjustment>, DbError> {
        Ok(sqlx::query_as::<_, ManualAdjustment>(
            "SELECT * FROM manual_adjustments ORDER BY created_at",
        )
        .fetch_all(&self.conn)
        .await?)
    }

    pub async fn add_adjustment(
        &self,
        team_id: i32,
        amount: i32,
        reason: &str,
    ) -> Result<(), DbError> {
        sqlx::query("INSERT INTO manual_adjustments (team_id, amount, reason) VALUES ($1, $2, $3)")
            .bind(team_id)
            .bind(amount)
            .bind(reason)
            .execute(&self.conn)
            .await?;
        Ok(())
    }

    /// `(service points, sla count, sla total)` for one team's score export.
    pub async fn team_score(&self, team_id: i32) -> Result<(i64, i64, i64), DbError> {
        let (points,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(CASE WHEN result THEN points ELSE 0 END), 0)::BIGINT
             FROM service_checks WHERE team_id = $1",
        )
        .bind(team_id)
        .fetch_one(&self.conn)
        .await?;

        let (count, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*)::BIGINT, COALESCE(SUM(penalty), 0)::BIGINT
             FROM slas WHERE team_id = $1",
        )
        .bind(team_id)
        .fetch_one(&self.conn)
        .await?;

        Ok((points, count, total))
    }

    /// `{passed, total}` counters per (team, service) across all committed
    /// checks.
    pub async fn uptimes(&self) -> Result<Vec<UptimeRow>, DbError> {
        Ok(sqlx::query_as::<_, UptimeRow>(
            "SELECT team_id, service_name,
                    SUM(CASE WHEN result THEN 1 ELSE 0 END)::BIGINT AS passed,
                    COUNT(*)::BIGINT AS total
             FROM service_checks GROUP BY team_id, service_name",
        )
        .fetch_all(&self.conn)
        .await?)
    }

    /// Wipe scoring state only. Teams, config and credentials are untouched.
    pub async fn reset_scores(&self) -> Result<(), DbError> {
        sqlx::query("TRUNCATE service_checks, slas, rounds")
            .execute(&self.conn)
            .await?;
        Ok(())
    }
}

fn hash_password(pw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pw.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_stable_hex() {
        let h = hash_password("hunter2");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_password("hunter2"));
        assert_ne!(h, hash_password("hunter3"));
    }
}
