use chrono::{DateTime, Utc};
use color_eyre::Report;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, Task, TaskState};
use crate::checks::{CheckResult, Runner};
use crate::config::{ConfigHandle, ConfigSettings};
use crate::creds::CredentialStore;
use crate::db::Db;
use crate::scoring::{
    admit_result, reduce_round, replay_counters, score_series, ParamsByService, ServiceParams,
    SlaCounters,
};
use crate::types::{Round, Team, Uptime};

/// Results are awaited for the round delay minus this margin, leaving the
/// tail of the round for reduction and persistence.
const SAFETY_MARGIN_SECS: u64 = 5;
/// Status records outlive their round by this much before the store expires
/// them.
const STATUS_TTL_GRACE_SECS: u64 = 30;
/// Each result pop blocks at most this long so shutdown stays responsive.
const RESULT_POP_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_ATTEMPTS: u32 = 3;

/// Pause flag plus the wakeup channel behind it. Both transitions are
/// idempotent; pausing never interrupts a round already in flight.
pub struct PauseControl {
    tx: watch::Sender<bool>,
}

impl PauseControl {
    pub fn new(paused: bool) -> Self {
        let (tx, _) = watch::channel(paused);
        Self { tx }
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        self.tx.send_if_modified(|paused| {
            let changed = !*paused;
            *paused = true;
            changed
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|paused| {
            let changed = *paused;
            *paused = false;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Wall-clock gating for the event window.
#[derive(Debug, Clone, Copy, Default)]
struct Gate {
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RoundClock {
    current_round_start: Option<DateTime<Utc>>,
    next_round_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub last_round: Option<Round>,
    pub current_round_time: Option<DateTime<Utc>>,
    pub next_round_time: Option<DateTime<Utc>>,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct TeamScore {
    pub team_id: i32,
    pub team_name: String,
    pub service_points: i64,
    pub sla_violations: i64,
    pub total_points: i64,
}

/// The scoring engine: drives rounds from wall-clock time and engine control
/// state, owns the bus and repository handles, and exposes the synchronous
/// control surface used by the admin API.
pub struct ScoringEngine {
    config: ConfigHandle,
    db: Db,
    bus: Bus,
    creds: Arc<CredentialStore>,
    pause: PauseControl,
    shutdown: watch::Receiver<bool>,
    clock: Mutex<RoundClock>,
    gate: Mutex<Gate>,
    counters: Mutex<SlaCounters>,
    counters_stale: AtomicBool,
}

impl ScoringEngine {
    pub fn new(
        config: ConfigHandle,
        db: Db,
        bus: Bus,
        creds: Arc<CredentialStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let snapshot = config.snapshot();
        Self {
            pause: PauseControl::new(snapshot.misc_settings.start_paused),
            gate: Mutex::new(Gate {
                start: snapshot.misc_settings.start_time,
                stop: snapshot.misc_settings.stop_time,
            }),
            config,
            db,
            bus,
            creds,
            shutdown,
            clock: Mutex::new(RoundClock::default()),
            counters: Mutex::new(SlaCounters::default()),
            counters_stale: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn creds(&self) -> &CredentialStore {
        &self.creds
    }

    // == control surface ==

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn pause_engine(&self) {
        self.pause.pause();
        info!("engine paused");
    }

    pub fn resume_engine(&self) {
        self.pause.resume();
        info!("engine resumed");
    }

    pub fn set_start_time(&self, start: Option<DateTime<Utc>>) {
        self.gate.lock().start = start;
        info!(?start, "start time updated");
    }

    pub fn set_stop_time(&self, stop: Option<DateTime<Utc>>) {
        self.gate.lock().stop = stop;
        info!(?stop, "stop time updated");
    }

    /// Truncate all scoring state. Status keys on the bus are left to their
    /// TTLs. Teams, config and credentials stay as they are.
    pub async fn reset_scores(&self) -> Result<(), Report> {
        self.db.reset_scores().await?;
        *self.counters.lock() = SlaCounters::default();
        self.counters_stale.store(false, Ordering::SeqCst);
        info!("scores reset");
        Ok(())
    }

    pub async fn status(&self) -> Result<EngineStatus, Report> {
        let clock = *self.clock.lock();
        Ok(EngineStatus {
            last_round: self.db.last_round().await?,
            current_round_time: clock.current_round_start,
            next_round_time: clock.next_round_start,
            running: !self.is_paused(),
        })
    }

    pub async fn active_tasks(
        &self,
    ) -> Result<HashMap<String, Vec<crate::bus::TaskStatusRecord>>, Report> {
        Ok(self.bus.active_tasks().await?)
    }

    pub async fn uptime_per_service(
        &self,
    ) -> Result<HashMap<i32, HashMap<String, Uptime>>, Report> {
        let mut out: HashMap<i32, HashMap<String, Uptime>> = HashMap::new();
        for row in self.db.uptimes().await? {
            out.entry(row.team_id).or_default().insert(
                row.service_name,
                Uptime {
                    passed: row.passed,
                    total: row.total,
                },
            );
        }
        Ok(out)
    }

    pub async fn team_scores(&self) -> Result<Vec<TeamScore>, Report> {
        let adjustments: HashMap<i32, i64> = self
            .db
            .adjustments()
            .await?
            .into_iter()
            .fold(HashMap::new(), |mut acc, adj| {
                *acc.entry(adj.team_id).or_default() += adj.amount as i64;
                acc
            });

        let mut scores = Vec::new();
        for team in self.db.teams().await? {
            let (points, sla_count, sla_total) = self.db.team_score(team.id).await?;
            let adjustment = adjustments.get(&team.id).copied().unwrap_or(0);
            scores.push(TeamScore {
                team_id: team.id,
                team_name: team.name,
                service_points: points,
                sla_violations: sla_count,
                total_points: points - sla_total + adjustment,
            });
        }
        Ok(scores)
    }

    /// Per-round cumulative score series for graphs.
    pub async fn score_series(&self) -> Result<Vec<HashMap<i32, i64>>, Report> {
        let last_round = self.db.last_round_id().await?;
        let points = self.db.round_points().await?;
        let penalties = self.db.round_penalties().await?;
        let adjustments: HashMap<i32, i64> = self
            .db
            .adjustments()
            .await?
            .into_iter()
            .fold(HashMap::new(), |mut acc, adj| {
                *acc.entry(adj.team_id).or_default() += adj.amount as i64;
                acc
            });
        Ok(score_series(last_round, &points, &penalties, &adjustments))
    }

    // == the round loop ==

    pub async fn run(self: Arc<Self>) -> Result<(), Report> {
        let mut shutdown = self.shutdown.clone();
        info!("scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.wait_while_paused(&mut shutdown).await;
            if *shutdown.borrow() {
                break;
            }

            let config = self.config.snapshot();
            let now = Utc::now();
            let gate = *self.gate.lock();

            if let Some(start) = gate.start {
                if now < start {
                    let wait = (start - now).to_std().unwrap_or(Duration::ZERO);
                    info!(?start, "waiting for event start");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }
            if let Some(stop) = gate.stop {
                if now >= stop {
                    debug!("stop time reached, engine idle");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }

            let round_start = Utc::now();
            let delay = config.misc_settings.delay;
            let offset = sample_jitter(config.misc_settings.jitter);
            let next_start = next_round_start(round_start, delay, offset);
            {
                let mut clock = self.clock.lock();
                clock.current_round_start = Some(round_start);
                clock.next_round_start = Some(next_start);
            }

            if let Err(e) = self.run_round(&config, round_start).await {
                error!(error = ?e, "round abandoned");
                // re-derive counter state from persisted checks next round
                self.counters_stale.store(true, Ordering::SeqCst);
            }

            let now = Utc::now();
            if next_start > now {
                let wait = (next_start - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    async fn wait_while_paused(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut paused = self.pause.subscribe();
        loop {
            if *shutdown.borrow() || !*paused.borrow_and_update() {
                return;
            }
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_round(
        &self,
        config: &ConfigSettings,
        round_start: DateTime<Utc>,
    ) -> Result<(), Report> {
        let round_id = self.db.last_round_id().await? + 1;
        let teams = self.db.active_teams().await?;
        let runners: Vec<Runner> = config
            .runtime_runners()?
            .into_iter()
            .filter(Runner::runnable)
            .collect();
        let params = params_for(&runners);
        let defaults = default_params(config);

        if self.counters_stale.swap(false, Ordering::SeqCst) {
            let outcomes = self.db.replay_outcomes().await?;
            *self.counters.lock() =
                replay_counters(&outcomes, &params, config.misc_settings.sla_threshold);
            info!("sla counters re-derived from persisted checks");
        }

        let delay = config.misc_settings.delay;
        let deadline = round_start + chrono::Duration::seconds(delay as i64);
        let tasks = build_tasks(round_id, &teams, &runners, deadline)?;
        info!(round = round_id, tasks = tasks.len(), "round started");

        let ttl = Duration::from_secs(delay + STATUS_TTL_GRACE_SECS);
        if let Err(e) = self.bus.push_tasks(&tasks, ttl).await {
            // the deadline path below turns the lost tasks into failed checks
            warn!(error = %e, "task enqueue degraded");
        }

        let window = Duration::from_secs(delay.saturating_sub(SAFETY_MARGIN_SECS).max(1));
        let results = self.collect_results(round_id, &tasks, window).await;

        for task in &tasks {
            if !results.contains_key(&task.id) {
                if let Err(e) = self
                    .bus
                    .set_task_state(&task.id, None, TaskState::Expired)
                    .await
                {
                    debug!(task = %task.id, error = %e, "could not expire task status");
                }
            }
        }

        let mut counters = self.counters.lock().clone();
        let reduction = reduce_round(round_id, &tasks, &results, &mut counters, &params, defaults);

        let round = Round {
            id: round_id,
            start_time: round_start,
        };
        self.db
            .commit_round(&round, &reduction.checks, &reduction.slas)
            .await?;
        // the new counter state exists only once the round it reflects does
        *self.counters.lock() = counters;

        if let Err(e) = self
            .bus
            .publish_event(&format!("round_complete:{round_id}"))
            .await
        {
            warn!(error = %e, "round event not published");
        }

        info!(
            round = round_id,
            checks = reduction.checks.len(),
            slas = reduction.slas.len(),
            "round committed"
        );
        Ok(())
    }

    /// Pop results until every task answered or the window closes. Pops block
    /// briefly so shutdown is observed between iterations.
    async fn collect_results(
        &self,
        round_id: i64,
        tasks: &[Task],
        window: Duration,
    ) -> HashMap<Uuid, CheckResult> {
        let issued: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        let mut results: HashMap<Uuid, CheckResult> = HashMap::new();
        let window_end = tokio::time::Instant::now() + window;
        let mut shutdown = self.shutdown.clone();

        while results.len() < tasks.len() {
            if *shutdown.borrow() {
                break;
            }

            let popped = tokio::select! {
                _ = tokio::time::sleep_until(window_end) => break,
                _ = shutdown.changed() => break,
                popped = self.bus.pop_result(RESULT_POP_TIMEOUT) => popped,
            };

            match popped {
                Ok(Some(result)) => {
                    let task_id = result.task_id;
                    if admit_result(&mut results, round_id, &issued, result) {
                        if let Err(e) = self
                            .bus
                            .set_task_state(&task_id, None, TaskState::Completed)
                            .await
                        {
                            debug!(task = %task_id, error = %e, "status update failed");
                        }
                    } else {
                        debug!(task = %task_id, "dropped stray or duplicate result");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "result pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        results
    }
}

/// Uniform signed jitter in [-jitter, +jitter] seconds.
pub fn sample_jitter(jitter: u64) -> i64 {
    if jitter == 0 {
        return 0;
    }
    let jitter = jitter as i64;
    rand::thread_rng().gen_range(-jitter..=jitter)
}

pub fn next_round_start(previous: DateTime<Utc>, delay: u64, jitter_offset: i64) -> DateTime<Utc> {
    previous + chrono::Duration::seconds(delay as i64 + jitter_offset)
}

/// One task per active team per runnable probe, each with a fresh id and the
/// probe's configuration serialized along so workers stay stateless.
pub fn build_tasks(
    round_id: i64,
    teams: &[Team],
    runners: &[Runner],
    deadline: DateTime<Utc>,
) -> Result<Vec<Task>, Report> {
    let mut tasks = Vec::with_capacity(teams.len() * runners.len());
    for team in teams {
        for runner in runners {
            tasks.push(Task {
                id: Uuid::new_v4(),
                team_id: team.id,
                team_identifier: team.identifier.clone(),
                service_type: runner.service_type().to_string(),
                service_name: runner.name().to_string(),
                round_id,
                attempts: DEFAULT_ATTEMPTS,
                deadline,
                check_data: runner.check_data()?,
                enqueued_at: Utc::now(),
            });
        }
    }
    Ok(tasks)
}

pub fn params_for(runners: &[Runner]) -> ParamsByService {
    runners
        .iter()
        .map(|runner| {
            let service = runner.service();
            (
                service.name.clone(),
                ServiceParams {
                    points: service.points,
                    sla_threshold: service.sla_threshold,
                    sla_penalty: service.sla_penalty,
                },
            )
        })
        .collect()
}

fn default_params(config: &ConfigSettings) -> ServiceParams {
    ServiceParams {
        points: config.misc_settings.points,
        sla_threshold: config.misc_settings.sla_threshold,
        sla_penalty: config.misc_settings.sla_penalty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{Service, ServiceDefaults, Tcp};

    fn team(id: i32) -> Team {
        Team {
            id,
            name: format!("Team{id:02}"),
            identifier: format!("{id:02}"),
            active: true,
            pw_hash: String::new(),
        }
    }

    fn tcp_runner(box_name: &str, port: u16) -> Runner {
        let mut runner = Runner::Tcp(Tcp {
            service: Service {
                port,
                ..Service::default()
            },
        });
        runner
            .verify(
                box_name,
                "10.0._.1",
                &ServiceDefaults {
                    points: 1,
                    timeout: 5,
                    sla_threshold: 5,
                    sla_penalty: 5,
                },
            )
            .unwrap();
        runner
    }

    #[test]
    fn pause_resume_round_trip() {
        let pause = PauseControl::new(false);
        assert!(!pause.is_paused());

        pause.pause();
        assert!(pause.is_paused());

        // Pause -> Resume -> Pause equals the initial Pause
        pause.resume();
        pause.pause();
        assert!(pause.is_paused());

        // both transitions are idempotent
        pause.pause();
        assert!(pause.is_paused());
        pause.resume();
        pause.resume();
        assert!(!pause.is_paused());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..1000 {
            let offset = sample_jitter(5);
            assert!((-5..=5).contains(&offset), "offset {offset} out of range");
        }
        assert_eq!(sample_jitter(0), 0);
    }

    #[test]
    fn next_tick_is_previous_plus_delay_plus_jitter() {
        let prev = Utc::now();
        assert_eq!(
            next_round_start(prev, 60, -5),
            prev + chrono::Duration::seconds(55)
        );
        assert_eq!(
            next_round_start(prev, 60, 5),
            prev + chrono::Duration::seconds(65)
        );
    }

    #[test]
    fn one_task_per_team_per_runnable_probe() {
        let teams = vec![team(1), team(2), team(3)];
        let runners = vec![tcp_runner("web01", 80), tcp_runner("db01", 5432)];
        let deadline = Utc::now();

        let tasks = build_tasks(7, &teams, &runners, deadline).unwrap();

        assert_eq!(tasks.len(), 6);
        // one task per (team, service), all with fresh unique ids
        let ids: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), tasks.len());
        let pairs: HashSet<(i32, &str)> = tasks
            .iter()
            .map(|t| (t.team_id, t.service_name.as_str()))
            .collect();
        assert_eq!(pairs.len(), tasks.len());
        assert!(tasks.iter().all(|t| t.round_id == 7 && t.attempts == 3));
    }

    #[test]
    fn task_check_data_round_trips_through_the_registry() {
        let teams = vec![team(1)];
        let runners = vec![tcp_runner("web01", 8080)];
        let tasks = build_tasks(1, &teams, &runners, Utc::now()).unwrap();

        let rebuilt =
            Runner::from_parts(&tasks[0].service_type, tasks[0].check_data.clone()).unwrap();
        assert_eq!(rebuilt.name(), "web01-tcp");
        assert_eq!(rebuilt.service().port, 8080);
    }

    #[test]
    fn params_follow_verified_services() {
        let runners = vec![tcp_runner("web01", 80)];
        let params = params_for(&runners);
        let p = params.get("web01-tcp").unwrap();
        assert_eq!(p.points, 1);
        assert_eq!(p.sla_threshold, 5);
        assert_eq!(p.sla_penalty, 5);
    }
}
