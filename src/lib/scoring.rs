use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::bus::Task;
use crate::checks::CheckResult;
use crate::types::{CheckOutcome, RoundSum, ServiceCheck, Sla};

/// Canonical error text for a task that produced no result inside the
/// collection window.
pub const DEADLINE_ERROR: &str = "deadline exceeded";

/// Scoring knobs of one service, looked up by service name during reduction.
#[derive(Debug, Clone, Copy)]
pub struct ServiceParams {
    pub points: i32,
    pub sla_threshold: u32,
    pub sla_penalty: i32,
}

pub type ParamsByService = HashMap<String, ServiceParams>;

/// Consecutive-failure counters per (team, service). The state flows strictly
/// forward across rounds and can always be reconstructed from persisted
/// checks with [`replay_counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaCounters {
    counts: HashMap<(i32, String), u32>,
}

impl SlaCounters {
    pub fn get(&self, team_id: i32, service_name: &str) -> u32 {
        self.counts
            .get(&(team_id, service_name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Advance one counter. Success resets it; failure increments it modulo
    /// the threshold, so another full streak is needed before the next
    /// penalty. Returns whether a penalty fires on this round.
    fn bump(&mut self, team_id: i32, service_name: &str, passed: bool, threshold: u32) -> bool {
        let key = (team_id, service_name.to_string());
        if passed {
            self.counts.insert(key, 0);
            return false;
        }
        let streak = self.counts.get(&key).copied().unwrap_or(0) + 1;
        let fires = threshold > 0 && streak == threshold;
        self.counts
            .insert(key, if threshold > 0 { streak % threshold } else { streak });
        fires
    }
}

pub struct RoundReduction {
    pub checks: Vec<ServiceCheck>,
    pub slas: Vec<Sla>,
}

/// Admit one popped result into the round's result set. Rejects results for
/// other rounds, results for tasks this round never issued, and duplicates
/// (the first result per task id wins). Returns whether it was admitted.
pub fn admit_result(
    results: &mut HashMap<Uuid, CheckResult>,
    round_id: i64,
    issued: &HashSet<Uuid>,
    result: CheckResult,
) -> bool {
    if result.round_id != round_id || !issued.contains(&result.task_id) {
        return false;
    }
    if results.contains_key(&result.task_id) {
        return false;
    }
    results.insert(result.task_id, result);
    true
}

/// Reduce one round: every task becomes exactly one check, resultless tasks
/// become failed checks with the deadline error, and SLA entries are emitted
/// where a failure streak has just reached its service's threshold.
pub fn reduce_round(
    round_id: i64,
    tasks: &[Task],
    results: &HashMap<Uuid, CheckResult>,
    counters: &mut SlaCounters,
    params: &ParamsByService,
    defaults: ServiceParams,
) -> RoundReduction {
    let mut checks = Vec::with_capacity(tasks.len());
    let mut slas = Vec::new();

    for task in tasks {
        let p = params
            .get(&task.service_name)
            .copied()
            .unwrap_or(defaults);

        let check = match results.get(&task.id) {
            Some(result) => ServiceCheck {
                team_id: task.team_id,
                round_id,
                service_name: task.service_name.clone(),
                points: if result.status { p.points } else { 0 },
                result: result.status,
                error: result.error.clone(),
                debug: result.debug.clone(),
            },
            None => ServiceCheck {
                team_id: task.team_id,
                round_id,
                service_name: task.service_name.clone(),
                points: 0,
                result: false,
                error: DEADLINE_ERROR.to_string(),
                debug: "no result before the collection window closed".to_string(),
            },
        };

        if counters.bump(task.team_id, &task.service_name, check.result, p.sla_threshold) {
            slas.push(Sla {
                team_id: task.team_id,
                round_id,
                service_name: task.service_name.clone(),
                penalty: p.sla_penalty,
            });
        }

        checks.push(check);
    }

    RoundReduction { checks, slas }
}

/// Rebuild the counters by replaying every persisted check in round order.
/// Equivalent to having run [`reduce_round`] live for each of them.
pub fn replay_counters(
    outcomes: &[CheckOutcome],
    params: &ParamsByService,
    default_threshold: u32,
) -> SlaCounters {
    let mut counters = SlaCounters::default();
    for outcome in outcomes {
        let threshold = params
            .get(&outcome.service_name)
            .map(|p| p.sla_threshold)
            .unwrap_or(default_threshold);
        counters.bump(outcome.team_id, &outcome.service_name, outcome.result, threshold);
    }
    counters
}

/// Cumulative per-round score series: one map `{team -> score}` per round,
/// folding earned points minus penalties forward, with manual adjustments as
/// a per-team constant offset.
pub fn score_series(
    last_round: i64,
    points: &[RoundSum],
    penalties: &[RoundSum],
    adjustments: &HashMap<i32, i64>,
) -> Vec<HashMap<i32, i64>> {
    if last_round <= 0 {
        return Vec::new();
    }

    let mut points_at: HashMap<(i64, i32), i64> = HashMap::new();
    for row in points {
        points_at.insert((row.round_id, row.team_id), row.total);
    }
    let mut penalties_at: HashMap<(i64, i32), i64> = HashMap::new();
    for row in penalties {
        penalties_at.insert((row.round_id, row.team_id), row.total);
    }

    let teams: HashSet<i32> = points
        .iter()
        .map(|r| r.team_id)
        .chain(penalties.iter().map(|r| r.team_id))
        .chain(adjustments.keys().copied())
        .collect();

    let mut running: HashMap<i32, i64> = teams
        .iter()
        .map(|&t| (t, adjustments.get(&t).copied().unwrap_or(0)))
        .collect();

    let mut series = Vec::with_capacity(last_round as usize);
    for round in 1..=last_round {
        for &team in &teams {
            let delta = points_at.get(&(round, team)).copied().unwrap_or(0)
                - penalties_at.get(&(round, team)).copied().unwrap_or(0);
            *running.entry(team).or_default() += delta;
        }
        series.push(running.clone());
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const DEFAULTS: ServiceParams = ServiceParams {
        points: 5,
        sla_threshold: 3,
        sla_penalty: 10,
    };

    fn task(team_id: i32, service: &str, round_id: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            team_id,
            team_identifier: format!("{team_id:02}"),
            service_type: "Tcp".into(),
            service_name: service.into(),
            round_id,
            attempts: 3,
            deadline: Utc::now(),
            check_data: serde_json::json!({}),
            enqueued_at: Utc::now(),
        }
    }

    fn result_for(task: &Task, status: bool) -> CheckResult {
        CheckResult {
            task_id: task.id,
            team_id: task.team_id,
            service_name: task.service_name.clone(),
            service_type: task.service_type.clone(),
            round_id: task.round_id,
            status,
            points: if status { 5 } else { 0 },
            error: if status { String::new() } else { "connection error".into() },
            debug: String::new(),
        }
    }

    /// Run `rounds` rounds of a single (team 1, "svc") service with the given
    /// outcome per round; returns the rounds at which penalties fired.
    fn penalty_rounds(outcomes: &[bool]) -> (Vec<i64>, SlaCounters) {
        let mut counters = SlaCounters::default();
        let mut fired = Vec::new();
        for (i, &passed) in outcomes.iter().enumerate() {
            let round_id = i as i64 + 1;
            let t = task(1, "svc", round_id);
            let mut results = HashMap::new();
            results.insert(t.id, result_for(&t, passed));
            let reduction = reduce_round(
                round_id,
                std::slice::from_ref(&t),
                &results,
                &mut counters,
                &HashMap::new(),
                DEFAULTS,
            );
            if !reduction.slas.is_empty() {
                fired.push(round_id);
            }
        }
        (fired, counters)
    }

    #[test]
    fn sla_fires_once_per_full_streak() {
        // threshold 3: five straight failures fire exactly once, at round 3
        let (fired, counters) = penalty_rounds(&[false; 5]);
        assert_eq!(fired, vec![3]);
        assert_eq!(counters.get(1, "svc"), 2);

        // a sixth failure completes the next streak
        let (fired, counters) = penalty_rounds(&[false; 6]);
        assert_eq!(fired, vec![3, 6]);
        assert_eq!(counters.get(1, "svc"), 0);
    }

    #[test]
    fn success_resets_the_streak() {
        let (fired, counters) = penalty_rounds(&[false, false, true, false, false]);
        assert!(fired.is_empty());
        assert_eq!(counters.get(1, "svc"), 2);

        let (fired, _) = penalty_rounds(&[false, false, true, false, false, false]);
        assert_eq!(fired, vec![6]);
    }

    #[test]
    fn short_streaks_never_fire() {
        for len in 0..3 {
            let outcomes = vec![false; len];
            let (fired, _) = penalty_rounds(&outcomes);
            assert!(fired.is_empty(), "streak of {len} must not fire");
        }
    }

    #[test]
    fn missing_results_become_deadline_failures() {
        let tasks: Vec<Task> = (0..10).map(|i| task(i % 2 + 1, &format!("svc{i}"), 1)).collect();
        let mut results = HashMap::new();
        for t in tasks.iter().take(7) {
            results.insert(t.id, result_for(t, true));
        }

        let mut counters = SlaCounters::default();
        let reduction = reduce_round(1, &tasks, &results, &mut counters, &HashMap::new(), DEFAULTS);

        assert_eq!(reduction.checks.len(), 10);
        let synthesized: Vec<&ServiceCheck> = reduction
            .checks
            .iter()
            .filter(|c| c.error == DEADLINE_ERROR)
            .collect();
        assert_eq!(synthesized.len(), 3);
        assert!(synthesized.iter().all(|c| !c.result && c.points == 0));
        assert_eq!(reduction.checks.iter().filter(|c| c.result).count(), 7);
    }

    #[test]
    fn one_check_per_task_always() {
        // teams x services, no results at all: still one check each
        let mut tasks = Vec::new();
        for team in 1..=3 {
            for service in ["web01-web", "web01-ssh"] {
                tasks.push(task(team, service, 1));
            }
        }
        let mut counters = SlaCounters::default();
        let reduction =
            reduce_round(1, &tasks, &HashMap::new(), &mut counters, &HashMap::new(), DEFAULTS);
        assert_eq!(reduction.checks.len(), 6);
    }

    #[test]
    fn admit_rejects_duplicates_and_strays() {
        let t = task(1, "svc", 4);
        let issued: HashSet<Uuid> = [t.id].into_iter().collect();
        let mut results = HashMap::new();

        assert!(admit_result(&mut results, 4, &issued, result_for(&t, true)));

        // duplicate task id: first write wins
        let mut late = result_for(&t, false);
        late.error = "late duplicate".into();
        assert!(!admit_result(&mut results, 4, &issued, late));
        assert!(results[&t.id].status);

        // wrong round
        let stale = task(1, "svc", 3);
        assert!(!admit_result(&mut results, 4, &issued, result_for(&stale, true)));

        // never issued this round
        let foreign = task(9, "svc", 4);
        assert!(!admit_result(&mut results, 4, &issued, result_for(&foreign, true)));

        assert_eq!(results.len(), 1);
    }

    #[test]
    fn reduction_is_deterministic() {
        let tasks: Vec<Task> = (0..4).map(|i| task(1, &format!("svc{i}"), 1)).collect();
        let mut results = HashMap::new();
        results.insert(tasks[0].id, result_for(&tasks[0], true));
        results.insert(tasks[1].id, result_for(&tasks[1], false));

        let mut c1 = SlaCounters::default();
        let mut c2 = SlaCounters::default();
        let r1 = reduce_round(1, &tasks, &results, &mut c1, &HashMap::new(), DEFAULTS);
        let r2 = reduce_round(1, &tasks, &results, &mut c2, &HashMap::new(), DEFAULTS);

        assert_eq!(r1.checks, r2.checks);
        assert_eq!(r1.slas, r2.slas);
        assert_eq!(c1, c2);
    }

    #[test]
    fn replay_matches_live_counters() {
        let outcomes = [true, false, false, true, false, false, false];
        let mut live = SlaCounters::default();
        let mut persisted = Vec::new();

        for (i, &passed) in outcomes.iter().enumerate() {
            let round_id = i as i64 + 1;
            let t = task(2, "mail01-smtp", round_id);
            let mut results = HashMap::new();
            results.insert(t.id, result_for(&t, passed));
            reduce_round(
                round_id,
                std::slice::from_ref(&t),
                &results,
                &mut live,
                &HashMap::new(),
                DEFAULTS,
            );
            persisted.push(CheckOutcome {
                team_id: 2,
                service_name: "mail01-smtp".into(),
                result: passed,
            });
        }

        let replayed = replay_counters(&persisted, &HashMap::new(), DEFAULTS.sla_threshold);
        assert_eq!(replayed, live);
    }

    #[test]
    fn per_service_thresholds_override_the_default() {
        let mut params = ParamsByService::new();
        params.insert(
            "svc".into(),
            ServiceParams {
                points: 5,
                sla_threshold: 2,
                sla_penalty: 7,
            },
        );

        let mut counters = SlaCounters::default();
        let mut fired = Vec::new();
        for round_id in 1..=4 {
            let t = task(1, "svc", round_id);
            let reduction = reduce_round(
                round_id,
                std::slice::from_ref(&t),
                &HashMap::new(),
                &mut counters,
                &params,
                DEFAULTS,
            );
            if let Some(sla) = reduction.slas.first() {
                assert_eq!(sla.penalty, 7);
                fired.push(round_id);
            }
        }
        assert_eq!(fired, vec![2, 4]);
    }

    #[test]
    fn series_folds_points_penalties_and_adjustments() {
        let points = vec![
            RoundSum { round_id: 1, team_id: 1, total: 10 },
            RoundSum { round_id: 2, team_id: 1, total: 5 },
            RoundSum { round_id: 1, team_id: 2, total: 10 },
        ];
        let penalties = vec![RoundSum { round_id: 2, team_id: 1, total: 10 }];
        let adjustments = HashMap::from([(2, -3i64)]);

        let series = score_series(3, &points, &penalties, &adjustments);

        assert_eq!(series.len(), 3);
        assert_eq!(series[0][&1], 10);
        assert_eq!(series[1][&1], 5); // 10 + 5 - 10
        assert_eq!(series[2][&1], 5); // quiet round carries forward
        assert_eq!(series[0][&2], 7); // 10 - 3 adjustment
        assert_eq!(series[2][&2], 7);

        // invariant: score(R) = score(R-1) + points(R) - penalties(R)
        assert_eq!(series[1][&1], series[0][&1] + 5 - 10);
    }

    #[test]
    fn series_is_idempotent_over_committed_rounds() {
        let points = vec![
            RoundSum { round_id: 1, team_id: 1, total: 4 },
            RoundSum { round_id: 2, team_id: 1, total: 4 },
        ];
        let first = score_series(2, &points, &[], &HashMap::new());
        let second = score_series(2, &points, &[], &HashMap::new());
        assert_eq!(first, second);
    }

    #[test]
    fn empty_history_yields_empty_series() {
        assert!(score_series(0, &[], &[], &HashMap::new()).is_empty());
    }
}
