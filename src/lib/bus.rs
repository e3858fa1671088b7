use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checks::CheckResult;

pub const TASKS_KEY: &str = "tasks";
pub const RESULTS_KEY: &str = "results";
pub const EVENTS_CHANNEL: &str = "events";
pub const TASK_STATUS_PREFIX: &str = "task:";

/// Backoff schedule for transport errors. Exhausting it degrades the current
/// round; it never crashes the caller.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(300),
];

#[derive(Error, Debug)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One probe execution order, as carried on the `tasks` queue. `check_data`
/// is the serialized probe configuration, opaque to the bus, so workers stay
/// stateless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub team_id: i32,
    pub team_identifier: String,
    pub service_type: String,
    pub service_name: String,
    pub round_id: i64,
    pub attempts: u32,
    pub deadline: DateTime<Utc>,
    pub check_data: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

/// Value of a `task:{uuid}` key. Written by the scheduler at creation, by a
/// worker on claim, by whichever side settles the task. Expires with its TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub runner_id: String,
    pub status_text: TaskState,
    pub task: Task,
}

pub fn task_key(id: &Uuid) -> String {
    format!("{TASK_STATUS_PREFIX}{id}")
}

/// Group status records by their `status_text`, the shape served to admins.
pub fn group_by_status(
    records: Vec<TaskStatusRecord>,
) -> HashMap<String, Vec<TaskStatusRecord>> {
    let mut grouped: HashMap<String, Vec<TaskStatusRecord>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.status_text.to_string())
            .or_default()
            .push(record);
    }
    grouped
}

/// Decode a queue payload, logging and dropping garbage instead of letting it
/// poison the consumer.
fn decode<T: serde::de::DeserializeOwned>(queue: &str, payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(queue, error = %e, "skipping malformed payload");
            None
        }
    }
}

async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = redis::RedisResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < RETRY_DELAYS.len() => {
                warn!(op, attempt, error = %e, "bus operation failed, retrying");
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// The task/result fabric between the scheduler and the runner pool. Three
/// logical surfaces on one store: the `tasks` and `results` lists, per-task
/// `task:{uuid}` status records, and the `events` pub/sub channel.
#[derive(Clone)]
pub struct Bus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl Bus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    /// Enqueue a round's tasks: one status record per task, then the whole
    /// batch in a single RPUSH.
    pub async fn push_tasks(&self, tasks: &[Task], ttl: Duration) -> Result<(), BusError> {
        if tasks.is_empty() {
            return Ok(());
        }

        for task in tasks {
            let record = TaskStatusRecord {
                runner_id: String::new(),
                status_text: TaskState::Pending,
                task: task.clone(),
            };
            let payload = serde_json::to_string(&record)?;
            let key = task_key(&task.id);
            with_retry("set task status", || {
                let mut conn = self.conn.clone();
                let key = key.clone();
                let payload = payload.clone();
                async move { conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs()).await }
            })
            .await?;
        }

        let payloads = tasks
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        with_retry("rpush tasks", || {
            let mut conn = self.conn.clone();
            let payloads = payloads.clone();
            async move { conn.rpush::<_, _, ()>(TASKS_KEY, payloads).await }
        })
        .await?;

        debug!(count = tasks.len(), "tasks enqueued");
        Ok(())
    }

    /// Blocking pop with a short timeout so the caller stays cancellable.
    /// Returns `None` on timeout or when the head of the queue was garbage.
    pub async fn pop_task(&self, timeout: Duration) -> Result<Option<Task>, BusError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(TASKS_KEY, timeout.as_secs_f64()).await?;
        Ok(popped.and_then(|(_, payload)| decode(TASKS_KEY, &payload)))
    }

    pub async fn push_result(&self, result: &CheckResult) -> Result<(), BusError> {
        let payload = serde_json::to_string(result)?;
        with_retry("rpush result", || {
            let mut conn = self.conn.clone();
            let payload = payload.clone();
            async move { conn.rpush::<_, _, ()>(RESULTS_KEY, payload).await }
        })
        .await
    }

    pub async fn pop_result(&self, timeout: Duration) -> Result<Option<CheckResult>, BusError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(RESULTS_KEY, timeout.as_secs_f64()).await?;
        Ok(popped.and_then(|(_, payload)| decode(RESULTS_KEY, &payload)))
    }

    /// Rewrite a task's status record in place, keeping its TTL. A missing
    /// record means it already expired; that is not an error.
    pub async fn set_task_state(
        &self,
        task_id: &Uuid,
        runner_id: Option<&str>,
        state: TaskState,
    ) -> Result<(), BusError> {
        let key = task_key(task_id);
        let mut conn = self.conn.clone();

        let Some(payload) = conn.get::<_, Option<String>>(&key).await? else {
            return Ok(());
        };
        let Some(mut record) = decode::<TaskStatusRecord>(&key, &payload) else {
            return Ok(());
        };

        record.status_text = state;
        if let Some(runner_id) = runner_id {
            record.runner_id = runner_id.to_string();
        }

        let payload = serde_json::to_string(&record)?;
        redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("KEEPTTL")
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// All live status records, grouped by status. Admin read-only.
    pub async fn active_tasks(
        &self,
    ) -> Result<HashMap<String, Vec<TaskStatusRecord>>, BusError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{TASK_STATUS_PREFIX}*")).await?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let payloads: Vec<Option<String>> = conn.mget(keys).await?;
        let records = payloads
            .into_iter()
            .flatten()
            .filter_map(|payload| decode("task status", &payload))
            .collect();
        Ok(group_by_status(records))
    }

    pub async fn publish_event(&self, message: &str) -> Result<(), BusError> {
        with_retry("publish event", || {
            let mut conn = self.conn.clone();
            let message = message.to_string();
            async move { conn.publish::<_, _, ()>(EVENTS_CHANNEL, message).await }
        })
        .await
    }

    /// Dedicated pub/sub connection for `events`. Messages published while a
    /// subscriber is away are gone; the channel is pure notification.
    pub async fn subscribe_events(&self) -> Result<redis::aio::PubSub, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(EVENTS_CHANNEL).await?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(round_id: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            team_id: 1,
            team_identifier: "01".into(),
            service_type: "Tcp".into(),
            service_name: "web01-tcp".into(),
            round_id,
            attempts: 3,
            deadline: Utc::now(),
            check_data: serde_json::json!({"port": 80}),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn task_json_round_trip() {
        let task = sample_task(4);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        // and a second pass is bit-for-bit identical
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn task_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            task_key(&id),
            "task:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn state_strings_are_lowercase() {
        assert_eq!(TaskState::Pending.to_string(), "pending");
        assert_eq!(TaskState::Expired.to_string(), "expired");
        let parsed: TaskState = "completed".parse().unwrap();
        assert_eq!(parsed, TaskState::Completed);
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        for garbage in [
            r#"{"invalid": "json"#,
            r#"{"team_id": "not_a_number"}"#,
            "",
            "null",
            r#"{"team_id": 1}"#,
        ] {
            assert!(decode::<Task>(TASKS_KEY, garbage).is_none(), "{garbage:?}");
        }

        let valid = serde_json::to_string(&sample_task(1)).unwrap();
        assert!(decode::<Task>(TASKS_KEY, &valid).is_some());
    }

    #[test]
    fn grouping_partitions_by_status() {
        let mut records = Vec::new();
        for (state, n) in [
            (TaskState::Running, 3),
            (TaskState::Completed, 2),
            (TaskState::Expired, 1),
        ] {
            for _ in 0..n {
                records.push(TaskStatusRecord {
                    runner_id: "r1".into(),
                    status_text: state,
                    task: sample_task(1),
                });
            }
        }
        let total = records.len();

        let grouped = group_by_status(records);

        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped["running"].len(), 3);
        assert_eq!(grouped["completed"].len(), 2);
        assert_eq!(grouped["expired"].len(), 1);
        // counts sum back to the number of records
        assert_eq!(grouped.values().map(Vec::len).sum::<usize>(), total);
        for (status, records) in &grouped {
            assert!(records
                .iter()
                .all(|r| r.status_text.to_string() == *status));
        }
    }

    #[test]
    fn status_record_wire_shape() {
        let record = TaskStatusRecord {
            runner_id: String::new(),
            status_text: TaskState::Pending,
            task: sample_task(2),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["runner_id"], "");
        assert_eq!(json["status_text"], "pending");
        assert_eq!(json["task"]["round_id"], 2);
    }
}
