use chrono::Utc;
use color_eyre::Report;
use std::sync::Arc;
use std::time::Duration;
use tokio::spawn;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tavla::bus::{Bus, Task, TaskState};
use tavla::checks::{CheckContext, Runner};
use tavla::config;
use tavla::creds::CredentialStore;

/// Each task pop blocks at most this long so shutdown stays responsive.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // get config
    let args = argh::from_env::<config::Args>();
    let config = args.get_config()?;

    // setup logging
    args.setup_logging()?;

    let bus = Bus::connect(&config.required_settings.redis_connect_url).await?;
    let creds = Arc::new(CredentialStore::new(
        ".",
        config.credlist_settings.credlist.clone(),
    ));

    let runner_id = format!("runner-{}", Uuid::new_v4());
    info!(runner = %runner_id, "runner started");

    let (shutdown_tx, mut shutdown) = watch::channel(false);
    spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    loop {
        if *shutdown.borrow() {
            break;
        }

        let popped = tokio::select! {
            _ = shutdown.changed() => break,
            popped = bus.pop_task(POP_TIMEOUT) => popped,
        };

        let task = match popped {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "task pop failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if task.deadline <= Utc::now() {
            debug!(task = %task.id, "task popped past its deadline");
            let _ = bus
                .set_task_state(&task.id, Some(&runner_id), TaskState::Expired)
                .await;
            continue;
        }

        let bus = bus.clone();
        let creds = Arc::clone(&creds);
        let runner_id = runner_id.clone();
        spawn(async move { execute(bus, creds, runner_id, task).await });
    }

    info!("runner stopped");
    Ok(())
}

/// Run one task to completion: claim it, rebuild the probe from its opaque
/// configuration, execute, publish the result.
async fn execute(bus: Bus, creds: Arc<CredentialStore>, runner_id: String, task: Task) {
    let runner = match Runner::from_parts(&task.service_type, task.check_data.clone()) {
        Ok(runner) => runner,
        Err(e) => {
            // the scheduler's deadline path scores this as a failed check
            warn!(task = %task.id, error = %e, "unusable task skipped");
            let _ = bus
                .set_task_state(&task.id, Some(&runner_id), TaskState::Failed)
                .await;
            return;
        }
    };

    if let Err(e) = bus
        .set_task_state(&task.id, Some(&runner_id), TaskState::Running)
        .await
    {
        debug!(task = %task.id, error = %e, "claim not recorded");
    }

    let ctx = CheckContext {
        team_id: task.team_id,
        team_identifier: &task.team_identifier,
        round_id: task.round_id,
        task_id: task.id,
        creds: Some(creds.as_ref()),
    };

    let (tx, rx) = flume::bounded(1);
    runner.run(&ctx, &tx).await;

    match rx.recv_async().await {
        Ok(result) => {
            let state = if result.status {
                TaskState::Completed
            } else {
                TaskState::Failed
            };
            if let Err(e) = bus.push_result(&result).await {
                warn!(task = %task.id, error = %e, "result not published");
            }
            let _ = bus.set_task_state(&task.id, Some(&runner_id), state).await;
            info!(
                task = %task.id,
                service = %result.service_name,
                status = result.status,
                "check finished"
            );
        }
        Err(_) => warn!(task = %task.id, "probe produced no result"),
    }
}
