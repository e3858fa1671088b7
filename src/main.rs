use color_eyre::Report;
use futures::future::join_all;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::spawn;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tavla::bus::Bus;
use tavla::config::{self, ConfigHandle};
use tavla::creds::CredentialStore;
use tavla::engine::ScoringEngine;

mod web;

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // get config
    let args = argh::from_env::<config::Args>();
    let config = args.get_config()?;

    // setup logging
    args.setup_logging()?;

    info!(event = %config.required_settings.event_name, "engine starting");

    let db = tavla::db_connect(&config.required_settings.db_connect_url).await?;
    db.ensure_schema().await?;
    db.sync_teams(&config.teams).await?;
    info!("connected to database");

    let bus = Bus::connect(&config.required_settings.redis_connect_url).await?;
    info!("connected to bus");

    let creds = Arc::new(CredentialStore::new(
        ".",
        config.credlist_settings.credlist.clone(),
    ));
    let team_ids: Vec<i32> = db.teams().await?.iter().map(|t| t.id).collect();
    creds.load_credentials(&team_ids).await?;

    let bind: SocketAddr = format!(
        "{}:{}",
        config.required_settings.bind_address, config.misc_settings.port
    )
    .parse()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // surface engine-wide bus events in the logs
    {
        let bus = bus.clone();
        spawn(async move {
            match bus.subscribe_events().await {
                Ok(mut pubsub) => {
                    let mut stream = pubsub.on_message();
                    while let Some(message) = stream.next().await {
                        match message.get_payload::<String>() {
                            Ok(payload) => debug!(event = %payload, "bus event"),
                            Err(e) => warn!(error = %e, "unreadable bus event"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "event subscription failed"),
            }
        });
    }

    let engine = Arc::new(ScoringEngine::new(
        ConfigHandle::new(config),
        db,
        bus,
        creds,
        shutdown_rx,
    ));

    let web_engine = Arc::clone(&engine);
    let server_handle = spawn(async move { web::run(bind, web_engine).await });
    let scheduler_handle = spawn(async move { engine.run().await });

    join_all(vec![scheduler_handle, server_handle]).await;

    Ok(())
}
