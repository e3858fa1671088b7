pub mod bus;
pub mod checks;
pub mod config;
pub mod creds;
pub mod db;
pub mod engine;
pub mod scoring;
pub mod types;

use color_eyre::Report;
use db::Db;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

const GET_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn db_connect(url: &str) -> Result<Db, Report> {
    Ok(Db::wrap(
        PgPoolOptions::new()
            .acquire_timeout(GET_TIMEOUT)
            .connect(url)
            .await?,
    ))
}
