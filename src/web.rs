use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use color_eyre::Report;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use tavla::engine::ScoringEngine;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal(err: Report) -> ApiError {
    error!(error = ?err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub async fn run(addr: SocketAddr, engine: Arc<ScoringEngine>) -> Result<(), Report> {
    let app = Router::new()
        .route("/ping", get(|| async { (StatusCode::OK, "pong") }))
        .route("/admin/pause", post(pause))
        .route("/admin/reset", post(reset))
        .route("/admin/start-time", post(start_time))
        .route("/admin/stop-time", post(stop_time))
        .route("/admin/engine", get(engine_status))
        .route("/admin/tasks", get(active_tasks))
        .route("/admin/uptime", get(uptime))
        .route("/admin/scores", get(scores))
        .route("/admin/teams", post(update_teams))
        .route("/admin/adjustments", post(add_adjustment))
        .route("/admin/pcrs", get(list_pcrs))
        .route("/credlists", get(credlists))
        .route("/pcr", post(create_pcr))
        .layer(CorsLayer::new().allow_methods(Any).allow_origin(Any))
        .with_state(engine);

    tracing::info!("webserver started on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

#[derive(Deserialize)]
struct PauseForm {
    pause: bool,
}

async fn pause(
    State(engine): State<Arc<ScoringEngine>>,
    Json(form): Json<PauseForm>,
) -> ApiResult {
    // reject no-op requests so a stale admin view notices
    if form.pause == engine.is_paused() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            if form.pause {
                "engine is already paused"
            } else {
                "engine is already running"
            },
        ));
    }

    if form.pause {
        engine.pause_engine();
    } else {
        engine.resume_engine();
    }
    Ok(Json(json!({ "status": "success" })))
}

async fn reset(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    engine.reset_scores().await.map_err(internal)?;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
struct StartTimeForm {
    start_time: Option<DateTime<Utc>>,
}

async fn start_time(
    State(engine): State<Arc<ScoringEngine>>,
    Json(form): Json<StartTimeForm>,
) -> ApiResult {
    engine.set_start_time(form.start_time);
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
struct StopTimeForm {
    stop_time: Option<DateTime<Utc>>,
}

async fn stop_time(
    State(engine): State<Arc<ScoringEngine>>,
    Json(form): Json<StopTimeForm>,
) -> ApiResult {
    engine.set_stop_time(form.stop_time);
    Ok(Json(json!({ "status": "success" })))
}

async fn engine_status(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    let status = engine.status().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(status).map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?))
}

async fn active_tasks(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    let tasks = engine.active_tasks().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(tasks).map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?))
}

async fn uptime(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    let uptimes = engine.uptime_per_service().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(uptimes).map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?))
}

async fn scores(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    let scores = engine.team_scores().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(scores).map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?))
}

#[derive(Deserialize)]
struct TeamUpdate {
    id: i32,
    identifier: String,
    active: bool,
}

#[derive(Deserialize)]
struct TeamsForm {
    teams: Vec<TeamUpdate>,
}

async fn update_teams(
    State(engine): State<Arc<ScoringEngine>>,
    Json(form): Json<TeamsForm>,
) -> ApiResult {
    for team in form.teams {
        engine
            .db()
            .update_team(team.id, &team.identifier, team.active)
            .await
            .map_err(|e| internal(e.into()))?;
    }
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
struct AdjustmentForm {
    team_id: i32,
    amount: i32,
    #[serde(default)]
    reason: String,
}

async fn add_adjustment(
    State(engine): State<Arc<ScoringEngine>>,
    Json(form): Json<AdjustmentForm>,
) -> ApiResult {
    engine
        .db()
        .add_adjustment(form.team_id, form.amount, &form.reason)
        .await
        .map_err(|e| internal(e.into()))?;
    Ok(Json(json!({ "status": "success" })))
}

async fn list_pcrs(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    let teams = engine.db().teams().await.map_err(|e| internal(e.into()))?;

    let mut data = Vec::new();
    for team in teams {
        let files = engine
            .creds()
            .team_files(team.id)
            .await
            .map_err(|e| internal(e.into()))?;
        for (credlist, updated) in files {
            data.push(json!({
                "team_id": team.id,
                "team_name": team.name,
                "credlist": credlist,
                "updated": updated.to_rfc3339(),
            }));
        }
    }
    Ok(Json(Value::Array(data)))
}

async fn credlists(State(engine): State<Arc<ScoringEngine>>) -> ApiResult {
    if !engine.config().snapshot().misc_settings.easy_pcr {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "PCR self service not allowed",
        ));
    }

    let lists: Vec<Value> = engine
        .creds()
        .credlists()
        .iter()
        .map(|list| {
            json!({
                "name": list.name,
                "path": list.path,
                "explain_text": list.explain_text,
            })
        })
        .collect();
    Ok(Json(Value::Array(lists)))
}

#[derive(Deserialize)]
struct PcrForm {
    team_id: i32,
    credlist_id: String,
    usernames: Vec<String>,
    passwords: Vec<String>,
}

async fn create_pcr(
    State(engine): State<Arc<ScoringEngine>>,
    Json(form): Json<PcrForm>,
) -> ApiResult {
    if !engine.config().snapshot().misc_settings.easy_pcr {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "PCR self service not allowed",
        ));
    }

    let count = engine
        .creds()
        .update_credentials(
            form.team_id,
            &form.credlist_id,
            &form.usernames,
            &form.passwords,
        )
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "message": "PCR updated successfully",
        "count": count,
    })))
}
