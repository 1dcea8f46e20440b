// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::app::types::{Ide, SessionKey};
use crate::app::usecases::UseCases;

pub mod mapping;

use mapping::{
    ApiError, CountResponse, HealthResponse, HistoryDto, HistoryQuery, LaunchRequest,
    LaunchResponse, SessionViewDto, StopResponse, UserQuery,
};

const DEFAULT_HISTORY_DAYS: u32 = 30;

type ApiResult<T> = Result<T, ApiError>;

pub fn router(usecases: UseCases) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(launch).get(list_sessions))
        .route("/sessions/{key}", delete(stop))
        .route("/sessions/{key}/heartbeat", post(heartbeat))
        .route("/sessions/{key}/dev-server", post(dev_server))
        .route("/history", get(history))
        .route("/history/count", get(history_count))
        .route("/clusters/{cluster}/health", get(cluster_health))
        .layer(TraceLayer::new_for_http())
        .with_state(usecases)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn launch(
    State(usecases): State<UseCases>,
    Json(req): Json<LaunchRequest>,
) -> ApiResult<(StatusCode, Json<LaunchResponse>)> {
    let ide: Ide = req.ide.parse()?;
    let outcome = usecases
        .launch(&req.user, &req.cluster, ide, req.resources())
        .await?;
    let response = mapping::launch_to_response(&outcome);
    let status = if response.url.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(response)))
}

async fn list_sessions(
    State(usecases): State<UseCases>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Vec<SessionViewDto>>> {
    let views = usecases.list_sessions(query.user.as_deref()).await?;
    Ok(Json(views.iter().map(mapping::session_view_to_dto).collect()))
}

async fn stop(
    State(usecases): State<UseCases>,
    Path(key): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let key: SessionKey = key.parse()?;
    let outcome = usecases.stop(key.user(), key.cluster(), key.ide()).await?;
    Ok(Json(mapping::stop_to_response(outcome)))
}

async fn heartbeat(
    State(usecases): State<UseCases>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key: SessionKey = key.parse()?;
    usecases.heartbeat(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dev_server(
    State(usecases): State<UseCases>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key: SessionKey = key.parse()?;
    usecases.mark_dev_server_used(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn history(
    State(usecases): State<UseCases>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<HistoryDto>>> {
    let records = usecases
        .history(
            query.user.as_deref(),
            query.days.unwrap_or(DEFAULT_HISTORY_DAYS),
            query.limit,
        )
        .await?;
    Ok(Json(records.into_iter().map(mapping::history_to_dto).collect()))
}

async fn history_count(
    State(usecases): State<UseCases>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<CountResponse>> {
    let count = usecases
        .history_count(
            query.user.as_deref(),
            query.days.unwrap_or(DEFAULT_HISTORY_DAYS),
        )
        .await?;
    Ok(Json(CountResponse { count }))
}

async fn cluster_health(
    State(usecases): State<UseCases>,
    Path(cluster): Path<String>,
) -> ApiResult<Json<HealthResponse>> {
    let view = usecases.cluster_health(&cluster).await?;
    Ok(Json(mapping::health_to_response(view)))
}
