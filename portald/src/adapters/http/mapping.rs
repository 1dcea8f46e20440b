// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::app::errors::{AppError, AppErrorKind};
use crate::app::types::{
    ActiveSession, ClusterHealth, HealthView, HistoryRecord, JobResources, LaunchOutcome,
    SessionView, StopOutcome, TunnelInfo, TunnelState,
};

#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    pub user: String,
    pub cluster: String,
    pub ide: String,
    pub cpus: u32,
    pub memory: String,
    pub time: String,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
}

impl LaunchRequest {
    pub fn resources(&self) -> JobResources {
        JobResources {
            cpus: self.cpus,
            memory: self.memory.clone(),
            time: self.time.clone(),
            gpu_type: self.gpu_type.clone(),
            release: self.release.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user: Option<String>,
    pub days: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SessionDto {
    pub key: String,
    pub user: String,
    pub cluster: String,
    pub ide: String,
    pub status: String,
    pub job_id: Option<String>,
    pub node: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub cpus: u32,
    pub memory: String,
    pub time: String,
    pub gpu_type: Option<String>,
    pub release: Option<String>,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub last_activity: String,
    pub used_dev_server: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TunnelDto {
    pub state: &'static str,
    pub node: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub pid: Option<u32>,
    pub started_at: String,
}

#[derive(Debug, Serialize)]
pub struct SessionViewDto {
    #[serde(flatten)]
    pub session: SessionDto,
    pub tunnel: Option<TunnelDto>,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    pub status: &'static str,
    pub session: SessionDto,
    pub url: Option<String>,
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub job_id: Option<String>,
    pub job_cancelled: bool,
    pub tunnel_stopped: bool,
    pub history_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryDto {
    pub id: i64,
    pub job_id: Option<String>,
    pub user: String,
    pub cluster: String,
    pub ide: String,
    pub end_reason: String,
    pub error_message: Option<String>,
    pub wait_seconds: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub gpu_type: Option<String>,
    pub release: Option<String>,
    /// Stored as an integer flag; clients read 0 or 1.
    pub used_dev_server: u8,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub ended_at: String,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub cluster: String,
    pub valid: bool,
    pub age_seconds: Option<u64>,
    pub health: Option<ClusterHealthDto>,
}

#[derive(Debug, Serialize)]
pub struct ClusterHealthDto {
    pub cpus_allocated: u64,
    pub cpus_idle: u64,
    pub cpus_other: u64,
    pub cpus_total: u64,
    pub nodes_allocated: u64,
    pub nodes_idle: u64,
    pub nodes_other: u64,
    pub nodes_total: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

/// JSON error response carrying the stable error code.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: AppErrorKind) -> StatusCode {
    match kind {
        AppErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        AppErrorKind::NotFound => StatusCode::NOT_FOUND,
        AppErrorKind::Conflict => StatusCode::CONFLICT,
        AppErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        AppErrorKind::Aborted => StatusCode::BAD_GATEWAY,
        AppErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.message(),
        };
        (status, Json(body)).into_response()
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

pub fn session_to_dto(session: &ActiveSession) -> SessionDto {
    SessionDto {
        key: session.key.to_string(),
        user: session.key.user().to_string(),
        cluster: session.key.cluster().to_string(),
        ide: session.key.ide().to_string(),
        status: session.status.as_str().to_string(),
        job_id: session.job_id.clone(),
        node: session.node.clone(),
        local_port: session.local_port,
        remote_port: session.remote_port,
        cpus: session.resources.cpus,
        memory: session.resources.memory.clone(),
        time: session.resources.time.clone(),
        gpu_type: session.resources.gpu_type.clone(),
        release: session.resources.release.clone(),
        submitted_at: rfc3339(session.submitted_at),
        started_at: session.started_at.map(rfc3339),
        last_activity: rfc3339(session.last_activity),
        used_dev_server: session.used_dev_server,
        error_message: session.error_message.clone(),
    }
}

fn tunnel_to_dto(tunnel: &TunnelInfo) -> TunnelDto {
    TunnelDto {
        state: match tunnel.state {
            TunnelState::Establishing => "establishing",
            TunnelState::Active => "active",
        },
        node: tunnel.node.clone(),
        local_port: tunnel.local_port,
        remote_port: tunnel.remote_port,
        pid: tunnel.pid,
        started_at: rfc3339(tunnel.started_at),
    }
}

pub fn session_view_to_dto(view: &SessionView) -> SessionViewDto {
    SessionViewDto {
        session: session_to_dto(&view.session),
        tunnel: view.tunnel.as_ref().map(tunnel_to_dto),
        url: view.url.clone(),
    }
}

pub fn launch_to_response(outcome: &LaunchOutcome) -> LaunchResponse {
    match outcome {
        LaunchOutcome::Pending { session } => LaunchResponse {
            status: "pending",
            session: session_to_dto(session),
            url: None,
            proxy_port: None,
        },
        LaunchOutcome::Running {
            session,
            url,
            proxy_port,
        } => LaunchResponse {
            status: "running",
            session: session_to_dto(session),
            url: Some(url.clone()),
            proxy_port: *proxy_port,
        },
    }
}

pub fn stop_to_response(outcome: StopOutcome) -> StopResponse {
    StopResponse {
        job_id: outcome.job_id,
        job_cancelled: outcome.job_cancelled,
        tunnel_stopped: outcome.tunnel_stopped,
        history_id: outcome.history_id,
    }
}

pub fn history_to_dto(record: HistoryRecord) -> HistoryDto {
    HistoryDto {
        id: record.id,
        job_id: record.job_id,
        user: record.user,
        cluster: record.cluster,
        ide: record.ide,
        end_reason: record.end_reason,
        error_message: record.error_message,
        wait_seconds: record.wait_seconds,
        duration_minutes: record.duration_minutes,
        cpus: record.cpus,
        memory: record.memory,
        gpu_type: record.gpu_type,
        release: record.release,
        used_dev_server: u8::from(record.used_dev_server),
        submitted_at: record.submitted_at,
        started_at: record.started_at,
        ended_at: record.ended_at,
    }
}

fn cluster_health_to_dto(health: ClusterHealth) -> ClusterHealthDto {
    ClusterHealthDto {
        cpus_allocated: health.cpus_allocated,
        cpus_idle: health.cpus_idle,
        cpus_other: health.cpus_other,
        cpus_total: health.cpus_total,
        nodes_allocated: health.nodes_allocated,
        nodes_idle: health.nodes_idle,
        nodes_other: health.nodes_other,
        nodes_total: health.nodes_total,
    }
}

pub fn health_to_response(view: HealthView) -> HealthResponse {
    HealthResponse {
        cluster: view.cluster,
        valid: view.valid,
        age_seconds: view.age_seconds,
        health: view.health.map(cluster_health_to_dto),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::errors::codes;

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(status_for(AppErrorKind::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(AppErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(AppErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(AppErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(AppErrorKind::Aborted), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(AppErrorKind::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn authentication_failure_is_a_bad_gateway() {
        let err = AppError::with_message(
            AppErrorKind::Aborted,
            codes::AUTHENTICATION_FAILURE,
            "Permission denied (publickey)",
        );
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
