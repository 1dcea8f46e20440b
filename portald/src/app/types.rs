// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::slurm;

/// Interactive service that can be launched as a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ide {
    VsCode,
    RStudio,
    Jupyter,
}

impl Ide {
    pub const ALL: [Ide; 3] = [Ide::VsCode, Ide::RStudio, Ide::Jupyter];

    pub fn as_str(self) -> &'static str {
        match self {
            Ide::VsCode => "vscode",
            Ide::RStudio => "rstudio",
            Ide::Jupyter => "jupyter",
        }
    }
}

impl fmt::Display for Ide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ide {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vscode" => Ok(Ide::VsCode),
            "rstudio" => Ok(Ide::RStudio),
            "jupyter" => Ok(Ide::Jupyter),
            other => Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::UNKNOWN_IDE,
                format!("Unknown IDE: {other}"),
            )),
        }
    }
}

/// `user-cluster-ide` identifier shared by a job, its tunnel and its stored session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    user: String,
    cluster: String,
    ide: Ide,
}

impl SessionKey {
    /// Cluster names must not contain `-`, otherwise the rendered key cannot be parsed back.
    pub fn new(user: impl Into<String>, cluster: impl Into<String>, ide: Ide) -> AppResult<Self> {
        let user = user.into();
        let cluster = cluster.into();
        if user.trim().is_empty() {
            return Err(AppError::invalid_argument("user must not be empty"));
        }
        if cluster.trim().is_empty() {
            return Err(AppError::invalid_argument("cluster must not be empty"));
        }
        if cluster.contains('-') {
            return Err(AppError::invalid_argument(format!(
                "cluster name '{cluster}' must not contain '-'"
            )));
        }
        Ok(Self { user, cluster, ide })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn ide(&self) -> Ide {
        self.ide
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.user, self.cluster, self.ide)
    }
}

impl FromStr for SessionKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The user absorbs every hyphen before the last two components.
        let mut parts = s.rsplitn(3, '-');
        let (Some(ide), Some(cluster), Some(user)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AppError::invalid_argument(format!(
                "malformed session key '{s}'"
            )));
        };
        let ide = ide.parse::<Ide>()?;
        SessionKey::new(user, cluster, ide)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    Other(String),
}

impl JobState {
    pub fn from_scheduler(raw: &str) -> Self {
        let normalized = slurm::normalize_slurm_state(raw);
        match normalized.as_str() {
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "COMPLETING" => JobState::Completing,
            "COMPLETED" => JobState::Completed,
            "CANCELLED" => JobState::Cancelled,
            "FAILED" => JobState::Failed,
            "TIMEOUT" => JobState::Timeout,
            _ => JobState::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::Other(value) => value,
        }
    }

    pub fn is_terminal(&self) -> bool {
        slurm::is_slurm_state_terminal(self.as_str())
    }

    /// Queued or running; the only states a new launch may adopt.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of scheduler status output for a portal job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub ide: Ide,
    pub state: JobState,
    /// None while pending, and briefly after the job starts.
    pub node: Option<String>,
    pub time_left: Option<String>,
    pub time_left_seconds: Option<u64>,
    pub time_limit: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResources {
    pub cpus: u32,
    /// Slurm memory spec, e.g. `8G` or `16000M`.
    pub memory: String,
    /// Slurm time spec, e.g. `04:00:00` or `1-00:00:00`.
    pub time: String,
    pub gpu_type: Option<String>,
    pub release: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeWait {
    Assigned { node: String },
    Pending { job_id: String },
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub return_pending_on_timeout: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            poll_interval: Duration::from_secs(2),
            return_pending_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "error" => Ok(SessionStatus::Error),
            other => Err(AppError::invalid_argument(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub key: SessionKey,
    pub status: SessionStatus,
    pub job_id: Option<String>,
    pub node: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub token: Option<String>,
    pub resources: JobResources,
    pub submitted_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub last_activity: OffsetDateTime,
    /// Only ever flips from false to true.
    pub used_dev_server: bool,
    pub error_message: Option<String>,
}

impl ActiveSession {
    pub fn submitted(
        key: SessionKey,
        job_id: impl Into<String>,
        token: Option<String>,
        resources: JobResources,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            key,
            status: SessionStatus::Pending,
            job_id: Some(job_id.into()),
            node: None,
            local_port: None,
            remote_port: None,
            token,
            resources,
            submitted_at: now,
            started_at: None,
            last_activity: now,
            used_dev_server: false,
            error_message: None,
        }
    }

    pub fn wait_seconds(&self) -> Option<i64> {
        self.started_at
            .map(|started| (started - self.submitted_at).as_seconds_f64().round() as i64)
    }

    pub fn duration_minutes(&self, ended_at: OffsetDateTime) -> Option<i64> {
        self.started_at
            .map(|started| ((ended_at - started).as_seconds_f64() / 60.0).round() as i64)
    }
}

/// Partial update for an active session; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub job_id: Option<String>,
    pub node: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub token: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub last_activity: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    UserStopped,
    JobEnded,
    Error,
    /// Terminal state reported by the scheduler, lowercased (`timeout`, `failed`, ...).
    Scheduler(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::UserStopped => "user_stopped",
            EndReason::JobEnded => "job_ended",
            EndReason::Error => "error",
            EndReason::Scheduler(state) => state,
        }
    }

    pub fn from_job_state(state: &JobState) -> Self {
        EndReason::Scheduler(state.as_str().to_ascii_lowercase())
    }
}

/// Archived session; rows are written once and never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
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
    pub used_dev_server: bool,
    pub submitted_at: String, // RFC3339
    pub started_at: Option<String>,
    pub ended_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterHealth {
    pub cpus_allocated: u64,
    pub cpus_idle: u64,
    pub cpus_other: u64,
    pub cpus_total: u64,
    pub nodes_allocated: u64,
    pub nodes_idle: u64,
    pub nodes_other: u64,
    pub nodes_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub identity_path: Option<String>,
    /// Extra `-o` options, passed verbatim.
    pub options: Vec<String>,
}

impl SshConfig {
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterProfile {
    pub name: String,
    pub ssh: SshConfig,
    pub partition: Option<String>,
    pub ides: Vec<Ide>,
    pub max_cpus: u32,
}

impl ClusterProfile {
    pub fn supports(&self, ide: Ide) -> bool {
        self.ides.contains(&ide)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdeProfile {
    pub ide: Ide,
    pub default_port: u16,
    /// Service command; `$PORT` and `$PORTAL_TOKEN` are set by the job script.
    pub launch: String,
    pub working_dir: Option<String>,
    pub setup: Vec<String>,
    pub uses_token: bool,
    pub readiness_path: Option<String>,
    /// Companion proxy command started next to the service; `$PROXY_PORT` is set.
    pub proxy: Option<String>,
    /// Browser path appended to the local tunnel URL; `{token}` is substituted.
    pub url_path: String,
}

/// Clusters and ides known to this daemon.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub job_prefix: String,
    pub remote_ports: RangeInclusive<u16>,
    pub clusters: BTreeMap<String, ClusterProfile>,
    pub ides: BTreeMap<Ide, IdeProfile>,
}

impl Catalog {
    pub fn cluster(&self, name: &str) -> AppResult<&ClusterProfile> {
        self.clusters.get(name).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::UNKNOWN_CLUSTER,
                format!("Unknown cluster: {name}"),
            )
        })
    }

    pub fn ide(&self, ide: Ide) -> AppResult<&IdeProfile> {
        self.ides.get(&ide).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::UNKNOWN_IDE,
                format!("Unknown IDE: {ide}"),
            )
        })
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    pub fn job_name(&self, ide: Ide) -> String {
        format!("{}-{}", self.job_prefix, ide)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Establishing,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub key: SessionKey,
    pub state: TunnelState,
    pub node: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub pid: Option<u32>,
    pub started_at: OffsetDateTime,
}

/// Result of a launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The job is queued; the caller should poll again later.
    Pending { session: ActiveSession },
    Running {
        session: ActiveSession,
        url: String,
        /// Port the companion proxy reported on the compute node, for ides that run one.
        proxy_port: Option<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub job_id: Option<String>,
    pub job_cancelled: bool,
    pub tunnel_stopped: bool,
    pub history_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session: ActiveSession,
    pub tunnel: Option<TunnelInfo>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthView {
    pub cluster: String,
    pub health: Option<ClusterHealth>,
    pub valid: bool,
    pub age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Session keys that were torn down and archived.
    pub ended: Vec<String>,
    pub skipped_clusters: Vec<String>,
}
