// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::app::command_queue::CommandQueue;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::health_cache::HealthCache;
use crate::app::ports::{ClockPort, RemoteExecPort, SessionStorePort};
use crate::app::scheduler::SlurmScheduler;
use crate::app::services::{ides, job_script};
use crate::app::tunnels::TunnelManager;
use crate::app::types::{
    ActiveSession, Catalog, ClusterHealth, EndReason, HealthView, HistoryRecord, Ide,
    JobResources, LaunchOutcome, NodeWait, ReconcileReport, SessionKey, SessionPatch,
    SessionStatus, SessionView, StopOutcome, TunnelState, WaitOptions,
};

pub struct UseCaseDeps {
    pub catalog: Arc<Catalog>,
    pub remote: Arc<dyn RemoteExecPort>,
    pub queue: CommandQueue,
    pub store: Arc<dyn SessionStorePort>,
    pub tunnels: TunnelManager,
    pub health: Arc<HealthCache<ClusterHealth>>,
    pub clock: Arc<dyn ClockPort>,
}

/// Marks a key as busy until dropped.
struct Claim {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Claim {
    fn acquire(held: &Arc<Mutex<HashSet<String>>>, key: String) -> Option<Self> {
        if !lock_set(held).insert(key.clone()) {
            return None;
        }
        Some(Self {
            held: held.clone(),
            key,
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.key);
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct UseCases {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) remote: Arc<dyn RemoteExecPort>,
    pub(crate) queue: CommandQueue,
    pub(crate) store: Arc<dyn SessionStorePort>,
    pub(crate) tunnels: TunnelManager,
    pub(crate) health: Arc<HealthCache<ClusterHealth>>,
    pub(crate) clock: Arc<dyn ClockPort>,
    node_wait: WaitOptions,
    in_flight: Arc<Mutex<HashSet<String>>>,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl UseCases {
    pub fn new(deps: UseCaseDeps, node_wait: WaitOptions) -> Self {
        Self {
            catalog: deps.catalog,
            remote: deps.remote,
            queue: deps.queue,
            store: deps.store,
            tunnels: deps.tunnels,
            health: deps.health,
            clock: deps.clock,
            node_wait: WaitOptions {
                return_pending_on_timeout: true,
                ..node_wait
            },
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn session_key(&self, user: &str, cluster: &str, ide: Ide) -> AppResult<SessionKey> {
        let profile = self.catalog.cluster(cluster)?;
        if !profile.supports(ide) {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::UNKNOWN_IDE,
                format!("Unknown IDE: {ide}"),
            )
            .with_context(format!("cluster {cluster}")));
        }
        SessionKey::new(user, cluster, ide)
    }

    /// Starts (or resumes) an IDE session and returns a browser URL once its tunnel is up.
    pub async fn launch(
        &self,
        user: &str,
        cluster: &str,
        ide: Ide,
        resources: JobResources,
    ) -> AppResult<LaunchOutcome> {
        let key = self.session_key(user, cluster, ide)?;
        job_script::validate_resources(&resources, self.catalog.cluster(cluster)?)?;
        let _claim = self.claim(&key)?;

        if let Some(outcome) = self.reuse_running(&key).await? {
            debug!(session = %key, "reusing running session");
            return Ok(outcome);
        }

        let scheduler = self.scheduler(&key)?;
        let stored = self.store.get_active_session(&key).await?;
        let mut session = match scheduler.get_job_info(ide).await? {
            Some(job) if job.state.is_live() => {
                info!(session = %key, job_id = %job.job_id, state = %job.state, "adopting existing job");
                match stored {
                    Some(previous) if previous.job_id.as_deref() == Some(job.job_id.as_str()) => {
                        previous
                    }
                    _ => ActiveSession::submitted(
                        key.clone(),
                        job.job_id,
                        None,
                        resources,
                        self.clock.now_utc(),
                    ),
                }
            }
            _ => {
                let submitted = scheduler.submit_job(&resources, ide).await?;
                ActiveSession::submitted(
                    key.clone(),
                    submitted.job_id,
                    submitted.token,
                    resources,
                    self.clock.now_utc(),
                )
            }
        };
        self.store.save_active_session(&session).await?;

        match self.bring_up(&scheduler, &mut session).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.record_failure(&key, &err).await;
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        scheduler: &SlurmScheduler,
        session: &mut ActiveSession,
    ) -> AppResult<LaunchOutcome> {
        let key = session.key.clone();
        let ide = key.ide();
        let job_id = session
            .job_id
            .clone()
            .ok_or_else(|| AppError::internal(format!("session {key} has no job id")))?;

        let node = match scheduler.wait_for_node(&job_id, ide, self.node_wait).await? {
            NodeWait::Assigned { node } => node,
            NodeWait::Pending { .. } => {
                debug!(session = %key, %job_id, "job still pending");
                return Ok(LaunchOutcome::Pending {
                    session: session.clone(),
                });
            }
        };
        session.status = SessionStatus::Starting;
        session.node = Some(node.clone());
        self.store
            .update_active_session(
                &key,
                &SessionPatch {
                    status: Some(SessionStatus::Starting),
                    node: Some(node.clone()),
                    ..SessionPatch::default()
                },
            )
            .await?;

        let remote_port = scheduler.get_ide_port(ide).await?;
        let tunnel = self
            .tunnels
            .start(&key, &node, Some(remote_port), self.on_tunnel_exit(&key))
            .await?;

        let now = self.clock.now_utc();
        session.status = SessionStatus::Running;
        session.local_port = Some(tunnel.local_port);
        session.remote_port = Some(tunnel.remote_port);
        session.started_at = Some(session.started_at.unwrap_or(now));
        session.last_activity = now;
        session.error_message = None;
        self.store.save_active_session(session).await?;

        let profile = self.catalog.ide(ide)?;
        let url = ides::session_url(profile, tunnel.local_port, session.token.as_deref());
        let proxy_port = self.companion_proxy_port(scheduler, ide).await?;
        info!(session = %key, %node, local_port = tunnel.local_port, proxy_port = ?proxy_port, "session running");
        Ok(LaunchOutcome::Running {
            session: session.clone(),
            url,
            proxy_port,
        })
    }

    async fn companion_proxy_port(
        &self,
        scheduler: &SlurmScheduler,
        ide: Ide,
    ) -> AppResult<Option<u16>> {
        if self.catalog.ide(ide)?.proxy.is_none() {
            return Ok(None);
        }
        let port = scheduler.get_proxy_port().await;
        if port.is_none() {
            warn!(cluster = scheduler.cluster(), %ide, "companion proxy reported no port");
        }
        Ok(port)
    }

    async fn reuse_running(&self, key: &SessionKey) -> AppResult<Option<LaunchOutcome>> {
        let Some(tunnel) = self.tunnels.get_tunnel(key) else {
            return Ok(None);
        };
        if tunnel.state != TunnelState::Active {
            return Ok(None);
        }
        match self.store.get_active_session(key).await? {
            Some(session) if session.status == SessionStatus::Running => {
                let profile = self.catalog.ide(key.ide())?;
                let url = ides::session_url(profile, tunnel.local_port, session.token.as_deref());
                let scheduler = self.scheduler(key)?;
                let proxy_port = self.companion_proxy_port(&scheduler, key.ide()).await?;
                Ok(Some(LaunchOutcome::Running {
                    session,
                    url,
                    proxy_port,
                }))
            }
            _ => Ok(None),
        }
    }

    fn on_tunnel_exit(&self, key: &SessionKey) -> impl FnOnce(Option<i32>) + Send + 'static {
        let store = self.store.clone();
        let key = key.clone();
        move |code| {
            tokio::spawn(async move {
                match store.get_active_session(&key).await {
                    Ok(Some(session)) if session.status == SessionStatus::Running => {
                        warn!(session = %key, exit_code = ?code, "tunnel exited, session disconnected");
                        let patch = SessionPatch {
                            status: Some(SessionStatus::Disconnected),
                            ..SessionPatch::default()
                        };
                        if let Err(err) = store.update_active_session(&key, &patch).await {
                            warn!(session = %key, error = %err, "could not mark session disconnected");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(session = %key, error = %err, "could not load session after tunnel exit");
                    }
                }
            });
        }
    }

    async fn record_failure(&self, key: &SessionKey, err: &AppError) {
        warn!(session = %key, code = err.code(), error = %err, "launch failed");
        let patch = SessionPatch {
            status: Some(SessionStatus::Error),
            error_message: Some(err.message().to_string()),
            ..SessionPatch::default()
        };
        if let Err(store_err) = self.store.update_active_session(key, &patch).await {
            warn!(session = %key, error = %store_err, "could not record launch failure");
        }
    }

    /// Cancels the job, then tears the tunnel down, and archives whatever was stored.
    pub async fn stop(&self, user: &str, cluster: &str, ide: Ide) -> AppResult<StopOutcome> {
        let key = self.session_key(user, cluster, ide)?;
        let _claim = self.claim(&key)?;
        let scheduler = self.scheduler(&key)?;

        let session = self.store.get_active_session(&key).await?;
        let job_id = match session.as_ref().and_then(|s| s.job_id.clone()) {
            Some(job_id) => Some(job_id),
            None => scheduler.get_job_info(ide).await?.map(|job| job.job_id),
        };
        if session.is_none() && job_id.is_none() && !self.tunnels.is_active(&key) {
            return Err(AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("No session found for {key}"),
            ));
        }

        let cancel_error = match &job_id {
            Some(job_id) => {
                let outcome = scheduler.cancel_job(job_id).await;
                (!outcome.failed.is_empty()).then(|| format!("Failed to cancel job {job_id}"))
            }
            None => None,
        };
        let tunnel_stopped = self.tunnels.stop(&key).await;

        let history_id = match &session {
            Some(session) => {
                let reason = match cancel_error {
                    Some(_) => EndReason::Error,
                    None => EndReason::UserStopped,
                };
                let id = self
                    .store
                    .archive_session(session, &reason, cancel_error.as_deref())
                    .await?;
                self.store.delete_active_session(&key).await?;
                Some(id)
            }
            None => None,
        };
        info!(
            session = %key,
            job_id = ?job_id,
            job_cancelled = cancel_error.is_none(),
            tunnel_stopped,
            "session stopped"
        );
        Ok(StopOutcome {
            job_cancelled: job_id.is_some() && cancel_error.is_none(),
            job_id,
            tunnel_stopped,
            history_id,
        })
    }

    pub async fn heartbeat(&self, key: &SessionKey) -> AppResult<()> {
        let patch = SessionPatch {
            last_activity: Some(self.clock.now_utc()),
            ..SessionPatch::default()
        };
        if self.store.update_active_session(key, &patch).await? {
            Ok(())
        } else {
            Err(session_not_found(key))
        }
    }

    pub async fn mark_dev_server_used(&self, key: &SessionKey) -> AppResult<()> {
        if self.store.mark_dev_server_used(key).await? {
            Ok(())
        } else {
            Err(session_not_found(key))
        }
    }

    pub async fn list_sessions(&self, user: Option<&str>) -> AppResult<Vec<SessionView>> {
        let sessions = match user {
            Some(user) => self.store.get_active_sessions_for_user(user).await?,
            None => self.store.get_all_active_sessions().await?,
        };
        Ok(sessions
            .into_iter()
            .map(|session| {
                let tunnel = self.tunnels.get_tunnel(&session.key);
                let url = tunnel
                    .as_ref()
                    .filter(|tunnel| tunnel.state == TunnelState::Active)
                    .and_then(|tunnel| {
                        let profile = self.catalog.ide(session.key.ide()).ok()?;
                        Some(ides::session_url(
                            profile,
                            tunnel.local_port,
                            session.token.as_deref(),
                        ))
                    });
                SessionView {
                    session,
                    tunnel,
                    url,
                }
            })
            .collect())
    }

    pub async fn history(
        &self,
        user: Option<&str>,
        days: u32,
        limit: Option<u32>,
    ) -> AppResult<Vec<HistoryRecord>> {
        validate_days(days)?;
        self.store.get_session_history(user, days, limit).await
    }

    pub async fn history_count(&self, user: Option<&str>, days: u32) -> AppResult<u64> {
        validate_days(days)?;
        self.store.get_session_history_count(user, days).await
    }

    /// Cached snapshot for `cluster`. Stale data is returned as-is while one background
    /// refresh runs; only an empty entry is fetched inline.
    pub async fn cluster_health(&self, cluster: &str) -> AppResult<HealthView> {
        self.catalog.cluster(cluster)?;
        let read = self.health.get(cluster);
        if !read.valid {
            match (read.data.is_some(), self.claim_refresh(cluster)) {
                (_, None) => {}
                (true, Some(claim)) => {
                    let this = self.clone();
                    let cluster = cluster.to_string();
                    tokio::spawn(async move {
                        if let Err(err) = this.refresh_health(&cluster).await {
                            warn!(%cluster, error = %err, "health refresh failed");
                        }
                        drop(claim);
                    });
                }
                (false, Some(claim)) => {
                    let result = self.refresh_health(cluster).await;
                    drop(claim);
                    result?;
                    return Ok(self.health_view(cluster));
                }
            }
        }
        Ok(health_view(cluster, read))
    }

    fn health_view(&self, cluster: &str) -> HealthView {
        health_view(cluster, self.health.get(cluster))
    }

    async fn refresh_health(&self, cluster: &str) -> AppResult<()> {
        let scheduler = SlurmScheduler::new(
            self.catalog.clone(),
            cluster,
            None,
            self.remote.clone(),
            self.queue.clone(),
            self.clock.clone(),
        )?;
        let health = scheduler.cluster_health().await?;
        self.health.set(cluster, health);
        debug!(%cluster, "health refreshed");
        Ok(())
    }

    /// Archives sessions whose job is gone or finished. One status query per cluster and user.
    pub async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let sessions = self.store.get_all_active_sessions().await?;
        let mut groups: BTreeMap<(String, String), Vec<ActiveSession>> = BTreeMap::new();
        for session in sessions {
            groups
                .entry((
                    session.key.cluster().to_string(),
                    session.key.user().to_string(),
                ))
                .or_default()
                .push(session);
        }

        let mut report = ReconcileReport::default();
        for ((cluster, user), sessions) in groups {
            let scheduler = match SlurmScheduler::new(
                self.catalog.clone(),
                &cluster,
                Some(&user),
                self.remote.clone(),
                self.queue.clone(),
                self.clock.clone(),
            ) {
                Ok(scheduler) => scheduler,
                Err(err) => {
                    warn!(%cluster, error = %err, "skipping sessions for unknown cluster");
                    report.skipped_clusters.push(cluster);
                    continue;
                }
            };
            let jobs = match scheduler.get_all_jobs().await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(%cluster, %user, error = %err, "job status unavailable, skipping");
                    report.skipped_clusters.push(cluster);
                    continue;
                }
            };

            for session in sessions {
                report.checked += 1;
                let Some(job_id) = session.job_id.clone() else {
                    continue;
                };
                let current = jobs.get(&session.key.ide()).cloned().flatten();
                let reason = match current {
                    Some(job) if job.job_id == job_id && !job.state.is_terminal() => continue,
                    Some(job) if job.job_id == job_id => EndReason::from_job_state(&job.state),
                    _ => EndReason::JobEnded,
                };
                // A launch or stop in progress owns the session.
                let Ok(_claim) = self.claim(&session.key) else {
                    continue;
                };
                self.tunnels.stop(&session.key).await;
                self.store.archive_session(&session, &reason, None).await?;
                self.store.delete_active_session(&session.key).await?;
                info!(session = %session.key, %job_id, reason = reason.as_str(), "session ended");
                report.ended.push(session.key.to_string());
            }
        }
        Ok(report)
    }

    fn scheduler(&self, key: &SessionKey) -> AppResult<SlurmScheduler> {
        SlurmScheduler::new(
            self.catalog.clone(),
            key.cluster(),
            Some(key.user()),
            self.remote.clone(),
            self.queue.clone(),
            self.clock.clone(),
        )
    }

    fn claim(&self, key: &SessionKey) -> AppResult<Claim> {
        Claim::acquire(&self.in_flight, key.to_string()).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Conflict,
                codes::CONFLICT,
                format!("An operation for {key} is already in progress"),
            )
        })
    }

    fn claim_refresh(&self, cluster: &str) -> Option<Claim> {
        Claim::acquire(&self.refreshing, cluster.to_string())
    }
}

fn health_view(cluster: &str, read: crate::app::health_cache::CacheRead<ClusterHealth>) -> HealthView {
    HealthView {
        cluster: cluster.to_string(),
        health: read.data,
        valid: read.valid,
        age_seconds: read.data.map(|_| read.age.as_secs()),
    }
}

fn session_not_found(key: &SessionKey) -> AppError {
    AppError::with_message(
        AppErrorKind::NotFound,
        codes::NOT_FOUND,
        format!("No active session for {key}"),
    )
}

fn validate_days(days: u32) -> AppResult<()> {
    if days == 0 {
        return Err(AppError::invalid_argument("days must be at least 1"));
    }
    Ok(())
}
