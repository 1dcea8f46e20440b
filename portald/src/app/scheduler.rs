// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app::command_queue::CommandQueue;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, ExecCapture, RemoteExecPort};
use crate::app::services::job_script::{self, ScriptInput};
use crate::app::services::{ides, random, slurm};
use crate::app::types::{
    CancelOutcome, Catalog, ClusterHealth, ClusterProfile, Ide, IdeProfile, Job, JobResources,
    JobState, NodeWait, SshConfig, SubmittedJob, WaitOptions,
};

/// Slurm front end for a single cluster.
///
/// Every remote call goes through the shared [`CommandQueue`] keyed by the cluster name.
#[derive(Clone)]
pub struct SlurmScheduler {
    catalog: Arc<Catalog>,
    cluster: ClusterProfile,
    ssh: SshConfig,
    remote: Arc<dyn RemoteExecPort>,
    queue: CommandQueue,
    clock: Arc<dyn ClockPort>,
}

impl SlurmScheduler {
    /// A username in the cluster profile wins over `user`.
    pub fn new(
        catalog: Arc<Catalog>,
        cluster: &str,
        user: Option<&str>,
        remote: Arc<dyn RemoteExecPort>,
        queue: CommandQueue,
        clock: Arc<dyn ClockPort>,
    ) -> AppResult<Self> {
        let cluster = catalog.cluster(cluster)?.clone();
        let mut ssh = cluster.ssh.clone();
        if ssh.username.is_none() {
            ssh.username = user.map(str::to_string);
        }
        Ok(Self {
            catalog,
            cluster,
            ssh,
            remote,
            queue,
            clock,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster.name
    }

    /// Current portal job for `ide`, if any. Remote failures read as "no job".
    ///
    /// When a finishing job and a fresh one share the job name, the fresh one wins.
    pub async fn get_job_info(&self, ide: Ide) -> AppResult<Option<Job>> {
        let mut records = self.job_records(ide).await?;
        match records.iter().position(|job| job.state.is_live()) {
            Some(index) => Ok(Some(records.swap_remove(index))),
            None => Ok(records.into_iter().next()),
        }
    }

    async fn job_records(&self, ide: Ide) -> AppResult<Vec<Job>> {
        self.ide_profile(ide)?;
        let command = slurm::squeue_command(&[self.catalog.job_name(ide)]);
        let capture = match self.exec(command).await {
            Ok(capture) if capture.exit_code == 0 => capture,
            Ok(capture) => {
                debug!(
                    cluster = %self.cluster.name,
                    %ide,
                    exit_code = capture.exit_code,
                    stderr = %capture.stderr_text().trim(),
                    "squeue failed"
                );
                return Ok(Vec::new());
            }
            Err(err) => {
                debug!(cluster = %self.cluster.name, %ide, error = %err, "squeue unavailable");
                return Ok(Vec::new());
            }
        };
        Ok(capture
            .stdout_text()
            .lines()
            .filter_map(|line| slurm::parse_job_record(ide, line))
            .collect())
    }

    /// One status query covering every ide the cluster offers.
    pub async fn get_all_jobs(&self) -> AppResult<BTreeMap<Ide, Option<Job>>> {
        let offered = self.cluster.ides.clone();
        let names: Vec<String> = offered
            .iter()
            .map(|ide| self.catalog.job_name(*ide))
            .collect();
        let mut jobs: BTreeMap<Ide, Option<Job>> =
            offered.iter().map(|ide| (*ide, None)).collect();
        if names.is_empty() {
            return Ok(jobs);
        }

        let capture = self.exec(slurm::squeue_command(&names)).await?;
        if capture.exit_code != 0 {
            return Err(self.remote_failure("squeue", &capture));
        }
        let stdout = capture.stdout_text();
        for line in stdout.lines() {
            // A single name is queried without the job-name column.
            let job = match offered.as_slice() {
                [only] => slurm::parse_job_record(*only, line),
                _ => slurm::parse_named_job_record(line, |name| {
                    offered
                        .iter()
                        .copied()
                        .find(|ide| self.catalog.job_name(*ide) == name)
                }),
            };
            if let Some(job) = job {
                let slot = jobs.entry(job.ide).or_insert(None);
                let replace = match slot.as_ref() {
                    None => true,
                    Some(current) => !current.state.is_live() && job.state.is_live(),
                };
                if replace {
                    *slot = Some(job);
                }
            }
        }
        Ok(jobs)
    }

    pub async fn submit_job(&self, resources: &JobResources, ide: Ide) -> AppResult<SubmittedJob> {
        let profile = self.ide_profile(ide)?.clone();
        job_script::validate_resources(resources, &self.cluster)?;

        let token = profile.uses_token.then(random::generate_job_token);
        let job_name = self.catalog.job_name(ide);
        let script = job_script::render_job_script(&ScriptInput {
            cluster: &self.cluster,
            profile: &profile,
            job_name: &job_name,
            resources,
            token: token.as_deref(),
            port_range: self.catalog.remote_ports.clone(),
        })?;

        let capture = self.exec(job_script::submit_command(&script)).await?;
        if capture.exit_code != 0 {
            return Err(self.remote_failure("sbatch", &capture));
        }
        let stdout = capture.stdout_text();
        let job_id = slurm::parse_job_id(&stdout).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::PARSE_ERROR,
                "Failed to parse job ID",
            )
            .with_context(format!("sbatch output: {}", stdout.trim()))
        })?;
        info!(cluster = %self.cluster.name, %ide, %job_id, "submitted job");
        Ok(SubmittedJob { job_id, token })
    }

    pub async fn cancel_job(&self, job_id: &str) -> CancelOutcome {
        self.cancel_jobs(Some(&[job_id.to_string()])).await
    }

    /// Cancels all `job_ids` with a single `scancel`; the outcome is all-or-nothing.
    pub async fn cancel_jobs(&self, job_ids: Option<&[String]>) -> CancelOutcome {
        let ids: Vec<String> = job_ids.unwrap_or_default().to_vec();
        if ids.is_empty() {
            return CancelOutcome::default();
        }
        match self.exec(slurm::scancel_command(&ids)).await {
            Ok(capture) if capture.exit_code == 0 => {
                info!(cluster = %self.cluster.name, jobs = ?ids, "cancelled jobs");
                CancelOutcome {
                    cancelled: ids,
                    failed: Vec::new(),
                }
            }
            Ok(capture) => {
                warn!(
                    cluster = %self.cluster.name,
                    jobs = ?ids,
                    stderr = %capture.stderr_text().trim(),
                    "scancel failed"
                );
                CancelOutcome {
                    cancelled: Vec::new(),
                    failed: ids,
                }
            }
            Err(err) => {
                warn!(cluster = %self.cluster.name, jobs = ?ids, error = %err, "scancel failed");
                CancelOutcome {
                    cancelled: Vec::new(),
                    failed: ids,
                }
            }
        }
    }

    pub async fn wait_for_node(
        &self,
        job_id: &str,
        ide: Ide,
        options: WaitOptions,
    ) -> AppResult<NodeWait> {
        for attempt in 1..=options.max_attempts {
            let records = self.job_records(ide).await?;
            let job = match records.into_iter().find(|job| job.job_id == job_id) {
                Some(job) => job,
                None => {
                    return Err(AppError::with_message(
                        AppErrorKind::NotFound,
                        codes::JOB_DISAPPEARED,
                        "Job disappeared",
                    )
                    .with_context(format!("job {job_id} on {}", self.cluster.name)));
                }
            };
            match (&job.state, job.node) {
                (JobState::Running, Some(node)) => {
                    debug!(cluster = %self.cluster.name, %job_id, %node, attempt, "node assigned");
                    return Ok(NodeWait::Assigned { node });
                }
                (state, _) if state.is_terminal() || *state == JobState::Completing => {
                    return Err(AppError::with_message(
                        AppErrorKind::Aborted,
                        codes::JOB_ENDED,
                        format!("Job ended ({state})"),
                    )
                    .with_context(format!("job {job_id} on {}", self.cluster.name)));
                }
                _ => {}
            }
            if attempt < options.max_attempts {
                self.clock.sleep(options.poll_interval).await;
            }
        }
        if options.return_pending_on_timeout {
            return Ok(NodeWait::Pending {
                job_id: job_id.to_string(),
            });
        }
        Err(AppError::with_message(
            AppErrorKind::Timeout,
            codes::TIMEOUT,
            "Timeout waiting for node assignment",
        )
        .with_context(format!("job {job_id} on {}", self.cluster.name)))
    }

    pub async fn check_job_exists(&self, job_id: &str) -> bool {
        match self.exec(slurm::squeue_job_command(job_id)).await {
            Ok(capture) if capture.exit_code == 0 => capture
                .stdout_text()
                .lines()
                .any(|line| line.trim() == job_id),
            _ => false,
        }
    }

    /// Port the job script picked for `ide`, or the ide default when unreadable.
    pub async fn get_ide_port(&self, ide: Ide) -> AppResult<u16> {
        let default_port = self.ide_profile(ide)?.default_port;
        let port = self.read_port_file(&ides::port_file(ide)).await;
        if port.is_none() {
            debug!(cluster = %self.cluster.name, %ide, default_port, "using default ide port");
        }
        Ok(port.unwrap_or(default_port))
    }

    pub async fn get_proxy_port(&self) -> Option<u16> {
        self.read_port_file(&ides::proxy_port_file()).await
    }

    pub async fn cluster_health(&self) -> AppResult<ClusterHealth> {
        let capture = self.exec(slurm::SINFO_HEALTH_CMD.to_string()).await?;
        if capture.exit_code != 0 {
            return Err(self.remote_failure("sinfo", &capture));
        }
        let stdout = capture.stdout_text();
        slurm::parse_sinfo_health(&stdout).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::PARSE_ERROR,
                "Failed to parse cluster status",
            )
            .with_context(format!("sinfo output: {}", stdout.trim()))
        })
    }

    async fn read_port_file(&self, path: &str) -> Option<u16> {
        match self.exec(format!("cat ~/{path} 2>/dev/null")).await {
            Ok(capture) if capture.exit_code == 0 => parse_port(&capture.stdout_text()),
            _ => None,
        }
    }

    fn ide_profile(&self, ide: Ide) -> AppResult<&IdeProfile> {
        if !self.cluster.supports(ide) {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::UNKNOWN_IDE,
                format!("Unknown IDE: {ide}"),
            )
            .with_context(format!("cluster {}", self.cluster.name)));
        }
        self.catalog.ide(ide)
    }

    async fn exec(&self, command: String) -> AppResult<ExecCapture> {
        let remote = self.remote.clone();
        let ssh = self.ssh.clone();
        self.queue
            .run(&self.cluster.name, async move {
                remote.exec_capture(&ssh, &command).await
            })
            .await
    }

    fn remote_failure(&self, what: &str, capture: &ExecCapture) -> AppError {
        let stderr = capture.stderr_text();
        let detail = stderr.trim();
        let message = if detail.is_empty() {
            format!("{what} exited with status {}", capture.exit_code)
        } else {
            format!("{what} failed: {detail}")
        };
        AppError::with_message(AppErrorKind::Aborted, codes::REMOTE_ERROR, message)
            .with_context(format!("cluster {}", self.cluster.name))
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => u16::try_from(port).ok(),
        _ => None,
    }
}
