// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::ops::RangeInclusive;

use tera::Context;

use crate::app::errors::{AppError, AppResult};
use crate::app::services::{ides, shell, slurm};
use crate::app::types::{ClusterProfile, IdeProfile, JobResources};

const HEREDOC_MARKER: &str = "PORTAL_JOB_EOF";
const JOB_SCRIPT_TEMPLATE: &str = include_str!("job_script.sh.tera");

pub struct ScriptInput<'a> {
    pub cluster: &'a ClusterProfile,
    pub profile: &'a IdeProfile,
    pub job_name: &'a str,
    pub resources: &'a JobResources,
    pub token: Option<&'a str>,
    pub port_range: RangeInclusive<u16>,
}

/// Rejects resource requests the scheduler would refuse, before any remote call.
pub fn validate_resources(resources: &JobResources, cluster: &ClusterProfile) -> AppResult<()> {
    if resources.cpus == 0 || resources.cpus > cluster.max_cpus {
        return Err(AppError::invalid_argument(format!(
            "cpus must be between 1 and {} on {}",
            cluster.max_cpus, cluster.name
        )));
    }
    match slurm::parse_memory_mb(&resources.memory) {
        Some(mb) if mb > 0 => {}
        _ => {
            return Err(AppError::invalid_argument(format!(
                "invalid memory '{}'",
                resources.memory
            )));
        }
    }
    match slurm::parse_slurm_duration(&resources.time) {
        Some(limit) if !limit.is_zero() => {}
        _ => {
            return Err(AppError::invalid_argument(format!(
                "invalid time limit '{}'",
                resources.time
            )));
        }
    }
    for (label, value) in [
        ("gpu type", resources.gpu_type.as_deref()),
        ("release", resources.release.as_deref()),
    ] {
        if let Some(value) = value {
            if !shell::is_shell_safe(value) {
                return Err(AppError::invalid_argument(format!(
                    "invalid {label} '{value}'"
                )));
            }
        }
    }
    Ok(())
}

/// Renders the sbatch script for one ide submission.
pub fn render_job_script(input: &ScriptInput<'_>) -> AppResult<String> {
    let profile = input.profile;
    let resources = input.resources;
    let token = input
        .token
        .filter(|_| profile.uses_token)
        .map(shell::sh_escape);

    let mut context = Context::new();
    context.insert("job_name", input.job_name);
    context.insert("cpus", &resources.cpus);
    context.insert("memory", resources.memory.trim());
    context.insert("time", resources.time.trim());
    context.insert("partition", &input.cluster.partition);
    context.insert("gpu_type", &resources.gpu_type);
    context.insert("release", &resources.release);
    context.insert("portal_dir", ides::PORTAL_DIR);
    context.insert("ide", profile.ide.as_str());
    context.insert("port_start", input.port_range.start());
    context.insert("port_end", input.port_range.end());
    context.insert("token", &token);
    context.insert("setup", &profile.setup);
    context.insert(
        "working_dir",
        &profile.working_dir.as_deref().map(shell::sh_escape),
    );
    context.insert("proxy", &profile.proxy);
    context.insert("proxy_port_file", ides::PROXY_PORT_FILE);
    context.insert("proxy_status_file", ides::PROXY_STATUS_FILE);
    context.insert("launch", &profile.launch);

    tera::Tera::one_off(JOB_SCRIPT_TEMPLATE, &context, false).map_err(|err| {
        AppError::internal(format!(
            "job script render failed for {}: {err}",
            input.job_name
        ))
    })
}

/// Wraps a job script into a single remote `sbatch` invocation fed by a quoted heredoc.
pub fn submit_command(script: &str) -> String {
    format!(
        "mkdir -p ~/{}/logs && sbatch <<'{HEREDOC_MARKER}'\n{}\n{HEREDOC_MARKER}",
        ides::PORTAL_DIR,
        script.trim_end()
    )
}
