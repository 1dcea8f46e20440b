// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use crate::app::types::{ClusterHealth, Ide, Job, JobState};

/// `squeue` fields: job id, state, node, time left, time limit, cpus, memory, start time.
pub const SQUEUE_FORMAT: &str = "%i|%T|%N|%L|%l|%C|%m|%S";
/// Same as [`SQUEUE_FORMAT`] prefixed with the job name.
pub const SQUEUE_NAMED_FORMAT: &str = "%j|%i|%T|%N|%L|%l|%C|%m|%S";
/// `sinfo` CPU (A/I/O/T) and node (A/I/O/T) counters.
pub const SINFO_HEALTH_CMD: &str = "sinfo -h -o '%C|%F'";

pub fn squeue_command(job_names: &[String]) -> String {
    if job_names.len() == 1 {
        format!(
            "squeue -h -u $USER -n {} -o '{}'",
            job_names[0], SQUEUE_FORMAT
        )
    } else {
        format!(
            "squeue -h -u $USER -n {} -o '{}'",
            job_names.join(","),
            SQUEUE_NAMED_FORMAT
        )
    }
}

pub fn squeue_job_command(job_id: &str) -> String {
    format!("squeue -h -j {job_id} -o '%i'")
}

pub fn scancel_command(job_ids: &[String]) -> String {
    format!("scancel {}", job_ids.join(" "))
}

/// Maps Slurm's placeholder values to `None`.
pub fn null_if_sentinel(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty()
        || value == "(null)"
        || value.eq_ignore_ascii_case("invalid")
        || value.eq_ignore_ascii_case("n/a")
    {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parses one `SQUEUE_FORMAT` record.
pub fn parse_job_record(ide: Ide, line: &str) -> Option<Job> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 8 {
        return None;
    }
    let job_id = fields[0].trim();
    if job_id.is_empty() {
        return None;
    }
    let time_left = null_if_sentinel(fields[3]);
    let time_left_seconds = time_left
        .as_deref()
        .and_then(parse_slurm_duration)
        .map(|d| d.as_secs());
    Some(Job {
        job_id: job_id.to_string(),
        ide,
        state: JobState::from_scheduler(fields[1]),
        node: null_if_sentinel(fields[2]),
        time_left,
        time_left_seconds,
        time_limit: null_if_sentinel(fields[4]),
        cpus: fields[5].trim().parse::<u32>().ok(),
        memory: null_if_sentinel(fields[6]),
        start_time: null_if_sentinel(fields[7]),
    })
}

/// Parses one `SQUEUE_NAMED_FORMAT` record into the job name and the job.
pub fn parse_named_job_record<F>(line: &str, ide_for_name: F) -> Option<Job>
where
    F: Fn(&str) -> Option<Ide>,
{
    let (name, rest) = line.trim().split_once('|')?;
    let ide = ide_for_name(name.trim())?;
    parse_job_record(ide, rest)
}

/// Parse SLURM durations like "D-HH:MM:SS", "HH:MM:SS" or "MM:SS".
/// Returns None for markers like "UNLIMITED", "NONE", "INVALID" or "N/A".
pub fn parse_slurm_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited")
        || s.eq_ignore_ascii_case("none")
        || s.eq_ignore_ascii_case("invalid")
        || s.eq_ignore_ascii_case("n/a")
        || s.is_empty()
    {
        return None;
    }

    let (days, hms) = if let Some(dash) = s.find('-') {
        let (d, rest) = s.split_at(dash);
        let d: u64 = d.parse().ok()?;
        (d, &rest[1..])
    } else {
        (0, s)
    };

    let parts: Vec<&str> = hms.split(':').collect();
    let numbers: Vec<u64> = parts
        .iter()
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (h, m, sec) = match numbers.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] if days == 0 => (0, *m, *s),
        [h] if days > 0 => (*h, 0, 0),
        _ => return None,
    };
    if m >= 60 || sec >= 60 {
        return None;
    }

    let total = days
        .saturating_mul(24 * 3600)
        .saturating_add(h * 3600)
        .saturating_add(m * 60)
        .saturating_add(sec);

    Some(Duration::from_secs(total))
}

/// Accepts Slurm memory specs such as `4096`, `512M`, `8G` or `1T`.
pub fn parse_memory_mb(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.char_indices().last()? {
        (idx, c) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => return s[..idx].parse::<u64>().ok().map(|kb| kb.div_ceil(1024)),
                'M' => 1,
                'G' => 1024,
                'T' => 1024 * 1024,
                _ => return None,
            };
            (&s[..idx], multiplier)
        }
        _ => (s, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

pub fn parse_job_id(line: &str) -> Option<String> {
    // Expect message from sbatch like: "Submitted batch job 11"
    let marker = "job ";
    line.lines().find_map(|line| {
        let idx = line.find(marker)?;
        let after_job = line[idx + marker.len()..].trim();
        let id: String = after_job
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if id.is_empty() { None } else { Some(id) }
    })
}

/// Parses a `SINFO_HEALTH_CMD` line (`A/I/O/T|A/I/O/T`).
pub fn parse_sinfo_health(output: &str) -> Option<ClusterHealth> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (cpus, nodes) = line.split_once('|')?;
    let cpus = parse_aiot(cpus)?;
    let nodes = parse_aiot(nodes)?;
    Some(ClusterHealth {
        cpus_allocated: cpus[0],
        cpus_idle: cpus[1],
        cpus_other: cpus[2],
        cpus_total: cpus[3],
        nodes_allocated: nodes[0],
        nodes_idle: nodes[1],
        nodes_other: nodes[2],
        nodes_total: nodes[3],
    })
}

fn parse_aiot(value: &str) -> Option<[u64; 4]> {
    let parsed: Vec<u64> = value
        .trim()
        .split('/')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    parsed.try_into().ok()
}

pub fn normalize_slurm_state(state: &str) -> String {
    let token = state
        .split(['+', ':', '(', ' '])
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

pub fn is_slurm_state_terminal(state: &str) -> bool {
    matches!(
        state,
        "COMPLETED"
            | "CANCELLED"
            | "FAILED"
            | "TIMEOUT"
            | "NODE_FAIL"
            | "PREEMPTED"
            | "BOOT_FAIL"
            | "OUT_OF_MEMORY"
            | "DEADLINE"
            | "SPECIAL_EXIT"
            | "REVOKED"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_record() {
        let job = parse_job_record(
            Ide::VsCode,
            "12345|RUNNING|g15|3:59:12|4:00:00|4|16G|2026-03-01T10:00:00",
        )
        .unwrap();
        assert_eq!(job.job_id, "12345");
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.node.as_deref(), Some("g15"));
        assert_eq!(job.time_left_seconds, Some(3 * 3600 + 59 * 60 + 12));
        assert_eq!(job.cpus, Some(4));
        assert_eq!(job.memory.as_deref(), Some("16G"));
    }

    #[test]
    fn pending_record_maps_sentinels_to_none() {
        let job =
            parse_job_record(Ide::Jupyter, "777|PENDING|(null)|INVALID|1-00:00:00|2|8G|N/A")
                .unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.node, None);
        assert_eq!(job.time_left, None);
        assert_eq!(job.time_left_seconds, None);
        assert_eq!(job.start_time, None);
        assert_eq!(job.time_limit.as_deref(), Some("1-00:00:00"));
    }

    #[test]
    fn short_record_is_rejected() {
        assert!(parse_job_record(Ide::VsCode, "12|RUNNING").is_none());
        assert!(parse_job_record(Ide::VsCode, "").is_none());
    }

    #[test]
    fn named_record_resolves_ide() {
        let lookup = |name: &str| match name {
            "portal-rstudio" => Some(Ide::RStudio),
            _ => None,
        };
        let job = parse_named_job_record(
            "portal-rstudio|55|RUNNING|c3|10:00|1:00:00|1|2G|2026-03-01T10:00:00",
            lookup,
        )
        .unwrap();
        assert_eq!(job.ide, Ide::RStudio);
        assert_eq!(job.time_left_seconds, Some(600));
        assert!(
            parse_named_job_record("other-job|56|RUNNING|c3|10:00|1:00:00|1|2G|N/A", lookup)
                .is_none()
        );
    }

    #[test]
    fn parses_durations() {
        assert_eq!(
            parse_slurm_duration("2-03:04:05"),
            Some(Duration::from_secs(2 * 86400 + 3 * 3600 + 4 * 60 + 5))
        );
        assert_eq!(parse_slurm_duration("05:00"), Some(Duration::from_secs(300)));
        assert_eq!(parse_slurm_duration("1-12"), Some(Duration::from_secs(129600)));
        assert_eq!(parse_slurm_duration("UNLIMITED"), None);
        assert_eq!(parse_slurm_duration("INVALID"), None);
        assert_eq!(parse_slurm_duration("1:2:3:4"), None);
        assert_eq!(parse_slurm_duration("00:75:00"), None);
    }

    #[test]
    fn parses_memory_specs() {
        assert_eq!(parse_memory_mb("4096"), Some(4096));
        assert_eq!(parse_memory_mb("8G"), Some(8192));
        assert_eq!(parse_memory_mb("512m"), Some(512));
        assert_eq!(parse_memory_mb("1T"), Some(1024 * 1024));
        assert_eq!(parse_memory_mb("2048K"), Some(2));
        assert_eq!(parse_memory_mb("lots"), None);
        assert_eq!(parse_memory_mb("8X"), None);
        assert_eq!(parse_memory_mb(""), None);
    }

    #[test]
    fn parses_sbatch_acknowledgement() {
        assert_eq!(
            parse_job_id("Submitted batch job 12345\n").as_deref(),
            Some("12345")
        );
        assert_eq!(
            parse_job_id("sbatch: warning: low priority\nSubmitted batch job 9 on cluster gemini")
                .as_deref(),
            Some("9")
        );
        assert_eq!(parse_job_id("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn parses_sinfo_counters() {
        let health = parse_sinfo_health("120/380/0/500|10/30/2/42\n").unwrap();
        assert_eq!(health.cpus_allocated, 120);
        assert_eq!(health.cpus_total, 500);
        assert_eq!(health.nodes_other, 2);
        assert!(parse_sinfo_health("garbage").is_none());
    }

    #[test]
    fn builds_queue_commands() {
        assert_eq!(
            squeue_command(&["portal-vscode".to_string()]),
            "squeue -h -u $USER -n portal-vscode -o '%i|%T|%N|%L|%l|%C|%m|%S'"
        );
        assert_eq!(
            squeue_command(&["portal-vscode".to_string(), "portal-jupyter".to_string()]),
            "squeue -h -u $USER -n portal-vscode,portal-jupyter -o '%j|%i|%T|%N|%L|%l|%C|%m|%S'"
        );
        assert_eq!(
            scancel_command(&["1".into(), "2".into(), "3".into()]),
            "scancel 1 2 3"
        );
    }

    #[test]
    fn normalizes_states() {
        assert_eq!(normalize_slurm_state("CANCELLED by 1000"), "CANCELLED");
        assert_eq!(normalize_slurm_state("completed+"), "COMPLETED");
        assert!(is_slurm_state_terminal("OUT_OF_MEMORY"));
    }
}
