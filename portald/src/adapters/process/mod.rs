// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill as send_unix_signal};
use nix::unistd::Pid;
use tokio::process::Command;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ProcessEntry, ProcessTablePort};

/// Local process table read through `ps`.
#[derive(Clone, Default)]
pub struct PsProcessTable;

impl PsProcessTable {
    pub fn new() -> Self {
        Self
    }
}

fn local_error(message: String) -> AppError {
    AppError::with_message(AppErrorKind::Internal, codes::LOCAL_ERROR, message)
}

pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                args: args.trim().to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ProcessTablePort for PsProcessTable {
    async fn list_processes(&self) -> AppResult<Vec<ProcessEntry>> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .output()
            .await
            .map_err(|e| local_error(format!("could not run ps: {e}")))?;
        if !output.status.success() {
            return Err(local_error(format!(
                "ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn terminate(&self, pid: u32) -> AppResult<()> {
        let raw = i32::try_from(pid).map_err(|_| local_error(format!("invalid pid {pid}")))?;
        match send_unix_signal(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            Err(err) if err == Errno::ESRCH => Ok(()),
            Err(err) => Err(local_error(format!(
                "failed to send SIGTERM to pid {pid}: {err}"
            ))),
        }
    }
}
