// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::adapters::ssh::args;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{DiagnosticStream, TunnelProcess, TunnelSpawnPort, TunnelSpec};

/// Spawns `ssh -N -L ...` forwarders.
#[derive(Clone)]
pub struct SshTunnelSpawner {
    program: String,
}

impl SshTunnelSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshTunnelSpawner {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl TunnelSpawnPort for SshTunnelSpawner {
    fn spawn(&self, spec: &TunnelSpec) -> AppResult<Box<dyn TunnelProcess>> {
        let child = Command::new(&self.program)
            .args(args::tunnel_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::LOCAL_ERROR,
                    format!("could not start tunnel: {e}"),
                )
            })?;
        Ok(Box::new(SshTunnel { child }))
    }
}

struct SshTunnel {
    child: Child,
}

#[async_trait]
impl TunnelProcess for SshTunnel {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stderr(&mut self) -> Option<DiagnosticStream> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::pin(stderr) as DiagnosticStream)
    }

    async fn wait(&mut self) -> AppResult<Option<i32>> {
        let status = self.child.wait().await.map_err(|e| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::LOCAL_ERROR,
                format!("waiting for tunnel failed: {e}"),
            )
        })?;
        Ok(status.code())
    }

    fn start_kill(&mut self) -> AppResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::LOCAL_ERROR,
                format!("could not stop tunnel: {e}"),
            )),
        }
    }
}
