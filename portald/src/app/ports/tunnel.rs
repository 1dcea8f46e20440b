// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::app::errors::AppResult;
use crate::app::types::SshConfig;

pub type DiagnosticStream = Pin<Box<dyn AsyncRead + Send>>;

/// `-o` value carried by every forwarder this daemon spawns.
pub const FORWARDER_MARKER: &str = "SetEnv=PORTAL_TUNNEL=1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub ssh: SshConfig,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// A running forwarding process.
#[async_trait]
pub trait TunnelProcess: Send {
    fn pid(&self) -> Option<u32>;
    /// Diagnostic output; can be taken once.
    fn take_stderr(&mut self) -> Option<DiagnosticStream>;
    /// Resolves with the exit code once the process is gone; `None` when killed by a signal.
    /// Must be cancel safe.
    async fn wait(&mut self) -> AppResult<Option<i32>>;
    fn start_kill(&mut self) -> AppResult<()>;
}

pub trait TunnelSpawnPort: Send + Sync {
    fn spawn(&self, spec: &TunnelSpec) -> AppResult<Box<dyn TunnelProcess>>;
}
