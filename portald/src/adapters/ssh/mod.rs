// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteExecPort};
use crate::app::types::SshConfig;

pub mod args;

/// Exit status the OpenSSH client uses for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;
const AUTH_FAILURE_MARKERS: [&str; 4] = [
    "Permission denied",
    "Host key verification failed",
    "Too many authentication failures",
    "no matching host key type",
];

/// Remote execution through the system `ssh` client.
#[derive(Clone)]
pub struct SshAdapter {
    program: String,
    timeout: Duration,
}

impl SshAdapter {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new("ssh", Duration::from_secs(60))
    }
}

fn map_spawn_error(err: std::io::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::LOCAL_ERROR,
        format!("could not run ssh: {err}"),
    )
}

fn map_client_failure(config: &SshConfig, stderr: &str) -> AppError {
    let code = if AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
    {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::CONNECTION_FAILURE
    };
    let detail = stderr.trim();
    AppError::with_message(
        AppErrorKind::Aborted,
        code,
        format!("ssh connect failed: {detail}"),
    )
    .with_context(format!("{}:{}", config.host, config.port))
}

#[async_trait]
impl RemoteExecPort for SshAdapter {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, config, command),
        fields(op = "exec_capture", host = %config.host, user = ?config.username, port = config.port)
    )]
    async fn exec_capture(&self, config: &SshConfig, command: &str) -> AppResult<ExecCapture> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args::exec_args(config, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(map_spawn_error)?,
            Err(_) => {
                return Err(AppError::with_message(
                    AppErrorKind::Timeout,
                    codes::TIMEOUT,
                    format!("remote command timed out after {}s", self.timeout.as_secs()),
                )
                .with_context(format!("{}:{}", config.host, config.port)));
            }
        };
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_CLIENT_FAILURE {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(map_client_failure(config, &stderr));
        }
        tracing::debug!(exit_code, "remote command finished");
        Ok(ExecCapture {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SshConfig {
        SshConfig {
            host: "gemini.example.org".into(),
            port: 22,
            username: Some("bob".into()),
            identity_path: None,
            options: Vec::new(),
        }
    }

    #[test]
    fn client_failures_distinguish_authentication() {
        let err = map_client_failure(&config(), "bob@gemini: Permission denied (publickey).\n");
        assert_eq!(err.code(), codes::AUTHENTICATION_FAILURE);
        assert_eq!(err.kind(), AppErrorKind::Aborted);

        let err = map_client_failure(&config(), "ssh: connect to host gemini port 22: No route");
        assert_eq!(err.code(), codes::CONNECTION_FAILURE);
        assert_eq!(err.context(), Some("gemini.example.org:22"));
    }

    #[tokio::test]
    async fn missing_client_binary_is_a_local_error() {
        let adapter = SshAdapter::new("/nonexistent/portal-ssh", Duration::from_secs(1));
        let err = adapter.exec_capture(&config(), "true").await.unwrap_err();
        assert_eq!(err.code(), codes::LOCAL_ERROR);
    }
}
