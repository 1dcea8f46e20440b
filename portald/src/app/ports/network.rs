// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[async_trait]
pub trait NetworkProbePort: Send + Sync {
    /// Whether something accepts TCP connections on `127.0.0.1:port`.
    async fn check_local_port(&self, port: u16) -> AppResult<bool>;
    /// Whether `127.0.0.1:port` is already bound by another listener.
    async fn local_port_in_use(&self, port: u16) -> bool;
    /// Whether an HTTP server answers `url` with a non-5xx status.
    async fn check_http_ready(&self, url: &str) -> AppResult<bool>;
}
