// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::NetworkProbePort;

mod reachability;

#[derive(Clone)]
pub struct NetworkAdapter {
    http: reqwest::Client,
}

impl NetworkAdapter {
    pub fn new() -> AppResult<Self> {
        let http = reachability::http_client().map_err(map_net_error)?;
        Ok(Self { http })
    }
}

fn map_net_error(err: reachability::NetError) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::NETWORK_ERROR,
        err.to_string(),
    )
}

#[async_trait]
impl NetworkProbePort for NetworkAdapter {
    async fn check_local_port(&self, port: u16) -> AppResult<bool> {
        Ok(reachability::is_local_port_open(port).await)
    }

    async fn local_port_in_use(&self, port: u16) -> bool {
        reachability::is_local_port_bound(port).await
    }

    async fn check_http_ready(&self, url: &str) -> AppResult<bool> {
        reachability::is_http_ready(&self.http, url)
            .await
            .map_err(map_net_error)
    }
}
