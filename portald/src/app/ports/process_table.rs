// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub args: String,
}

#[async_trait]
/// Local process table, used to find forwarders left over from a previous run.
pub trait ProcessTablePort: Send + Sync {
    async fn list_processes(&self) -> AppResult<Vec<ProcessEntry>>;
    fn terminate(&self, pid: u32) -> AppResult<()>;
}
