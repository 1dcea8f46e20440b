// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{ActiveSession, EndReason, HistoryRecord, SessionKey, SessionPatch};

#[async_trait]
pub trait SessionStorePort: Send + Sync {
    /// Insert or replace the active row for `session.key`.
    async fn save_active_session(&self, session: &ActiveSession) -> AppResult<()>;
    async fn get_active_session(&self, key: &SessionKey) -> AppResult<Option<ActiveSession>>;
    /// Returns false when no active row exists for `key`.
    async fn update_active_session(&self, key: &SessionKey, patch: &SessionPatch)
    -> AppResult<bool>;
    async fn mark_dev_server_used(&self, key: &SessionKey) -> AppResult<bool>;
    async fn get_all_active_sessions(&self) -> AppResult<Vec<ActiveSession>>;
    async fn get_active_sessions_for_user(&self, user: &str) -> AppResult<Vec<ActiveSession>>;
    async fn delete_active_session(&self, key: &SessionKey) -> AppResult<bool>;
    /// Writes one history row derived from `session`; does not touch the active row.
    async fn archive_session(
        &self,
        session: &ActiveSession,
        end_reason: &EndReason,
        error_message: Option<&str>,
    ) -> AppResult<i64>;
    /// Newest first, limited to rows archived within `days`.
    async fn get_session_history(
        &self,
        user: Option<&str>,
        days: u32,
        limit: Option<u32>,
    ) -> AppResult<Vec<HistoryRecord>>;
    async fn get_session_history_count(&self, user: Option<&str>, days: u32) -> AppResult<u64>;
}
