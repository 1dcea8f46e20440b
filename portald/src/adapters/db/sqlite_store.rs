// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::adapters::db::{SessionStore, SessionStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, SessionStorePort};
use crate::app::types::{ActiveSession, EndReason, HistoryRecord, SessionKey, SessionPatch};

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<SessionStore>,
    clock: Arc<dyn ClockPort>,
}

impl SqliteStoreAdapter {
    pub fn new(store: SessionStore, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            store: Arc::new(store),
            clock,
        }
    }

    fn window_start(&self, days: u32) -> OffsetDateTime {
        self.clock.now_utc() - time::Duration::days(i64::from(days))
    }
}

/// Keeps sqlx and row-decoding details out of the app core.
fn map_store_error(err: SessionStoreError) -> AppError {
    match err {
        SessionStoreError::Sqlx(e) => {
            AppError::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, e.to_string())
        }
        SessionStoreError::InvalidTimestamp(_) | SessionStoreError::InvalidRow(_) => {
            AppError::with_message(AppErrorKind::Internal, codes::PARSE_ERROR, err.to_string())
        }
    }
}

#[async_trait]
impl SessionStorePort for SqliteStoreAdapter {
    async fn save_active_session(&self, session: &ActiveSession) -> AppResult<()> {
        self.store
            .save_active_session(session)
            .await
            .map_err(map_store_error)
    }

    async fn get_active_session(&self, key: &SessionKey) -> AppResult<Option<ActiveSession>> {
        self.store
            .get_active_session(key)
            .await
            .map_err(map_store_error)
    }

    async fn update_active_session(
        &self,
        key: &SessionKey,
        patch: &SessionPatch,
    ) -> AppResult<bool> {
        self.store
            .update_active_session(key, patch)
            .await
            .map_err(map_store_error)
    }

    async fn mark_dev_server_used(&self, key: &SessionKey) -> AppResult<bool> {
        self.store
            .mark_dev_server_used(key)
            .await
            .map_err(map_store_error)
    }

    async fn get_all_active_sessions(&self) -> AppResult<Vec<ActiveSession>> {
        self.store
            .list_active_sessions(None)
            .await
            .map_err(map_store_error)
    }

    async fn get_active_sessions_for_user(&self, user: &str) -> AppResult<Vec<ActiveSession>> {
        self.store
            .list_active_sessions(Some(user))
            .await
            .map_err(map_store_error)
    }

    async fn delete_active_session(&self, key: &SessionKey) -> AppResult<bool> {
        self.store
            .delete_active_session(key)
            .await
            .map_err(map_store_error)
    }

    async fn archive_session(
        &self,
        session: &ActiveSession,
        end_reason: &EndReason,
        error_message: Option<&str>,
    ) -> AppResult<i64> {
        self.store
            .archive_session(
                session,
                end_reason.as_str(),
                error_message,
                self.clock.now_utc(),
            )
            .await
            .map_err(map_store_error)
    }

    async fn get_session_history(
        &self,
        user: Option<&str>,
        days: u32,
        limit: Option<u32>,
    ) -> AppResult<Vec<HistoryRecord>> {
        self.store
            .get_session_history(user, self.window_start(days), limit)
            .await
            .map_err(map_store_error)
    }

    async fn get_session_history_count(&self, user: Option<&str>, days: u32) -> AppResult<u64> {
        self.store
            .get_session_history_count(user, self.window_start(days))
            .await
            .map_err(map_store_error)
    }
}
