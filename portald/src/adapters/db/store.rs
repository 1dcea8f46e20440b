// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::types::{
    ActiveSession, HistoryRecord, Ide, JobResources, SessionKey, SessionPatch, SessionStatus,
};

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

pub type Result<T> = std::result::Result<T, SessionStoreError>;

/// Active sessions plus the append-only session history.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        self.ensure_active_sessions_table().await?;
        self.ensure_session_history_table().await?;
        Ok(())
    }

    async fn ensure_active_sessions_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_sessions (
            session_key TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            cluster TEXT NOT NULL,
            ide TEXT NOT NULL,
            status TEXT NOT NULL,
            job_id TEXT,
            node TEXT,
            local_port INTEGER,
            remote_port INTEGER,
            token TEXT,
            cpus INTEGER NOT NULL,
            memory TEXT NOT NULL,
            time_limit TEXT NOT NULL,
            gpu_type TEXT,
            release_tag TEXT,
            submitted_at TEXT NOT NULL,
            started_at TEXT,
            last_activity TEXT NOT NULL,
            used_dev_server INTEGER NOT NULL DEFAULT 0,
            error_message TEXT);
            CREATE INDEX IF NOT EXISTS idx_active_sessions_user ON active_sessions(user);
    "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_session_history_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT,
            user TEXT NOT NULL,
            cluster TEXT NOT NULL,
            ide TEXT NOT NULL,
            end_reason TEXT NOT NULL,
            error_message TEXT,
            wait_seconds INTEGER,
            duration_minutes INTEGER,
            cpus INTEGER,
            memory TEXT,
            gpu_type TEXT,
            release_tag TEXT,
            used_dev_server INTEGER NOT NULL DEFAULT 0,
            submitted_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT NOT NULL,
            archived_at_unix INTEGER NOT NULL);
            CREATE INDEX IF NOT EXISTS idx_session_history_user_archived
                ON session_history(user, archived_at_unix);
    "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace the row for `session.key`; `used_dev_server` never goes back to 0.
    pub async fn save_active_session(&self, session: &ActiveSession) -> Result<()> {
        sqlx::query(
            r#"
        insert into active_sessions(
            session_key, user, cluster, ide, status, job_id, node, local_port, remote_port,
            token, cpus, memory, time_limit, gpu_type, release_tag, submitted_at, started_at,
            last_activity, used_dev_server, error_message
        )
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        on conflict(session_key) do update set
            status = excluded.status,
            job_id = excluded.job_id,
            node = excluded.node,
            local_port = excluded.local_port,
            remote_port = excluded.remote_port,
            token = excluded.token,
            cpus = excluded.cpus,
            memory = excluded.memory,
            time_limit = excluded.time_limit,
            gpu_type = excluded.gpu_type,
            release_tag = excluded.release_tag,
            submitted_at = excluded.submitted_at,
            started_at = excluded.started_at,
            last_activity = excluded.last_activity,
            used_dev_server = max(active_sessions.used_dev_server, excluded.used_dev_server),
            error_message = excluded.error_message;
    "#,
        )
        .bind(session.key.to_string())
        .bind(session.key.user())
        .bind(session.key.cluster())
        .bind(session.key.ide().as_str())
        .bind(session.status.as_str())
        .bind(session.job_id.as_deref())
        .bind(session.node.as_deref())
        .bind(session.local_port.map(i64::from))
        .bind(session.remote_port.map(i64::from))
        .bind(session.token.as_deref())
        .bind(i64::from(session.resources.cpus))
        .bind(session.resources.memory.as_str())
        .bind(session.resources.time.as_str())
        .bind(session.resources.gpu_type.as_deref())
        .bind(session.resources.release.as_deref())
        .bind(format_ts(session.submitted_at)?)
        .bind(session.started_at.map(format_ts).transpose()?)
        .bind(format_ts(session.last_activity)?)
        .bind(i64::from(session.used_dev_server))
        .bind(session.error_message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_active_session(&self, key: &SessionKey) -> Result<Option<ActiveSession>> {
        let row = sqlx::query(
            r#"
            select * from active_sessions
            where session_key = ?1
            "#,
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_session).transpose()
    }

    /// Merges the `Some` fields of `patch`; returns false when the row does not exist.
    pub async fn update_active_session(
        &self,
        key: &SessionKey,
        patch: &SessionPatch,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            update active_sessions
            set status = coalesce(?1, status),
                job_id = coalesce(?2, job_id),
                node = coalesce(?3, node),
                local_port = coalesce(?4, local_port),
                remote_port = coalesce(?5, remote_port),
                token = coalesce(?6, token),
                started_at = coalesce(?7, started_at),
                last_activity = coalesce(?8, last_activity),
                error_message = coalesce(?9, error_message)
            where session_key = ?10
            "#,
        )
        .bind(patch.status.map(SessionStatus::as_str))
        .bind(patch.job_id.as_deref())
        .bind(patch.node.as_deref())
        .bind(patch.local_port.map(i64::from))
        .bind(patch.remote_port.map(i64::from))
        .bind(patch.token.as_deref())
        .bind(patch.started_at.map(format_ts).transpose()?)
        .bind(patch.last_activity.map(format_ts).transpose()?)
        .bind(patch.error_message.as_deref())
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_dev_server_used(&self, key: &SessionKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            update active_sessions
            set used_dev_server = 1
            where session_key = ?1
            "#,
        )
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_active_sessions(&self, user: Option<&str>) -> Result<Vec<ActiveSession>> {
        let rows = sqlx::query(
            r#"
            select * from active_sessions
            where (?1 is null or user = ?1)
            order by submitted_at, session_key
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_session).collect()
    }

    pub async fn delete_active_session(&self, key: &SessionKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            delete from active_sessions
            where session_key = ?1
            "#,
        )
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Writes the single history row for an ended session, with metrics taken at `ended_at`.
    pub async fn archive_session(
        &self,
        session: &ActiveSession,
        end_reason: &str,
        error_message: Option<&str>,
        ended_at: OffsetDateTime,
    ) -> Result<i64> {
        let rec = sqlx::query(
            r#"
        insert into session_history(
            job_id, user, cluster, ide, end_reason, error_message, wait_seconds,
            duration_minutes, cpus, memory, gpu_type, release_tag, used_dev_server,
            submitted_at, started_at, ended_at, archived_at_unix
        )
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        returning id;
    "#,
        )
        .bind(session.job_id.as_deref())
        .bind(session.key.user())
        .bind(session.key.cluster())
        .bind(session.key.ide().as_str())
        .bind(end_reason)
        .bind(error_message.or(session.error_message.as_deref()))
        .bind(session.wait_seconds())
        .bind(session.duration_minutes(ended_at))
        .bind(i64::from(session.resources.cpus))
        .bind(session.resources.memory.as_str())
        .bind(session.resources.gpu_type.as_deref())
        .bind(session.resources.release.as_deref())
        .bind(i64::from(session.used_dev_server))
        .bind(format_ts(session.submitted_at)?)
        .bind(session.started_at.map(format_ts).transpose()?)
        .bind(format_ts(ended_at)?)
        .bind(ended_at.unix_timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get::<i64, _>("id")?)
    }

    /// Rows archived at or after `since`, newest first.
    pub async fn get_session_history(
        &self,
        user: Option<&str>,
        since: OffsetDateTime,
        limit: Option<u32>,
    ) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            r#"
            select * from session_history
            where (?1 is null or user = ?1)
              and archived_at_unix >= ?2
            order by archived_at_unix desc, id desc
            limit ?3
            "#,
        )
        .bind(user)
        .bind(since.unix_timestamp())
        // A negative limit means no limit in SQLite.
        .bind(limit.map(i64::from).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_history).collect()
    }

    pub async fn get_session_history_count(
        &self,
        user: Option<&str>,
        since: OffsetDateTime,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            select count(*) as total from session_history
            where (?1 is null or user = ?1)
              and archived_at_unix >= ?2
            "#,
        )
        .bind(user)
        .bind(since.unix_timestamp())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or_default())
    }
}

// -- helpers

fn format_ts(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|e| SessionStoreError::InvalidTimestamp(e.to_string()))
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|_| SessionStoreError::InvalidTimestamp(raw.to_string()))
}

fn port_column(row: &SqliteRow, column: &str) -> Result<Option<u16>> {
    let value: Option<i64> = row.try_get(column)?;
    value
        .map(|port| {
            u16::try_from(port)
                .map_err(|_| SessionStoreError::InvalidRow(format!("{column} out of range: {port}")))
        })
        .transpose()
}

fn row_to_session(row: SqliteRow) -> Result<ActiveSession> {
    let user: String = row.try_get("user")?;
    let cluster: String = row.try_get("cluster")?;
    let ide: String = row.try_get("ide")?;
    let ide = Ide::from_str(&ide).map_err(|e| SessionStoreError::InvalidRow(e.to_string()))?;
    let key = SessionKey::new(user, cluster, ide)
        .map_err(|e| SessionStoreError::InvalidRow(e.to_string()))?;
    let status: String = row.try_get("status")?;
    let status =
        SessionStatus::from_str(&status).map_err(|e| SessionStoreError::InvalidRow(e.to_string()))?;
    let cpus: i64 = row.try_get("cpus")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    Ok(ActiveSession {
        key,
        status,
        job_id: row.try_get("job_id")?,
        node: row.try_get("node")?,
        local_port: port_column(&row, "local_port")?,
        remote_port: port_column(&row, "remote_port")?,
        token: row.try_get("token")?,
        resources: JobResources {
            cpus: u32::try_from(cpus)
                .map_err(|_| SessionStoreError::InvalidRow(format!("cpus out of range: {cpus}")))?,
            memory: row.try_get("memory")?,
            time: row.try_get("time_limit")?,
            gpu_type: row.try_get("gpu_type")?,
            release: row.try_get("release_tag")?,
        },
        submitted_at: parse_ts(&row.try_get::<String, _>("submitted_at")?)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        last_activity: parse_ts(&row.try_get::<String, _>("last_activity")?)?,
        used_dev_server: row.try_get::<i64, _>("used_dev_server")? != 0,
        error_message: row.try_get("error_message")?,
    })
}

fn row_to_history(row: SqliteRow) -> Result<HistoryRecord> {
    let cpus: Option<i64> = row.try_get("cpus")?;
    Ok(HistoryRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        user: row.try_get("user")?,
        cluster: row.try_get("cluster")?,
        ide: row.try_get("ide")?,
        end_reason: row.try_get("end_reason")?,
        error_message: row.try_get("error_message")?,
        wait_seconds: row.try_get("wait_seconds")?,
        duration_minutes: row.try_get("duration_minutes")?,
        cpus: cpus.and_then(|cpus| u32::try_from(cpus).ok()),
        memory: row.try_get("memory")?,
        gpu_type: row.try_get("gpu_type")?,
        release: row.try_get("release_tag")?,
        used_dev_server: row.try_get::<i64, _>("used_dev_server")? != 0,
        submitted_at: row.try_get("submitted_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}
