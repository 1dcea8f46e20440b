// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::app::errors::{AppError, AppResult};

type QueuedOp = BoxFuture<'static, ()>;

/// Serializes operations per resource key.
///
/// Each key owns a lane drained by one task, so operations on the same key run one at a time
/// in the order `run` was called; different keys never wait on each other. Cloning shares
/// the lanes.
#[derive(Clone, Default)]
pub struct CommandQueue {
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<QueuedOp>>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `op` on the lane for `key` immediately; the returned future resolves with its
    /// result. A failing or panicking operation does not affect later ones.
    pub fn run<T, F>(&self, key: &str, op: F) -> impl Future<Output = AppResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: Future<Output = AppResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued: QueuedOp = Box::pin(async move {
            let result = match AssertUnwindSafe(op).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(AppError::internal("queued operation panicked")),
            };
            let _ = tx.send(result);
        });
        let enqueued = self.enqueue(key, queued);
        async move {
            enqueued?;
            rx.await
                .map_err(|_| AppError::internal("command queue lane closed"))?
        }
    }

    /// Like [`CommandQueue::run`] for a synchronous closure, executed on the blocking pool.
    pub fn run_blocking<T, F>(
        &self,
        key: &str,
        op: F,
    ) -> impl Future<Output = AppResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        self.run(key, async move {
            tokio::task::spawn_blocking(op)
                .await
                .map_err(|e| AppError::internal(format!("blocking operation failed: {e}")))?
        })
    }

    /// Drops every lane. Work already queued still runs to completion.
    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn lane_count(&self) -> usize {
        self.lock().len()
    }

    fn enqueue(&self, key: &str, queued: QueuedOp) -> AppResult<()> {
        let mut lanes = self.lock();
        let queued = match lanes.get(key) {
            Some(lane) => match lane.send(queued) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(queued)) => queued,
            },
            None => queued,
        };
        let lane = spawn_lane();
        lane.send(queued)
            .map_err(|_| AppError::internal("command queue lane closed"))?;
        lanes.insert(key.to_string(), lane);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<QueuedOp>>> {
        self.lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn spawn_lane() -> mpsc::UnboundedSender<QueuedOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOp>();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            op.await;
        }
    });
    tx
}
