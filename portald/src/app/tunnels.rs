// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::port_allocator::PortAllocator;
use crate::app::ports::{
    ClockPort, DiagnosticStream, FORWARDER_MARKER, NetworkProbePort, ProcessTablePort,
    TunnelProcess, TunnelSpawnPort, TunnelSpec,
};
use crate::app::types::{Catalog, Ide, SessionKey, TunnelInfo, TunnelState};

const STDERR_TAIL_LINES: usize = 20;
const AUTH_FAILURE_MARKERS: [&str; 4] = [
    "Permission denied",
    "publickey",
    "Host key verification failed",
    "Authentication failed",
];

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 30,
            connect_interval: Duration::from_secs(1),
            readiness_attempts: 30,
            readiness_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

pub struct TunnelDeps {
    pub catalog: Arc<Catalog>,
    pub ports: Arc<PortAllocator>,
    pub spawner: Arc<dyn TunnelSpawnPort>,
    pub network: Arc<dyn NetworkProbePort>,
    pub processes: Arc<dyn ProcessTablePort>,
    pub clock: Arc<dyn ClockPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub terminated: Vec<u32>,
    pub failed: Vec<u32>,
}

#[derive(Debug, Clone)]
struct ExitReport {
    code: Option<i32>,
    stderr_tail: Vec<String>,
}

struct TunnelEntry {
    generation: u64,
    info: TunnelInfo,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitReport>>,
}

struct Inner {
    deps: TunnelDeps,
    settings: TunnelSettings,
    tunnels: Mutex<HashMap<String, TunnelEntry>>,
    next_generation: AtomicU64,
}

/// Owns the `ssh -L` forwarders, one per session key.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(deps: TunnelDeps, settings: TunnelSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                tunnels: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Builds the manager and terminates forwarders left behind by a previous run.
    pub async fn bootstrap(
        deps: TunnelDeps,
        settings: TunnelSettings,
    ) -> AppResult<(Self, CleanupReport)> {
        let manager = Self::new(deps, settings);
        let report = manager.cleanup_orphans().await?;
        if !report.terminated.is_empty() || !report.failed.is_empty() {
            info!(
                terminated = ?report.terminated,
                failed = ?report.failed,
                "cleaned up orphaned tunnels"
            );
        }
        Ok((manager, report))
    }

    pub async fn start<F>(
        &self,
        key: &SessionKey,
        node: &str,
        remote_port: Option<u16>,
        on_exit: F,
    ) -> AppResult<TunnelInfo>
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let inner = &self.inner;
        let cluster = inner.deps.catalog.cluster(key.cluster())?.clone();
        let profile = inner.deps.catalog.ide(key.ide())?.clone();
        let remote_port = remote_port.unwrap_or(profile.default_port);
        let key_str = key.to_string();

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(None::<ExitReport>);
        {
            let mut tunnels = inner.lock();
            if let Some(entry) = tunnels.get(&key_str) {
                return match entry.info.state {
                    TunnelState::Active => Ok(entry.info.clone()),
                    TunnelState::Establishing => Err(AppError::with_message(
                        AppErrorKind::Conflict,
                        codes::CONFLICT,
                        format!("tunnel for {key_str} is already being established"),
                    )),
                };
            }
            tunnels.insert(
                key_str.clone(),
                TunnelEntry {
                    generation,
                    info: TunnelInfo {
                        key: key.clone(),
                        state: TunnelState::Establishing,
                        node: node.to_string(),
                        local_port: 0,
                        remote_port,
                        pid: None,
                        started_at: inner.deps.clock.now_utc(),
                    },
                    kill: Some(kill_tx),
                    exited: exit_rx.clone(),
                },
            );
        }

        let local_port = match self.pick_local_port(&key_str).await {
            Ok(port) => port,
            Err(err) => {
                inner.discard(&key_str, generation, None, &exit_tx);
                return Err(err);
            }
        };

        let mut ssh = cluster.ssh.clone();
        if ssh.username.is_none() {
            ssh.username = Some(key.user().to_string());
        }
        let spec = TunnelSpec {
            ssh,
            local_port,
            remote_host: node.to_string(),
            remote_port,
        };
        let mut process = match inner.deps.spawner.spawn(&spec) {
            Ok(process) => process,
            Err(err) => {
                inner.discard(&key_str, generation, Some(local_port), &exit_tx);
                return Err(err);
            }
        };
        let pid = process.pid();
        {
            let mut tunnels = inner.lock();
            if let Some(entry) = tunnels.get_mut(&key_str) {
                if entry.generation == generation {
                    entry.info.local_port = local_port;
                    entry.info.pid = pid;
                }
            }
        }
        info!(
            cluster = %cluster.name,
            ide = %key.ide(),
            session = %key_str,
            local_port,
            node,
            remote_port,
            pid = ?pid,
            "spawned tunnel"
        );

        let tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = process.take_stderr().map(|stream| {
            tokio::spawn(pump_stderr(
                stream,
                cluster.name.clone(),
                key.ide(),
                key_str.clone(),
                tail.clone(),
            ))
        });
        tokio::spawn(supervise(Supervision {
            inner: inner.clone(),
            key: key_str.clone(),
            generation,
            local_port,
            process,
            kill_rx,
            stderr_task,
            tail,
            exit_tx,
            on_exit: Box::new(on_exit),
        }));

        if !self.wait_until_connected(local_port, &mut exit_rx).await? {
            self.kill(&key_str, generation);
            wait_for_exit(&mut exit_rx, inner.settings.stop_timeout).await;
            return Err(AppError::with_message(
                AppErrorKind::Timeout,
                codes::TIMEOUT,
                format!(
                    "tunnel to {node}:{remote_port} not reachable on local port {local_port}"
                ),
            )
            .with_context(format!("session {key_str}")));
        }

        if let Some(path) = &profile.readiness_path {
            let url = format!("http://127.0.0.1:{local_port}{path}");
            if !self.wait_until_ready(&url, &mut exit_rx).await? {
                warn!(session = %key_str, %url, "service not ready yet, continuing");
            }
        }

        let mut tunnels = inner.lock();
        match tunnels.get_mut(&key_str) {
            Some(entry) if entry.generation == generation => {
                entry.info.state = TunnelState::Active;
                inner.deps.ports.activate(&key_str, local_port);
                info!(session = %key_str, local_port, "tunnel active");
                Ok(entry.info.clone())
            }
            _ => {
                drop(tunnels);
                let report = exit_rx.borrow().clone();
                Err(early_exit_error(report.as_ref(), &key_str))
            }
        }
    }

    /// Returns whether a tunnel existed for `key`.
    pub async fn stop(&self, key: &SessionKey) -> bool {
        let key_str = key.to_string();
        let (kill, mut exited) = {
            let mut tunnels = self.inner.lock();
            match tunnels.get_mut(&key_str) {
                Some(entry) => (entry.kill.take(), entry.exited.clone()),
                None => return false,
            }
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if !wait_for_exit(&mut exited, self.inner.settings.stop_timeout).await {
            warn!(session = %key_str, "tunnel did not exit in time");
        }
        true
    }

    pub async fn stop_all(&self) -> usize {
        let keys: Vec<SessionKey> = self
            .inner
            .lock()
            .values()
            .map(|entry| entry.info.key.clone())
            .collect();
        let stops = keys.iter().map(|key| self.stop(key));
        futures::future::join_all(stops)
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count()
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.inner
            .lock()
            .get(&key.to_string())
            .is_some_and(|entry| entry.info.state == TunnelState::Active)
    }

    pub fn get_tunnel(&self, key: &SessionKey) -> Option<TunnelInfo> {
        self.inner
            .lock()
            .get(&key.to_string())
            .map(|entry| entry.info.clone())
    }

    pub fn list(&self) -> Vec<TunnelInfo> {
        self.inner
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Terminates portal forwarders in the local port range that this manager does not track.
    pub async fn cleanup_orphans(&self) -> AppResult<CleanupReport> {
        let range = self.inner.deps.ports.range();
        let tracked = self.tracked_pids();
        let mut report = CleanupReport::default();
        for entry in self.inner.deps.processes.list_processes().await? {
            let Some(port) = forwarded_local_port(&entry.args) else {
                continue;
            };
            if !range.contains(&port) || tracked.contains(&entry.pid) {
                continue;
            }
            match self.inner.deps.processes.terminate(entry.pid) {
                Ok(()) => {
                    debug!(pid = entry.pid, port, "terminated orphaned tunnel");
                    report.terminated.push(entry.pid);
                }
                Err(err) => {
                    warn!(pid = entry.pid, port, error = %err, "could not terminate orphaned tunnel");
                    report.failed.push(entry.pid);
                }
            }
        }
        Ok(report)
    }

    async fn pick_local_port(&self, key: &str) -> AppResult<u16> {
        let deps = &self.inner.deps;
        let mut skip = Vec::new();
        loop {
            let port = deps.ports.reserve(key, &skip)?;
            if !deps.network.local_port_in_use(port).await {
                return Ok(port);
            }
            if self.release_stale_listener(port).await
                && !deps.network.local_port_in_use(port).await
            {
                return Ok(port);
            }
            debug!(session = %key, port, "local port busy, trying another");
            skip.push(port);
        }
    }

    async fn release_stale_listener(&self, port: u16) -> bool {
        let deps = &self.inner.deps;
        let tracked = self.tracked_pids();
        let processes = match deps.processes.list_processes().await {
            Ok(processes) => processes,
            Err(err) => {
                debug!(port, error = %err, "process table unavailable");
                return false;
            }
        };
        let mut released = false;
        for entry in processes {
            if forwarded_local_port(&entry.args) != Some(port) || tracked.contains(&entry.pid) {
                continue;
            }
            match deps.processes.terminate(entry.pid) {
                Ok(()) => {
                    info!(pid = entry.pid, port, "terminated stale tunnel holding local port");
                    released = true;
                }
                Err(err) => warn!(pid = entry.pid, port, error = %err, "could not release port"),
            }
        }
        if released {
            deps.clock.sleep(Duration::from_millis(200)).await;
        }
        released
    }

    async fn wait_until_connected(
        &self,
        local_port: u16,
        exit_rx: &mut watch::Receiver<Option<ExitReport>>,
    ) -> AppResult<bool> {
        let deps = &self.inner.deps;
        let settings = &self.inner.settings;
        let context = format!("local port {local_port}");
        for attempt in 1..=settings.connect_attempts {
            exited(exit_rx, &context)?;
            match deps.network.check_local_port(local_port).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => debug!(local_port, error = %err, "local port probe failed"),
            }
            if attempt < settings.connect_attempts {
                deps.clock.sleep(settings.connect_interval).await;
            }
        }
        exited(exit_rx, &context)?;
        Ok(false)
    }

    async fn wait_until_ready(
        &self,
        url: &str,
        exit_rx: &mut watch::Receiver<Option<ExitReport>>,
    ) -> AppResult<bool> {
        let deps = &self.inner.deps;
        let settings = &self.inner.settings;
        for attempt in 1..=settings.readiness_attempts {
            exited(exit_rx, url)?;
            match deps.network.check_http_ready(url).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => debug!(%url, error = %err, "readiness probe failed"),
            }
            if attempt < settings.readiness_attempts {
                deps.clock.sleep(settings.readiness_interval).await;
            }
        }
        Ok(false)
    }

    fn kill(&self, key: &str, generation: u64) {
        let kill = {
            let mut tunnels = self.inner.lock();
            match tunnels.get_mut(key) {
                Some(entry) if entry.generation == generation => entry.kill.take(),
                _ => None,
            }
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
    }

    fn tracked_pids(&self) -> Vec<u32> {
        self.inner
            .lock()
            .values()
            .filter_map(|entry| entry.info.pid)
            .collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TunnelEntry>> {
        self.tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Single exit transition: drops the live entry and its port together.
    fn terminate(&self, key: &str, generation: u64, local_port: Option<u16>) {
        let mut tunnels = self.lock();
        if tunnels
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            tunnels.remove(key);
            if let Some(port) = local_port {
                self.deps.ports.release_port(key, port);
            }
        }
    }

    fn discard(
        &self,
        key: &str,
        generation: u64,
        local_port: Option<u16>,
        exit_tx: &watch::Sender<Option<ExitReport>>,
    ) {
        self.terminate(key, generation, local_port);
        exit_tx.send_replace(Some(ExitReport {
            code: None,
            stderr_tail: Vec::new(),
        }));
    }
}

struct Supervision {
    inner: Arc<Inner>,
    key: String,
    generation: u64,
    local_port: u16,
    process: Box<dyn TunnelProcess>,
    kill_rx: oneshot::Receiver<()>,
    stderr_task: Option<JoinHandle<()>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    on_exit: Box<dyn FnOnce(Option<i32>) + Send>,
}

async fn supervise(job: Supervision) {
    let Supervision {
        inner,
        key,
        generation,
        local_port,
        mut process,
        kill_rx,
        stderr_task,
        tail,
        exit_tx,
        on_exit,
    } = job;

    let code = tokio::select! {
        result = process.wait() => result.unwrap_or_else(|err| {
            warn!(session = %key, error = %err, "waiting for tunnel failed");
            None
        }),
        _ = kill_rx => {
            if let Err(err) = process.start_kill() {
                warn!(session = %key, error = %err, "could not kill tunnel");
            }
            process.wait().await.unwrap_or(None)
        }
    };
    if let Some(task) = stderr_task {
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            debug!(session = %key, "tunnel stderr still open after exit");
        }
    }
    let stderr_tail: Vec<String> = tail
        .lock()
        .map(|tail| tail.iter().cloned().collect())
        .unwrap_or_default();

    inner.terminate(&key, generation, Some(local_port));
    info!(session = %key, exit_code = ?code, "tunnel exited");
    on_exit(code);
    exit_tx.send_replace(Some(ExitReport { code, stderr_tail }));
}

async fn pump_stderr(
    stream: DiagnosticStream,
    cluster: String,
    ide: Ide,
    session: String,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                warn!(%cluster, %ide, %session, "ssh: {line}");
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%session, error = %err, "tunnel stderr closed");
                break;
            }
        }
    }
}

fn exited(exit_rx: &mut watch::Receiver<Option<ExitReport>>, context: &str) -> AppResult<()> {
    let report = exit_rx.borrow_and_update().clone();
    match report {
        Some(report) => Err(early_exit_error(Some(&report), context)),
        None => Ok(()),
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitReport>>, limit: Duration) -> bool {
    let wait = async {
        loop {
            if exit_rx.borrow_and_update().is_some() {
                return;
            }
            if exit_rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::time::timeout(limit, wait).await.is_ok()
}

fn early_exit_error(report: Option<&ExitReport>, context: &str) -> AppError {
    let Some(report) = report else {
        return AppError::with_message(
            AppErrorKind::Aborted,
            codes::TUNNEL_FAILED,
            "tunnel exited during establishment",
        )
        .with_context(context.to_string());
    };
    let stderr = report.stderr_tail.join("\n");
    let looks_like_auth = AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker));
    let status = match report.code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    };
    let detail = report
        .stderr_tail
        .last()
        .map(|line| format!(": {line}"))
        .unwrap_or_default();
    let code = if looks_like_auth {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::TUNNEL_FAILED
    };
    AppError::with_message(
        AppErrorKind::Aborted,
        code,
        format!("tunnel exited with {status}{detail}"),
    )
    .with_context(context.to_string())
}

/// Local port of a portal forwarder command line
/// (`ssh ... -N ... -o SetEnv=PORTAL_TUNNEL=1 ... -L 127.0.0.1:<port>:...`).
pub fn forwarded_local_port(args: &str) -> Option<u16> {
    let mut tokens = args.split_whitespace();
    let program = tokens.next()?;
    if program.rsplit('/').next() != Some("ssh") {
        return None;
    }
    let tokens: Vec<&str> = tokens.collect();
    if !tokens.contains(&"-N") {
        return None;
    }
    if !tokens
        .iter()
        .any(|token| token.strip_prefix("-o").unwrap_or(*token) == FORWARDER_MARKER)
    {
        return None;
    }
    let forward = tokens.iter().enumerate().find_map(|(idx, token)| {
        if *token == "-L" {
            tokens.get(idx + 1).copied()
        } else {
            token.strip_prefix("-L").filter(|rest| !rest.is_empty())
        }
    })?;
    let rest = forward.strip_prefix("127.0.0.1:")?;
    let (port, _) = rest.split_once(':')?;
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{
        FakeNetwork, FakeProcessTable, FakeTunnelSpawner, ManualClock, catalog,
    };
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        manager: TunnelManager,
        ports: Arc<PortAllocator>,
        spawner: Arc<FakeTunnelSpawner>,
        network: Arc<FakeNetwork>,
        processes: Arc<FakeProcessTable>,
    }

    fn settings() -> TunnelSettings {
        TunnelSettings {
            connect_attempts: 5,
            connect_interval: Duration::from_secs(1),
            readiness_attempts: 3,
            readiness_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
        }
    }

    fn harness(network: FakeNetwork, processes: FakeProcessTable) -> Harness {
        let ports = Arc::new(PortAllocator::new(20000..=20009));
        let spawner = Arc::new(FakeTunnelSpawner::new());
        let network = Arc::new(network);
        let processes = Arc::new(processes);
        let manager = TunnelManager::new(
            TunnelDeps {
                catalog: Arc::new(catalog()),
                ports: ports.clone(),
                spawner: spawner.clone(),
                network: network.clone(),
                processes: processes.clone(),
                clock: Arc::new(ManualClock::new()),
            },
            settings(),
        );
        Harness {
            manager,
            ports,
            spawner,
            network,
            processes,
        }
    }

    fn key(ide: Ide) -> SessionKey {
        SessionKey::new("bob", "gemini", ide).unwrap()
    }

    fn exit_recorder() -> (Arc<Mutex<Vec<Option<i32>>>>, impl FnOnce(Option<i32>) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |code| sink.lock().unwrap().push(code))
    }

    async fn until_gone(manager: &TunnelManager, key: &SessionKey) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.get_tunnel(key).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("tunnel entry should be removed");
    }

    #[tokio::test]
    async fn start_activates_tunnel_and_records_port() {
        let h = harness(FakeNetwork::reachable_after(2), FakeProcessTable::default());
        let key = key(Ide::Jupyter);
        let (_, on_exit) = exit_recorder();
        let info = h
            .manager
            .start(&key, "node07", Some(20042), on_exit)
            .await
            .unwrap();
        assert_eq!(info.state, TunnelState::Active);
        assert!(h.ports.range().contains(&info.local_port));
        assert_eq!(h.ports.port_for(&key.to_string()), Some(info.local_port));
        assert!(h.manager.is_active(&key));

        let spawned = h.spawner.last();
        assert_eq!(spawned.spec.remote_host, "node07");
        assert_eq!(spawned.spec.remote_port, 20042);
        assert_eq!(spawned.spec.ssh.username.as_deref(), Some("bob"));
        assert_eq!(h.network.connect_probes(), 2);
        assert_eq!(h.network.http_probes(), 1);
    }

    #[tokio::test]
    async fn start_on_active_key_returns_existing_tunnel() {
        let h = harness(FakeNetwork::reachable_after(1), FakeProcessTable::default());
        let key = key(Ide::RStudio);
        let (_, first_exit) = exit_recorder();
        let first = h.manager.start(&key, "node01", None, first_exit).await.unwrap();
        assert_eq!(first.remote_port, 8787);
        let (_, second_exit) = exit_recorder();
        let second = h.manager.start(&key, "node01", None, second_exit).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.spawner.spawned().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_start_for_same_key_conflicts() {
        let h = harness(FakeNetwork::never_reachable(), FakeProcessTable::default());
        let key = key(Ide::VsCode);
        let (_, a_exit) = exit_recorder();
        let (_, b_exit) = exit_recorder();
        let (a, b) = tokio::join!(
            h.manager.start(&key, "node01", None, a_exit),
            h.manager.start(&key, "node01", None, b_exit)
        );
        assert_eq!(a.unwrap_err().code(), codes::TIMEOUT);
        assert_eq!(b.unwrap_err().kind(), AppErrorKind::Conflict);
    }

    #[tokio::test]
    async fn early_exit_is_reported_as_authentication_failure() {
        let h = harness(FakeNetwork::never_reachable(), FakeProcessTable::default());
        h.spawner
            .fail_with("bob@gemini.example.org: Permission denied (publickey).\n", 255);
        let key = key(Ide::VsCode);
        let (seen, on_exit) = exit_recorder();
        let err = h
            .manager
            .start(&key, "node01", None, on_exit)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::AUTHENTICATION_FAILURE);
        assert!(err.message().contains("status 255"));
        until_gone(&h.manager, &key).await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(255)]);
        assert_eq!(h.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn other_early_exit_is_a_tunnel_failure() {
        let h = harness(FakeNetwork::never_reachable(), FakeProcessTable::default());
        h.spawner
            .fail_with("channel 2: open failed: connect failed: Connection refused\n", 1);
        let err = h
            .manager
            .start(&key(Ide::VsCode), "node01", None, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::TUNNEL_FAILED);
    }

    #[tokio::test]
    async fn unreachable_tunnel_is_killed_on_timeout() {
        let h = harness(FakeNetwork::never_reachable(), FakeProcessTable::default());
        let key = key(Ide::Jupyter);
        let (seen, on_exit) = exit_recorder();
        let err = h
            .manager
            .start(&key, "node01", None, on_exit)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Timeout);
        assert_eq!(h.spawner.last().kills(), 1);
        assert_eq!(h.network.connect_probes(), 5);
        until_gone(&h.manager, &key).await;
        assert!(!h.manager.is_active(&key));
        assert_eq!(*seen.lock().unwrap(), vec![None]);
        assert_eq!(h.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn readiness_timeout_still_activates() {
        let network = FakeNetwork::reachable_after(1);
        network.set_http_ready(false);
        let h = harness(network, FakeProcessTable::default());
        let info = h
            .manager
            .start(&key(Ide::Jupyter), "node01", None, |_| {})
            .await
            .unwrap();
        assert_eq!(info.state, TunnelState::Active);
        assert_eq!(h.network.http_probes(), 3);
    }

    #[tokio::test]
    async fn busy_local_port_is_skipped() {
        let network = FakeNetwork::reachable_after(1);
        network.mark_in_use(20000);
        let h = harness(network, FakeProcessTable::default());
        let info = h
            .manager
            .start(&key(Ide::VsCode), "node01", None, |_| {})
            .await
            .unwrap();
        assert_eq!(info.local_port, 20001);
        assert!(h.processes.terminated().is_empty());
    }

    #[tokio::test]
    async fn stale_portal_listener_is_terminated() {
        let network = FakeNetwork::reachable_after(1);
        network.mark_in_use(20000);
        let h = harness(
            network,
            FakeProcessTable::with(vec![(
                991,
                "ssh -N -o SetEnv=PORTAL_TUNNEL=1 -o ExitOnForwardFailure=yes -L 127.0.0.1:20000:node09:8888 bob@gemini",
            )]),
        );
        h.manager
            .start(&key(Ide::VsCode), "node01", None, |_| {})
            .await
            .unwrap();
        assert_eq!(h.processes.terminated(), vec![991]);
    }

    #[tokio::test]
    async fn stop_kills_tunnel_and_fires_exit_once() {
        let h = harness(FakeNetwork::reachable_after(1), FakeProcessTable::default());
        let key = key(Ide::VsCode);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        h.manager
            .start(&key, "node01", None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert!(h.manager.stop(&key).await);
        assert!(!h.manager.stop(&key).await);
        assert_eq!(h.spawner.last().kills(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.manager.get_tunnel(&key).is_none());
        assert_eq!(h.ports.port_for(&key.to_string()), None);
    }

    #[tokio::test]
    async fn stopping_unknown_tunnel_is_a_no_op() {
        let h = harness(FakeNetwork::reachable_after(1), FakeProcessTable::default());
        assert!(!h.manager.stop(&key(Ide::Jupyter)).await);
        assert_eq!(h.manager.stop_all().await, 0);
    }

    #[tokio::test]
    async fn process_exit_removes_entry_and_port() {
        let h = harness(FakeNetwork::reachable_after(1), FakeProcessTable::default());
        let key = key(Ide::VsCode);
        let (seen, on_exit) = exit_recorder();
        h.manager.start(&key, "node01", None, on_exit).await.unwrap();
        h.spawner.last().exit(Some(0));
        until_gone(&h.manager, &key).await;
        assert_eq!(h.ports.port_for(&key.to_string()), None);
        assert_eq!(*seen.lock().unwrap(), vec![Some(0)]);
    }

    #[tokio::test]
    async fn stop_all_stops_every_tunnel() {
        let h = harness(FakeNetwork::reachable_after(1), FakeProcessTable::default());
        for ide in [Ide::VsCode, Ide::Jupyter] {
            h.manager.start(&key(ide), "node01", None, |_| {}).await.unwrap();
        }
        assert_eq!(h.manager.list().len(), 2);
        assert_eq!(h.manager.stop_all().await, 2);
        assert!(h.manager.list().is_empty());
        assert!(h.spawner.spawned().iter().all(|t| t.has_exited()));
    }

    #[tokio::test]
    async fn bootstrap_terminates_only_portal_orphans_in_range() {
        let processes = FakeProcessTable::with(vec![
            (
                501,
                "/usr/bin/ssh -N -o SetEnv=PORTAL_TUNNEL=1 -o ExitOnForwardFailure=yes -L 127.0.0.1:20003:node02:8888 bob@gemini",
            ),
            (
                502,
                "ssh -N -o SetEnv=PORTAL_TUNNEL=1 -L 127.0.0.1:9000:node02:8888 bob@gemini",
            ),
            (505, "ssh -N -L 127.0.0.1:20003:db01:5432 alice@gemini"),
            (503, "ssh bob@gemini squeue"),
            (504, "python -m http.server 20004"),
        ]);
        let ports = Arc::new(PortAllocator::new(20000..=20009));
        let processes = Arc::new(processes);
        let (_, report) = TunnelManager::bootstrap(
            TunnelDeps {
                catalog: Arc::new(catalog()),
                ports,
                spawner: Arc::new(FakeTunnelSpawner::new()),
                network: Arc::new(FakeNetwork::reachable_after(1)),
                processes: processes.clone(),
                clock: Arc::new(ManualClock::new()),
            },
            settings(),
        )
        .await
        .unwrap();
        assert_eq!(report.terminated, vec![501]);
        assert_eq!(processes.terminated(), vec![501]);
    }

    #[tokio::test]
    async fn unknown_cluster_fails_before_spawning() {
        let h = harness(FakeNetwork::reachable_after(1), FakeProcessTable::default());
        let key = SessionKey::new("bob", "nowhere", Ide::VsCode).unwrap();
        let err = h.manager.start(&key, "node01", None, |_| {}).await.unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_CLUSTER);
        assert!(h.spawner.spawned().is_empty());
    }

    #[test]
    fn recognizes_forwarder_command_lines() {
        assert_eq!(
            forwarded_local_port("ssh -N -o SetEnv=PORTAL_TUNNEL=1 -L 127.0.0.1:20001:node1:8888 host"),
            Some(20001)
        );
        assert_eq!(
            forwarded_local_port("ssh -N -oSetEnv=PORTAL_TUNNEL=1 -L127.0.0.1:20002:node1:8888 host"),
            Some(20002)
        );
        assert_eq!(forwarded_local_port("ssh -N -L 127.0.0.1:20001:node1:8888 host"), None);
        assert_eq!(
            forwarded_local_port("ssh -o SetEnv=PORTAL_TUNNEL=1 -L 127.0.0.1:20001:node1:8888 host"),
            None
        );
        assert_eq!(
            forwarded_local_port("ssh -N -o SetEnv=PORTAL_TUNNEL=1 -L 0.0.0.0:20001:node1:8888 host"),
            None
        );
        assert_eq!(
            forwarded_local_port("sshd -N -o SetEnv=PORTAL_TUNNEL=1 -L 127.0.0.1:20001:n:1 host"),
            None
        );
    }
}
