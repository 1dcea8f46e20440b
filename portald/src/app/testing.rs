// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Test doubles for the app ports.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::watch;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    ClockPort, DiagnosticStream, ExecCapture, NetworkProbePort, ProcessEntry, ProcessTablePort,
    RemoteExecPort, TunnelProcess, TunnelSpawnPort, TunnelSpec,
};
use crate::app::services::ides;
use crate::app::types::{Catalog, ClusterProfile, Ide, JobResources, SshConfig};

pub fn catalog() -> Catalog {
    let mut clusters = BTreeMap::new();
    clusters.insert(
        "gemini".to_string(),
        ClusterProfile {
            name: "gemini".into(),
            ssh: SshConfig {
                host: "gemini.example.org".into(),
                port: 22,
                username: None,
                identity_path: None,
                options: Vec::new(),
            },
            partition: Some("interactive".into()),
            ides: Ide::ALL.to_vec(),
            max_cpus: 32,
        },
    );
    clusters.insert(
        "apollo".to_string(),
        ClusterProfile {
            name: "apollo".into(),
            ssh: SshConfig {
                host: "apollo.example.org".into(),
                port: 2222,
                username: Some("svc".into()),
                identity_path: None,
                options: Vec::new(),
            },
            partition: None,
            ides: vec![Ide::VsCode],
            max_cpus: 8,
        },
    );
    Catalog {
        job_prefix: "portal".into(),
        remote_ports: 20000..=20100,
        clusters,
        ides: Ide::ALL
            .into_iter()
            .map(|ide| (ide, ides::default_profile(ide)))
            .collect(),
    }
}

pub fn resources() -> JobResources {
    JobResources {
        cpus: 4,
        memory: "16G".into(),
        time: "04:00:00".into(),
        gpu_type: None,
        release: None,
    }
}

pub fn ok_capture(stdout: &str) -> AppResult<ExecCapture> {
    Ok(ExecCapture {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code: 0,
    })
}

pub fn failed_capture(stderr: &str, exit_code: i32) -> AppResult<ExecCapture> {
    Ok(ExecCapture {
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code,
    })
}

pub fn connection_error() -> AppResult<ExecCapture> {
    Err(AppError::with_message(
        AppErrorKind::Aborted,
        codes::CONNECTION_FAILURE,
        "ssh: connect to host gemini.example.org port 22: Connection refused",
    ))
}

/// Replays captures in order; each entry names a fragment the command must contain.
#[derive(Default)]
pub struct SequencedRemoteExec {
    captures: Mutex<VecDeque<(String, AppResult<ExecCapture>)>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl SequencedRemoteExec {
    pub fn new(captures: Vec<(&str, AppResult<ExecCapture>)>) -> Self {
        Self {
            captures: Mutex::new(
                captures
                    .into_iter()
                    .map(|(fragment, capture)| (fragment.to_string(), capture))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, fragment: &str, capture: AppResult<ExecCapture>) {
        self.captures
            .lock()
            .expect("captures lock")
            .push_back((fragment.to_string(), capture));
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.captures.lock().expect("captures lock").len()
    }
}

#[async_trait]
impl RemoteExecPort for SequencedRemoteExec {
    async fn exec_capture(&self, config: &SshConfig, command: &str) -> AppResult<ExecCapture> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((config.destination(), command.to_string()));
        let (fragment, capture) = self
            .captures
            .lock()
            .expect("captures lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected remote command: {command}"));
        assert!(
            command.contains(&fragment),
            "expected command containing {fragment:?}, got {command:?}"
        );
        capture
    }
}

/// Clock whose sleeps advance its own time instead of waiting.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::at(datetime!(2026-03-01 12:00:00 UTC))
    }

    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeps lock").clone()
    }
}

#[async_trait]
impl ClockPort for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock lock")
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeps lock").push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Local port becomes connectable after `connect_after` probes.
pub struct FakeNetwork {
    connect_after: AtomicUsize,
    connect_probes: AtomicUsize,
    http_ready: AtomicBool,
    http_probes: AtomicUsize,
    in_use: Mutex<HashSet<u16>>,
}

impl FakeNetwork {
    pub fn reachable_after(probes: usize) -> Self {
        Self {
            connect_after: AtomicUsize::new(probes),
            connect_probes: AtomicUsize::new(0),
            http_ready: AtomicBool::new(true),
            http_probes: AtomicUsize::new(0),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn never_reachable() -> Self {
        Self::reachable_after(usize::MAX)
    }

    pub fn set_http_ready(&self, ready: bool) {
        self.http_ready.store(ready, Ordering::SeqCst);
    }

    pub fn mark_in_use(&self, port: u16) {
        self.in_use.lock().expect("in_use lock").insert(port);
    }

    pub fn release(&self, port: u16) {
        self.in_use.lock().expect("in_use lock").remove(&port);
    }

    pub fn connect_probes(&self) -> usize {
        self.connect_probes.load(Ordering::SeqCst)
    }

    pub fn http_probes(&self) -> usize {
        self.http_probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkProbePort for FakeNetwork {
    async fn check_local_port(&self, _port: u16) -> AppResult<bool> {
        let seen = self.connect_probes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(seen >= self.connect_after.load(Ordering::SeqCst))
    }

    async fn local_port_in_use(&self, port: u16) -> bool {
        self.in_use.lock().expect("in_use lock").contains(&port)
    }

    async fn check_http_ready(&self, _url: &str) -> AppResult<bool> {
        self.http_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.http_ready.load(Ordering::SeqCst))
    }
}

type ExitSignal = Arc<watch::Sender<Option<Option<i32>>>>;

/// Handle on a spawned fake forwarder.
#[derive(Clone)]
pub struct SpawnedTunnel {
    pub spec: TunnelSpec,
    pub pid: u32,
    exit: ExitSignal,
    kills: Arc<AtomicUsize>,
}

impl SpawnedTunnel {
    pub fn exit(&self, code: Option<i32>) {
        self.exit.send_replace(Some(code));
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

pub struct FakeTunnelSpawner {
    spawned: Mutex<Vec<SpawnedTunnel>>,
    next_pid: AtomicU32,
    stderr: Mutex<Vec<u8>>,
    exit_on_spawn: Mutex<Option<Option<i32>>>,
}

impl FakeTunnelSpawner {
    pub fn new() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(4100),
            stderr: Mutex::new(Vec::new()),
            exit_on_spawn: Mutex::new(None),
        }
    }

    /// Every later spawn prints `stderr` and exits with `code` right away.
    pub fn fail_with(&self, stderr: &str, code: i32) {
        *self.stderr.lock().expect("stderr lock") = stderr.as_bytes().to_vec();
        *self.exit_on_spawn.lock().expect("exit lock") = Some(Some(code));
    }

    pub fn spawned(&self) -> Vec<SpawnedTunnel> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn last(&self) -> SpawnedTunnel {
        self.spawned()
            .pop()
            .expect("at least one tunnel should have been spawned")
    }
}

impl TunnelSpawnPort for FakeTunnelSpawner {
    fn spawn(&self, spec: &TunnelSpec) -> AppResult<Box<dyn TunnelProcess>> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let initial = *self.exit_on_spawn.lock().expect("exit lock");
        let (tx, _) = watch::channel(initial);
        let exit = Arc::new(tx);
        let kills = Arc::new(AtomicUsize::new(0));
        self.spawned.lock().expect("spawned lock").push(SpawnedTunnel {
            spec: spec.clone(),
            pid,
            exit: exit.clone(),
            kills: kills.clone(),
        });
        Ok(Box::new(FakeTunnelProcess {
            pid,
            stderr: Some(self.stderr.lock().expect("stderr lock").clone()),
            exit_rx: exit.subscribe(),
            exit,
            kills,
        }))
    }
}

struct FakeTunnelProcess {
    pid: u32,
    stderr: Option<Vec<u8>>,
    exit: ExitSignal,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelProcess for FakeTunnelProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stderr(&mut self) -> Option<DiagnosticStream> {
        self.stderr
            .take()
            .map(|bytes| Box::pin(std::io::Cursor::new(bytes)) as DiagnosticStream)
    }

    async fn wait(&mut self) -> AppResult<Option<i32>> {
        loop {
            if let Some(code) = *self.exit_rx.borrow_and_update() {
                return Ok(code);
            }
            if self.exit_rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    fn start_kill(&mut self) -> AppResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit.send_replace(Some(None));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProcessTable {
    entries: Mutex<Vec<ProcessEntry>>,
    terminated: Mutex<Vec<u32>>,
}

impl FakeProcessTable {
    pub fn with(entries: Vec<(u32, &str)>) -> Self {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(pid, args)| ProcessEntry {
                        pid,
                        args: args.to_string(),
                    })
                    .collect(),
            ),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().expect("terminated lock").clone()
    }
}

#[async_trait]
impl ProcessTablePort for FakeProcessTable {
    async fn list_processes(&self) -> AppResult<Vec<ProcessEntry>> {
        Ok(self.entries.lock().expect("entries lock").clone())
    }

    fn terminate(&self, pid: u32) -> AppResult<()> {
        self.terminated.lock().expect("terminated lock").push(pid);
        self.entries
            .lock()
            .expect("entries lock")
            .retain(|entry| entry.pid != pid);
        Ok(())
    }
}
