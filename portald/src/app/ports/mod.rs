// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod network;
pub mod process_table;
pub mod remote_exec;
pub mod session_store;
pub mod tunnel;

pub use clock::ClockPort;
pub use network::NetworkProbePort;
pub use process_table::{ProcessEntry, ProcessTablePort};
pub use remote_exec::{ExecCapture, RemoteExecPort};
pub use session_store::SessionStorePort;
pub use tunnel::{
    DiagnosticStream, FORWARDER_MARKER, TunnelProcess, TunnelSpawnPort, TunnelSpec,
};
