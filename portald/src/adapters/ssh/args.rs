// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::{FORWARDER_MARKER, TunnelSpec};
use crate::app::types::SshConfig;

/// Options shared by remote commands and tunnels. Non-interactive: a missing key or an
/// unknown-but-changed host key fails instead of prompting.
pub fn base_args(config: &SshConfig) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ConnectTimeout=15".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-p".to_string(),
        config.port.to_string(),
    ];
    if let Some(identity) = &config.identity_path {
        args.push("-i".to_string());
        args.push(identity.clone());
        args.push("-o".to_string());
        args.push("IdentitiesOnly=yes".to_string());
    }
    for option in &config.options {
        args.push("-o".to_string());
        args.push(option.clone());
    }
    args
}

pub fn exec_args(config: &SshConfig, command: &str) -> Vec<String> {
    let mut args = base_args(config);
    args.push("-T".to_string());
    args.push(config.destination());
    args.push(command.to_string());
    args
}

/// `-N -o SetEnv=PORTAL_TUNNEL=1 -L 127.0.0.1:<local>:<node>:<remote>`; the process-table
/// scan relies on this shape.
pub fn tunnel_args(spec: &TunnelSpec) -> Vec<String> {
    let mut args = base_args(&spec.ssh);
    args.push("-N".to_string());
    args.push("-o".to_string());
    args.push(FORWARDER_MARKER.to_string());
    args.push("-o".to_string());
    args.push("ExitOnForwardFailure=yes".to_string());
    args.push("-L".to_string());
    args.push(format!(
        "127.0.0.1:{}:{}:{}",
        spec.local_port, spec.remote_host, spec.remote_port
    ));
    args.push(spec.ssh.destination());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tunnels::forwarded_local_port;

    fn config() -> SshConfig {
        SshConfig {
            host: "gemini.example.org".into(),
            port: 2222,
            username: Some("bob".into()),
            identity_path: Some("/home/bob/.ssh/id_ed25519".into()),
            options: vec!["ProxyJump=bastion".into()],
        }
    }

    #[test]
    fn exec_args_end_with_destination_and_command() {
        let args = exec_args(&config(), "squeue -h");
        let tail: Vec<&str> = args.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, vec!["squeue -h", "bob@gemini.example.org"]);
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/home/bob/.ssh/id_ed25519"));
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "ProxyJump=bastion"));
    }

    #[test]
    fn tunnel_args_match_the_orphan_signature() {
        let spec = TunnelSpec {
            ssh: config(),
            local_port: 20005,
            remote_host: "node07".into(),
            remote_port: 8888,
        };
        let args = tunnel_args(&spec);
        assert!(args.contains(&"127.0.0.1:20005:node07:8888".to_string()));
        let command_line = format!("ssh {}", args.join(" "));
        assert_eq!(forwarded_local_port(&command_line), Some(20005));
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == FORWARDER_MARKER));
    }
}
