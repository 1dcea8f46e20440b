// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::{Ide, IdeProfile};

pub const PORTAL_DIR: &str = ".portal";
pub const PROXY_PORT_FILE: &str = "proxy.port";
pub const PROXY_STATUS_FILE: &str = "proxy.status";

/// Port file written by the job script, relative to the remote home directory.
pub fn port_file(ide: Ide) -> String {
    format!("{PORTAL_DIR}/{}.port", ide)
}

pub fn proxy_port_file() -> String {
    format!("{PORTAL_DIR}/{PROXY_PORT_FILE}")
}

pub fn proxy_status_file() -> String {
    format!("{PORTAL_DIR}/{PROXY_STATUS_FILE}")
}

pub fn default_profile(ide: Ide) -> IdeProfile {
    match ide {
        Ide::VsCode => IdeProfile {
            ide,
            default_port: 8000,
            launch: "code serve-web --host 0.0.0.0 --port \"$PORT\" --connection-token \"$PORTAL_TOKEN\" --accept-server-license-terms".to_string(),
            working_dir: None,
            setup: Vec::new(),
            uses_token: true,
            readiness_path: Some("/".to_string()),
            proxy: Some("portal-proxy --listen \"$PROXY_PORT\" --upstream \"127.0.0.1:$PORT\"".to_string()),
            url_path: "/?tkn={token}".to_string(),
        },
        Ide::RStudio => IdeProfile {
            ide,
            default_port: 8787,
            launch: "rserver --www-port=\"$PORT\" --www-address=0.0.0.0 --auth-none=1 --server-user=\"$USER\"".to_string(),
            working_dir: None,
            setup: Vec::new(),
            uses_token: false,
            readiness_path: Some("/".to_string()),
            proxy: None,
            url_path: "/".to_string(),
        },
        Ide::Jupyter => IdeProfile {
            ide,
            default_port: 8888,
            launch: "jupyter lab --no-browser --ip=0.0.0.0 --port=\"$PORT\" --ServerApp.token=\"$PORTAL_TOKEN\"".to_string(),
            working_dir: None,
            setup: Vec::new(),
            uses_token: true,
            readiness_path: Some("/api/status".to_string()),
            proxy: None,
            url_path: "/lab?token={token}".to_string(),
        },
    }
}

/// Browser URL for a tunnel listening on `local_port`.
pub fn session_url(profile: &IdeProfile, local_port: u16, token: Option<&str>) -> String {
    let path = profile.url_path.replace("{token}", token.unwrap_or_default());
    format!("http://127.0.0.1:{local_port}{path}")
}
