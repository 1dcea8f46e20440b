// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::services::ides;
use crate::app::tunnels::TunnelSettings;
use crate::app::types::{Catalog, ClusterProfile, Ide, SshConfig, WaitOptions};

const APP_DIR_NAME: &str = "portal";
const CONFIG_FILE_NAME: &str = "portal.toml";
const CONFIG_ENV_VAR: &str = "PORTAL_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "portal.sqlite";
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEALTH_TTL_SECS: u64 = 60;
const DEFAULT_PORT: u16 = 47800;
const DEFAULT_JOB_PREFIX: &str = "portal";
const DEFAULT_LOCAL_PORTS: RangeInclusive<u16> = 42000..=42099;
const DEFAULT_REMOTE_PORTS: RangeInclusive<u16> = 20000..=20999;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_MAX_CPUS: u32 = 64;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    listen_port: Option<u16>,
    verbose: Option<bool>,
    reconcile_interval_secs: Option<u64>,
    health_ttl_secs: Option<u64>,
    job_prefix: Option<String>,
    #[serde(default)]
    tunnel: TunnelFile,
    #[serde(default)]
    scheduler: SchedulerFile,
    #[serde(default)]
    clusters: BTreeMap<String, ClusterFile>,
    #[serde(default)]
    ides: BTreeMap<String, IdeFile>,
}

#[derive(Debug, Default, Deserialize)]
struct TunnelFile {
    local_port_start: Option<u16>,
    local_port_end: Option<u16>,
    connect_attempts: Option<u32>,
    connect_interval_ms: Option<u64>,
    readiness_attempts: Option<u32>,
    readiness_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerFile {
    node_poll_attempts: Option<u32>,
    node_poll_interval_ms: Option<u64>,
    remote_port_start: Option<u16>,
    remote_port_end: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ClusterFile {
    host: String,
    port: Option<u16>,
    user: Option<String>,
    identity_path: Option<String>,
    partition: Option<String>,
    #[serde(default)]
    ssh_options: Vec<String>,
    ides: Option<Vec<String>>,
    max_cpus: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct IdeFile {
    default_port: Option<u16>,
    setup: Option<Vec<String>>,
    working_dir: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub listen_port: u16,
    pub verbose: bool,
    pub reconcile_interval_secs: u64,
    pub health_ttl: Duration,
    pub catalog: Catalog,
    pub local_ports: RangeInclusive<u16>,
    pub tunnel: TunnelSettings,
    pub node_wait: WaitOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub listen_port: ConfigValue<u16>,
    pub reconcile_interval_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
    pub clusters: Vec<String>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub listen_port: Option<u16>,
    pub reconcile_interval_secs: Option<u64>,
    pub verbose: Option<bool>,
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (database_path, database_source) = match overrides.database_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match &file_config.database_path {
            Some(raw) => (resolve_path(raw, base_dir), ConfigSource::ConfigFile),
            None => (
                default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (listen_port, port_source) = pick(overrides.listen_port, file_config.listen_port, DEFAULT_PORT);
    if listen_port == 0 {
        anyhow::bail!("listen_port must be between 1 and 65535");
    }
    let (verbose, verbose_source) = pick(overrides.verbose, file_config.verbose, false);
    let (reconcile_interval_secs, reconcile_source) = pick(
        overrides.reconcile_interval_secs,
        file_config.reconcile_interval_secs,
        DEFAULT_RECONCILE_INTERVAL_SECS,
    );
    if reconcile_interval_secs == 0 {
        anyhow::bail!("reconcile_interval_secs must be at least 1");
    }

    let tunnel_file = &file_config.tunnel;
    let local_ports = port_range(
        "tunnel.local_port",
        tunnel_file.local_port_start,
        tunnel_file.local_port_end,
        DEFAULT_LOCAL_PORTS,
    )?;
    let tunnel_defaults = TunnelSettings::default();
    let tunnel = TunnelSettings {
        connect_attempts: tunnel_file
            .connect_attempts
            .unwrap_or(tunnel_defaults.connect_attempts),
        connect_interval: tunnel_file
            .connect_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(tunnel_defaults.connect_interval),
        readiness_attempts: tunnel_file
            .readiness_attempts
            .unwrap_or(tunnel_defaults.readiness_attempts),
        readiness_interval: tunnel_file
            .readiness_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(tunnel_defaults.readiness_interval),
        stop_timeout: tunnel_defaults.stop_timeout,
    };

    let scheduler_file = &file_config.scheduler;
    let wait_defaults = WaitOptions::default();
    let node_wait = WaitOptions {
        max_attempts: scheduler_file
            .node_poll_attempts
            .unwrap_or(wait_defaults.max_attempts),
        poll_interval: scheduler_file
            .node_poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(wait_defaults.poll_interval),
        return_pending_on_timeout: true,
    };
    let remote_ports = port_range(
        "scheduler.remote_port",
        scheduler_file.remote_port_start,
        scheduler_file.remote_port_end,
        DEFAULT_REMOTE_PORTS,
    )?;

    let catalog = build_catalog(&file_config, remote_ports, base_dir)?;

    let config = Config {
        database_path,
        listen_port,
        verbose,
        reconcile_interval_secs,
        health_ttl: Duration::from_secs(
            file_config
                .health_ttl_secs
                .unwrap_or(DEFAULT_HEALTH_TTL_SECS),
        ),
        catalog,
        local_ports,
        tunnel,
        node_wait,
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path: ConfigValue {
            value: config.database_path.clone(),
            source: database_source,
        },
        listen_port: ConfigValue {
            value: config.listen_port,
            source: port_source,
        },
        reconcile_interval_secs: ConfigValue {
            value: config.reconcile_interval_secs,
            source: reconcile_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
        clusters: config.catalog.cluster_names(),
    };

    Ok(LoadResult { config, report })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn pick<T>(flag: Option<T>, file: Option<T>, default: T) -> (T, ConfigSource) {
    match (flag, file) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default, ConfigSource::Default),
    }
}

fn port_range(
    name: &str,
    start: Option<u16>,
    end: Option<u16>,
    default: RangeInclusive<u16>,
) -> Result<RangeInclusive<u16>> {
    let start = start.unwrap_or(*default.start());
    let end = end.unwrap_or(*default.end());
    if start == 0 || start > end {
        anyhow::bail!("{name}_start..{name}_end must be a non-empty range of ports ({start}-{end})");
    }
    Ok(start..=end)
}

fn build_catalog(
    file_config: &FileConfig,
    remote_ports: RangeInclusive<u16>,
    base_dir: Option<&Path>,
) -> Result<Catalog> {
    let mut ide_profiles: BTreeMap<Ide, _> = Ide::ALL
        .into_iter()
        .map(|ide| (ide, ides::default_profile(ide)))
        .collect();
    for (name, overrides) in &file_config.ides {
        let ide: Ide = name
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid [ides.{name}] section: {err}"))?;
        let Some(profile) = ide_profiles.get_mut(&ide) else {
            continue;
        };
        if let Some(port) = overrides.default_port {
            if port == 0 {
                anyhow::bail!("ides.{name}.default_port must be between 1 and 65535");
            }
            profile.default_port = port;
        }
        if let Some(setup) = &overrides.setup {
            profile.setup = setup.clone();
        }
        if let Some(dir) = &overrides.working_dir {
            profile.working_dir = Some(dir.clone());
        }
    }

    let mut clusters = BTreeMap::new();
    for (name, cluster) in &file_config.clusters {
        if name.is_empty() || name.contains('-') {
            anyhow::bail!("cluster name '{name}' must be non-empty and must not contain '-'");
        }
        if cluster.host.trim().is_empty() {
            anyhow::bail!("clusters.{name}.host must not be empty");
        }
        let offered = match &cluster.ides {
            Some(names) => names
                .iter()
                .map(|ide| {
                    ide.parse::<Ide>()
                        .map_err(|err| anyhow::anyhow!("clusters.{name}.ides: {err}"))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Ide::ALL.to_vec(),
        };
        clusters.insert(
            name.clone(),
            ClusterProfile {
                name: name.clone(),
                ssh: SshConfig {
                    host: cluster.host.trim().to_string(),
                    port: cluster.port.unwrap_or(DEFAULT_SSH_PORT),
                    username: cluster.user.clone(),
                    identity_path: cluster
                        .identity_path
                        .as_deref()
                        .map(|raw| resolve_path(raw, base_dir).to_string_lossy().into_owned()),
                    options: cluster.ssh_options.clone(),
                },
                partition: cluster.partition.clone(),
                ides: offered,
                max_cpus: cluster.max_cpus.unwrap_or(DEFAULT_MAX_CPUS),
            },
        );
    }

    let job_prefix = file_config
        .job_prefix
        .clone()
        .unwrap_or_else(|| DEFAULT_JOB_PREFIX.to_string());
    if job_prefix.is_empty() || job_prefix.contains(',') || job_prefix.contains(char::is_whitespace) {
        anyhow::bail!("job_prefix must be non-empty without commas or whitespace");
    }

    Ok(Catalog {
        job_prefix,
        remote_ports,
        clusters,
        ides: ide_profiles,
    })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(DATABASE_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.prev {
                // SAFETY: tests serialize env mutations with ENV_LOCK.
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                // SAFETY: tests serialize env mutations with ENV_LOCK.
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("portal.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    fn load_config(path: PathBuf) -> Result<Config> {
        load_with_report(Some(path), Overrides::default()).map(|loaded| loaded.config)
    }

    const CLUSTERS: &str = r#"
database_path = "db/portal.sqlite"

[clusters.gemini]
host = "gemini.example.org"
identity_path = "keys/id_ed25519"
partition = "interactive"
ssh_options = ["ProxyJump=bastion"]

[clusters.apollo]
host = "apollo.example.org"
port = 2222
user = "svc"
ides = ["vscode"]
max_cpus = 8
"#;

    #[test]
    fn missing_optional_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let cfg = read_config_file(&dir.path().join("missing.toml"), false).unwrap();
        assert!(cfg.database_path.is_none());
        assert!(cfg.clusters.is_empty());
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn builds_catalog_from_cluster_sections() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CLUSTERS);
        let config = load_config(path).unwrap();
        let config_dir = dir.path().join("config");
        assert_eq!(config.database_path, config_dir.join("db").join("portal.sqlite"));

        let gemini = config.catalog.cluster("gemini").unwrap();
        assert_eq!(gemini.ssh.port, 22);
        assert_eq!(
            gemini.ssh.identity_path.as_deref(),
            Some(config_dir.join("keys").join("id_ed25519").to_str().unwrap())
        );
        assert_eq!(gemini.ssh.options, vec!["ProxyJump=bastion".to_string()]);
        assert_eq!(gemini.ides, Ide::ALL.to_vec());

        let apollo = config.catalog.cluster("apollo").unwrap();
        assert_eq!(apollo.ssh.destination(), "svc@apollo.example.org");
        assert_eq!(apollo.ides, vec![Ide::VsCode]);
        assert_eq!(apollo.max_cpus, 8);
        assert_eq!(config.catalog.job_prefix, DEFAULT_JOB_PREFIX);
        assert_eq!(config.local_ports, DEFAULT_LOCAL_PORTS);
    }

    #[test]
    fn rejects_hyphenated_cluster_names() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[clusters.big-iron]\nhost = \"h\"\n");
        let err = load_config(path).unwrap_err();
        assert!(err.to_string().contains("must not contain '-'"));
    }

    #[test]
    fn ide_sections_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[ides.jupyter]\ndefault_port = 9999\nsetup = [\"module load python\"]\nworking_dir = \"$HOME/work\"\n",
        );
        let config = load_config(path).unwrap();
        let jupyter = config.catalog.ide(Ide::Jupyter).unwrap();
        assert_eq!(jupyter.default_port, 9999);
        assert_eq!(jupyter.setup, vec!["module load python".to_string()]);
        assert_eq!(jupyter.working_dir.as_deref(), Some("$HOME/work"));
        assert_eq!(config.catalog.ide(Ide::RStudio).unwrap().default_port, 8787);
    }

    #[test]
    fn unknown_ide_section_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[ides.emacs]\ndefault_port = 1\n");
        assert!(load_config(path).is_err());
    }

    #[test]
    fn tunnel_and_scheduler_settings_are_read() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[tunnel]\nlocal_port_start = 30000\nlocal_port_end = 30010\nconnect_attempts = 5\nconnect_interval_ms = 250\n\n[scheduler]\nnode_poll_attempts = 10\nnode_poll_interval_ms = 500\nremote_port_start = 9000\nremote_port_end = 9100\n",
        );
        let config = load_config(path).unwrap();
        assert_eq!(config.local_ports, 30000..=30010);
        assert_eq!(config.tunnel.connect_attempts, 5);
        assert_eq!(config.tunnel.connect_interval, Duration::from_millis(250));
        assert_eq!(config.tunnel.readiness_attempts, 30);
        assert_eq!(config.node_wait.max_attempts, 10);
        assert_eq!(config.node_wait.poll_interval, Duration::from_millis(500));
        assert_eq!(config.catalog.remote_ports, 9000..=9100);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[tunnel]\nlocal_port_start = 30010\nlocal_port_end = 30000\n");
        assert!(load_config(path).is_err());
    }

    #[test]
    fn cli_overrides_take_precedence_over_file_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "database_path = \"db/from_config.sqlite\"\nlisten_port = 40001\nreconcile_interval_secs = 9\nverbose = false\n",
        );
        let LoadResult { config, report } = load_with_report(
            Some(path),
            Overrides {
                database_path: Some(PathBuf::from("from_flag.sqlite")),
                listen_port: Some(40002),
                reconcile_interval_secs: None,
                verbose: Some(true),
            },
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("from_flag.sqlite"));
        assert_eq!(config.listen_port, 40002);
        assert_eq!(config.reconcile_interval_secs, 9);
        assert!(config.verbose);
        assert_eq!(report.listen_port.source, ConfigSource::Override);
        assert_eq!(report.reconcile_interval_secs.source, ConfigSource::ConfigFile);
        assert_eq!(report.config_path_source, Some(ConfigSource::Override));
    }

    #[test]
    fn uses_defaults_when_keys_are_missing() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"portal.sqlite\"\n");
        let LoadResult { config, report } = load_with_report(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert_eq!(config.reconcile_interval_secs, DEFAULT_RECONCILE_INTERVAL_SECS);
        assert_eq!(config.health_ttl, Duration::from_secs(DEFAULT_HEALTH_TTL_SECS));
        assert_eq!(report.verbose.source, ConfigSource::Default);
        assert!(report.clusters.is_empty());
    }

    #[test]
    fn zero_port_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"portal.sqlite\"\nlisten_port = 0\n");
        let err = load_config(path).unwrap_err();
        assert!(err.to_string().contains("listen_port"));
    }

    #[test]
    fn ensure_database_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("portal.sqlite");
        ensure_database_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
        ensure_database_dir(Path::new("portal.sqlite")).unwrap();
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"portal.sqlite\"\nlisten_port = 40001\n");
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.listen_port, 40001);
        assert_eq!(report.config_path, Some(path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn empty_env_config_path_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, "");
        assert!(load_with_report(None, Overrides::default()).is_err());
        drop(_env);
        let _cleared = EnvVarGuard::clear(CONFIG_ENV_VAR);
        assert!(config_path_from_env().unwrap().is_none());
    }
}
