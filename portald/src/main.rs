// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use portald::adapters;
use portald::adapters::db::{SessionStore, SqliteStoreAdapter};
use portald::app::command_queue::CommandQueue;
use portald::app::health_cache::HealthCache;
use portald::app::port_allocator::PortAllocator;
use portald::app::ports::ClockPort;
use portald::app::tunnels::{TunnelDeps, TunnelManager};
use portald::app::usecases::{UseCaseDeps, UseCases};
use portald::{config, logging};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => info!(
            path = %path.display(),
            source = source.as_str(),
            present = report.config_file_present,
            "config path"
        ),
        (Some(path), None) => info!(
            path = %path.display(),
            present = report.config_file_present,
            "config path"
        ),
        (None, _) => info!("config path: (none)"),
    }
    info!(
        value = %report.database_path.value.display(),
        source = report.database_path.source.as_str(),
        "config database_path"
    );
    info!(
        value = report.listen_port.value,
        source = report.listen_port.source.as_str(),
        "config listen_port"
    );
    info!(
        value = report.reconcile_interval_secs.value,
        source = report.reconcile_interval_secs.source.as_str(),
        "config reconcile_interval_secs"
    );
    info!(
        value = report.verbose.value,
        source = report.verbose.source.as_str(),
        "config verbose"
    );
    if report.clusters.is_empty() {
        warn!("no clusters configured");
    } else {
        info!(clusters = ?report.clusters, "config clusters");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            listen_port: opts.port,
            reconcile_interval_secs: opts.reconcile_interval_secs,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);

    config::ensure_database_dir(&config.database_path)?;
    let clock: Arc<dyn ClockPort> = Arc::new(adapters::time::SystemClock::new());
    let db = SessionStore::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;
    let store = Arc::new(SqliteStoreAdapter::new(db, clock.clone()));

    let catalog = Arc::new(config.catalog);
    let network = Arc::new(adapters::network::NetworkAdapter::new()?);
    let (tunnels, _cleaned) = TunnelManager::bootstrap(
        TunnelDeps {
            catalog: catalog.clone(),
            ports: Arc::new(PortAllocator::new(config.local_ports)),
            spawner: Arc::new(adapters::tunnel::SshTunnelSpawner::default()),
            network,
            processes: Arc::new(adapters::process::PsProcessTable::new()),
            clock: clock.clone(),
        },
        config.tunnel,
    )
    .await
    .context("failed to clean up orphaned tunnels")?;

    let usecases = UseCases::new(
        UseCaseDeps {
            health: Arc::new(HealthCache::new(catalog.cluster_names(), config.health_ttl)),
            catalog,
            remote: Arc::new(adapters::ssh::SshAdapter::with_defaults()),
            queue: CommandQueue::new(),
            store,
            tunnels: tunnels.clone(),
            clock,
        },
        config.node_wait,
    );

    let reconciler = usecases.clone();
    let interval = Duration::from_secs(config.reconcile_interval_secs);
    let reconcile_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match reconciler.reconcile().await {
                Ok(report) if !report.ended.is_empty() => {
                    info!(ended = ?report.ended, checked = report.checked, "reconciled sessions");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        }
    });

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "server listening");
    axum::serve(listener, adapters::http::router(usecases))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    reconcile_task.abort();
    let stopped = tunnels.stop_all().await;
    info!(stopped, "tunnels stopped");
    Ok(())
}
