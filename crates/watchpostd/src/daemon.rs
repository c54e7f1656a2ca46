//! Config → runtime wiring for the daemon's subcommands.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use watchpost_checker::{CheckSpec, Supervisor};
use watchpost_core::WatchpostConfig;
use watchpost_history::{CompactionPolicy, HistoryOptions, HistoryStore};
use watchpost_notify::Dispatcher;

/// Store options derived from config; every configured check is registered.
pub fn history_options(config: &WatchpostConfig) -> anyhow::Result<HistoryOptions> {
    let policy = CompactionPolicy {
        max_writes: config.compact.max_writes,
        interval: config.compact.interval()?,
    };
    let mut options = HistoryOptions::new(&config.db)
        .max_entries(config.history.max_entries)
        .max_concurrent_writes(config.history.max_concurrent_writes)
        .compaction(policy);
    for (group, definition) in config.check_definitions()? {
        options = options.register(&group, &definition.name);
    }
    Ok(options)
}

pub fn check_specs(config: &WatchpostConfig) -> anyhow::Result<Vec<CheckSpec>> {
    let shell = config.shell();
    Ok(config
        .check_definitions()?
        .iter()
        .map(|(group, definition)| CheckSpec::from_definition(group, &shell, definition))
        .collect())
}

fn open_store(config: &WatchpostConfig) -> anyhow::Result<HistoryStore> {
    HistoryStore::open(history_options(config)?)
        .with_context(|| format!("failed to open history file {}", config.db))
}

/// Run every check and serve the API until Ctrl-C.
pub async fn run(config: WatchpostConfig) -> anyhow::Result<()> {
    info!(name = %config.name, services = config.services.len(), "watchpost starting");

    let dispatcher = Dispatcher::from_config(&config).context("invalid notification config")?;
    info!(handlers = dispatcher.handler_count(), "notification handlers loaded");

    let store = open_store(&config)?;
    let mut supervisor = Supervisor::new(store.clone(), Arc::new(dispatcher));
    match supervisor.start_all(check_specs(&config)?) {
        Ok(started) => info!(checks = started, "checks started"),
        Err(e) => {
            supervisor.close().await;
            return Err(e.into());
        }
    }

    // ── API server ─────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            supervisor.close().await;
            return Err(e).with_context(|| format!("failed to bind {addr}"));
        }
    };
    let router = watchpost_api::build_router(store, &config.name);
    let server = tokio::spawn(watchpost_api::serve(listener, router, shutdown_rx));

    // ── Shutdown ───────────────────────────────────────────────

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");

    supervisor.close().await;
    let _ = shutdown_tx.send(true);
    server.await.context("API server task failed")??;

    info!("watchpost stopped");
    Ok(())
}

/// Open (creating if needed) the history file, then compact it unless told
/// not to.
pub async fn check_config(config: &WatchpostConfig, no_compact: bool) -> anyhow::Result<()> {
    let checks = config.check_definitions()?.len();
    let store = open_store(config)?;
    let stats = store.stats();
    info!(
        services = config.services.len(),
        checks,
        groups = stats.groups,
        items = stats.items,
        "configuration is valid"
    );

    let result = if no_compact {
        Ok(())
    } else {
        compact_store(&store).await
    };
    store.close().await;
    result
}

/// Compact the history file and exit.
pub async fn compact(config: &WatchpostConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let result = compact_store(&store).await;
    store.close().await;
    result
}

async fn compact_store(store: &HistoryStore) -> anyhow::Result<()> {
    let kept = store.compact().await.context("compaction failed")?;
    info!(path = ?store.path(), kept, "history compacted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use watchpost_core::CheckKind;
    use watchpost_history::Observation;

    fn config(dir: &tempfile::TempDir) -> WatchpostConfig {
        let db = dir.path().join("history.jsonl");
        WatchpostConfig::from_toml_str(&format!(
            r#"
            db = "{}"
            shell = "/bin/sh"

            [history]
            max_entries = 10

            [compact]
            max_writes = 500
            interval = "1h"

            [services.api]
            checks = [
              {{ name = "Website is up", cmd = "true" }},
              {{ name = "Queue depth", type = "metric", unit = "jobs", cmd = ["echo 1", "echo 2"] }},
            ]
            "#,
            db.display()
        ))
        .unwrap()
    }

    #[test]
    fn options_register_every_check() {
        let dir = tempfile::tempdir().unwrap();
        let options = history_options(&config(&dir)).unwrap();
        assert_eq!(options.max_entries, 10);
        assert_eq!(options.compaction.max_writes, 500);
        assert_eq!(options.compaction.interval, Some(Duration::from_secs(3600)));
        assert_eq!(options.registered.len(), 2);
    }

    #[test]
    fn specs_carry_group_and_shell() {
        let dir = tempfile::tempdir().unwrap();
        let specs = check_specs(&config(&dir)).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.group == "api" && s.shell == "/bin/sh"));
        let depth = specs.iter().find(|s| s.name == "Queue depth").unwrap();
        assert_eq!(depth.kind, CheckKind::Metric);
        assert_eq!(depth.command, "echo 1;echo 2");
        assert!(specs.iter().all(|s| s.validate().is_ok()));
    }

    #[tokio::test]
    async fn check_config_creates_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        check_config(&config, true).await.unwrap();
        assert!(dir.path().join("history.jsonl").exists());
    }

    #[tokio::test]
    async fn compact_drops_removed_checks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let store = HistoryStore::open(HistoryOptions::new(&config.db)).unwrap();
        store
            .append(Observation::healthy("api", "Website is up", CheckKind::Boolean))
            .await
            .unwrap();
        store
            .append(Observation::healthy("legacy", "Old check", CheckKind::Boolean))
            .await
            .unwrap();
        store.close().await;

        compact(&config).await.unwrap();

        let content = std::fs::read_to_string(&config.db).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("Website is up"));
    }
}
