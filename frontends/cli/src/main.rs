//! Mirror the tables listed in a YAML config and log every change
//!
//! Usage: `pgmirror [--config|-c] <path>`, or set `PGMIRROR_CONFIG`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use pgmirror::{
    ConnectorRegistry, MirrorConfig, MirrorEvent, NotificationRouter, PostgresDriver,
    RequiredFields, TableManager,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_ENV: &str = "PGMIRROR_CONFIG";

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    let mut path = None;

    // Simple argument parsing: --config <path> or <path>
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(p) = args.next() {
                path = Some(PathBuf::from(p));
            }
        } else if !arg.starts_with('-') {
            path = Some(PathBuf::from(arg));
        }
    }

    path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("tokio_postgres=warn".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let path = config_path()
        .with_context(|| format!("No config file given (pass --config or set {})", CONFIG_ENV))?;
    let config = MirrorConfig::load_from_file(&path)?;
    tracing::info!("[Main] loaded config from {}", path.display());

    let registry = ConnectorRegistry::new(Arc::new(PostgresDriver));
    let routers = open_connections(&registry, &config).await?;
    let (managers, mut events) = start_mirrors(&registry, &routers, &config).await;

    tracing::info!(
        "[Main] mirroring {} table(s), press Ctrl-C to stop",
        managers.len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some((table, event)) = events.next() => log_event(&managers, &table, event).await,
            else => break,
        }
    }

    for name in registry.names() {
        registry.close(&name)?;
    }
    tracing::info!("[Main] shut down");
    Ok(())
}

/// Register and open every configured connection. A connection that fails
/// to open is logged and left out of the returned routers.
async fn open_connections(
    registry: &ConnectorRegistry,
    config: &MirrorConfig,
) -> Result<HashMap<String, Arc<NotificationRouter>>> {
    let mut routers = HashMap::new();

    for conn in &config.connections {
        let name = registry.add_with_params(conn.params(), Some(&conn.name))?;
        let connector = registry
            .connector(&name)
            .with_context(|| format!("Connection {} vanished from the registry", name))?;

        let opened = match conn.resolve_password() {
            Ok(password) => registry
                .open(&name, &conn.username, &password)
                .await
                .with_context(|| format!("Failed to open connection {}", name)),
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            tracing::error!("[Main] {:#}", e);
            continue;
        }

        let router = Arc::new(NotificationRouter::new());
        router.listen(&connector);
        routers.insert(name, router);
    }

    Ok(routers)
}

/// Attach and load a manager for every table whose connection is open
async fn start_mirrors(
    registry: &ConnectorRegistry,
    routers: &HashMap<String, Arc<NotificationRouter>>,
    config: &MirrorConfig,
) -> (Vec<Arc<TableManager>>, StreamMap<String, UnboundedReceiverStream<MirrorEvent>>) {
    let mut managers = Vec::new();
    let mut events = StreamMap::new();

    for table in &config.tables {
        let (Some(connector), Some(router)) = (
            registry.connector(&table.connection),
            routers.get(&table.connection),
        ) else {
            tracing::warn!(
                "[Main] skipping {}.{}: connection {} is not open",
                table.schema,
                table.table,
                table.connection
            );
            continue;
        };

        let descriptor = table.descriptor();
        let mut manager = TableManager::new(connector, descriptor.clone()).with_policy(table.policy);
        if table.validate_required {
            manager = manager.with_validator(RequiredFields::from_descriptor(&descriptor));
        }
        let manager = Arc::new(manager);
        manager.attach(router);
        events.insert(descriptor.qualified_name(), manager.event_stream());
        manager.load().await;
        managers.push(manager);
    }

    (managers, events)
}

async fn log_event(managers: &[Arc<TableManager>], table: &str, event: MirrorEvent) {
    match event {
        MirrorEvent::LoadStateChanged(state) => {
            let count = match managers
                .iter()
                .find(|m| m.descriptor().qualified_name() == table)
            {
                Some(manager) => manager.count().await,
                None => 0,
            };
            tracing::info!("[Main] {} is {:?} with {} row(s)", table, state, count);
        }
        MirrorEvent::UpdatedItem(id) => tracing::info!("[Main] {} row {} changed", table, id),
        MirrorEvent::Updated => tracing::debug!("[Main] {} updated", table),
        MirrorEvent::Warning(warning) => tracing::warn!("[Main] {}: {}", table, warning),
        MirrorEvent::QueryError { id, error } => {
            tracing::error!("[Main] {} command {} failed: {}", table, id, error)
        }
    }
}
