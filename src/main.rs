use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomward::config::SchedulingConfig;
use roomward::directory::StaticDirectory;
use roomward::engine::Engine;
use roomward::server::{self, ServerSettings};
use roomward::wire::RoomwardFactory;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = ServerSettings::from_env();
    let config = SchedulingConfig::from_env()?;
    roomward::observability::init(settings.metrics_port);

    let tls_acceptor = server::load_tls_acceptor(settings.tls_cert.as_deref(), settings.tls_key.as_deref())?;

    let directory = match &settings.directory {
        Some(path) => StaticDirectory::load(path)?,
        None => {
            tracing::warn!("ROOMWARD_DIRECTORY not set, every room lookup will fail");
            StaticDirectory::new()
        }
    };
    info!(
        rooms = directory.room_count(),
        users = directory.user_count(),
        "directory loaded"
    );
    let directory = Arc::new(directory);

    std::fs::create_dir_all(&settings.data_dir)?;
    let engine = Arc::new(Engine::new(
        settings.wal_path(),
        config.clone(),
        directory.clone(),
        directory,
    )?);
    server::spawn_compactor(engine.clone(), settings.compact_threshold, COMPACT_CHECK_INTERVAL);

    let addr = settings.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("roomward listening on {addr}");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  max_connections: {}", settings.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );
    info!(?config, "scheduling policy");

    let factory = Arc::new(RoomwardFactory::new(engine, settings.password.clone()));
    server::serve(
        listener,
        factory,
        tls_acceptor,
        settings.max_connections,
        server::shutdown_signal(),
    )
    .await;

    info!("roomward stopped");
    Ok(())
}
