use std::sync::Arc;

use clap::Parser;
use canopy_core::TenantId;
use canopy_server::cli::{Cli, Command};
use canopy_server::config::{AppConfig, LogFormat, StorageBackend};
use canopy_server::metrics::Metrics;
use canopy_server::rest;
use canopy_server::service::PermissionService;
use canopy_server::sweep_job::spawn_sweep_job;
use canopy_storage::postgres::{PostgresStoreFactory, migrations};
use canopy_storage::{InMemoryStoreFactory, StoreFactory, run_sweep_cycle};

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    match cli.command {
        Some(Command::Migrate) => run_migrate(&config).await,
        Some(Command::ProvisionTenant { name }) => run_provision_tenant(&config, &name).await,
        Some(Command::Sweep { tenant_id }) => run_sweep_once(&config, tenant_id.as_deref()).await,
        Some(Command::Serve) | None => run_serve(config).await,
    }
}

async fn connect(config: &AppConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
}

async fn run_migrate(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("running database migrations");
    let pool = connect(config).await?;
    migrations::run_shared_migrations(&pool).await?;
    tracing::info!("migrations completed successfully");
    Ok(())
}

async fn run_provision_tenant(
    config: &AppConfig,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = connect(config).await?;
    migrations::run_shared_migrations(&pool).await?;

    let tenant_id = TenantId::generate();
    let factory = PostgresStoreFactory::new(pool);
    factory.provision_tenant(&tenant_id, name).await?;

    println!("Tenant provisioned successfully");
    println!("  Name:      {name}");
    println!("  Tenant ID: {}", tenant_id.as_uuid());
    Ok(())
}

async fn run_sweep_once(
    config: &AppConfig,
    tenant_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.storage.backend != StorageBackend::Postgres {
        return Err("the sweep command needs storage.backend = \"postgres\"".into());
    }
    let tenant_id = match tenant_id {
        Some(id) => TenantId::new(uuid::Uuid::parse_str(id)?),
        None => config.tenant_id()?,
    };

    let pool = connect(config).await?;
    let factory = PostgresStoreFactory::new(pool);
    let report = run_sweep_cycle(&factory.for_tenant(&tenant_id)).await?;

    println!("Permission cache swept");
    println!("  Tenant ID:        {}", tenant_id.as_uuid());
    println!("  Rows removed:     {}", report.removed());
    println!("  Missing creative: {}", report.missing_creative);
    println!("  Missing user:     {}", report.missing_user);
    println!("  Missing share:    {}", report.missing_share);
    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let tenant_id = config.tenant_id()?;

    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; all data is lost on shutdown");
            serve(config, Arc::new(InMemoryStoreFactory::new()), tenant_id).await
        }
        StorageBackend::Postgres => {
            let pool = connect(&config).await?;
            migrations::run_shared_migrations(&pool).await?;
            let factory = PostgresStoreFactory::new(pool);
            factory
                .provision_tenant(&tenant_id, &config.tenant.name)
                .await?;
            serve(config, Arc::new(factory), tenant_id).await
        }
    }
}

async fn serve<F>(
    config: AppConfig,
    factory: Arc<F>,
    tenant_id: TenantId,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: StoreFactory + 'static,
{
    tracing::info!(
        http_addr = %config.http_addr(),
        tenant_id = %tenant_id,
        "starting canopy server"
    );

    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(
        PermissionService::new(factory, config.to_engine_config())
            .with_metrics(Arc::clone(&metrics)),
    );

    let (shutdown_tx, _) = tokio::sync::watch::channel(());

    let sweep_handle = config.sweep.enabled.then(|| {
        spawn_sweep_job(
            Arc::clone(&service),
            tenant_id,
            config.sweep_interval(),
            shutdown_tx.subscribe(),
        )
    });

    let state = rest::AppState {
        service,
        tenant_id,
        metrics,
    };
    let router = rest::create_router(state);

    let http_addr: std::net::SocketAddr = config.http_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(%http_addr, "REST server listening");

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });
    if let Err(e) = server.await {
        tracing::error!(error = %e, "REST server error");
    }

    // The server may also stop on its own; the sweep job follows it.
    let _ = shutdown_tx.send(());
    if let Some(handle) = sweep_handle
        && let Err(e) = handle.await
    {
        tracing::warn!(error = %e, "sweep job ended abnormally");
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { tracing::info!("received SIGINT"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT");
        }
    }

    let _ = shutdown_tx.send(());
}
