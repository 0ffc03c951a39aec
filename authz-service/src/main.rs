//! Authorization server - main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use authz_service::config::{AuthzConfig, FabricTransportKind};
use authz_service::fabric::handlers::{register_core_handlers, HandlerRegistry};
use authz_service::fabric::rabbitmq::RabbitMqTransport;
use authz_service::fabric::transport::{InMemoryTransport, Transport};
use authz_service::fabric::{Fabric, FabricConfig, FabricConsumer};
use authz_service::services::{
    AuditService, AuthCoordinator, Database, IdentityProvider, MaintenanceRunner, OidcProvider,
    OrganizationService, PermissionService, TokenService,
};
use authz_service::{db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration first (before tracing init)
    let config = AuthzConfig::from_env()?;

    authz_core::observability::init_tracing(&config.service_name, &config.log_level);

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting authz-service"
    );

    // Create PostgreSQL connection pool
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("PostgreSQL connection pool created");

    // Run migrations, then refuse to start beside a conflicting legacy schema.
    db::run_migrations(&pool).await?;
    db::assert_canonical_schema(&pool).await?;

    let database = Database::new(pool.clone());

    // Seed the Admin root and this month's audit partitions; both idempotent.
    let admin_id = database.ensure_admin_organization().await?;
    database.ensure_audit_partitions().await?;
    tracing::info!(admin_org_id = %admin_id, "admin organization ensured");

    // Token service
    let tokens = TokenService::new(&config.token)?;

    // Identity provider adapter
    let idp: Arc<dyn IdentityProvider> = Arc::new(OidcProvider::new(config.idp.clone())?);

    // Message fabric: transport, handlers, consumer, client.
    let transport: Arc<dyn Transport> = match config.fabric.transport {
        FabricTransportKind::InMemory => {
            tracing::info!("using in-memory fabric transport");
            Arc::new(InMemoryTransport::new(config.fabric.prefetch as usize))
        }
        FabricTransportKind::RabbitMq => {
            Arc::new(RabbitMqTransport::connect(&config.fabric.url, config.fabric.prefetch).await?)
        }
    };

    let mut registry = HandlerRegistry::new();
    register_core_handlers(&mut registry);

    let shutdown = CancellationToken::new();
    let fabric_config = FabricConfig::from_settings(&config.fabric);

    let consumer = FabricConsumer::new(
        transport.clone(),
        Arc::new(registry),
        database.clone(),
        fabric_config.clone(),
        shutdown.clone(),
    );
    consumer.start().await?;
    tracing::info!("fabric consumers started");

    let fabric = Arc::new(Fabric::new(transport, fabric_config));
    let coordinator = Arc::new(AuthCoordinator::new(fabric, tokens, idp));

    // Administrative services share the audit pipeline.
    let audit = AuditService::new(database.clone());
    let organizations = OrganizationService::new(database.clone(), audit.clone());
    let permissions = PermissionService::new(database.clone(), audit.clone());

    // Maintenance sweeps
    MaintenanceRunner::new(
        config.maintenance.clone(),
        database.clone(),
        audit,
        shutdown.clone(),
    )
    .start();

    // HTTP probe endpoints for orchestrator health checks
    let state = AppState {
        config: config.clone(),
        db: database,
        coordinator,
        organizations,
        permissions,
    };
    let probe_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let probe_router = authz_service::build_probe_router(state);

    tracing::info!("probe endpoints listening on {}", probe_addr);
    let listener = TcpListener::bind(probe_addr).await?;

    axum::serve(listener, probe_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Stop consumers and maintenance, then drain the pool.
    shutdown.cancel();
    pool.close().await;
    tracing::info!("shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM and cancels the shared token so fabric
/// consumers and maintenance loops stop before the pool closes.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
