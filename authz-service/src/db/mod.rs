//! Database module for PostgreSQL connection management.

use crate::config::DatabaseConfig;
use authz_core::error::AuthzError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let command_timeout_ms = config.command_timeout_seconds * 1000;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        .max_lifetime(Duration::from_secs(1800))
        .after_connect(move |conn, _meta| {
            // Per-command deadline enforced server-side on every connection.
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {}", command_timeout_ms))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// The canonical schema is `authz`. Some earlier deployments carried a schema
/// literally named `authorization`; that name is rejected at startup rather
/// than silently coexisting.
pub async fn assert_canonical_schema(pool: &PgPool) -> Result<(), AuthzError> {
    let conflicting: Option<(String,)> = sqlx::query_as(
        "SELECT schema_name FROM information_schema.schemata WHERE schema_name = 'authorization'",
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| AuthzError::QueryFailed(anyhow::anyhow!(e)))?;

    if conflicting.is_some() {
        return Err(AuthzError::ConfigError(anyhow::anyhow!(
            "found a schema named 'authorization'; the canonical schema is 'authz'. \
             Migrate or drop the conflicting schema before starting"
        )));
    }
    Ok(())
}

/// Check database health.
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_create_pool() {
        let config = DatabaseConfig {
            url: "postgres://localhost/authz_test".to_string(),
            min_connections: 1,
            max_connections: 5,
            idle_timeout_seconds: 900,
            connect_timeout_seconds: 15,
            command_timeout_seconds: 30,
        };

        let result = create_pool(&config).await;
        assert!(result.is_ok());
    }
}
