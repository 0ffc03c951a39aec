//! Periodic maintenance sweeps.
//!
//! Four loops, all driven by intervals and stopped by the shared shutdown
//! token: role expiry, blacklist cleanup, projection refresh, and audit
//! partition provisioning. Each sweep is independent; a failing iteration is
//! logged and the loop continues.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::MaintenanceConfig;
use crate::models::{AuditCategory, AuditResult, ClientContext};
use crate::services::audit::AuditService;
use crate::services::database::Database;

pub struct MaintenanceRunner {
    config: MaintenanceConfig,
    db: Database,
    audit: AuditService,
    shutdown: CancellationToken,
}

impl MaintenanceRunner {
    pub fn new(
        config: MaintenanceConfig,
        db: Database,
        audit: AuditService,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            db,
            audit,
            shutdown,
        }
    }

    /// Spawn all maintenance loops.
    pub fn start(self) {
        let role_expiry = Duration::from_secs(self.config.role_expiry_seconds);
        let token_cleanup = Duration::from_secs(self.config.token_cleanup_seconds);
        let projection_refresh = Duration::from_secs(self.config.projection_refresh_seconds);

        tracing::info!(
            role_expiry_secs = role_expiry.as_secs(),
            token_cleanup_secs = token_cleanup.as_secs(),
            projection_refresh_secs = projection_refresh.as_secs(),
            "starting maintenance loops"
        );

        {
            let db = self.db.clone();
            let audit = self.audit.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                run_loop("role_expiry", role_expiry, shutdown, move || {
                    let db = db.clone();
                    let audit = audit.clone();
                    async move { expire_roles(&db, &audit).await }
                })
                .await;
            });
        }

        {
            let db = self.db.clone();
            let audit = self.audit.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                run_loop("token_cleanup", token_cleanup, shutdown, move || {
                    let db = db.clone();
                    let audit = audit.clone();
                    async move { cleanup_tokens(&db, &audit).await }
                })
                .await;
            });
        }

        {
            let db = self.db.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                run_loop(
                    "projection_refresh",
                    projection_refresh,
                    shutdown,
                    move || {
                        let db = db.clone();
                        async move {
                            db.refresh_permission_projection().await?;
                            Ok(())
                        }
                    },
                )
                .await;
            });
        }

        {
            let db = self.db.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                // Partitions only change at month boundaries; daily is plenty.
                run_loop(
                    "audit_partitions",
                    Duration::from_secs(24 * 3600),
                    shutdown,
                    move || {
                        let db = db.clone();
                        async move { db.ensure_audit_partitions().await }
                    },
                )
                .await;
            });
        }
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    sweep: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), authz_core::error::AuthzError>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup stays quick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(sweep = name, "maintenance loop shutting down");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = sweep().await {
                    tracing::error!(sweep = name, error = %e, "maintenance sweep failed");
                }
            }
        }
    }
}

/// Deactivate user-role edges whose expiry has passed and record one audit
/// event summarizing the batch.
async fn expire_roles(
    db: &Database,
    audit: &AuditService,
) -> Result<(), authz_core::error::AuthzError> {
    let expired = db.expire_user_roles().await?;
    if expired > 0 {
        tracing::info!(count = expired, "expired user-role assignments");
        audit
            .log_best_effort(
                "ROLE_EXPIRY_SWEEP",
                AuditCategory::System,
                None,
                None,
                None,
                Some("expire"),
                AuditResult::Success,
                serde_json::json!({ "expired_count": expired }),
                &ClientContext::default(),
            )
            .await;
    }
    Ok(())
}

/// Drop blacklist rows whose expiry has passed.
async fn cleanup_tokens(
    db: &Database,
    audit: &AuditService,
) -> Result<(), authz_core::error::AuthzError> {
    let removed = db.cleanup_expired_tokens().await?;
    if removed > 0 {
        tracing::info!(count = removed, "removed expired blacklist entries");
        audit
            .log_best_effort(
                "TOKEN_CLEANUP",
                AuditCategory::System,
                None,
                None,
                None,
                Some("cleanup"),
                AuditResult::Success,
                serde_json::json!({ "removed_count": removed }),
                &ClientContext::default(),
            )
            .await;
    }
    Ok(())
}
