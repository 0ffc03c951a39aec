//! Authorization server
//!
//! PostgreSQL-backed, multi-tenant hierarchical RBAC with:
//! - An organization tree rooted at the fixed Admin organization
//! - Effective-permission resolution with inheritance and provenance
//! - Short-lived scoped tokens carrying the resolved set
//! - A typed message fabric between the coordinator and the handlers
//! - An immutable, monthly-partitioned audit log with anomaly detection

pub mod config;
pub mod db;
pub mod fabric;
pub mod models;
pub mod services;

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

use crate::config::AuthzConfig;
use crate::services::{AuthCoordinator, Database, OrganizationService, PermissionService};
use authz_core::error::AuthzError;

/// Application state: the probe endpoints use the database handle; the
/// coordinator and the admin services are the mount points for whichever
/// transport exposes the protected operations.
#[derive(Clone)]
pub struct AppState {
    pub config: AuthzConfig,
    pub db: Database,
    pub coordinator: Arc<AuthCoordinator>,
    pub organizations: OrganizationService,
    pub permissions: PermissionService,
}

/// Probe router: liveness and readiness only. The protected operations are
/// the coordinator's API; the transport exposing them lives elsewhere.
pub fn build_probe_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
}

/// Health check endpoint.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AuthzError> {
    state.db.health_check().await?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "checks": {
            "postgresql": "up"
        }
    })))
}

/// Readiness probe.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AuthzError> {
    state.db.health_check().await?;
    Ok(Json(serde_json::json!({ "status": "ready" })))
}
