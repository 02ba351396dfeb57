//! Migration intake API
//!
//! Exposes migration creation/inspection, cancellation, and the alert
//! endpoint the monitoring side posts to. Migration creation is
//! idempotent on `client_request_id`; alerts are acknowledged
//! immediately and handled in the background.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use stratus_common::{Alert, Error, MigrationStatus};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::db;
use crate::error::ApiError;
use crate::state::AppState;
use crate::store::{Migration, MigrationEvent, MigrationFilter, NewMigration};

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/migrations", post(create_migration).get(list_migrations))
        .route("/migrations/:id", get(get_migration))
        .route("/migrations/:id/cancel", post(cancel_migration))
        .route("/scheduler/alert", post(receive_alert))
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer-token check; skipped entirely when no token is configured.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.server.token.as_deref() else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        ApiError::AuthenticationFailed.into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MigrationCreateRequest {
    /// Controller-internal VM id; alternatively the hypervisor uuid
    vm_id: Option<Uuid>,
    vm_uuid: Option<String>,
    source_host: String,
    target_host: String,
    reason: Option<String>,
    client_request_id: Option<String>,
    target_sr: Option<String>,
}

#[derive(Debug, Serialize)]
struct MigrationAccepted {
    migration_id: Uuid,
    status: MigrationStatus,
}

async fn create_migration(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MigrationCreateRequest>,
) -> Result<(StatusCode, Json<MigrationAccepted>), ApiError> {
    let vm_id = match (payload.vm_id, payload.vm_uuid) {
        (Some(id), _) => id,
        (None, Some(vm_uuid)) => match db::vms::get_by_uuid(state.database.pool(), &vm_uuid).await {
            Ok(vm) => vm.vm_id,
            Err(Error::VmNotFound(_)) => {
                return Err(ApiError::BadRequest(format!(
                    "vm_uuid '{}' not found in controller",
                    vm_uuid
                )))
            }
            Err(e) => return Err(e.into()),
        },
        (None, None) => {
            return Err(ApiError::BadRequest("vm_id or vm_uuid is required".to_string()))
        }
    };

    let new = NewMigration {
        vm_id,
        source_host: payload.source_host,
        target_host: payload.target_host,
        reason: payload.reason,
        client_request_id: payload.client_request_id,
        details: payload.target_sr.map(|sr| json!({"target_sr": sr})),
    };

    let migration = match state.store.create(new).await {
        Ok(m) => {
            if let Err(e) = state.queue.enqueue(m.id) {
                tracing::error!("Failed to enqueue migration {}: {}", m.id, e);
            }
            m
        }
        // an in-flight migration for the VM is an idempotency hit, not an error
        Err(Error::MigrationExists { existing, .. }) => state.store.get(existing).await?,
        Err(e) => return Err(e.into()),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(MigrationAccepted { migration_id: migration.id, status: migration.status }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    /// Comma-separated statuses, e.g. `queued,running`
    status: Option<String>,
    vm_id: Option<Uuid>,
}

async fn list_migrations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Migration>>, ApiError> {
    let statuses = match params.status {
        Some(csv) => {
            let mut parsed = Vec::new();
            for token in csv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match MigrationStatus::parse(token) {
                    Some(status) => parsed.push(status),
                    None => {
                        return Err(ApiError::BadRequest(format!("Unknown status '{}'", token)))
                    }
                }
            }
            Some(parsed)
        }
        None => None,
    };

    let migrations = state
        .store
        .list(&MigrationFilter { statuses, vm_id: params.vm_id, since: None })
        .await?;
    Ok(Json(migrations))
}

#[derive(Debug, Serialize)]
struct MigrationDetail {
    #[serde(flatten)]
    migration: Migration,
    events: Vec<MigrationEvent>,
}

async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MigrationDetail>, ApiError> {
    let migration = state.store.get(id).await?;
    let events = state.store.events(id, 50).await?;
    Ok(Json(MigrationDetail { migration, events }))
}

async fn cancel_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Migration>), ApiError> {
    let migration = state.store.request_cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(migration)))
}

async fn receive_alert(
    State(state): State<Arc<AppState>>,
    Json(alert): Json<Alert>,
) -> (StatusCode, Json<serde_json::Value>) {
    // respond immediately, work in the background
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.handle_alert(alert).await;
    });

    (StatusCode::ACCEPTED, Json(json!({"accepted": true})))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .database
        .health_check()
        .await
        .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;
    Ok(Json(json!({"status": "ok"})))
}
