//! HTTP routes.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    BindingQuery, Instance, JoinRequest, ObservedPortsRequest, Port, PortBinding, PortQuery,
    ReleaseRequest, ReserveRequest,
};
use rusqlite::Connection;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::PoolConfig;
use crate::error::{GatekeeperError, Result};
use crate::registry::NewInstance;
use crate::{allocator, lifecycle, query, reconcile, registry};

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    config: PoolConfig,
}

impl AppState {
    pub fn new(conn: Connection, config: PoolConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run `f` with exclusive use of the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .db
            .lock()
            .map_err(|e| GatekeeperError::Internal(format!("lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/instances", post(join_instance).get(list_instances))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/ports", get(list_ports))
        .route("/api/ports/reserve", post(reserve_ports))
        .route("/api/ports/release", post(release_ports))
        .route("/api/ports/observed", post(observe_ports))
        .route("/api/bindings", get(list_bindings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Unwrap a JSON body, reporting malformed input as a 400.
fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| GatekeeperError::InvalidRequest(rejection.body_text()))
}

fn instance_id(value: Option<String>) -> Result<String> {
    value
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| GatekeeperError::InvalidRequest("instance_id is required".to_string()))
}

async fn health() -> &'static str {
    "OK"
}

async fn join_instance(
    State(state): State<AppState>,
    payload: std::result::Result<Json<JoinRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Instance>)> {
    let new = NewInstance::try_from(body(payload)?)?;
    let instance = state.with_conn(|conn| registry::join(conn, new))?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Debug, Default, Deserialize)]
struct InstanceListQuery {
    name: Option<String>,
}

async fn list_instances(
    State(state): State<AppState>,
    Query(params): Query<InstanceListQuery>,
) -> Result<Json<Vec<Instance>>> {
    let instances = state.with_conn(|conn| registry::list(conn, params.name.as_deref()))?;
    Ok(Json(instances))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>> {
    let instance = state.with_conn(|conn| registry::get(conn, &id))?;
    Ok(Json(instance))
}

async fn reserve_ports(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ReserveRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PortBinding>)> {
    let req = body(payload)?;
    let id = instance_id(req.instance_id)?;
    let config = state.config;
    let binding = state.with_conn(|conn| allocator::reserve(conn, &config, &id, req.range))?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn release_ports(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ReleaseRequest>, JsonRejection>,
) -> Result<Json<PortBinding>> {
    let req = body(payload)?;
    let config = state.config;
    let binding = state.with_conn(|conn| lifecycle::release(conn, &config, &req))?;
    Ok(Json(binding))
}

async fn list_ports(
    State(state): State<AppState>,
    Query(params): Query<PortQuery>,
) -> Result<Json<Vec<Port>>> {
    let ports = state.with_conn(|conn| query::list_ports(conn, &params))?;
    Ok(Json(ports))
}

async fn observe_ports(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ObservedPortsRequest>, JsonRejection>,
) -> Result<Json<Vec<Port>>> {
    let req = body(payload)?;
    let config = state.config;
    let ports = state.with_conn(|conn| reconcile::get_or_create_ports(conn, &config, &req.ports))?;
    Ok(Json(ports))
}

async fn list_bindings(
    State(state): State<AppState>,
    Query(params): Query<BindingQuery>,
) -> Result<Json<Vec<PortBinding>>> {
    let bindings = state.with_conn(|conn| query::list_bindings(conn, &params))?;
    Ok(Json(bindings))
}
