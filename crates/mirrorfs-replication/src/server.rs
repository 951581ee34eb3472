//! Replication HTTP server
//!
//! Surface:
//!
//! ```text
//! POST /stream          ordered frame stream from a given position
//! GET  /snapshot/{db}   full database copy plus resume position
//! GET  /pos             last durable position per database
//! GET  /status          node role and stream accounting
//! GET  /metrics         Prometheus exposition
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRef, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, info, warn};

use mirrorfs_core::types::{headers as wire, ReplicationConfig, Role};
use mirrorfs_core::{Error, ErrorBody, Result};
use mirrorfs_store::Store;

use crate::metrics::{metrics_handler, metrics_middleware, MetricsRecorder};
use crate::protocol::{StatusResponse, StreamRequest};
use crate::stream::{frame_body, ReplicaRegistry};

/// Application state shared across handlers
#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Arc<Store>,
    pub metrics: Arc<MetricsRecorder>,
    pub registry: Arc<ReplicaRegistry>,
    pub config: Arc<ReplicationConfig>,
    pub node_id: String,
}

/// Replication API server
pub struct ReplicationServer {
    state: AppState,
}

impl ReplicationServer {
    pub fn new(store: Arc<Store>, config: ReplicationConfig, node_id: String) -> Self {
        Self {
            state: AppState {
                store,
                metrics: Arc::new(MetricsRecorder::new()),
                registry: Arc::new(ReplicaRegistry::default()),
                config: Arc::new(config),
                node_id,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/stream", post(stream_handler))
            .route("/snapshot/{db}", get(snapshot_handler))
            .route("/pos", get(positions_handler))
            .route("/status", get(status_handler))
            .route("/metrics", get(metrics_handler))
            .layer(middleware::from_fn_with_state(
                self.state.metrics.clone(),
                metrics_middleware,
            ))
            .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until the process exits
    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.bind_address, self.state.config.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("replication server listening on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Serve on an already-bound listener. Useful for ephemeral ports.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Maps domain errors onto HTTP responses with a JSON body
pub(crate) struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            debug!(code = self.0.code(), error = %self.0, "request rejected");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// `POST /stream`: serve frames from `position + 1`, then follow live
/// commits. Rejected off the primary; answers `SnapshotRequired` when
/// the requested position is no longer retained or unknown.
async fn stream_handler(
    State(state): State<AppState>,
    Json(req): Json<StreamRequest>,
) -> std::result::Result<Response, ApiError> {
    if state.store.role() != Role::Primary {
        return Err(Error::NotPrimary.into());
    }
    let db = state.store.database(&req.db)?;
    if db.is_out_of_sync() {
        return Err(Error::OutOfSync(req.db).into());
    }

    let floor = db.retained_floor().await;
    let position = db.position().await;
    if req.position + 1 < floor {
        return Err(Error::SnapshotRequired { min_position: floor }.into());
    }
    if req.position > position {
        // the follower claims history this primary never produced
        return Err(Error::SnapshotRequired { min_position: floor }.into());
    }

    let body = frame_body(
        Arc::clone(&state.store),
        db,
        Arc::clone(&state.registry),
        req.position,
        state.config.send_queue_depth,
        Arc::clone(&state.metrics),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(wire::X_MIRRORFS_POSITION, position.to_string())
        .body(body)
        .map_err(|e| ApiError(Error::Internal(format!("failed to build response: {e}"))))
}

/// `GET /snapshot/{db}`: point-in-time copy with its position and a
/// content checksum for the follower to verify.
async fn snapshot_handler(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
) -> std::result::Result<Response, ApiError> {
    if state.store.role() != Role::Primary {
        return Err(Error::NotPrimary.into());
    }
    let db = state.store.database(&db_name)?;
    let (data, position) = db.snapshot().await?;
    let checksum = hex::encode(Sha256::digest(&data));

    state.metrics.record_snapshot_served(&db_name);
    info!(db = %db_name, position, bytes = data.len(), "serving snapshot");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(wire::X_MIRRORFS_POSITION, position.to_string())
        .header(wire::X_MIRRORFS_CHECKSUM, checksum)
        .body(Body::from(data))
        .map_err(|e| ApiError(Error::Internal(format!("failed to build response: {e}"))))
}

/// `GET /pos`
async fn positions_handler(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.store.positions().await)
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let lease = state.store.lease_state();
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        role: lease.role,
        primary_url: lease.primary_url,
        databases: state.store.database_count() as u64,
        followers: state.registry.len() as u64,
        version: mirrorfs_core::VERSION.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_codes() {
        let resp = ApiError(Error::NotPrimary).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = ApiError(Error::SnapshotRequired { min_position: 9 }).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError(Error::NoSuchDatabase("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
