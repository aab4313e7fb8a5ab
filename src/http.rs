//! HTTP API for the sync engine
//!
//! Thin wire surface over the service layer:
//!
//! - `POST /items/sync` - read and write sync in one round trip
//! - `POST /transitions/{user_uuid}` - start or resume a dual-store
//!   transition for a user (operator surface)
//! - `GET /health` - health check with store statistics
//!
//! Authentication is a gateway concern; the caller identity arrives in
//! the `x-user-uuid` header, with `x-session-uuid` and
//! `x-read-only-access` alongside it.
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST -H "Content-Type: application/json" \
//!      -H "x-user-uuid: 9f3a…" \
//!      -d '{"items": [], "limit": 150, "api_version": "20240226"}' \
//!      http://localhost:8094/items/sync
//! ```

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::db::items::{Item, ItemHash};
use crate::error::SyncError;
use crate::services::save_rules::ItemConflict;
use crate::services::item_service::{GetItemsRequest, SaveItemsRequest};
use crate::services::{CancelFlag, Services};
use crate::transition::{TransitionOutcome, TransitionRunner};

/// Sync request body (wire shape)
#[derive(Debug, Default, Deserialize)]
struct SyncRequestBody {
    #[serde(default)]
    items: Vec<ItemHash>,
    #[serde(default)]
    sync_token: Option<String>,
    #[serde(default)]
    cursor_token: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    shared_vault_uuids: Option<Vec<String>>,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    sdk_version: Option<String>,
}

/// Sync response body (wire shape)
#[derive(Debug, Serialize)]
struct SyncResponseBody {
    retrieved_items: Vec<Item>,
    saved_items: Vec<Item>,
    conflicts: Vec<ItemConflict>,
    sync_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor_token: Option<String>,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
    /// Optional transition runner for the operator surface
    transition_runner: Option<Arc<TransitionRunner>>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            bind_addr,
            transition_runner: None,
        }
    }

    /// Set the transition runner for `/transitions/*` routes
    pub fn with_transition_runner(mut self, runner: Arc<TransitionRunner>) -> Self {
        self.transition_runner = Some(runner);
        self
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), SyncError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let result = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health(),

            (Method::POST, "/items/sync") => self.handle_sync(req).await,

            (Method::POST, p) if p.starts_with("/transitions/") => {
                let user_uuid = p.strip_prefix("/transitions/").unwrap_or("").to_string();
                self.handle_transition(&user_uuid).await
            }

            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(r#"{"error": "Not found"}"#)))
                .unwrap()),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn handle_health(&self) -> Result<Response<Full<Bytes>>, SyncError> {
        let stats = self.services.db.stats()?;
        let body = serde_json::json!({
            "status": "ok",
            "items": stats.item_count,
            "users": stats.user_count,
            "tombstones": stats.tombstone_count,
        });

        json_response(StatusCode::OK, &body.to_string())
    }

    async fn handle_sync(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, SyncError> {
        let user_uuid = required_header(&req, "x-user-uuid")?;
        let session_uuid = optional_header(&req, "x-session-uuid");
        let read_only_access = optional_header(&req, "x-read-only-access")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::BadRequest(format!("body read failed: {}", e)))?
            .to_bytes();

        let request: SyncRequestBody = if body.is_empty() {
            SyncRequestBody::default()
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| SyncError::BadRequest(format!("invalid JSON body: {}", e)))?
        };

        let cancel = CancelFlag::new();

        let retrieved = self.services.items.get_items(
            &GetItemsRequest {
                user_uuid: user_uuid.clone(),
                sync_token: request.sync_token.clone(),
                cursor_token: request.cursor_token.clone(),
                limit: request.limit,
                content_type: request.content_type.clone(),
                shared_vault_uuids: request.shared_vault_uuids.clone(),
            },
            &cancel,
        )?;

        let saved = self.services.items.save_items(
            &SaveItemsRequest {
                user_uuid,
                session_uuid,
                api_version: request.api_version.unwrap_or_default(),
                sdk_version: request.sdk_version,
                read_only_access,
                item_hashes: request.items,
            },
            &cancel,
        )?;

        // The save token supersedes the read token once anything was
        // persisted, so the next sync does not re-fetch its own writes
        let sync_token = if saved.saved_items.is_empty() {
            retrieved.sync_token
        } else {
            saved.sync_token
        };

        let response = SyncResponseBody {
            retrieved_items: retrieved.items,
            saved_items: saved.saved_items,
            conflicts: saved.conflicts,
            sync_token,
            cursor_token: retrieved.cursor_token,
        };

        json_response(StatusCode::OK, &serde_json::to_string(&response)?)
    }

    async fn handle_transition(
        &self,
        user_uuid: &str,
    ) -> Result<Response<Full<Bytes>>, SyncError> {
        if user_uuid.is_empty() {
            return Err(SyncError::BadRequest("missing user uuid".into()));
        }

        let runner = self
            .transition_runner
            .as_ref()
            .ok_or_else(|| SyncError::BadRequest("transitions not enabled".into()))?;

        let outcome = runner.run(user_uuid).await?;
        let outcome_text = match outcome {
            TransitionOutcome::AlreadyMigrated => "already_migrated",
            TransitionOutcome::Verified => "verified",
            TransitionOutcome::Failed => "failed",
        };

        let body = serde_json::json!({ "outcome": outcome_text });
        json_response(StatusCode::OK, &body.to_string())
    }
}

fn required_header(req: &Request<Incoming>, name: &str) -> Result<String, SyncError> {
    optional_header(req, name)
        .ok_or_else(|| SyncError::BadRequest(format!("missing {} header", name)))
}

fn optional_header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

fn json_response(
    status: StatusCode,
    body: &str,
) -> Result<Response<Full<Bytes>>, SyncError> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .map_err(|e| SyncError::Internal(format!("Response build failed: {}", e)))
}

fn error_response(error: &SyncError) -> Response<Full<Bytes>> {
    let status = match error {
        SyncError::BadToken(_) | SyncError::BadRequest(_) | SyncError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        SyncError::ReadOnly => StatusCode::UNAUTHORIZED,
        SyncError::ConflictingItem(_) => StatusCode::CONFLICT,
        SyncError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = serde_json::json!({ "error": error.to_string() });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
