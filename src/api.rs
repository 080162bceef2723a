//! REST endpoints served on the gateway port
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /api/spawn?rendering=csr\|ssr&model=..` | admit and launch a worker |
//! | `POST /api/liveliness/{id}[?viewer=connected]` | worker heartbeat |
//! | `GET /api/slots/{id}` | one slot |
//! | `DELETE /api/slots/{id}` | explicit shutdown |
//! | `GET /api/status` | pool snapshot |
//! | `GET /health`, `GET /version` | probes |

use crate::error::{json_error_response, ErrorCode, SpawnError};
use crate::slot::{ContactKind, HeartbeatAck, RenderingMode, SlotId, SpawnRequest, TerminateAck, TerminationReason};
use crate::spawner::SpawnPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version information for the spawn server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

fn response(status: StatusCode, body: impl Into<Bytes>) -> ApiResponse {
    let mut response = Response::new(Full::new(body.into()).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, value: &impl serde::Serialize) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = response(status, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => json_error_response(ErrorCode::InternalError, format!("serialization failed: {}", e)),
    }
}

/// Decoded query parameters; later duplicates win
pub fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (decode(key), decode(value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s)
        .map(|d| d.into_owned())
        .unwrap_or(s)
}

/// Build a spawn request from `rendering` and `model` query parameters
pub fn spawn_request_from_query(uri: &Uri) -> Result<SpawnRequest, String> {
    let params = query_params(uri);
    let rendering = match params.get("rendering").map(String::as_str) {
        None | Some("") => RenderingMode::default(),
        Some(mode) => mode.parse::<RenderingMode>()?,
    };
    let model = params.get("model").filter(|m| !m.is_empty()).cloned();
    Ok(SpawnRequest { rendering, model })
}

fn parse_slot_id(raw: &str) -> Result<SlotId, ApiResponse> {
    raw.parse::<SlotId>().map_err(|_| {
        json_error_response(ErrorCode::InvalidRequest, format!("invalid slot id: {}", raw))
    })
}

/// Route a non-upgrade request
pub async fn handle_api_request<B>(req: Request<B>, pool: Arc<SpawnPool>) -> ApiResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/api/status") => json_response(StatusCode::OK, &pool.snapshot()),

        (&Method::POST, "/api/spawn") => {
            let request = match spawn_request_from_query(req.uri()) {
                Ok(request) => request,
                Err(e) => return json_error_response(ErrorCode::InvalidRequest, e),
            };
            match pool.request_spawn(request) {
                Ok(handle) => json_response(StatusCode::OK, &handle),
                Err(e) => {
                    warn!(error = %e, "Spawn request rejected");
                    e.into_response()
                }
            }
        }

        (&Method::POST, path) if path.starts_with("/api/liveliness/") => {
            let id = match parse_slot_id(&path["/api/liveliness/".len()..]) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let kind = match query_params(req.uri()).get("viewer").map(String::as_str) {
                Some("connected") => ContactKind::ViewerConnected,
                _ => ContactKind::Liveliness,
            };
            match pool.report_heartbeat(id, kind) {
                Ok(ack) => {
                    if ack == HeartbeatAck::Activated {
                        debug!(slot_id = %id, "Worker reported first viewer");
                    }
                    json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
                }
                Err(e) => {
                    debug!(slot_id = %id, error = %e, "Heartbeat rejected");
                    e.into_response()
                }
            }
        }

        (&Method::GET, path) if path.starts_with("/api/slots/") => {
            let id = match parse_slot_id(&path["/api/slots/".len()..]) {
                Ok(id) => id,
                Err(response) => return response,
            };
            match pool.slot(id) {
                Some(view) => json_response(StatusCode::OK, &view),
                None => SpawnError::UnknownSlot(id.to_string()).into_response(),
            }
        }

        (&Method::DELETE, path) if path.starts_with("/api/slots/") => {
            let id = match parse_slot_id(&path["/api/slots/".len()..]) {
                Ok(id) => id,
                Err(response) => return response,
            };
            match pool.terminate(id, TerminationReason::Explicit) {
                TerminateAck::Signalled => {
                    info!(slot_id = %id, "Slot shutdown requested");
                    json_response(
                        StatusCode::ACCEPTED,
                        &serde_json::json!({ "status": "terminating" }),
                    )
                }
                TerminateAck::AlreadyTerminating => json_response(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({ "status": "already_terminating" }),
                ),
                TerminateAck::Unknown => SpawnError::UnknownSlot(id.to_string()).into_response(),
            }
        }

        _ => json_error_response(ErrorCode::NotFound, format!("no route for {} {}", method, path)),
    }
}
