//! w64fsd - remote storage backend for 8-bit home computers.
//!
//! Clients speak a compact binary RPC (see [`wire`]) over HTTP POST; the
//! [`dispatch`] module resolves each request against a per-token sandboxed
//! root, routing transparently through mounted CBM disk images ([`image`])
//! when a path crosses into one.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod fs;
pub mod image;
pub mod lock;
pub mod path;
pub mod policy;
pub mod sandbox;
pub mod status;
pub mod trash;
pub mod wire;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;

use crate::config::ConfigHandle;
use crate::dispatch::ServerState;
use crate::wire::header::{self, HeaderError};
use crate::wire::Opcode;

/// Everything an HTTP handler needs to service a request: the hot-swappable
/// config snapshot and the process-wide dispatcher state (`spec.md` §5
/// "Shared resources").
pub struct AppState {
    pub config: ConfigHandle,
    pub server: ServerState,
}

impl AppState {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config, server: ServerState::new() }
    }
}

#[derive(serde::Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Binds `listener` and serves the framed RPC endpoint forever, mirroring
/// the predecessor's `handle_forever` loop shape but over HTTP rather than
/// a raw TCP accept loop, since the wire protocol now rides inside POST
/// bodies (`spec.md` §5 "Transport").
pub async fn handle_forever(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let endpoint = state.config.load().endpoint_path.clone();
    let endpoint = if endpoint.is_empty() { "/rpc".to_string() } else { endpoint };

    let app = Router::new().route(&endpoint, post(handle_rpc)).with_state(state);

    axum::serve(listener, app).await
}

/// Parses the framed body, dispatches it, and frames the response -
/// `spec.md` §4.1 "Data flow".
async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    let cfg = state.config.load();

    let req = match header::parse(&body, cfg.limits.max_payload) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                header::UNPARSEABLE_OPCODE,
                header_error_status(e),
                cfg.global_policy.errmsg_enabled,
                None,
            )
        }
    };

    let opcode = match Opcode::from_byte(req.opcode) {
        Some(op) => op,
        None => {
            return error_response(
                req.opcode,
                crate::status::Status::BadRequest,
                cfg.global_policy.errmsg_enabled,
                Some("unknown opcode"),
            )
        }
    };

    let token = query.token.unwrap_or_default();
    let policy = match cfg.resolve_token(&token) {
        Ok(policy) => policy,
        Err(_) => {
            return error_response(
                req.opcode,
                crate::status::Status::AccessDenied,
                cfg.global_policy.errmsg_enabled,
                Some("unknown token"),
            )
        }
    };

    match dispatch::dispatch(&state.server, &cfg, &policy, opcode, req.flags, req.payload) {
        Ok(payload) => frame_response(req.opcode, crate::status::Status::Ok, &payload),
        Err(err) => {
            error_response(req.opcode, err.status(), policy.errmsg_enabled, Some(&err.message()))
        }
    }
}

fn header_error_status(e: HeaderError) -> crate::status::Status {
    match e {
        HeaderError::TooShort | HeaderError::BadMagic | HeaderError::BadVersion
        | HeaderError::BadReserved => crate::status::Status::BadRequest,
        HeaderError::LengthOverflow => crate::status::Status::TooLarge,
    }
}

/// Builds an error response, appending a truncated human-readable message
/// when the resolved token's policy (or, for pre-token failures, the
/// global default) has `errmsg_enabled` - `spec.md` §4.1, §6 `ERRMSG`
/// feature bit.
fn error_response(
    opcode: u8,
    status: crate::status::Status,
    errmsg_enabled: bool,
    message: Option<&str>,
) -> Response {
    let payload: Vec<u8> = match message {
        Some(msg) if errmsg_enabled => {
            let mut bytes = msg.as_bytes().to_vec();
            bytes.truncate(200);
            bytes
        }
        _ => Vec::new(),
    };
    frame_response(opcode, status, &payload)
}

fn frame_response(opcode: u8, status: crate::status::Status, payload: &[u8]) -> Response {
    let frame = header::build_response(opcode, status, payload);
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-transform"));
    headers.insert(
        axum::http::header::CONTENT_ENCODING,
        HeaderValue::from_static("identity"),
    );
    (StatusCode::OK, headers, frame).into_response()
}
