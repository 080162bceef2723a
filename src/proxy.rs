//! The public gateway: one listener for REST calls and proxied viewer
//! connections.
//!
//! Upgrade requests on `/proxy/{slot_id}` (or `/spawn`, which admits a new
//! slot first) are relayed as raw byte streams to the worker's private port.
//! Everything else goes to the REST API.

use crate::api::{handle_api_request, spawn_request_from_query};
use crate::error::{json_error_response, ErrorCode, SpawnError};
use crate::slot::{ContactKind, SlotId, SlotState, TerminationReason};
use crate::spawner::SpawnPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const PROXY_PREFIX: &str = "/proxy/";
const SPAWN_PATH: &str = "/spawn";

/// Largest worker handshake response accepted
const MAX_HANDSHAKE_LEN: usize = 16 * 1024;
/// Pause between connection attempts to a starting worker
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

type GatewayResponse = Response<BoxBody<Bytes, hyper::Error>>;

pub struct GatewayServer {
    bind_addr: SocketAddr,
    pool: Arc<SpawnPool>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, pool: Arc<SpawnPool>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            pool,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Spawn server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, pool).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Spawn server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, pool: Arc<SpawnPool>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pool = Arc::clone(&pool);
        async move { handle_request(req, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    pool: Arc<SpawnPool>,
    client_addr: SocketAddr,
) -> Result<GatewayResponse, hyper::Error> {
    if !is_upgrade_request(&req) {
        return Ok(handle_api_request(req, pool).await);
    }

    let path = req.uri().path().to_string();
    debug!(%client_addr, %path, "Upgrade request");

    if let Some(raw_id) = path.strip_prefix(PROXY_PREFIX) {
        let id = match raw_id.parse::<SlotId>() {
            Ok(id) => id,
            Err(_) => {
                return Ok(json_error_response(
                    ErrorCode::InvalidRequest,
                    format!("invalid slot id: {}", raw_id),
                ))
            }
        };
        return Ok(relay(req, pool, id, false).await);
    }

    if path == SPAWN_PATH {
        let request = match spawn_request_from_query(req.uri()) {
            Ok(request) => request,
            Err(e) => return Ok(json_error_response(ErrorCode::InvalidRequest, e)),
        };
        let handle = match pool.request_spawn(request) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%client_addr, error = %e, "Spawn on connect rejected");
                return Ok(e.into_response());
            }
        };
        return Ok(relay(req, pool, handle.slot_id, true).await);
    }

    Ok(json_error_response(
        ErrorCode::NotFound,
        format!("no upgrade route for {}", path),
    ))
}

/// Relay a viewer connection to a slot's worker.
///
/// With `owns_slot` the slot was spawned for this connection and is shut
/// down again if the worker cannot be reached.
async fn relay(req: Request<Incoming>, pool: Arc<SpawnPool>, id: SlotId, owns_slot: bool) -> GatewayResponse {
    let connection = match open_worker_connection(&req, &pool, id).await {
        Ok(connection) => connection,
        Err(response) => {
            if owns_slot {
                pool.terminate(id, TerminationReason::Explicit);
            }
            return response;
        }
    };
    let WorkerConnection {
        stream,
        status,
        headers,
        leftover,
        lifecycle,
    } = connection;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(slot_id = %id, %status, "Worker rejected upgrade request");
        if owns_slot {
            pool.terminate(id, TerminationReason::Explicit);
        }
        return build_response(status, &headers);
    }

    // Only a completed handshake counts as the slot's first use
    if let Err(e) = pool.report_heartbeat(id, ContactKind::ViewerConnected) {
        warn!(slot_id = %id, error = %e, "Slot ended before the relay started");
        return e.into_response();
    }

    info!(slot_id = %id, "Viewer connected to worker");
    let response = build_response(StatusCode::SWITCHING_PROTOCOLS, &headers);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(slot_id = %id, "Client upgrade complete, starting relay");
                forward_bidirectional(upgraded, stream, leftover, lifecycle, id).await;
            }
            Err(e) => {
                error!(slot_id = %id, error = %e, "Failed to upgrade client connection");
            }
        }
        debug!(slot_id = %id, "Viewer connection closed");
    });

    response
}

struct WorkerConnection {
    stream: TcpStream,
    status: StatusCode,
    headers: Vec<(String, String)>,
    /// Bytes the worker sent after its handshake response
    leftover: Vec<u8>,
    lifecycle: watch::Receiver<SlotState>,
}

async fn open_worker_connection(
    req: &Request<Incoming>,
    pool: &SpawnPool,
    id: SlotId,
) -> Result<WorkerConnection, GatewayResponse> {
    let (port, lifecycle) = pool.open_relay(id).map_err(SpawnError::into_response)?;
    let host = pool.config().server.loopback_host();
    let timeout = pool.config().server.connect_timeout();

    let mut stream = connect_with_retry(host, port, timeout, &lifecycle)
        .await
        .map_err(|response| {
            warn!(slot_id = %id, port, "Worker did not accept a connection");
            response
        })?;

    let raw_request = build_upgrade_request(req, host, port);
    if let Err(e) = stream.write_all(&raw_request).await {
        error!(slot_id = %id, error = %e, "Failed to send upgrade request to worker");
        return Err(json_error_response(
            ErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let mut buf = Vec::with_capacity(4096);
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(json_error_response(
                ErrorCode::ConnectionFailed,
                "Worker handshake response too large",
            ));
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) => {
                error!(slot_id = %id, "Worker closed connection before responding to upgrade");
                return Err(json_error_response(
                    ErrorCode::ConnectionFailed,
                    "Worker closed connection",
                ));
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                error!(slot_id = %id, error = %e, "Failed to read upgrade response from worker");
                return Err(json_error_response(
                    ErrorCode::ConnectionFailed,
                    format!("Failed to read worker response: {}", e),
                ));
            }
        }
    };

    let (status, headers) = parse_upgrade_response(&buf[..header_end]).ok_or_else(|| {
        error!(slot_id = %id, "Failed to parse worker upgrade response");
        json_error_response(
            ErrorCode::ConnectionFailed,
            "Invalid upgrade response from worker",
        )
    })?;

    Ok(WorkerConnection {
        stream,
        status,
        headers,
        leftover: buf[header_end..].to_vec(),
        lifecycle,
    })
}

/// Connect to a worker that may still be starting up
async fn connect_with_retry(
    host: &str,
    port: u16,
    timeout: Duration,
    lifecycle: &watch::Receiver<SlotState>,
) -> Result<TcpStream, GatewayResponse> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if !lifecycle.borrow().is_live() {
                    return Err(json_error_response(
                        ErrorCode::SlotTerminating,
                        "Slot terminated before the worker accepted connections",
                    ));
                }
                if Instant::now() + CONNECT_RETRY_INTERVAL > deadline {
                    return Err(json_error_response(
                        ErrorCode::RequestTimeout,
                        format!(
                            "Worker did not accept connections within {} seconds: {}",
                            timeout.as_secs(),
                            e
                        ),
                    ));
                }
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the worker
fn build_upgrade_request<B>(req: &Request<B>, host: &str, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if *name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}:{}\r\n", host, port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Offset just past the blank line ending an HTTP header block
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the worker's handshake response status line and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn build_response(status: StatusCode, headers: &[(String, String)]) -> GatewayResponse {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    for (name, value) in headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Copy bytes both ways until either side closes or the slot stops being live
async fn forward_bidirectional(
    client: Upgraded,
    worker: TcpStream,
    leftover: Vec<u8>,
    mut lifecycle: watch::Receiver<SlotState>,
    id: SlotId,
) {
    let mut client_io = TokioIo::new(client);
    let mut worker_io = worker;

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(slot_id = %id, error = %e, "Client closed before relay started");
            return;
        }
    }

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client_io, &mut worker_io) => {
            match result {
                Ok((client_to_worker, worker_to_client)) => {
                    debug!(
                        slot_id = %id,
                        client_to_worker,
                        worker_to_client,
                        "Relay closed normally"
                    );
                }
                Err(e) => {
                    debug!(slot_id = %id, error = %e, "Relay closed with error");
                }
            }
        }
        _ = lifecycle.wait_for(|state| !state.is_live()) => {
            info!(slot_id = %id, "Slot terminating, closing relay");
        }
    }
}
