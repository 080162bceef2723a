//! Mock stream-cache worker for integration testing
//!
//! Understands the subset of worker flags the spawn server passes:
//! - --port: WebSocket port to listen on (required)
//! - --liveliness-url: URL to POST liveliness reports to (optional)
//! - --liveliness-interval: Seconds between reports (default: 1)
//!
//! Every other flag is accepted and ignored. The worker exits on its own once
//! the spawn server answers a report with 404 or 410.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// WebSocket magic GUID for handshake
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

struct Args {
    port: u16,
    liveliness_url: Option<String>,
    liveliness_interval: Duration,
}

fn parse_args() -> Args {
    let mut port = None;
    let mut liveliness_url = None;
    let mut liveliness_interval = Duration::from_secs(1);

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--port" => port = args.next().and_then(|v| v.parse().ok()),
            "--liveliness-url" => liveliness_url = args.next(),
            "--liveliness-interval" => {
                if let Some(secs) = args.next().and_then(|v| v.parse::<u64>().ok()) {
                    liveliness_interval = Duration::from_secs(secs.max(1));
                }
            }
            _ => {}
        }
    }

    Args {
        port: port.expect("--port is required"),
        liveliness_url,
        liveliness_interval,
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    let listener = TcpListener::bind(format!("127.0.0.1:{}", args.port))
        .await
        .expect("Failed to bind");

    eprintln!("Mock worker: listening on port {}", args.port);

    let viewer_seen = Arc::new(AtomicBool::new(false));
    let viewer_notify = Arc::new(Notify::new());

    if let Some(url) = args.liveliness_url {
        let viewer_seen = Arc::clone(&viewer_seen);
        let viewer_notify = Arc::clone(&viewer_notify);
        tokio::spawn(async move {
            liveliness_loop(url, args.liveliness_interval, viewer_seen, viewer_notify).await;
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                eprintln!("Mock worker: connection from {}", addr);
                let viewer_seen = Arc::clone(&viewer_seen);
                let viewer_notify = Arc::clone(&viewer_notify);
                tokio::spawn(async move {
                    handle_connection(stream, viewer_seen, viewer_notify).await;
                });
            }
            Err(e) => {
                eprintln!("Mock worker: accept error: {}", e);
            }
        }
    }
}

/// Report liveliness until the spawn server disowns this worker
async fn liveliness_loop(
    url: String,
    interval: Duration,
    viewer_seen: Arc<AtomicBool>,
    viewer_notify: Arc<Notify>,
) {
    let mut viewer_reported = false;
    loop {
        let report_viewer = !viewer_reported && viewer_seen.load(Ordering::SeqCst);
        let target = if report_viewer {
            format!("{}?viewer=connected", url)
        } else {
            url.clone()
        };

        match post(&target).await {
            Ok(404) | Ok(410) => {
                eprintln!("Mock worker: spawn server disowned this worker, exiting");
                std::process::exit(0);
            }
            Ok(status) => {
                if report_viewer && status == 200 {
                    viewer_reported = true;
                }
            }
            Err(e) => eprintln!("Mock worker: liveliness report failed: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = viewer_notify.notified(), if !viewer_reported => {}
        }
    }
}

/// POST with an empty body and return the response status code
async fn post(url: &str) -> Result<u16, Box<dyn std::error::Error>> {
    let url = url.strip_prefix("http://").unwrap_or(url);
    let (host_port, path) = url.split_once('/').unwrap_or((url, ""));
    let path = format!("/{}", path);

    let mut stream = tokio::net::TcpStream::connect(host_port).await?;

    let request = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        path, host_port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or("malformed response")?;
    Ok(status)
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    viewer_seen: Arc<AtomicBool>,
    viewer_notify: Arc<Notify>,
) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    // Read HTTP request headers
    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request_str = match std::str::from_utf8(&buf) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut lines = request_str.lines();
    let request_line = match lines.next() {
        Some(l) => l,
        None => return,
    };
    eprintln!("Mock worker: {}", request_line);

    let headers: Vec<&str> = lines.take_while(|l| !l.is_empty()).collect();

    let ws_key = headers
        .iter()
        .find(|h| h.to_lowercase().starts_with("sec-websocket-key:"))
        .and_then(|h| h.split_once(':'))
        .map(|(_, v)| v.trim().to_string());

    let key = match ws_key {
        Some(key) => key,
        None => {
            let body = "websocket only";
            let response = format!(
                "HTTP/1.1 400 Bad Request\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            return;
        }
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        compute_ws_accept(&key)
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    if !viewer_seen.swap(true, Ordering::SeqCst) {
        viewer_notify.notify_one();
    }

    eprintln!("Mock worker: WebSocket upgrade successful");
    handle_websocket(stream).await;
}

/// Compute the Sec-WebSocket-Accept header value
fn compute_ws_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x80 | opcode];
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Echo text and binary frames back to the viewer
async fn handle_websocket(mut stream: tokio::net::TcpStream) {
    loop {
        let mut header = [0u8; 2];
        if stream.read_exact(&mut header).await.is_err() {
            break;
        }

        let opcode = header[0] & 0x0F;
        let masked = (header[1] & 0x80) != 0;
        let mut payload_len = (header[1] & 0x7F) as u64;

        if payload_len == 126 {
            let mut ext = [0u8; 2];
            if stream.read_exact(&mut ext).await.is_err() {
                break;
            }
            payload_len = u16::from_be_bytes(ext) as u64;
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            if stream.read_exact(&mut ext).await.is_err() {
                break;
            }
            payload_len = u64::from_be_bytes(ext);
        }

        let mask = if masked {
            let mut m = [0u8; 4];
            if stream.read_exact(&mut m).await.is_err() {
                break;
            }
            Some(m)
        } else {
            None
        };

        let mut payload = vec![0u8; payload_len as usize];
        if !payload.is_empty() && stream.read_exact(&mut payload).await.is_err() {
            break;
        }

        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        match opcode {
            0x1 | 0x2 => {
                if stream.write_all(&encode_frame(opcode, &payload)).await.is_err() {
                    break;
                }
            }
            0x8 => {
                let _ = stream.write_all(&[0x88, 0x00]).await;
                break;
            }
            0x9 => {
                let _ = stream.write_all(&encode_frame(0xA, &payload)).await;
            }
            _ => {}
        }
    }
    eprintln!("Mock worker: WebSocket connection closed");
}
