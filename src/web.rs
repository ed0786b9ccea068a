use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use colored::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::service::{Response, TuningService, ROUTES, SERVICE_TITLE};

const MAX_HEADERS: usize = 32;
const MAX_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 8192;

/// Percent-decoding for URL query parameters.  Invalid escapes are dropped.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                if let Some(byte) = std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    bytes.push(byte);
                }
            }
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse query string into key-value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

/// Split a request target into path and raw query.
pub fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: *\r\nAccess-Control-Allow-Headers: *\r\n";

/// Serialize a [`Response`] as a complete HTTP/1.1 message.  A 204 carries
/// no body and no Content-Type.
pub fn render_response(resp: &Response, request_id: &str) -> String {
    if resp.status == 204 {
        return format!(
            "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nX-Request-Id: {}\r\n{}Connection: close\r\n\r\n",
            request_id, CORS_HEADERS
        );
    }
    let body = resp.body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nX-Request-Id: {}\r\n{}Connection: close\r\n\r\n{}",
        resp.status,
        reason_phrase(resp.status),
        body.len(),
        request_id,
        CORS_HEADERS,
        body
    )
}

/// Bind to the configured address and serve until the process exits.
pub async fn serve(
    config: &ServiceConfig,
    service: Arc<TuningService>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(config.bind_addr()).await?;
    let local = listener.local_addr()?;

    eprintln!(
        "{}",
        format!("  {} v{} listening on http://{}", SERVICE_TITLE, env!("CARGO_PKG_VERSION"), local)
            .bright_green()
    );
    eprintln!("{}", format!("  Data directory: {}", service.data_dir()).bright_cyan());
    eprintln!("{}", format!("  {} routes; try GET /health", ROUTES.len()).bright_blue());
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    tracing::info!(target: "web", addr = %local, "listening");

    serve_listener(listener, service, config.max_body_bytes).await?;
    Ok(())
}

/// Accept loop over an already-bound listener.  One task per connection.
pub async fn serve_listener(
    listener: TcpListener,
    service: Arc<TuningService>,
    max_body_bytes: usize,
) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, service, max_body_bytes).await {
                tracing::warn!(target: "web", peer = %addr, error = %e, "connection error");
            }
        });
    }
}

/// Parsed request head, owned so the read buffer can keep growing.
struct Head {
    method: String,
    target: String,
    content_length: usize,
    head_len: usize,
}

enum HeadOutcome {
    Complete(Head),
    Reject(Response),
    Closed,
}

async fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<HeadOutcome> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(HeadOutcome::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let content_length = match content_length(req.headers) {
                    Ok(len) => len,
                    Err(msg) => return Ok(HeadOutcome::Reject(Response::detail(400, msg))),
                };
                return Ok(HeadOutcome::Complete(Head {
                    method: req.method.unwrap_or("GET").to_string(),
                    target: req.path.unwrap_or("/").to_string(),
                    content_length,
                    head_len,
                }));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Ok(HeadOutcome::Reject(Response::detail(431, "request head too large")));
                }
            }
            Err(e) => {
                return Ok(HeadOutcome::Reject(Response::detail(400, format!("malformed request: {e}"))));
            }
        }
    }
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<usize, String> {
    match headers.iter().find(|h| h.name.eq_ignore_ascii_case("content-length")) {
        None => Ok(0),
        Some(h) => std::str::from_utf8(h.value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| "invalid Content-Length".to_string()),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    service: Arc<TuningService>,
    max_body_bytes: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let mut buf = Vec::with_capacity(READ_CHUNK);

    let head = match read_head(&mut stream, &mut buf).await? {
        HeadOutcome::Complete(head) => head,
        HeadOutcome::Reject(resp) => {
            service.metrics().record("", "", resp.status, started.elapsed());
            stream.write_all(render_response(&resp, &request_id).as_bytes()).await?;
            stream.shutdown().await?;
            return Ok(());
        }
        HeadOutcome::Closed => return Ok(()),
    };

    if head.content_length > max_body_bytes {
        let resp = Response::detail(413, format!("request body exceeds {max_body_bytes} bytes"));
        service.metrics().record(&head.method, split_target(&head.target).0, resp.status, started.elapsed());
        stream.write_all(render_response(&resp, &request_id).as_bytes()).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let mut body = buf.split_off(head.head_len);
    let mut chunk = [0u8; READ_CHUNK];
    while body.len() < head.content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    if body.len() < head.content_length {
        let resp = Response::detail(400, "request body shorter than Content-Length");
        service.metrics().record(&head.method, split_target(&head.target).0, resp.status, started.elapsed());
        stream.write_all(render_response(&resp, &request_id).as_bytes()).await?;
        stream.shutdown().await?;
        return Ok(());
    }
    body.truncate(head.content_length);

    let (path, raw_query) = split_target(&head.target);
    let path = path.to_string();
    let query = parse_query(raw_query);
    let method = head.method.clone();

    let span = tracing::info_span!("request", id = %request_id, method = %method, path = %path);
    let resp = dispatch(service, method, path, query, body, started).instrument(span).await;

    stream.write_all(render_response(&resp, &request_id).as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn dispatch(
    service: Arc<TuningService>,
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
    started: Instant,
) -> Response {
    let handler = Arc::clone(&service);
    let (m, p) = (method.clone(), path.clone());
    let resp = match tokio::task::spawn_blocking(move || handler.handle(&m, &p, &query, &body)).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(target: "web", error = %e, "handler task failed");
            Response::detail(500, "internal error")
        }
    };
    service.metrics().record(&method, &path, resp.status, started.elapsed());
    tracing::info!(
        target: "web",
        status = resp.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    resp
}
