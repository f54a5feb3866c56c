use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fserve::engine::{AttachRequest, Engine};
use fserve::error::FserveError;
use fserve::config::EngineConfig;
use fserve::binding::FormatType;
use fserve::sender::{self, Socket, WriteOutcome};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::{interval, sleep, timeout, Duration};

const PORT: u16 = 8080;
const MAX_REQUEST_SIZE: usize = 8192;
const CONTENT_ROOT: &str = "./content";
const CONFIG_PATH: &str = "./fserve.toml";
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const KEEPALIVE_TIMEOUT_SECS: u64 = 5;
const SCAN_INTERVAL_SECS: u64 = 5;
const WORKER_COUNT: u32 = 4;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// Case-insensitive byte-prefix match, used for header field names.
fn header_starts_with(header_line: &[u8], prefix: &[u8]) -> bool {
    if header_line.len() < prefix.len() {
        return false;
    }
    for i in 0..prefix.len() {
        let h = header_line[i];
        let p = prefix[i];
        if h != p && h.to_ascii_lowercase() != p.to_ascii_lowercase() {
            return false;
        }
    }
    true
}

fn trim_header_line(line: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = line.len();
    while end > 0 {
        match line[end - 1] {
            b'\r' | b'\n' | b' ' | b'\t' => end -= 1,
            _ => break,
        }
    }
    while start < end {
        match line[start] {
            b' ' | b'\t' => start += 1,
            _ => break,
        }
    }
    &line[start..end]
}

fn extract_header_value<'a>(line: &'a [u8], header_name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= header_name.len() {
        return None;
    }
    let mut start = header_name.len();
    while start < line.len() && (line[start] == b' ' || line[start] == b'\t') {
        start += 1;
    }
    if start >= line.len() {
        return None;
    }
    Some(&line[start..])
}

fn parse_request_line_fast(request: &[u8]) -> Option<(&[u8], &str, &str)> {
    let mut parts = request.split(|&b| b == b' ').filter(|part| !part.is_empty());
    let method = parts.next()?;
    let path_bytes = parts.next()?;
    let version_bytes = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let path = std::str::from_utf8(path_bytes).ok()?;
    let version = std::str::from_utf8(version_bytes).ok()?;
    if method.is_empty() || path.is_empty() || version.is_empty() {
        return None;
    }
    Some((method, path, version))
}

async fn read_line_bytes(reader: &mut BufReader<&mut TcpStream>, buffer: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut total_bytes = 0;
    loop {
        let bytes_read = reader.read_until(b'\n', buffer).await?;
        total_bytes += bytes_read;
        if bytes_read == 0 || buffer.ends_with(b"\n") {
            break;
        }
    }
    Ok(total_bytes)
}

struct ParsedRequest {
    path: String,
    is_get: bool,
    keep_alive: bool,
    range_start: Option<u64>,
}

async fn parse_request(stream: &mut TcpStream) -> std::io::Result<Option<ParsedRequest>> {
    let mut request_line = String::with_capacity(128);
    {
        let mut reader = BufReader::new(&mut *stream);
        match timeout(Duration::from_secs(KEEPALIVE_TIMEOUT_SECS), reader.read_line(&mut request_line)).await {
            Ok(Ok(0)) | Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(size)) if size > MAX_REQUEST_SIZE => return Ok(None),
            Ok(Ok(_)) => {}
        }
    }
    if request_line.trim().is_empty() {
        return Ok(None);
    }

    let request_bytes = request_line.trim().as_bytes();
    let Some((method, path, version)) = parse_request_line_fast(request_bytes) else {
        return Ok(None);
    };
    if method != b"GET" && method != b"HEAD" {
        return Ok(None);
    }
    let is_get = method == b"GET";
    let path = path.to_string();
    let mut keep_alive = version == "HTTP/1.1";
    let mut range_start = None;

    let mut reader = BufReader::new(&mut *stream);
    let mut header_buffer = Vec::with_capacity(256);
    loop {
        header_buffer.clear();
        match read_line_bytes(&mut reader, &mut header_buffer).await {
            Ok(0) => break,
            Ok(_) => {
                if header_buffer.is_empty() || header_buffer == b"\r\n" {
                    break;
                }
                let line = trim_header_line(&header_buffer);
                if line.is_empty() {
                    break;
                }
                if header_starts_with(line, b"connection:") {
                    if let Some(value) = extract_header_value(line, b"connection:") {
                        let lower = value.to_ascii_lowercase();
                        keep_alive = !lower.windows(5).any(|w| w == b"close");
                    }
                } else if header_starts_with(line, b"range:") {
                    if let Some(value) = extract_header_value(line, b"range:") {
                        range_start = parse_range_start(value);
                    }
                }
            }
            Err(_) => break,
        }
    }

    Ok(Some(ParsedRequest {
        path,
        is_get,
        keep_alive,
        range_start,
    }))
}

// Parses `bytes=N-` into N; multi-range and suffix ranges aren't supported.
fn parse_range_start(value: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(value).ok()?;
    let spec = text.strip_prefix("bytes=")?;
    let start = spec.split('-').next()?;
    start.trim().parse().ok()
}

struct TokioSocket<'a> {
    stream: &'a mut TcpStream,
}

impl Socket for TokioSocket<'_> {
    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        match self.stream.try_write(buf) {
            Ok(n) => WriteOutcome::Wrote(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
            Err(_) => WriteOutcome::ConnectionClosed,
        }
    }
}

async fn write_status_line(stream: &mut TcpStream, status: u16, body: &str) {
    use tokio::io::AsyncWriteExt;
    let response = format!(
        "HTTP/1.1 {status} {}\r\nDate: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        status_text(status),
        httpdate::fmt_http_date(SystemTime::now()),
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        403 => "Forbidden",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        _ => "Internal Server Error",
    }
}

async fn serve_connection(engine: Arc<Engine>, mut stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }
        let parsed = match timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS), parse_request(&mut stream)).await {
            Ok(Ok(Some(p))) => p,
            _ => break,
        };

        let req = AttachRequest {
            mount: parsed.path.clone(),
            is_fallback: false,
            limit: 0,
            format_type: FormatType::Undefined,
            range_start: parsed.range_start,
            is_get: parsed.is_get,
        };

        match engine.attach(req, now_ms()) {
            Ok(listener_id) => {
                serve_attached(&engine, listener_id, &parsed, &mut stream).await;
                engine.detach(listener_id, now_ms());
            }
            Err(FserveError::NotFound(_)) => {
                // Playlist synthesis and peer redirects belong to a fuller
                // HTTP layer; this demo server only classifies and falls
                // back to a plain 404.
                log::debug!("missing file classified as {:?}", engine.classify_missing(&parsed.path));
                write_status_line(&mut stream, 404, "not found").await;
            }
            Err(FserveError::Forbidden { reason, .. }) => {
                write_status_line(&mut stream, 403, &reason).await;
            }
            Err(FserveError::RangeNotSatisfiable) => {
                write_status_line(&mut stream, 416, "range not satisfiable").await;
            }
            Err(_) => {
                write_status_line(&mut stream, 404, "not found").await;
            }
        }

        if !parsed.keep_alive {
            break;
        }
    }
}

async fn serve_attached(engine: &Arc<Engine>, listener_id: fserve::ListenerId, parsed: &ParsedRequest, stream: &mut TcpStream) {
    use tokio::io::AsyncWriteExt;

    let listener_arc = {
        let listeners = engine_listener(engine, listener_id);
        let Some(l) = listeners else { return };
        l
    };

    let fh = match engine_lookup_handle(engine, &parsed.path) {
        Some(fh) => fh,
        None => return,
    };

    let (content_type, fsize) = {
        let st = fh.state.lock();
        (engine.mime().content_type_for(&parsed.path), st.binding.fsize)
    };

    if let Some(range_start) = parsed.range_start {
        // Already validated against the FH's available bytes during attach,
        // before the refcount was touched; nothing left to check here.
        let header = format!(
            "HTTP/1.1 206 Partial Content\r\nDate: {}\r\nContent-Type: {content_type}\r\nContent-Range: bytes {range_start}-{}/{fsize}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            httpdate::fmt_http_date(SystemTime::now()),
            fsize.saturating_sub(1),
        );
        if stream.write_all(header.as_bytes()).await.is_err() {
            return;
        }
    } else {
        let header = format!(
            "HTTP/1.1 200 OK\r\nDate: {}\r\nContent-Type: {content_type}\r\nContent-Length: {fsize}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            httpdate::fmt_http_date(SystemTime::now()),
        );
        if stream.write_all(header.as_bytes()).await.is_err() {
            return;
        }
    }
    let _ = stream.flush().await;

    loop {
        let now = now_ms();
        let mut listener = listener_arc.lock();
        let action = {
            let mut socket = TokioSocket { stream };
            sender::tick(&mut listener, &fh, &mut socket, engine.workers(), now)
        };
        drop(listener);

        match action {
            fserve::listener::Action::Continue => {}
            fserve::listener::Action::RescheduleIn(ms) => {
                sleep(Duration::from_millis(ms.max(0) as u64)).await;
            }
            fserve::listener::Action::Terminate => break,
            fserve::listener::Action::Migrate(_binding) => {
                // A migration landed mid-stream; close this response cleanly
                // and let the client reconnect to pick up the new binding.
                break;
            }
        }
    }
}

fn engine_listener(engine: &Arc<Engine>, id: fserve::ListenerId) -> Option<Arc<parking_lot::Mutex<fserve::Listener>>> {
    engine.listener_handle(id)
}

fn engine_lookup_handle(engine: &Arc<Engine>, mount: &str) -> Option<Arc<fserve::handle::FileHandle>> {
    engine.cache().find(&fserve::FileBinding::new(mount.to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = std::fs::read_to_string(CONFIG_PATH)
        .ok()
        .and_then(|text| EngineConfig::parse(&text).ok())
        .unwrap_or_default();

    let engine = Arc::new(Engine::new(PathBuf::from(CONTENT_ROOT), config, WORKER_COUNT));
    if let Some(mimetypes_fn) = engine.mimetypes_fn() {
        if let Ok(text) = std::fs::read_to_string(&mimetypes_fn) {
            engine.reload_mime(Some(&text));
        }
    }

    let scan_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(SCAN_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            scan_engine.scan(now_ms());
        }
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", PORT))
        .await
        .expect("failed to bind to address");

    log::info!("fserve listening on http://0.0.0.0:{}", PORT);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(engine.clone(), stream));
                    }
                    Err(_) => continue,
                }
            }
            _ = shutdown_signal() => {
                log::info!("shutdown signal received, draining");
                SHUTDOWN.store(true, Ordering::Relaxed);
                engine.scan(0);
                break;
            }
        }
    }

    log::info!("fserve shutdown complete");
}
