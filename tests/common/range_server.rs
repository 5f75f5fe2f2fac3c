//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves files registered by path. GET with `Range: bytes=N-` answers
//! 206 Partial Content unless ranges are disabled. Artifact responses can be
//! cut short or stalled to simulate a flaky link, and every GET is recorded.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Close the connection after this many body bytes...
    pub drop_after: Option<usize>,
    /// ...on this many of the first requests for a `.zip` file.
    pub drop_requests: usize,
    /// Stop sending (socket left open) after this many body bytes on the first
    /// `.zip` request.
    pub stall_after: Option<usize>,
    pub stall_for: Duration,
    /// Body bytes per write, with `write_delay` between writes.
    pub write_chunk: usize,
    pub write_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            drop_after: None,
            drop_requests: 0,
            stall_after: None,
            stall_for: Duration::from_secs(3),
            write_chunk: 64 * 1024,
            write_delay: Duration::ZERO,
        }
    }
}

impl ServerOptions {
    /// Deliver bodies slowly enough that a test can act mid-transfer.
    pub fn throttled() -> Self {
        Self {
            write_chunk: 25_000,
            write_delay: Duration::from_millis(15),
            ..Self::default()
        }
    }
}

/// One recorded GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    /// Start offset of the `Range` header, if any.
    pub range_start: Option<u64>,
}

struct Shared {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<Request>>,
    artifact_requests: AtomicUsize,
    opts: ServerOptions,
}

/// Handle to a running server. The server thread lives until the process exits.
#[derive(Clone)]
pub struct RangeServer {
    base: String,
    shared: Arc<Shared>,
}

impl RangeServer {
    pub fn start(opts: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            files: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            artifact_requests: AtomicUsize::new(0),
            opts,
        });
        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || handle(stream, &shared));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{port}"),
            shared,
        }
    }

    /// Register (or replace) the body served at `path`; returns its URL.
    pub fn put(&self, path: &str, body: Vec<u8>) -> String {
        self.shared.files.lock().unwrap().insert(path.to_string(), body);
        format!("{}{}", self.base, path)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests_for(&self, path: &str) -> Vec<Request> {
        self.shared
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

/// Accept connections and never answer them. Returns the base URL.
pub fn start_silent() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    format!("http://127.0.0.1:{port}")
}

fn handle(mut stream: TcpStream, shared: &Shared) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let request = String::from_utf8_lossy(&buf).to_string();
    let (method, path, range) = parse_request(&request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
        return;
    }

    shared.requests.lock().unwrap().push(Request {
        path: path.clone(),
        range_start: range,
    });

    let Some(body) = shared.files.lock().unwrap().get(&path).cloned() else {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    };

    let opts = shared.opts;
    let total = body.len();
    let start = match range {
        Some(start) if opts.support_ranges => start as usize,
        _ => 0,
    };
    if start >= total && total > 0 && range.is_some() && opts.support_ranges {
        let response = format!(
            "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    let slice = &body[start..];
    let header = if range.is_some() && opts.support_ranges {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            slice.len(),
            start,
            total.saturating_sub(1),
            total
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            slice.len()
        )
    };
    if stream.write_all(header.as_bytes()).is_err() {
        return;
    }

    let mut limit = slice.len();
    let mut stall = false;
    if path.ends_with(".zip") {
        let nth = shared.artifact_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(drop_after) = opts.drop_after {
            if nth < opts.drop_requests {
                limit = limit.min(drop_after);
            }
        }
        if let Some(stall_after) = opts.stall_after {
            if nth == 0 {
                limit = limit.min(stall_after);
                stall = true;
            }
        }
    }

    for piece in slice[..limit].chunks(opts.write_chunk.max(1)) {
        if stream.write_all(piece).is_err() {
            return;
        }
        let _ = stream.flush();
        if !opts.write_delay.is_zero() {
            thread::sleep(opts.write_delay);
        }
    }
    if stall {
        thread::sleep(opts.stall_for);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Returns (method, path, start offset of `Range: bytes=N-`).
fn parse_request(request: &str) -> (String, String, Option<u64>) {
    let mut lines = request.lines();
    let mut first = lines.next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("").to_string();
    let path = first.next().unwrap_or("/").to_string();
    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = value
                    .trim()
                    .strip_prefix("bytes=")
                    .and_then(|v| v.split_once('-'))
                    .and_then(|(a, _)| a.trim().parse::<u64>().ok());
            }
        }
    }
    (method, path, range)
}
