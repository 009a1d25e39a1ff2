//! Minimal HTTP/1.1 file server for integration tests.
//!
//! Serves static bodies by path. HEAD answers with Content-Length; GET honours
//! `Range: bytes=N-` with 206 (or 416 past the end). Every request is logged
//! so tests can assert what went over the wire.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// If false, HEAD returns 405 (servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Pause after every `chunk` bytes of a GET body.
    pub throttle: Option<(usize, Duration)>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            throttle: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub range_start: Option<u64>,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

pub struct RangeServer {
    base: String,
    log: Arc<Mutex<Vec<Request>>>,
}

impl RangeServer {
    /// Serve `files` (path such as `/a.bin` to body) until the process exits.
    pub fn start(files: Vec<(&str, Vec<u8>)>, opts: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let files: Arc<HashMap<String, Vec<u8>>> = Arc::new(
            files
                .into_iter()
                .map(|(p, body)| (p.to_string(), body))
                .collect(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let server_log = Arc::clone(&log);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let files = Arc::clone(&files);
                let log = Arc::clone(&server_log);
                thread::spawn(move || handle(stream, &files, &log, opts));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{port}"),
            log,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    pub fn gets(&self, path: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET" && r.path == path)
            .collect()
    }
}

fn handle(
    mut stream: TcpStream,
    files: &HashMap<String, Vec<u8>>,
    log: &Mutex<Vec<Request>>,
    opts: ServerOptions,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(text) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let request = parse_request(text);
    log.lock().unwrap().push(request.clone());

    let Some(body) = files.get(&request.path) else {
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    };
    let total = body.len() as u64;

    match request.method.as_str() {
        "HEAD" if !opts.head_allowed => {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
        "HEAD" => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes());
        }
        "GET" => {
            let start = request.range_start.filter(|_| opts.support_ranges);
            match start {
                Some(start) if start >= total => {
                    let head = format!(
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = stream.write_all(head.as_bytes());
                }
                Some(start) => {
                    let slice = &body[start as usize..];
                    let head = format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                        slice.len(),
                        start,
                        total - 1,
                        total
                    );
                    if stream.write_all(head.as_bytes()).is_ok() {
                        write_body(&mut stream, slice, opts.throttle);
                    }
                }
                None => {
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
                    );
                    if stream.write_all(head.as_bytes()).is_ok() {
                        write_body(&mut stream, body, opts.throttle);
                    }
                }
            }
        }
        _ => {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    }
}

fn write_body(stream: &mut TcpStream, body: &[u8], throttle: Option<(usize, Duration)>) {
    match throttle {
        None => {
            let _ = stream.write_all(body);
        }
        Some((chunk, delay)) => {
            for part in body.chunks(chunk.max(1)) {
                if stream.write_all(part).is_err() || stream.flush().is_err() {
                    return;
                }
                thread::sleep(delay);
            }
        }
    }
}

fn parse_request(text: &str) -> Request {
    let mut lines = text.lines();
    let mut first = lines.next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("").to_ascii_uppercase();
    let path = first.next().unwrap_or("/").to_string();
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let range_start = headers
        .get("range")
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, _)| a.trim().parse::<u64>().ok());
    Request {
        method,
        path,
        range_start,
        headers,
    }
}
