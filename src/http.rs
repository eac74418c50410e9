//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! HTTP/1.1 framing over blocking sockets. One request per connection, no
//! keep-alive: every response carries `Connection: close` and the peer is
//! closed after exactly one response has been written.
//!
//! Framing reads into a growing buffer until the `CRLF CRLF` sentinel ends
//! the header block, then keeps reading until `Content-Length` bytes of body
//! have arrived. The 50 MiB ceiling is enforced on the declared length,
//! before any body buffer is grown.

use std::{
    fmt,
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};
use bytes::BytesMut;
use serde::Serialize;
use anyhow::{Result, Context};
use crate::{
    config::MAX_UPLOAD_SIZE,
    util::{KB, find_subsequence},
};

/// Sockets are abandoned after this much read or write inactivity.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Request lines plus headers have to fit in this much.
pub const MAX_HEADER_SIZE: usize = 64*KB;

const READ_CHUNK_SIZE: usize = 16*KB;

#[derive(Debug)]
pub enum RequestError {
    /// No data arrived within `IO_TIMEOUT`.
    Timeout,
    /// The peer closed the connection before a full request was read.
    ConnectionClosed,
    Malformed(String),
    /// Declared Content-Length exceeds `MAX_UPLOAD_SIZE`.
    TooLarge,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "timed out reading request"),
            RequestError::ConnectionClosed => write!(f, "connection closed mid-request"),
            RequestError::Malformed(msg) => write!(f, "malformed request: {}", msg),
            RequestError::TooLarge => write!(f, "request body exceeds upload ceiling"),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup, first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request target with any query string stripped.
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(pos) => &self.target[..pos],
            None => &self.target,
        }
    }
}

/// Reads one full request from the socket, arming the inactivity timeout
/// first. This is the only entry point used on live connections.
pub fn read_request(stream: &mut TcpStream) -> Result<Request, RequestError> {
    stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(|_| RequestError::ConnectionClosed)?;
    stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(|_| RequestError::ConnectionClosed)?;
    read_request_from(stream)
}

/// Framing core, generic over `Read` so tests can drive it from byte slices.
pub fn read_request_from<S: Read>(stream: &mut S) -> Result<Request, RequestError> {
    let mut buf = BytesMut::with_capacity(2*READ_CHUNK_SIZE);

    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(RequestError::Malformed("header block too large".to_string()));
        }
        read_some(stream, &mut buf)?;
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| RequestError::Malformed("header block is not valid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let (method, target, version) = match parts.as_slice() {
        [method, target, version] => (*method, *target, *version),
        _ => return Err(RequestError::Malformed(format!("bad request line: {:?}", request_line))),
    };
    if !version.starts_with("HTTP/") {
        return Err(RequestError::Malformed(format!("bad HTTP version: {:?}", version)));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')
            .ok_or_else(|| RequestError::Malformed(format!("bad header line: {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let request = Request {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body: Vec::new(),
    };

    let content_length = match request.header("Content-Length") {
        Some(value) => Some(value.parse::<usize>()
            .map_err(|_| RequestError::Malformed(format!("bad Content-Length: {:?}", value)))?),
        None => None,
    };

    let body = match content_length {
        Some(len) if len > MAX_UPLOAD_SIZE => return Err(RequestError::TooLarge),
        Some(len) => {
            let total = header_end + len;
            buf.reserve(total.saturating_sub(buf.len()));
            while buf.len() < total {
                read_some(stream, &mut buf)?;
            }
            buf[header_end..total].to_vec()
        }
        // A POST without Content-Length would force read-until-close framing,
        // which cannot be told apart from a truncated request. Reject it.
        None if request.method == "POST" => {
            return Err(RequestError::Malformed("Content-Length required for POST".to_string()));
        }
        None => Vec::new(),
    };

    Ok(Request { body, ..request })
}

fn read_some<S: Read>(stream: &mut S, buf: &mut BytesMut) -> Result<(), RequestError> {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Err(RequestError::ConnectionClosed),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
                   || e.kind() == io::ErrorKind::TimedOut => return Err(RequestError::Timeout),
            Err(_) => return Err(RequestError::ConnectionClosed),
        }
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn write_response<W: Write>(w: &mut W, code: u16, content_type: &str, body: &[u8])
    -> Result<()>
{
    let header = format!("HTTP/1.1 {} {}\r\n\
                          Content-Type: {}\r\n\
                          Content-Length: {}\r\n\
                          Connection: close\r\n\
                          \r\n",
                         code, status_text(code), content_type, body.len());

    w.write_all(header.as_bytes()).context("Failed to write response header")?;
    w.write_all(body).context("Failed to write response body")?;
    w.flush().context("Failed to flush response")?;
    Ok(())
}

pub fn write_json<W: Write, T: Serialize>(w: &mut W, code: u16, payload: &T) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    write_response(w, code, "application/json", &body)
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: u16,
}

pub fn write_error<W: Write>(w: &mut W, code: u16, message: &str) -> Result<()> {
    write_json(w, code, &ErrorBody { error: message, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out one byte per read() call, to exercise incremental framing.
    struct TrickleReader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl Read for TrickleReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_get_request() {
        let raw = b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let req = read_request_from(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/status");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_post_with_body() {
        let raw = b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let req = read_request_from(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn test_trickled_request() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nX-Extra: 1\r\n\r\nabc";
        let req = read_request_from(&mut TrickleReader { data: raw, pos: 0 }).unwrap();
        assert_eq!(req.body, b"abc");
        assert_eq!(req.header("x-extra"), Some("1"));
    }

    #[test]
    fn test_body_beyond_buffered_headers() {
        // The body must keep being read after the header block completes.
        let body = vec![b'z'; 40_000];
        let mut raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(&body);
        let req = read_request_from(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(req.body.len(), body.len());
    }

    #[test]
    fn test_post_without_content_length() {
        let raw = b"POST /upload HTTP/1.1\r\nHost: x\r\n\r\n";
        match read_request_from(&mut Cursor::new(&raw[..])) {
            Err(RequestError::Malformed(msg)) => assert!(msg.contains("Content-Length")),
            other => panic!("expected Malformed, got {:?}", other.map(|r| r.method)),
        }
    }

    #[test]
    fn test_content_length_over_ceiling() {
        let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_UPLOAD_SIZE + 1);
        match read_request_from(&mut Cursor::new(raw.as_bytes())) {
            Err(RequestError::TooLarge) => {}
            other => panic!("expected TooLarge, got {:?}", other.map(|r| r.method)),
        }
    }

    #[test]
    fn test_truncated_request() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nshort";
        match read_request_from(&mut Cursor::new(&raw[..])) {
            Err(RequestError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {:?}", other.map(|r| r.method)),
        }
    }

    #[test]
    fn test_bad_request_line() {
        let raw = b"NONSENSE\r\n\r\n";
        assert!(matches!(read_request_from(&mut Cursor::new(&raw[..])),
                         Err(RequestError::Malformed(_))));

        let raw = b"GET / JUNK/1.1\r\n\r\n";
        assert!(matches!(read_request_from(&mut Cursor::new(&raw[..])),
                         Err(RequestError::Malformed(_))));
    }

    #[test]
    fn test_path_strips_query() {
        let raw = b"GET /status?verbose=1 HTTP/1.1\r\n\r\n";
        let req = read_request_from(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(req.path(), "/status");
    }

    #[test]
    fn test_write_response_layout() {
        let mut out = Vec::new();
        write_response(&mut out, 200, "application/json", b"{}").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn test_write_error_body() {
        let mut out = Vec::new();
        write_error(&mut out, 413, "File too large").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(text.ends_with(r#"{"error":"File too large","code":413}"#));
    }
}
