//! Minimal HTTP/1.1 framing
//!
//! Enough to carry requests and responses over the server: request line,
//! headers, and a `Content-Length` body. Chunked transfer encoding is
//! rejected. Routing and header semantics belong to the responder.

use crate::error::ServerError;
use crate::traits::{ErrorResponse, RequestParser, ResponseSerializer};

/// Largest request head (request line plus headers) the parser buffers
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First header named `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// HTTP/1.1 keeps the connection unless told `close`; HTTP/1.0 closes it
    /// unless told `keep-alive`
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == Version::Http11,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 200 with `body`
    pub fn ok(body: impl Into<Vec<u8>>) -> Response {
        Response::new(200).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Response {
        self.body = body.into();
        self
    }

    pub fn reason(&self) -> &'static str {
        reason_phrase(self.status)
    }
}

impl ErrorResponse for Response {
    fn internal_server_error() -> Response {
        Response::new(500)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct Head {
    method: String,
    target: String,
    version: Version,
    headers: Vec<(String, String)>,
}

/// Incremental request parser; one per connection
#[derive(Debug, Default)]
pub struct HttpParser {
    buf: Vec<u8>,
}

impl HttpParser {
    pub fn new() -> HttpParser {
        HttpParser::default()
    }

    /// Bytes received but not yet part of a returned request
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn parse_head(head: &str) -> Result<Head, ServerError> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
            _ => return Err(ServerError::Parse("malformed request line")),
        };
        let version = match version {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            _ => return Err(ServerError::Parse("unsupported http version")),
        };

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or(ServerError::Parse("malformed header line"))?;
            if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
                return Err(ServerError::Parse("malformed header name"));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }
        Ok(Head {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers,
        })
    }
}

impl RequestParser for HttpParser {
    type Request = Request;

    fn parse(&mut self, bytes: &[u8]) -> Result<Option<Request>, ServerError> {
        self.buf.extend_from_slice(bytes);

        // Empty lines before a request line are ignored
        let blank = self.buf.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
        if blank > 0 {
            self.buf.drain(..blank);
        }

        let head_end = match find_subslice(&self.buf, b"\r\n\r\n") {
            Some(i) if i <= MAX_HEAD_BYTES => i,
            None if self.buf.len() <= MAX_HEAD_BYTES => return Ok(None),
            _ => return Err(ServerError::Parse("request head too large")),
        };
        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| ServerError::Parse("request head is not utf-8"))?;
        let Head {
            method,
            target,
            version,
            headers,
        } = HttpParser::parse_head(head)?;

        if find_header(&headers, "transfer-encoding").is_some() {
            return Err(ServerError::Parse("transfer-encoding not supported"));
        }
        let body_len = match find_header(&headers, "content-length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ServerError::Parse("invalid content-length"))?,
            None => 0,
        };

        let body_start = head_end + 4;
        let total = body_start
            .checked_add(body_len)
            .ok_or(ServerError::Parse("invalid content-length"))?;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[body_start..total].to_vec();
        self.buf.drain(..total);

        Ok(Some(Request {
            method,
            target,
            version,
            headers,
            body,
        }))
    }

    fn keep_alive(&self, request: &Request) -> bool {
        request.keep_alive()
    }
}

/// Response writer; adds `Content-Length` (and `Server` when configured)
/// unless the response already carries them
#[derive(Debug, Clone, Default)]
pub struct HttpSerializer {
    server_name: Option<String>,
}

impl HttpSerializer {
    pub fn new() -> HttpSerializer {
        HttpSerializer::default()
    }

    pub fn server_name(mut self, name: impl Into<String>) -> HttpSerializer {
        self.server_name = Some(name.into());
        self
    }
}

impl ResponseSerializer for HttpSerializer {
    type Response = Response;

    fn serialize(&self, response: &Response) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason());
        if let Some(name) = &self.server_name {
            if find_header(&response.headers, "server").is_none() {
                head.push_str(&format!("Server: {}\r\n", name));
            }
        }
        for (name, value) in &response.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if find_header(&response.headers, "content-length").is_none() {
            head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&response.body);
        out
    }
}
