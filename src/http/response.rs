//! HTTP response construction and serialization.

use std::fs;
use std::path::Path;

use crate::config::Location;

/// Chunk payload size used when a response body is streamed with chunked
/// transfer encoding.
pub const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn reason_phrase(status: u16) -> Option<&'static str> {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        418 => "I'm a teapot",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => return None,
    };
    Some(reason)
}

impl Response {
    /// A response for the given status. Statuses outside the table collapse
    /// to 418, which the original server used as its catch-all.
    pub fn new(status: u16) -> Response {
        let (status, reason) = match reason_phrase(status) {
            Some(reason) => (status, reason),
            None => (418, "I'm a teapot"),
        };
        Response {
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Response {
        let mut response = Response::new(status);
        response.set_header("Content-Type", content_type);
        response.set_header("Content-Length", &body.len().to_string());
        response.body = body;
        response
    }

    pub fn redirect(status: u16, target: &str) -> Response {
        let mut response = Response::new(status);
        response.set_header("Location", target);
        response.set_header("Content-Length", "0");
        response
    }

    /// Error response, preferring the location's configured error page over
    /// the generated minimal HTML document.
    pub fn error(status: u16, location: Option<&Location>) -> Response {
        let mut response = match location
            .and_then(|loc| custom_error_body(status, loc))
        {
            Some((body, content_type)) => Response::with_body(status, &content_type, body),
            None => {
                let response = Response::new(status);
                let body = format!(
                    "<html><body><h1>{} {}</h1></body></html>",
                    response.status, response.reason
                )
                .into_bytes();
                Response::with_body(response.status, "text/html", body)
            }
        };
        response.set_header("Connection", "close");
        response
    }

    /// Sets a header, replacing any existing value for the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn wants_close(&self) -> bool {
        self.header("Connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("close"))
    }

    /// Serializes to the exact wire form: status line, headers in insertion
    /// order, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn custom_error_body(status: u16, location: &Location) -> Option<(Vec<u8>, String)> {
    let page = location.error_page(status)?;
    let path = Path::new(&location.root).join(page.trim_start_matches('/'));
    let body = fs::read(&path).ok()?;
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Some((body, content_type))
}

/// Encodes `data` as a sequence of size-prefixed chunks ending in the
/// zero-size terminator.
pub fn chunk_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / CHUNK_SIZE * 16 + 16);
    for chunk in data.chunks(CHUNK_SIZE) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
