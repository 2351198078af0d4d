//! Incremental HTTP/1.1 request decoding.
//!
//! Everything here is a pure transformation over byte buffers. "Not enough
//! data yet" is an ordinary value (`None` / `ChunkStatus::Incomplete`),
//! distinct from malformed input which maps to an `HttpError` status.

use std::collections::HashMap;

use crate::http::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPolicy {
    None,
    Length(usize),
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: String,
    pub version: String,
    /// Header names kept case-sensitive as received; duplicates are
    /// last-write-wins.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub body_policy: BodyPolicy,
}

impl Request {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("Host")
    }

    pub fn wants_close(&self) -> bool {
        self.header("Connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("close"))
    }
}

/// Offset just past the `\r\n\r\n` head terminator, if present.
pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Number of leading empty-line bytes (stray CRLF / LF before the request
/// line), which a tolerant server discards.
pub fn skip_leading_empty_lines(buf: &[u8]) -> usize {
    let mut pos = 0;
    while pos < buf.len() {
        if buf[pos] == b'\n' {
            pos += 1;
        } else if buf[pos] == b'\r' && buf.get(pos + 1) == Some(&b'\n') {
            pos += 2;
        } else {
            break;
        }
    }
    pos
}

/// Decodes the start line and headers from the head bytes (everything up to
/// and including the blank line). The returned request has an empty body;
/// body assembly is driven by `body_policy`.
pub fn decode_head(head: &[u8]) -> Result<Request, HttpError> {
    let text = std::str::from_utf8(head).map_err(|_| HttpError::new(400))?;
    let mut lines = split_lines(text).into_iter();

    let start = lines.next().ok_or(HttpError::new(400))?;
    let (method, uri, version) = parse_start_line(&start)?;

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut pending: Option<String> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: continuation belongs to the previous
            // header's value.
            let key = pending.clone().ok_or(HttpError::new(400))?;
            let folded = line.trim().to_string();
            if let Some(value) = headers.get_mut(&key) {
                value.push(' ');
                value.push_str(&folded);
            }
            continue;
        }
        let (name, value) = parse_header_line(&line)?;
        pending = Some(name.clone());
        headers.insert(name, value);
    }

    let body_policy = derive_body_policy(&headers)?;
    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (uri, String::new()),
    };

    Ok(Request {
        method,
        path,
        query,
        version,
        headers,
        body: Vec::new(),
        body_policy,
    })
}

/// Splits head text on LF, popping a trailing CR from each line. A bare CR
/// inside a line is turned into a space, matching tolerant parsers.
fn split_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            line.replace('\r', " ")
        })
        .collect()
}

fn parse_start_line(line: &str) -> Result<(String, String, String), HttpError> {
    let mut parts = line.split(' ');
    let method = parts.next().unwrap_or("");
    let uri = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method.is_empty() || uri.is_empty() || version.is_empty() || parts.next().is_some() {
        return Err(HttpError::new(400));
    }

    if !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(HttpError::new(400));
    }
    if !matches!(method, "GET" | "POST" | "DELETE") {
        return Err(HttpError::new(405));
    }
    if version != "HTTP/1.1" {
        return Err(HttpError::new(505));
    }
    Ok((method.to_string(), uri.to_string(), version.to_string()))
}

fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    let colon = line.find(':').ok_or(HttpError::new(400))?;
    let name = line[..colon].trim_end();
    let value = line[colon + 1..].trim();
    if name.is_empty() || !is_valid_header_name(name) {
        return Err(HttpError::new(400));
    }
    Ok((name.to_string(), value.to_string()))
}

fn is_valid_header_name(name: &str) -> bool {
    name.bytes()
        .all(|b| !b.is_ascii_whitespace() && !b.is_ascii_control() && b != b':')
}

fn derive_body_policy(headers: &HashMap<String, String>) -> Result<BodyPolicy, HttpError> {
    let lookup = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    // Chunked wins when both framings are declared.
    if let Some(te) = lookup("Transfer-Encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyPolicy::Chunked);
        }
    }
    if let Some(cl) = lookup("Content-Length") {
        let length: usize = cl.trim().parse().map_err(|_| HttpError::new(400))?;
        if length == 0 {
            return Ok(BodyPolicy::None);
        }
        return Ok(BodyPolicy::Length(length));
    }
    Ok(BodyPolicy::None)
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Fully decoded body plus the number of raw bytes consumed, so the
    /// caller can leave pipelined bytes in its buffer.
    Complete { body: Vec<u8>, consumed: usize },
    Incomplete,
}

/// Whether the raw, still-encoded chunked stream contains its terminating
/// zero chunk; returns the offset just past it. Used as the cheap framing
/// completeness test before any decoding happens.
pub fn chunked_frame_end(raw: &[u8]) -> Option<usize> {
    if raw.starts_with(b"0\r\n\r\n") {
        return Some(5);
    }
    raw.windows(7)
        .position(|w| w == b"\r\n0\r\n\r\n")
        .map(|p| p + 7)
}

/// Single-pass chunked decoding: hex size line, that many bytes, CRLF,
/// until a zero-size chunk. Bad hex or broken framing is `Err(400)`;
/// truncated input is `Incomplete`, never an error.
pub fn decode_chunked(raw: &[u8]) -> Result<ChunkStatus, HttpError> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = match find_crlf(&raw[pos..]) {
            Some(offset) => pos + offset,
            None => return Ok(ChunkStatus::Incomplete),
        };
        let size_field = &raw[pos..line_end];
        // Chunk extensions after ';' are tolerated and ignored.
        let size_hex = size_field
            .split(|&b| b == b';')
            .next()
            .unwrap_or(size_field);
        let size_hex = std::str::from_utf8(size_hex)
            .map_err(|_| HttpError::new(400))?
            .trim();
        if size_hex.is_empty() {
            return Err(HttpError::new(400));
        }
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| HttpError::new(400))?;

        if size == 0 {
            let after = line_end + 2;
            if raw.len() < after + 2 {
                return Ok(ChunkStatus::Incomplete);
            }
            if &raw[after..after + 2] != b"\r\n" {
                return Err(HttpError::new(400));
            }
            return Ok(ChunkStatus::Complete {
                body,
                consumed: after + 2,
            });
        }

        let data_start = line_end + 2;
        if raw.len() < data_start + size + 2 {
            return Ok(ChunkStatus::Incomplete);
        }
        body.extend_from_slice(&raw[data_start..data_start + size]);
        if &raw[data_start + size..data_start + size + 2] != b"\r\n" {
            return Err(HttpError::new(400));
        }
        pos = data_start + size + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// One file part of a multipart/form-data body.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub name: String,
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct FormData {
    pub fields: HashMap<String, String>,
    pub files: Vec<FilePart>,
}

/// Decodes a fully-assembled body into form fields and file parts. Only the
/// static-upload path consumes this; CGI always receives the raw body.
pub fn parse_form(content_type: &str, body: &[u8]) -> Result<Option<FormData>, HttpError> {
    if content_type.contains("multipart/form-data") {
        let boundary = extract_boundary(content_type).ok_or(HttpError::new(400))?;
        return parse_multipart(body, &boundary).map(Some);
    }
    if content_type.contains("application/x-www-form-urlencoded") {
        let text = std::str::from_utf8(body).map_err(|_| HttpError::new(400))?;
        let mut form = FormData::default();
        form.fields = parse_urlencoded(text);
        return Ok(Some(form));
    }
    Ok(None)
}

pub fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for pair in body.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(percent_decode(key), percent_decode(value));
        }
    }
    fields
}

/// Percent-decoding as applied inside form bodies: `%XX` and `+` as space.
/// Never applied to request paths.
pub fn percent_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn extract_boundary(content_type: &str) -> Option<String> {
    let boundary = content_type.split("boundary=").nth(1)?;
    let boundary = boundary.split(';').next().unwrap_or(boundary).trim();
    let boundary = boundary.trim_matches('"');
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<FormData, HttpError> {
    let delim = format!("--{}", boundary).into_bytes();
    let mut form = FormData::default();

    let mut pos = find_subslice(body, &delim).ok_or(HttpError::new(400))?;
    pos += delim.len();

    loop {
        // A part ends at the next boundary; the final boundary carries a
        // trailing "--".
        if body[pos..].starts_with(b"--") {
            break;
        }
        let next = match find_subslice(&body[pos..], &delim) {
            Some(offset) => pos + offset,
            None => break,
        };
        let mut part = &body[pos..next];
        if part.starts_with(b"\r\n") {
            part = &part[2..];
        }
        if let Some(headers_end) = find_headers_end(part) {
            let headers_text = String::from_utf8_lossy(&part[..headers_end]);
            let mut content = &part[headers_end..];
            if content.ends_with(b"\r\n") {
                content = &content[..content.len() - 2];
            }
            let (name, filename) = parse_content_disposition(&headers_text);
            if !name.is_empty() {
                if filename.is_empty() {
                    form.fields
                        .insert(name, String::from_utf8_lossy(content).into_owned());
                } else {
                    form.files.push(FilePart {
                        name,
                        filename,
                        data: content.to_vec(),
                    });
                }
            }
        }
        pos = next + delim.len();
    }
    Ok(form)
}

fn parse_content_disposition(headers_text: &str) -> (String, String) {
    for line in headers_text.lines() {
        if !line
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("content-disposition:")
        {
            continue;
        }
        let name = disposition_param(line, "name").unwrap_or_default();
        let filename = disposition_param(line, "filename").unwrap_or_default();
        return (name, filename);
    }
    (String::new(), String::new())
}

fn disposition_param(line: &str, param: &str) -> Option<String> {
    for piece in line.split(';') {
        let piece = piece.trim();
        if let Some(rest) = piece.strip_prefix(param) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.trim_matches('"').trim_matches('\'').to_string());
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
