//! Per-client connection state: buffered reads, incremental request
//! assembly, and the outgoing send cursor.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::cgi::CgiProcess;
use crate::config::Location;
use crate::http::request::{
    chunked_frame_end, decode_chunked, decode_head, find_headers_end, skip_leading_empty_lines,
    BodyPolicy, ChunkStatus, Request,
};
use crate::http::response::Response;
use crate::http::HttpError;
use crate::server::poll::{READABLE, WRITABLE};

/// Upper bound on the head (start line + headers); beyond this the request
/// is rejected rather than buffered forever.
const MAX_HEAD_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, PartialEq, Eq)]
pub enum RequestProgress {
    /// More bytes are needed before anything can be decided.
    Incomplete,
    /// The head was just decoded; reported exactly once per request so the
    /// caller can reject oversized declared bodies before reading them.
    HeadDecoded,
    /// A full request was assembled and its bytes consumed from the buffer.
    Complete(Request),
}

/// Incremental assembly of requests from a raw byte stream. Bytes past the
/// consumed request stay buffered for the next pipelined request.
#[derive(Default)]
pub struct RequestAssembler {
    buffer: Vec<u8>,
    head: Option<(Request, usize)>,
    head_reported: bool,
}

impl RequestAssembler {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Declared body length of the in-flight request, once its head is
    /// decoded. Chunked bodies have no declared length.
    pub fn declared_body_len(&self) -> Option<usize> {
        match self.head.as_ref().map(|(r, _)| r.body_policy) {
            Some(BodyPolicy::Length(n)) => Some(n),
            _ => None,
        }
    }

    pub fn pending_head(&self) -> Option<&Request> {
        self.head.as_ref().map(|(request, _)| request)
    }

    /// Drops the in-flight request and everything buffered. Used when the
    /// request was rejected and the connection is closing anyway.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.head = None;
        self.head_reported = false;
    }

    pub fn poll(&mut self) -> Result<RequestProgress, HttpError> {
        if self.head.is_none() {
            let skip = skip_leading_empty_lines(&self.buffer);
            if skip > 0 {
                self.buffer.drain(..skip);
            }
            let head_end = match find_headers_end(&self.buffer) {
                Some(end) => end,
                None if self.buffer.len() > MAX_HEAD_SIZE => return Err(HttpError::new(400)),
                None => return Ok(RequestProgress::Incomplete),
            };
            let request = decode_head(&self.buffer[..head_end])?;
            self.head = Some((request, head_end));
            self.head_reported = false;
        }

        if !self.head_reported {
            self.head_reported = true;
            return Ok(RequestProgress::HeadDecoded);
        }

        let (_, head_end) = match &self.head {
            Some(head) => (&head.0, head.1),
            None => return Ok(RequestProgress::Incomplete),
        };
        let policy = self.head.as_ref().map(|(r, _)| r.body_policy);

        match policy {
            Some(BodyPolicy::None) => {
                let (request, _) = self.take_head();
                self.buffer.drain(..head_end);
                Ok(RequestProgress::Complete(request))
            }
            Some(BodyPolicy::Length(length)) => {
                if self.buffer.len() < head_end + length {
                    return Ok(RequestProgress::Incomplete);
                }
                let (mut request, _) = self.take_head();
                request.body = self.buffer[head_end..head_end + length].to_vec();
                self.buffer.drain(..head_end + length);
                Ok(RequestProgress::Complete(request))
            }
            Some(BodyPolicy::Chunked) => {
                let raw = &self.buffer[head_end..];
                if chunked_frame_end(raw).is_none() {
                    return Ok(RequestProgress::Incomplete);
                }
                match decode_chunked(raw)? {
                    ChunkStatus::Complete { body, consumed } => {
                        let (mut request, _) = self.take_head();
                        request.body = body;
                        self.buffer.drain(..head_end + consumed);
                        Ok(RequestProgress::Complete(request))
                    }
                    // The terminator scan matched bytes inside chunk data;
                    // the real terminator has not arrived yet.
                    ChunkStatus::Incomplete => Ok(RequestProgress::Incomplete),
                }
            }
            None => Ok(RequestProgress::Incomplete),
        }
    }

    fn take_head(&mut self) -> (Request, usize) {
        self.head_reported = false;
        match self.head.take() {
            Some(head) => head,
            None => unreachable!("take_head called without a decoded head"),
        }
    }
}

pub struct Connection {
    stream: TcpStream,
    /// Listener fd this connection was accepted on; selects the vhost group.
    pub listener_fd: RawFd,
    pub assembler: RequestAssembler,
    outbox: Vec<u8>,
    sent: usize,
    pub close_after: bool,
    /// Set while a CGI child is servicing the current request.
    pub cgi: Option<CgiProcess>,
    pub cgi_location: Option<Location>,
    last_activity: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, listener_fd: RawFd) -> Connection {
        Connection {
            stream,
            listener_fd,
            assembler: RequestAssembler::default(),
            outbox: Vec::new(),
            sent: 0,
            close_after: false,
            cgi: None,
            cgi_location: None,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, limit: Duration) -> bool {
        self.last_activity.elapsed() >= limit
    }

    /// Drains the socket into the assembler. Returns true when the peer
    /// closed its end.
    pub fn on_readable(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.touch();
                    self.assembler.feed(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn queue_response(&mut self, response: &Response) {
        self.close_after = self.close_after || response.wants_close();
        self.outbox = response.to_bytes();
        self.sent = 0;
        self.touch();
    }

    pub fn has_pending_output(&self) -> bool {
        self.sent < self.outbox.len()
    }

    /// Writes as much of the outbox as the socket accepts. Returns true
    /// once the response is fully flushed.
    pub fn on_writable(&mut self) -> io::Result<bool> {
        while self.sent < self.outbox.len() {
            match self.stream.write(&self.outbox[self.sent..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.sent += n;
                    self.touch();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.outbox.clear();
        self.sent = 0;
        Ok(true)
    }

    /// Readiness mask this connection currently needs.
    pub fn interest(&self) -> u32 {
        if self.has_pending_output() {
            READABLE | WRITABLE
        } else {
            READABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n";

    fn drive(assembler: &mut RequestAssembler) -> RequestProgress {
        // Callers step past HeadDecoded when they have no limit to enforce.
        match assembler.poll().unwrap() {
            RequestProgress::HeadDecoded => assembler.poll().unwrap(),
            other => other,
        }
    }

    #[test]
    fn assembles_whole_request_in_one_feed() {
        let mut assembler = RequestAssembler::default();
        assembler.feed(SIMPLE);
        match drive(&mut assembler) {
            RequestProgress::Complete(request) => {
                assert_eq!(request.method, "GET");
                assert_eq!(request.path, "/index.html");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_single_feed() {
        let mut whole = RequestAssembler::default();
        whole.feed(SIMPLE);
        let expected = match drive(&mut whole) {
            RequestProgress::Complete(request) => request,
            other => panic!("unexpected: {:?}", other),
        };

        let mut split = RequestAssembler::default();
        let mut assembled = None;
        for byte in SIMPLE {
            split.feed(&[*byte]);
            if let RequestProgress::Complete(request) = drive(&mut split) {
                assembled = Some(request);
            }
        }
        let assembled = assembled.unwrap();
        assert_eq!(assembled.method, expected.method);
        assert_eq!(assembled.path, expected.path);
        assert_eq!(assembled.headers, expected.headers);
    }

    #[test]
    fn head_decoded_reported_once_with_declared_length() {
        let mut assembler = RequestAssembler::default();
        assembler.feed(b"POST /up HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(assembler.poll().unwrap(), RequestProgress::HeadDecoded);
        assert_eq!(assembler.declared_body_len(), Some(5));
        assert_eq!(assembler.poll().unwrap(), RequestProgress::Incomplete);

        assembler.feed(b"hello");
        match assembler.poll().unwrap() {
            RequestProgress::Complete(request) => assert_eq!(request.body, b"hello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn pipelined_bytes_stay_buffered() {
        let mut assembler = RequestAssembler::default();
        let mut wire = SIMPLE.to_vec();
        wire.extend_from_slice(b"GET /second HTTP/1.1\r\nHost: a\r\n\r\n");
        assembler.feed(&wire);

        match drive(&mut assembler) {
            RequestProgress::Complete(request) => assert_eq!(request.path, "/index.html"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(assembler.buffered() > 0);
        match drive(&mut assembler) {
            RequestProgress::Complete(request) => assert_eq!(request.path, "/second"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn body_boundary_leaves_pipelined_bytes_buffered() {
        let mut assembler = RequestAssembler::default();
        let mut wire =
            b"POST /up HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        wire.extend_from_slice(SIMPLE);
        assembler.feed(&wire);

        match drive(&mut assembler) {
            RequestProgress::Complete(request) => {
                // Exactly the declared five bytes; nothing of the next
                // request bleeds into the body.
                assert_eq!(request.body, b"hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(assembler.buffered(), SIMPLE.len());
        match drive(&mut assembler) {
            RequestProgress::Complete(request) => assert_eq!(request.path, "/index.html"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn chunked_body_waits_for_terminator() {
        let mut assembler = RequestAssembler::default();
        assembler.feed(
            b"POST /cgi HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n",
        );
        assert_eq!(drive(&mut assembler), RequestProgress::Incomplete);

        assembler.feed(b"5\r\npedia\r\n0\r\n\r\n");
        match assembler.poll().unwrap() {
            RequestProgress::Complete(request) => assert_eq!(request.body, b"Wikipedia"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn malformed_start_line_is_an_error() {
        let mut assembler = RequestAssembler::default();
        assembler.feed(b"GET /x HTTP/1.1 extra\r\n\r\n");
        assert_eq!(assembler.poll().unwrap_err().status, 400);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut assembler = RequestAssembler::default();
        assembler.feed(b"GET / HTTP/1.1\r\nX-Fill: ");
        assembler.feed(&vec![b'a'; MAX_HEAD_SIZE + 1]);
        assert_eq!(assembler.poll().unwrap_err().status, 400);
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let mut assembler = RequestAssembler::default();
        assembler.feed(b"\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n");
        match drive(&mut assembler) {
            RequestProgress::Complete(request) => assert_eq!(request.path, "/"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
