//! CGI subprocess orchestration.
//!
//! One `CgiProcess` owns one spawned child and its three pipe descriptors.
//! Completion is three independent signals (stdout EOF, stderr EOF, child
//! reaped) that may arrive in any order; the process is finished only when
//! all three have fired. Nothing here blocks: pipes are non-blocking, the
//! body is written in readiness-driven steps, and reaping uses `try_wait`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::Location;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::HttpError;
use crate::server::poll::set_nonblocking;

const SERVER_SOFTWARE: &str = "webserv/0.1";

/// The three completion signals, each settable only by its own event
/// source (stdout read, stderr read, wait status).
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    pub stdout_done: bool,
    pub stderr_done: bool,
    pub reaped: bool,
}

impl Completion {
    pub fn is_done(&self) -> bool {
        self.stdout_done && self.stderr_done && self.reaped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiStream {
    Stdout,
    Stderr,
}

/// A resolved CGI invocation: where the script lives on disk, how it is
/// named on the wire, and what runs it. `interpreter` of `None` means the
/// script is exec'ed directly.
#[derive(Debug, Clone)]
pub struct CgiTarget {
    pub script_path: PathBuf,
    pub script_name: String,
    pub path_info: String,
    pub interpreter: Option<String>,
}

pub struct CgiProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    pub stdin_fd: Option<RawFd>,
    pub stdout_fd: RawFd,
    pub stderr_fd: RawFd,
    body: Vec<u8>,
    body_sent: usize,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    pub completion: Completion,
    exit_ok: bool,
    started: Instant,
    deadline: Duration,
}

impl CgiProcess {
    /// Validates the script and spawns the child. Pre-spawn failures carry
    /// the status the connection answers with: 404 for a missing script,
    /// 403 for a non-executable one, 500 otherwise.
    pub fn spawn(
        target: &CgiTarget,
        request: &Request,
        location: &Location,
        timeout_secs: u64,
    ) -> Result<CgiProcess, HttpError> {
        let metadata = std::fs::metadata(&target.script_path).map_err(|_| HttpError::new(404))?;
        if !metadata.is_file() {
            return Err(HttpError::new(404));
        }
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(HttpError::new(403));
        }

        let script_dir = target
            .script_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let script_base = target
            .script_path
            .file_name()
            .ok_or(HttpError::new(404))?
            .to_os_string();

        let mut command = match &target.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script_base);
                command
            }
            None => {
                let absolute = target
                    .script_path
                    .canonicalize()
                    .map_err(|_| HttpError::new(500))?;
                Command::new(absolute)
            }
        };

        let env = cgi_environment(target, request, location, timeout_secs);
        command
            .current_dir(script_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            warn!("cgi spawn failed for {:?}: {}", target.script_path, e);
            HttpError::new(500)
        })?;

        let stdin = child.stdin.take().ok_or(HttpError::new(500))?;
        let stdout = child.stdout.take().ok_or(HttpError::new(500))?;
        let stderr = child.stderr.take().ok_or(HttpError::new(500))?;
        for fd in [stdin.as_raw_fd(), stdout.as_raw_fd(), stderr.as_raw_fd()] {
            set_nonblocking(fd).map_err(|_| HttpError::new(500))?;
        }

        debug!("spawned cgi pid {} for {:?}", child.id(), target.script_path);

        let mut process = CgiProcess {
            stdin_fd: Some(stdin.as_raw_fd()),
            stdout_fd: stdout.as_raw_fd(),
            stderr_fd: stderr.as_raw_fd(),
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            child,
            body: request.body.clone(),
            body_sent: 0,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            completion: Completion::default(),
            exit_ok: false,
            started: Instant::now(),
            deadline: Duration::from_secs(timeout_secs),
        };
        if process.body.is_empty() {
            process.close_stdin();
        }
        Ok(process)
    }

    /// Advances the multiplexed body write on a stdin-writable event.
    /// Returns true once the write end has been closed (fully written,
    /// or the script stopped reading).
    pub fn on_stdin_writable(&mut self) -> bool {
        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return true,
        };
        while self.body_sent < self.body.len() {
            match stdin.write(&self.body[self.body_sent..]) {
                Ok(0) => break,
                Ok(n) => self.body_sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    // EPIPE: the script exited or closed stdin without
                    // draining the body. Not an error for the request.
                    debug!("cgi stdin write ended early: {}", e);
                    break;
                }
            }
        }
        self.close_stdin();
        true
    }

    fn close_stdin(&mut self) {
        self.stdin = None;
        self.stdin_fd = None;
    }

    /// Drains whatever the ready stream has available. Returns true when
    /// the stream reached EOF and its descriptor should be deregistered.
    pub fn on_readable(&mut self, stream: CgiStream) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            let read = match stream {
                CgiStream::Stdout => self.stdout.as_mut().map(|s| s.read(&mut chunk)),
                CgiStream::Stderr => self.stderr.as_mut().map(|s| s.read(&mut chunk)),
            };
            match read {
                None | Some(Ok(0)) => {
                    self.mark_stream_done(stream);
                    return true;
                }
                Some(Ok(n)) => match stream {
                    CgiStream::Stdout => self.stdout_buf.extend_from_slice(&chunk[..n]),
                    CgiStream::Stderr => self.stderr_buf.extend_from_slice(&chunk[..n]),
                },
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Some(Err(e)) => {
                    debug!("cgi pipe read error: {}", e);
                    self.mark_stream_done(stream);
                    return true;
                }
            }
        }
    }

    fn mark_stream_done(&mut self, stream: CgiStream) {
        match stream {
            CgiStream::Stdout => {
                self.completion.stdout_done = true;
                self.stdout = None;
            }
            CgiStream::Stderr => {
                self.completion.stderr_done = true;
                self.stderr = None;
            }
        }
    }

    /// Non-blocking reap attempt; called on every event delivered to this
    /// process and once per housekeeping tick.
    pub fn try_reap(&mut self) {
        if self.completion.reaped {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.completion.reaped = true;
            self.exit_ok = status.success();
            debug!("cgi pid {} exited, success={}", self.child.id(), self.exit_ok);
        }
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    pub fn over_deadline(&self) -> bool {
        self.started.elapsed() > self.deadline
    }

    /// Kills the child and marks the process complete with a failed exit.
    /// Waiting after SIGKILL is bounded, so this cannot stall the loop.
    pub fn abort(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.completion.stdout_done = true;
        self.completion.stderr_done = true;
        self.completion.reaped = true;
        self.exit_ok = false;
    }

    /// Every descriptor still registered with the reactor.
    pub fn open_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::with_capacity(3);
        if let Some(fd) = self.stdin_fd {
            fds.push(fd);
        }
        if self.stdout.is_some() {
            fds.push(self.stdout_fd);
        }
        if self.stderr.is_some() {
            fds.push(self.stderr_fd);
        }
        fds
    }

    /// Folds the finished process into an HTTP response. Only valid once
    /// `is_done()` holds.
    pub fn into_response(&self, location: &Location) -> Response {
        if !self.stderr_buf.is_empty() {
            warn!(
                "cgi stderr: {}",
                String::from_utf8_lossy(&self.stderr_buf).trim_end()
            );
        }
        if !self.exit_ok || self.stdout_buf.is_empty() {
            return Response::error(500, Some(location));
        }
        build_response(&self.stdout_buf)
    }
}

/// Builds the HTTP response from raw CGI stdout. Output with a header
/// block before `\r\n\r\n` keeps those headers verbatim (a `Status:`
/// pseudo-header selects the response status); output without one becomes
/// a text/html body. Content-Length is always computed here.
pub fn build_response(output: &[u8]) -> Response {
    let separator = output.windows(4).position(|w| w == b"\r\n\r\n");
    let (header_part, body) = match separator {
        Some(pos) => (&output[..pos], &output[pos + 4..]),
        None => (&output[..0], output),
    };

    let mut status = 200;
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in String::from_utf8_lossy(header_part).lines() {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => continue,
        };
        if name.eq_ignore_ascii_case("Status") {
            if let Some(code) = value.split(' ').next().and_then(|c| c.parse().ok()) {
                status = code;
            }
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut response = Response::new(status);
    for (name, value) in headers {
        response.set_header(&name, &value);
    }
    if response.header("Content-Type").is_none() {
        response.set_header("Content-Type", "text/html");
    }
    response.set_header("Content-Length", &body.len().to_string());
    response.body = body.to_vec();
    response
}

fn cgi_environment(
    target: &CgiTarget,
    request: &Request,
    location: &Location,
    timeout_secs: u64,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert("SERVER_PROTOCOL".into(), request.version.clone());
    env.insert("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into());
    env.insert("REQUEST_METHOD".into(), request.method.clone());
    env.insert("SCRIPT_NAME".into(), target.script_name.clone());
    env.insert("PATH_INFO".into(), target.path_info.clone());
    env.insert("QUERY_STRING".into(), request.query.clone());
    env.insert(
        "CONTENT_TYPE".into(),
        request.header("Content-Type").unwrap_or("").into(),
    );
    env.insert("CONTENT_LENGTH".into(), request.body.len().to_string());
    // Hostname only; the Host header may carry a :port suffix.
    let host = request.host().unwrap_or("");
    env.insert(
        "SERVER_NAME".into(),
        host.split(':').next().unwrap_or(host).to_string(),
    );
    env.insert(
        "UPLOAD_DIR".into(),
        location.upload_path.clone().unwrap_or_default(),
    );
    env.insert("TIMEOUT".into(), timeout_secs.to_string());
    // Interpreters that re-exec helpers still need a search path.
    env.insert(
        "PATH".into(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()),
    );
    // Remaining request headers, HTTP_-prefixed per the CGI convention.
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("Content-Type") || name.eq_ignore_ascii_case("Content-Length")
        {
            continue;
        }
        let key: String = name
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        env.insert(format!("HTTP_{}", key), value.clone());
    }
    env
}

/// Splits a request path at the matched CGI extension: the script portion
/// (ending in `ext`) and the trailing PATH_INFO. Returns `None` when the
/// path does not contain the extension as a segment boundary.
pub fn split_script_path(path: &str, ext: &str) -> Option<(String, String)> {
    if path.ends_with(ext) {
        return Some((path.to_string(), String::new()));
    }
    let marker = format!("{}/", ext);
    path.find(&marker).map(|pos| {
        (
            path[..pos + ext.len()].to_string(),
            path[pos + ext.len()..].to_string(),
        )
    })
}
