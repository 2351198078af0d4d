//! The event loop: one epoll instance multiplexing listeners, client
//! sockets, and CGI pipe descriptors in a single thread.

pub mod connection;
pub mod poll;

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::epoll_event;
use log::{debug, info, warn};

use crate::cgi::{split_script_path, CgiProcess, CgiStream, CgiTarget};
use crate::config::{match_server, Config, Location, ServerConfig};
use crate::error::ServerError;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::server::connection::{Connection, RequestProgress};
use crate::server::poll::{Poller, ERROR, READABLE, WRITABLE};
use crate::static_files;

const MAX_EVENTS: usize = 1024;
/// Upper bound on one wait, so housekeeping runs at least once a second
/// even with no traffic.
const TICK_MS: i32 = 1000;

struct Listener {
    listener: TcpListener,
    /// Indices into `config.servers` sharing this address, in declaration
    /// order; the first is the default virtual host.
    server_idxs: Vec<usize>,
}

#[derive(Clone, Copy)]
enum CgiChannel {
    Stdin,
    Stdout,
    Stderr,
}

/// Reverse mapping from a CGI pipe descriptor to the client it serves.
#[derive(Clone, Copy)]
struct CgiFd {
    client_fd: RawFd,
    channel: CgiChannel,
}

pub struct Server {
    poller: Poller,
    config: Config,
    listeners: HashMap<RawFd, Listener>,
    connections: HashMap<RawFd, Connection>,
    cgi_fds: HashMap<RawFd, CgiFd>,
}

/// Where a routed request goes: an immediate response, or a CGI child
/// that will produce one later.
pub enum Routed {
    Response(Response),
    Cgi(CgiTarget),
}

/// Fixed routing order once a request has parsed and a location matched:
/// redirect, then the body size limit, then the method check, then CGI,
/// then static content. Method rejection never consults the filesystem.
pub fn route(request: &Request, location: &Location) -> Routed {
    if let Some((status, target)) = &location.redirect {
        return Routed::Response(Response::redirect(*status, target));
    }
    if request.body.len() > location.max_body_size {
        return Routed::Response(Response::error(413, Some(location)));
    }
    if !location.allows_method(&request.method) {
        return Routed::Response(Response::error(405, Some(location)));
    }
    if let Some(target) = cgi_target(location, &request.path) {
        return Routed::Cgi(target);
    }
    if let Some(target) = cgi_index_target(location, &request.path) {
        return Routed::Cgi(target);
    }
    Routed::Response(static_files::handle(request, location))
}

/// Resolves a path against the location's CGI map. An empty interpreter
/// value means the script is exec'ed directly.
fn cgi_target(location: &Location, path: &str) -> Option<CgiTarget> {
    // Longest extension first, ties broken lexicographically, so the pick
    // is stable when extensions overlap (".py" beats ".y" for "/a.py").
    let mut exts: Vec<&String> = location.cgi.keys().collect();
    exts.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    for ext in exts {
        let interpreter = location.cgi.get(ext)?;
        if let Some((script_name, path_info)) = split_script_path(path, ext) {
            let script_path = Path::new(&location.root).join(script_name.trim_start_matches('/'));
            return Some(CgiTarget {
                script_path,
                script_name,
                path_info,
                interpreter: if interpreter.is_empty() {
                    None
                } else {
                    Some(interpreter.clone())
                },
            });
        }
    }
    None
}

/// A directory request whose configured index file carries a CGI extension
/// runs the index as a script instead of serving its source.
fn cgi_index_target(location: &Location, path: &str) -> Option<CgiTarget> {
    let dir = Path::new(&location.root).join(path.trim_start_matches('/'));
    if !dir.is_dir() {
        return None;
    }
    for index in &location.index {
        let ext = match index.rfind('.') {
            Some(dot) => &index[dot..],
            None => continue,
        };
        let interpreter = match location.cgi.get(ext) {
            Some(interpreter) => interpreter,
            None => continue,
        };
        let script_path = dir.join(index);
        if !script_path.is_file() {
            continue;
        }
        return Some(CgiTarget {
            script_path,
            script_name: format!("{}/{}", path.trim_end_matches('/'), index),
            path_info: String::new(),
            interpreter: if interpreter.is_empty() {
                None
            } else {
                Some(interpreter.clone())
            },
        });
    }
    None
}

/// What the housekeeping tick does with a non-CGI connection.
#[derive(Debug, PartialEq, Eq)]
enum IdleVerdict {
    Active,
    /// Queued output the peer has stopped draining; close.
    Stalled,
    /// A request was started but never completed; answer 408.
    Partial,
    /// Nothing in flight; close quietly.
    Quiet,
}

fn idle_verdict(conn: &Connection, limit: Duration) -> IdleVerdict {
    if !conn.idle_for(limit) {
        return IdleVerdict::Active;
    }
    if conn.has_pending_output() {
        IdleVerdict::Stalled
    } else if conn.assembler.buffered() > 0 || conn.assembler.pending_head().is_some() {
        IdleVerdict::Partial
    } else {
        IdleVerdict::Quiet
    }
}

impl Server {
    /// Binds one listening socket per distinct host:port, grouping servers
    /// that share an address into a virtual-host group.
    pub fn bind(config: Config) -> Result<Server, ServerError> {
        let poller = Poller::new()?;

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, server) in config.servers.iter().enumerate() {
            let addr = server.addr();
            if !groups.contains_key(&addr) {
                order.push(addr.clone());
            }
            groups.entry(addr).or_default().push(idx);
        }

        let mut listeners = HashMap::new();
        for addr in order {
            let server_idxs = groups.remove(&addr).unwrap_or_default();
            let listener = TcpListener::bind(&addr)?;
            listener.set_nonblocking(true)?;
            let fd = listener.as_raw_fd();
            poller.add(fd, READABLE)?;
            info!("listening on {}", addr);
            listeners.insert(fd, Listener {
                listener,
                server_idxs,
            });
        }

        Ok(Server {
            poller,
            config,
            listeners,
            connections: HashMap::new(),
            cgi_fds: HashMap::new(),
        })
    }

    /// Runs until `shutdown` is raised. The wait is the only blocking
    /// call; every handler runs to completion or parks on readiness.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while !shutdown.load(Ordering::Relaxed) {
            let ready = self.poller.wait(&mut events, TICK_MS)?;
            for i in 0..ready {
                let fd = events[i].u64 as RawFd;
                let mask = events[i].events;
                if self.listeners.contains_key(&fd) {
                    self.accept(fd);
                } else if self.connections.contains_key(&fd) {
                    self.handle_client(fd, mask);
                } else if self.cgi_fds.contains_key(&fd) {
                    self.handle_cgi(fd, mask);
                }
            }
            self.housekeeping();
        }
        info!("shutting down");
        Ok(())
    }

    fn accept(&mut self, listener_fd: RawFd) {
        loop {
            let accepted = match self.listeners.get(&listener_fd) {
                Some(entry) => entry.listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    if self.poller.add(fd, READABLE).is_err() {
                        continue;
                    }
                    debug!("accepted {} on fd {}", peer, fd);
                    self.connections.insert(fd, Connection::new(stream, listener_fd));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_client(&mut self, fd: RawFd, mask: u32) {
        let mut close = mask & ERROR != 0;

        if !close && mask & READABLE != 0 {
            match self.connections.get_mut(&fd).map(Connection::on_readable) {
                Some(Ok(false)) => self.process_requests(fd),
                Some(Ok(true)) => {
                    // Peer half-closed; serve what it already sent, then
                    // close once the response is flushed.
                    self.process_requests(fd);
                    let busy = self
                        .connections
                        .get(&fd)
                        .map_or(false, |c| c.has_pending_output() || c.cgi.is_some());
                    if busy {
                        if let Some(conn) = self.connections.get_mut(&fd) {
                            conn.close_after = true;
                        }
                    } else {
                        close = true;
                    }
                }
                Some(Err(e)) => {
                    debug!("read error on fd {}: {}", fd, e);
                    close = true;
                }
                None => close = true,
            }
        }

        if !close && mask & WRITABLE != 0 {
            match self.connections.get_mut(&fd).map(Connection::on_writable) {
                Some(Ok(true)) => {
                    let close_after = self
                        .connections
                        .get(&fd)
                        .map_or(true, |c| c.close_after);
                    if close_after {
                        close = true;
                    } else {
                        // Response flushed; a pipelined request may already
                        // be sitting in the buffer.
                        self.process_requests(fd);
                    }
                }
                Some(Ok(false)) => {}
                Some(Err(e)) => {
                    debug!("write error on fd {}: {}", fd, e);
                    close = true;
                }
                None => close = true,
            }
        }

        if close {
            self.close_connection(fd);
        } else {
            self.update_interest(fd);
        }
    }

    /// Drives request assembly for a connection until it blocks on more
    /// bytes, queues a response, or hands off to CGI.
    fn process_requests(&mut self, fd: RawFd) {
        loop {
            let busy = match self.connections.get(&fd) {
                Some(conn) => conn.cgi.is_some() || conn.has_pending_output(),
                None => return,
            };
            if busy {
                return;
            }
            let progress = match self.connections.get_mut(&fd) {
                Some(conn) => conn.assembler.poll(),
                None => return,
            };
            match progress {
                Err(err) => {
                    self.queue_error(fd, err.status, None);
                    return;
                }
                Ok(RequestProgress::Incomplete) => return,
                Ok(RequestProgress::HeadDecoded) => {
                    // Reject an oversized declared body before reading it.
                    if let Some((status, location)) = self.oversized_head(fd) {
                        self.queue_error(fd, status, location.as_ref());
                        return;
                    }
                }
                Ok(RequestProgress::Complete(request)) => {
                    self.dispatch(fd, request);
                    return;
                }
            }
        }
    }

    /// After a head decode: `Some((413, location))` when the declared
    /// Content-Length exceeds the matched location's limit.
    fn oversized_head(&self, fd: RawFd) -> Option<(u16, Option<Location>)> {
        let conn = self.connections.get(&fd)?;
        let declared = conn.assembler.declared_body_len()?;
        let head = conn.assembler.pending_head()?;
        let location = self.resolve_location(conn.listener_fd, head)?;
        // A redirect outranks the size limit, so it must see the request.
        if location.redirect.is_some() {
            return None;
        }
        if declared > location.max_body_size {
            Some((413, Some(location)))
        } else {
            None
        }
    }

    fn resolve_location(&self, listener_fd: RawFd, request: &Request) -> Option<Location> {
        let server_idxs = &self.listeners.get(&listener_fd)?.server_idxs;
        let group: Vec<&ServerConfig> = server_idxs
            .iter()
            .map(|&idx| &self.config.servers[idx])
            .collect();
        let server = match_server(&group, request.host().unwrap_or(""))?;
        Some(server.match_location(&request.path))
    }

    fn dispatch(&mut self, fd: RawFd, request: Request) {
        if request.host().is_none() {
            self.queue_error(fd, 400, None);
            return;
        }
        let listener_fd = match self.connections.get(&fd) {
            Some(conn) => conn.listener_fd,
            None => return,
        };
        let location = match self.resolve_location(listener_fd, &request) {
            Some(location) => location,
            None => {
                self.queue_error(fd, 404, None);
                return;
            }
        };
        info!("{} {} (location {})", request.method, request.path, location.path);

        match route(&request, &location) {
            Routed::Response(mut response) => {
                if request.wants_close() {
                    response.set_header("Connection", "close");
                }
                if let Some(conn) = self.connections.get_mut(&fd) {
                    conn.queue_response(&response);
                }
            }
            Routed::Cgi(target) => {
                match CgiProcess::spawn(&target, &request, &location, self.config.cgi_timeout_secs)
                {
                    Ok(process) => {
                        self.register_cgi(fd, process, location, request.wants_close())
                    }
                    Err(err) => self.queue_error(fd, err.status, Some(&location)),
                }
            }
        }
    }

    /// Registers the child's pipe descriptors with the reactor and parks
    /// the connection until all three completion signals arrive.
    fn register_cgi(
        &mut self,
        client_fd: RawFd,
        process: CgiProcess,
        location: Location,
        wants_close: bool,
    ) {
        let mut registered = Vec::new();
        let channels = [
            (process.stdin_fd, CgiChannel::Stdin, WRITABLE),
            (Some(process.stdout_fd), CgiChannel::Stdout, READABLE),
            (Some(process.stderr_fd), CgiChannel::Stderr, READABLE),
        ];
        for (pipe_fd, channel, interest) in channels {
            let pipe_fd = match pipe_fd {
                Some(pipe_fd) => pipe_fd,
                None => continue,
            };
            if self.poller.add(pipe_fd, interest).is_err() {
                for fd in registered {
                    let _ = self.poller.delete(fd);
                    self.cgi_fds.remove(&fd);
                }
                let mut process = process;
                process.abort();
                self.queue_error(client_fd, 500, Some(&location));
                return;
            }
            registered.push(pipe_fd);
            self.cgi_fds.insert(pipe_fd, CgiFd { client_fd, channel });
        }

        if let Some(conn) = self.connections.get_mut(&client_fd) {
            conn.cgi = Some(process);
            conn.cgi_location = Some(location);
            conn.close_after = conn.close_after || wants_close;
        }
    }

    fn handle_cgi(&mut self, fd: RawFd, mask: u32) {
        let entry = match self.cgi_fds.get(&fd) {
            Some(entry) => *entry,
            None => return,
        };
        let client_fd = entry.client_fd;

        let deregister = match self
            .connections
            .get_mut(&client_fd)
            .and_then(|conn| conn.cgi.as_mut())
        {
            Some(process) => {
                let eof = match entry.channel {
                    CgiChannel::Stdin if mask & (WRITABLE | ERROR) != 0 => {
                        process.on_stdin_writable()
                    }
                    CgiChannel::Stdout if mask & (READABLE | ERROR) != 0 => {
                        process.on_readable(CgiStream::Stdout)
                    }
                    CgiChannel::Stderr if mask & (READABLE | ERROR) != 0 => {
                        process.on_readable(CgiStream::Stderr)
                    }
                    _ => false,
                };
                process.try_reap();
                eof
            }
            // Stale entry: the client vanished while events were in flight.
            None => true,
        };

        if deregister {
            let _ = self.poller.delete(fd);
            self.cgi_fds.remove(&fd);
        }

        let done = self
            .connections
            .get(&client_fd)
            .and_then(|conn| conn.cgi.as_ref())
            .map_or(false, CgiProcess::is_done);
        if done {
            self.finish_cgi(client_fd, None);
        }
    }

    /// Folds a finished (or force-aborted) CGI process into the queued
    /// response. `forced_status` overrides the child's output, used when
    /// the deadline killed it.
    fn finish_cgi(&mut self, client_fd: RawFd, forced_status: Option<u16>) {
        let (process, location) = match self.connections.get_mut(&client_fd) {
            Some(conn) => (conn.cgi.take(), conn.cgi_location.take()),
            None => return,
        };
        let process = match process {
            Some(process) => process,
            None => return,
        };
        for pipe_fd in process.open_fds() {
            let _ = self.poller.delete(pipe_fd);
            self.cgi_fds.remove(&pipe_fd);
        }

        let mut response = match (forced_status, location.as_ref()) {
            (Some(status), location) => Response::error(status, location),
            (None, Some(location)) => process.into_response(location),
            (None, None) => Response::error(500, None),
        };
        if let Some(conn) = self.connections.get_mut(&client_fd) {
            if conn.close_after {
                response.set_header("Connection", "close");
            }
            conn.queue_response(&response);
        }
        self.update_interest(client_fd);
    }

    /// Periodic pass: retry CGI reaps, enforce the CGI deadline, and evict
    /// idle connections.
    fn housekeeping(&mut self) {
        let idle_limit = Duration::from_secs(self.config.timeout_secs);
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();

        for fd in fds {
            let mut cgi_timed_out = false;
            let mut cgi_done = false;
            let mut verdict = IdleVerdict::Active;

            if let Some(conn) = self.connections.get_mut(&fd) {
                if let Some(process) = conn.cgi.as_mut() {
                    process.try_reap();
                    if process.is_done() {
                        cgi_done = true;
                    } else if process.over_deadline() {
                        process.abort();
                        cgi_timed_out = true;
                    }
                } else {
                    verdict = idle_verdict(conn, idle_limit);
                }
            }

            if cgi_timed_out {
                warn!("cgi deadline exceeded for fd {}", fd);
                self.finish_cgi(fd, Some(500));
            } else if cgi_done {
                self.finish_cgi(fd, None);
            } else {
                match verdict {
                    IdleVerdict::Active => {}
                    // A request was started but never completed.
                    IdleVerdict::Partial => self.queue_error(fd, 408, None),
                    IdleVerdict::Stalled | IdleVerdict::Quiet => {
                        debug!("evicting idle fd {}", fd);
                        self.close_connection(fd);
                    }
                }
            }
        }
    }

    /// Queues an error response and abandons whatever was buffered; error
    /// responses always close the connection after the flush.
    fn queue_error(&mut self, fd: RawFd, status: u16, location: Option<&Location>) {
        let response = Response::error(status, location);
        if let Some(conn) = self.connections.get_mut(&fd) {
            conn.assembler.reset();
            conn.queue_response(&response);
        }
        self.update_interest(fd);
    }

    fn update_interest(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.get(&fd) {
            let _ = self.poller.modify(fd, conn.interest());
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.connections.remove(&fd) {
            if let Some(mut process) = conn.cgi.take() {
                for pipe_fd in process.open_fds() {
                    let _ = self.poller.delete(pipe_fd);
                    self.cgi_fds.remove(&pipe_fd);
                }
                process.abort();
            }
            let _ = self.poller.delete(fd);
            debug!("closed fd {}", fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::BodyPolicy;
    use std::collections::HashMap as Map;

    fn location() -> Location {
        Location {
            path: "/".into(),
            root: "www".into(),
            index: vec!["index.html".into()],
            allowed_methods: vec!["GET".into()],
            autoindex: false,
            upload_path: None,
            max_body_size: 100,
            cgi: Map::new(),
            error_pages: Map::new(),
            redirect: None,
        }
    }

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            query: String::new(),
            version: "HTTP/1.1".into(),
            headers: Map::new(),
            body: Vec::new(),
            body_policy: BodyPolicy::None,
        }
    }

    fn routed_status(routed: Routed) -> u16 {
        match routed {
            Routed::Response(response) => response.status,
            Routed::Cgi(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn redirect_beats_method_check() {
        let mut loc = location();
        loc.redirect = Some((301, "/moved".into()));
        let routed = route(&request("DELETE", "/old"), &loc);
        match routed {
            Routed::Response(response) => {
                assert_eq!(response.status, 301);
                assert_eq!(response.header("Location"), Some("/moved"));
            }
            Routed::Cgi(_) => panic!("expected a redirect"),
        }
    }

    #[test]
    fn oversized_body_beats_method_check() {
        let loc = location();
        let mut req = request("DELETE", "/x");
        req.body = vec![0; 101];
        assert_eq!(routed_status(route(&req, &loc)), 413);
    }

    #[test]
    fn disallowed_method_is_405_without_touching_the_filesystem() {
        let loc = location();
        // The path does not exist; the method check still wins over 404.
        assert_eq!(
            routed_status(route(&request("DELETE", "/no/such/file"), &loc)),
            405
        );
    }

    #[test]
    fn cgi_extension_takes_priority_over_static() {
        let mut loc = location();
        loc.cgi.insert(".py".into(), "/usr/bin/python3".into());
        match route(&request("GET", "/scripts/app.py/extra"), &loc) {
            Routed::Cgi(target) => {
                assert_eq!(target.script_name, "/scripts/app.py");
                assert_eq!(target.path_info, "/extra");
                assert_eq!(target.interpreter.as_deref(), Some("/usr/bin/python3"));
                assert_eq!(target.script_path, Path::new("www/scripts/app.py"));
            }
            Routed::Response(_) => panic!("expected a cgi target"),
        }
    }

    #[test]
    fn empty_interpreter_means_direct_exec() {
        let mut loc = location();
        loc.cgi.insert(".cgi".into(), String::new());
        match route(&request("GET", "/run.cgi"), &loc) {
            Routed::Cgi(target) => assert!(target.interpreter.is_none()),
            Routed::Response(_) => panic!("expected a cgi target"),
        }
    }

    #[test]
    fn overlapping_extensions_pick_longest_match() {
        let mut loc = location();
        loc.cgi.insert(".py".into(), "/usr/bin/python3".into());
        loc.cgi.insert(".y".into(), "/usr/bin/yacc-run".into());
        match route(&request("GET", "/a.py"), &loc) {
            Routed::Cgi(target) => {
                assert_eq!(target.script_name, "/a.py");
                assert_eq!(target.interpreter.as_deref(), Some("/usr/bin/python3"));
            }
            Routed::Response(_) => panic!("expected a cgi target"),
        }
        // The shorter extension still matches on its own.
        match route(&request("GET", "/b.y"), &loc) {
            Routed::Cgi(target) => {
                assert_eq!(target.interpreter.as_deref(), Some("/usr/bin/yacc-run"));
            }
            Routed::Response(_) => panic!("expected a cgi target"),
        }
    }

    fn connected_pair() -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        (Connection::new(stream, 0), peer)
    }

    #[test]
    fn stalled_writer_is_evicted_once_idle() {
        let (mut conn, _peer) = connected_pair();
        conn.queue_response(&Response::error(408, None));
        assert!(conn.has_pending_output());
        // Unflushed output does not exempt an idle connection from eviction.
        assert_eq!(idle_verdict(&conn, Duration::from_secs(0)), IdleVerdict::Stalled);
        assert_eq!(idle_verdict(&conn, Duration::from_secs(1000)), IdleVerdict::Active);
    }

    #[test]
    fn idle_verdicts_for_partial_and_quiet_connections() {
        let (mut conn, _peer) = connected_pair();
        assert_eq!(idle_verdict(&conn, Duration::from_secs(0)), IdleVerdict::Quiet);
        conn.assembler.feed(b"GET /half");
        assert_eq!(idle_verdict(&conn, Duration::from_secs(0)), IdleVerdict::Partial);
    }

    #[test]
    fn unmatched_extension_falls_through_to_static() {
        let mut loc = location();
        loc.cgi.insert(".py".into(), "/usr/bin/python3".into());
        // Static lookup on a missing file is a 404, not a CGI attempt.
        assert_eq!(
            routed_status(route(&request("GET", "/notes.txt"), &loc)),
            404
        );
    }
}
