//! Loopback authorization server.
//!
//! Serves exactly two routes: `GET /` redirects the browser to the identity
//! provider's sign-in page, and `GET /authorization-code` captures the code
//! the provider redirects back with. Everything runs on the control thread;
//! the listener and each in-flight connection are individual reactor
//! sources, so no request handling ever blocks the kernel channel.

pub mod url;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::reactor::{EventSource, Interest, Reactor};

const AUTHORIZE_ENDPOINT: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const SCOPE: &str = "offline_access%20files.readwrite";
const RESPONSE_TYPE: &str = "code";

/// Longest authorization code accepted; anything longer is rejected, never
/// truncated.
pub const MAX_CODE_LEN: usize = 63;

/// Requests longer than this cannot be one of our two routes.
const MAX_REQUEST_SIZE: usize = 8 * 1024;

const COMPLETE_BODY: &str = "<p>Authorization is completed. You can close the browser now.</p>";
const MISSING_CODE_BODY: &str =
    "<p>No authorization code in the URL that was redirected by OneDrive.</p>";
const CODE_TOO_LONG_BODY: &str = "<p>The authorization code is too long.</p>";
const REDIRECT_FAILED_BODY: &str = "<p>Failed to build the sign-in redirect.</p>";

/// Shared handle to the captured authorization code.
///
/// Written by the server, read by the (external) token exchange; safe
/// without locking because both run on the single control thread.
#[derive(Debug, Clone, Default)]
pub struct AuthCode {
    code: Rc<RefCell<Option<String>>>,
}

impl AuthCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.code.borrow().clone()
    }

    fn store(&self, code: String) {
        *self.code.borrow_mut() = Some(code);
    }
}

/// HTTP responder bound to the loopback interface.
pub struct AuthServer {
    listener: TcpListener,
    port: u16,
    config: Rc<Config>,
    code: AuthCode,
    connections: Rc<RefCell<BTreeSet<RawFd>>>,
}

impl AuthServer {
    /// Bind the configured loopback port. Failure here is fatal to startup;
    /// the supervisor must not proceed to mount.
    pub fn bind(config: Rc<Config>, code: AuthCode) -> Result<Self> {
        let port = config.auth_port;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|source| Error::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| Error::Bind { port, source })?
            .port();

        info!("authorization server listening on 127.0.0.1:{port}");

        Ok(Self {
            listener,
            port,
            config,
            code,
            connections: Rc::new(RefCell::new(BTreeSet::new())),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// The bound port; differs from the configured one only when that was 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Unregister the listener and abandon any in-flight connections.
    pub fn stop(&mut self, reactor: &mut Reactor) {
        let _ = reactor.unregister(self.listener.as_raw_fd());
        for fd in std::mem::take(&mut *self.connections.borrow_mut()) {
            let _ = reactor.unregister(fd);
        }
        info!("authorization server stopped");
    }
}

impl EventSource for AuthServer {
    fn on_readable(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        debug!("failed to prepare connection from {peer}: {err}");
                        continue;
                    }
                    debug!("accepted authorization connection from {peer}");

                    let fd = stream.as_raw_fd();
                    let connection = Rc::new(RefCell::new(Connection::new(
                        stream,
                        Rc::clone(&self.config),
                        self.code.clone(),
                        Rc::clone(&self.connections),
                    )));
                    reactor.register(fd, Interest::Readable, connection)?;
                    self.connections.borrow_mut().insert(fd);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // a failed accept spoils one connection, not the server
                    error!("failed to accept authorization connection: {err}");
                    return Ok(());
                }
            }
        }
    }
}

/// One in-flight HTTP exchange.
struct Connection {
    stream: TcpStream,
    config: Rc<Config>,
    code: AuthCode,
    connections: Rc<RefCell<BTreeSet<RawFd>>>,
    request: Vec<u8>,
    response: Vec<u8>,
    written: usize,
    responding: bool,
}

impl Connection {
    fn new(
        stream: TcpStream,
        config: Rc<Config>,
        code: AuthCode,
        connections: Rc<RefCell<BTreeSet<RawFd>>>,
    ) -> Self {
        Self {
            stream,
            config,
            code,
            connections,
            request: Vec::new(),
            response: Vec::new(),
            written: 0,
            responding: false,
        }
    }

    fn finish(&mut self, reactor: &mut Reactor) {
        let fd = self.stream.as_raw_fd();
        let _ = reactor.unregister(fd);
        self.connections.borrow_mut().remove(&fd);
    }

    fn flush(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            if self.written >= self.response.len() {
                self.finish(reactor);
                return Ok(());
            }
            match self.stream.write(&self.response[self.written..]) {
                Ok(0) => {
                    self.finish(reactor);
                    return Ok(());
                }
                Ok(written) => self.written += written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = self.stream.as_raw_fd();
                    reactor.set_interest(fd, Interest::Writable)?;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("authorization connection aborted: {err}");
                    self.finish(reactor);
                    return Ok(());
                }
            }
        }
    }
}

impl EventSource for Connection {
    fn on_readable(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.responding {
            return Ok(());
        }

        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    if !headers_complete(&self.request) {
                        // client went away mid-request
                        self.finish(reactor);
                        return Ok(());
                    }
                    break;
                }
                Ok(len) => {
                    self.request.extend_from_slice(&buf[..len]);
                    if headers_complete(&self.request) || self.request.len() > MAX_REQUEST_SIZE {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("authorization connection aborted: {err}");
                    self.finish(reactor);
                    return Ok(());
                }
            }
        }

        self.responding = true;
        self.response = handle_request(&self.request, &self.config, &self.code);
        self.flush(reactor)
    }

    fn on_writable(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.responding {
            self.flush(reactor)
        } else {
            Ok(())
        }
    }
}

/// Route one request to a complete response buffer. Per-request failures
/// always degrade to a 4xx/500 response here; they never unwind further.
fn handle_request(request: &[u8], config: &Config, code: &AuthCode) -> Vec<u8> {
    let target = match request_target(request) {
        Some(target) => target,
        None => return response(400, "Bad Request", &[], ""),
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    match path {
        "/" => login_redirect(config),
        "/authorization-code" => capture_code(query, code),
        _ => response(404, "Not Found", &[], ""),
    }
}

fn login_redirect(config: &Config) -> Vec<u8> {
    let location = format!(
        "{AUTHORIZE_ENDPOINT}?client_id={}&scope={SCOPE}&response_type={RESPONSE_TYPE}&redirect_uri={}",
        config.app_id,
        url::percent_encode(&config.redirect_uri)
    );

    // a header value must not carry control characters; a configuration that
    // would degrades this one request to a 500
    if location.bytes().any(|byte| byte < 0x20 || byte == 0x7f) {
        error!("cannot build sign-in redirect from the configured identity");
        return response(500, "Internal Server Error", &[], REDIRECT_FAILED_BODY);
    }

    info!("redirecting browser to the OneDrive sign-in page");
    response(303, "See Other", &[("Location", &location)], "")
}

fn capture_code(query: Option<&str>, code: &AuthCode) -> Vec<u8> {
    match query.and_then(|query| query_param(query, "code")) {
        None => response(400, "Bad Request", &[], MISSING_CODE_BODY),
        Some(value) if value.len() > MAX_CODE_LEN => {
            warn!("rejected oversized authorization code ({} bytes)", value.len());
            response(400, "Bad Request", &[], CODE_TOO_LONG_BODY)
        }
        Some(value) => {
            info!("authorization code captured");
            code.store(value);
            response(200, "OK", &[], COMPLETE_BODY)
        }
    }
}

fn request_target(request: &[u8]) -> Option<&str> {
    let line_end = request.windows(2).position(|window| window == b"\r\n")?;
    let line = std::str::from_utf8(&request[..line_end]).ok()?;

    let mut parts = line.split(' ');
    let _method = parts.next()?;
    let target = parts.next()?;
    parts.next()?;

    Some(target)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then(|| url::percent_decode(value))
    })
}

fn headers_complete(request: &[u8]) -> bool {
    request.windows(4).any(|window| window == b"\r\n\r\n")
}

fn response(status: u16, reason: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !body.is_empty() {
        head.push_str("Content-Type: text/html; charset=utf-8\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}
