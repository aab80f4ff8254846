//! End-to-end authorization server tests over real loopback sockets,
//! driven by the reactor exactly as the supervisor drives it.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::rc::Rc;

use onedrive_fuse::auth::{AuthCode, AuthServer};
use onedrive_fuse::config::Config;
use onedrive_fuse::reactor::{Interest, Reactor};
use pretty_assertions::assert_eq;

struct Harness {
    reactor: Reactor,
    code: AuthCode,
    port: u16,
    // kept alive so the listener stays open
    _server: Rc<RefCell<AuthServer>>,
}

fn start_server() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = Config::new(PathBuf::from("/tmp/onedrive"));
    config.app_id = "abc-123".to_string();
    config.redirect_uri = "http://localhost:2300/authorization-code".to_string();
    // ephemeral port, so tests never collide
    config.auth_port = 0;

    let code = AuthCode::new();
    let server = AuthServer::bind(Rc::new(config), code.clone()).expect("failed to bind");
    let port = server.port();
    let fd = server.fd();
    let server = Rc::new(RefCell::new(server));

    let mut reactor = Reactor::new();
    reactor
        .register(fd, Interest::Readable, server.clone())
        .expect("failed to register listener");

    Harness {
        reactor,
        code,
        port,
        _server: server,
    }
}

impl Harness {
    /// Issue one GET and drive the reactor until the connection completes.
    fn get(&mut self, target: &str) -> String {
        let mut stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect");
        stream
            .write_all(format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .expect("failed to send request");
        stream
            .shutdown(Shutdown::Write)
            .expect("failed to shut down write half");

        // one source (the listener) remains once the connection has finished
        for _ in 0..100 {
            self.reactor
                .run_one_iteration()
                .expect("reactor iteration failed");
            if self.reactor.len() == 1 {
                break;
            }
        }
        assert_eq!(self.reactor.len(), 1, "connection never completed");

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .expect("failed to read response");
        response
    }
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        line.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix(": "))
    })
}

#[test]
fn root_redirects_to_the_identity_provider() {
    let mut harness = start_server();

    let response = harness.get("/");
    assert!(response.starts_with("HTTP/1.1 303 See Other\r\n"));

    let location = header(&response, "Location").expect("no Location header");
    assert!(location
        .starts_with("https://login.microsoftonline.com/common/oauth2/v2.0/authorize?"));
    assert!(location.contains("client_id=abc-123"));
    assert!(location.contains("scope=offline_access%20files.readwrite"));
    assert!(location.contains("response_type=code"));
    assert!(location
        .contains("redirect_uri=http%3a%2f%2flocalhost%3a2300%2fauthorization-code"));
}

#[test]
fn captured_code_is_stored_and_retrievable() {
    let mut harness = start_server();

    let response = harness.get("/authorization-code?code=XYZ");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Authorization is completed"));
    assert_eq!(harness.code.get().as_deref(), Some("XYZ"));
}

#[test]
fn missing_code_is_rejected_and_previous_code_survives() {
    let mut harness = start_server();

    harness.get("/authorization-code?code=FIRST");
    let response = harness.get("/authorization-code");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(harness.code.get().as_deref(), Some("FIRST"));
}

#[test]
fn oversized_code_is_rejected_and_not_stored() {
    let mut harness = start_server();

    let oversized = "x".repeat(65);
    let response = harness.get(&format!("/authorization-code?code={oversized}"));
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.contains("too long"));
    assert_eq!(harness.code.get(), None);
}

#[test]
fn unknown_path_is_a_404_with_empty_body() {
    let mut harness = start_server();

    let response = harness.get("/nonexistent");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(header(&response, "Content-Length"), Some("0"));
    assert!(response.ends_with("\r\n\r\n"));
}

#[test]
fn server_keeps_serving_across_requests() {
    let mut harness = start_server();

    harness.get("/nonexistent");
    harness.get("/authorization-code?code=ONE");
    harness.get("/");
    harness.get("/authorization-code?code=TWO");

    assert_eq!(harness.code.get().as_deref(), Some("TWO"));
}

#[test]
fn stopping_the_server_releases_every_registration() {
    let mut harness = start_server();
    harness.get("/authorization-code?code=XYZ");

    harness
        ._server
        .borrow_mut()
        .stop(&mut harness.reactor);
    assert!(harness.reactor.is_empty());
}
