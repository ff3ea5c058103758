// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pinned TLS through the session: the pin comes from a protected asset.

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use common::{Harness, wait_until};
use tak_core::{RuntimeCrashReason, SessionState, StatusCode};
use tak_security::tls::pem_decode;

const CA_PEM: &str = include_str!("../../tak-security/tests/fixtures/ca.pem");
const SERVER_PEM: &str = include_str!("../../tak-security/tests/fixtures/server.pem");
const SERVER_KEY: &[u8] = include_bytes!("../../tak-security/tests/fixtures/server.key.der");
const OTHER_PEM: &str = include_str!("../../tak-security/tests/fixtures/other.pem");

const TIMEOUT_MS: u64 = 5_000;

type ServerStream = StreamOwned<ServerConnection, TcpStream>;

/// Accept one connection and hand the TLS stream to `serve`.
fn spawn_server(serve: fn(ServerStream)) -> (u16, JoinHandle<()>) {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            pem_decode(SERVER_PEM).unwrap(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(SERVER_KEY.to_vec())),
        )
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let Ok((sock, _)) = listener.accept() else {
            return;
        };
        let _ = sock.set_read_timeout(Some(Duration::from_millis(TIMEOUT_MS)));
        let Ok(conn) = ServerConnection::new(Arc::new(config)) else {
            return;
        };
        serve(StreamOwned::new(conn, sock));
    });
    (port, handle)
}

/// Serve one `pong:<request>` exchange and close.
fn spawn_echo() -> (u16, JoinHandle<()>) {
    spawn_server(|mut tls| {
        let mut request = [0u8; 64];
        let Ok(n) = tls.read(&mut request) else {
            return;
        };
        let mut reply = b"pong:".to_vec();
        reply.extend_from_slice(&request[..n]);
        let _ = tls.write_all(&reply);
        tls.conn.send_close_notify();
        let _ = tls.flush();
    })
}

/// Complete the handshake, then swallow input until the client leaves.
fn spawn_silent() -> (u16, JoinHandle<()>) {
    spawn_server(|mut tls| {
        let mut sink = [0u8; 64];
        while matches!(tls.read(&mut sink), Ok(n) if n > 0) {}
    })
}

fn ship_pin(h: &Harness, fqdn: &str, pem: &str) {
    let sealed = h.session.file_protector_encrypt(pem.as_bytes()).unwrap();
    h.host.add_asset(&format!("{fqdn}.tak"), sealed);
}

#[test]
fn pinned_connection_uses_the_protected_asset() {
    let h = Harness::initialized();
    ship_pin(&h, "localhost", SERVER_PEM);
    let (port, server) = spawn_echo();

    let connected = h
        .session
        .tls_connect_pinned("localhost", port, TIMEOUT_MS)
        .unwrap();
    let d = connected.descriptor;
    assert!(!h.session.tls_protocol_version(d).unwrap().is_empty());
    assert!(
        h.session
            .tls_supported_cipher_suites()
            .contains(&h.session.tls_cipher_suite(d).unwrap())
    );

    h.session.tls_write(d, b"ping").unwrap();
    assert_eq!(h.session.tls_read(d, 0).unwrap(), b"pong:ping");
    assert!(h.session.tls_is_closed(d));
    h.session.tls_close(d).unwrap();
    server.join().unwrap();
}

#[test]
fn wrong_pin_is_rejected() {
    let h = Harness::initialized();
    ship_pin(&h, "localhost", OTHER_PEM);
    let (port, server) = spawn_echo();

    let err = h
        .session
        .tls_connect_pinned("localhost", port, TIMEOUT_MS)
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::SecurityCertificateError);
    server.join().unwrap();
}

#[test]
fn missing_pin_asset_is_a_parameter_error() {
    let h = Harness::initialized();
    let err = h
        .session
        .tls_connect_pinned("unknown.example", 443, TIMEOUT_MS)
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::InvalidParameter);
}

#[test]
fn caller_supplied_trust_anchor() {
    let h = Harness::initialized();
    let (port, server) = spawn_echo();
    let d = h
        .session
        .tls_connect("localhost", port, CA_PEM, TIMEOUT_MS)
        .unwrap()
        .descriptor;
    h.session.tls_write(d, b"hi").unwrap();
    assert_eq!(h.session.tls_read(d, 0).unwrap(), b"pong:hi");

    h.session.release().unwrap();
    assert!(h.session.tls_is_closed(d));
    server.join().unwrap();
}

#[test]
fn tls_needs_a_live_session() {
    let h = Harness::new();
    let err = h
        .session
        .tls_connect("localhost", 443, CA_PEM, TIMEOUT_MS)
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::NotInitialized);
}

#[test]
fn release_does_not_wait_for_a_blocked_reader() {
    let h = Harness::initialized();
    let (port, server) = spawn_silent();
    let d = h
        .session
        .tls_connect("localhost", port, CA_PEM, 0)
        .unwrap()
        .descriptor;

    thread::scope(|s| {
        let reader = s.spawn(|| h.session.tls_read(d, 0));
        thread::sleep(Duration::from_millis(300));
        assert!(!reader.is_finished());

        let started = Instant::now();
        h.session.release().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(1), "release took {elapsed:?}");

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.status(), StatusCode::NetworkError);
    });
    assert!(h.session.tls_is_closed(d));
    server.join().unwrap();
}

#[test]
fn violation_cuts_off_open_channels() {
    let h = Harness::registered();
    let (port, server) = spawn_silent();
    let d = h
        .session
        .tls_connect("localhost", port, CA_PEM, TIMEOUT_MS)
        .unwrap()
        .descriptor;
    h.session.tls_write(d, b"before").unwrap();

    h.host.set_violation(Some(RuntimeCrashReason::HookingDetected));
    h.session.monitor_start(45).unwrap();
    assert!(wait_until(|| h.session.state().unwrap() == SessionState::Locked));

    let write = h.session.tls_write(d, b"after").unwrap_err();
    assert_eq!(write.status(), StatusCode::InstanceLocked);
    let read = h.session.tls_read(d, 0).unwrap_err();
    assert_eq!(read.status(), StatusCode::InstanceLocked);

    h.session.tls_close(d).unwrap();
    assert!(h.session.tls_is_closed(d));
    server.join().unwrap();
}
