// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pinned channels against an in-process rustls server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};

use tak_bridge::KeyVault;
use tak_core::{KeyAlgorithm, StatusCode};
use tak_security::tls::pem_decode;
use tak_security::{ClientIdentity, PinnedChannels, SoftwareKeystore};

const CA_PEM: &str = include_str!("fixtures/ca.pem");
const SERVER_PEM: &str = include_str!("fixtures/server.pem");
const SERVER_KEY: &[u8] = include_bytes!("fixtures/server.key.der");
const CLIENT_PEM: &str = include_str!("fixtures/client.pem");
const CLIENT_KEY: &[u8] = include_bytes!("fixtures/client.key.der");
const OTHER_PEM: &str = include_str!("fixtures/other.pem");

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Mode {
    /// Answer `pong:<request>` and close.
    Echo,
    /// Complete the handshake, then say nothing until the client leaves.
    Silent,
}

fn server_config(require_client_cert: bool) -> Arc<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let chain = pem_decode(SERVER_PEM).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(SERVER_KEY.to_vec()));

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap();
    let builder = if require_client_cert {
        let mut roots = RootCertStore::empty();
        roots.add(pem_decode(CA_PEM).unwrap().remove(0)).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .unwrap();
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };
    Arc::new(builder.with_single_cert(chain, key).unwrap())
}

/// Serve one connection. Yields the client certificate (DER), if any.
fn spawn_server(config: Arc<ServerConfig>, mode: Mode) -> (u16, JoinHandle<Option<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (sock, _) = listener.accept().ok()?;
        sock.set_read_timeout(Some(TIMEOUT)).ok()?;
        let mut tls = StreamOwned::new(ServerConnection::new(config).ok()?, sock);

        let mut request = [0u8; 64];
        let n = tls.read(&mut request).ok()?;
        let client_cert = tls
            .conn
            .peer_certificates()
            .and_then(|c| c.first())
            .map(|c| c.as_ref().to_vec());

        if let Mode::Echo = mode {
            let mut reply = b"pong:".to_vec();
            reply.extend_from_slice(&request[..n]);
            tls.write_all(&reply).ok()?;
            tls.conn.send_close_notify();
            tls.flush().ok()?;
        }
        client_cert
    });
    (port, handle)
}

#[test]
fn exact_leaf_pin_round_trip() {
    let (port, server) = spawn_server(server_config(false), Mode::Echo);
    let channels = PinnedChannels::new();

    let connected = channels
        .connect("localhost", port, TIMEOUT, SERVER_PEM, None)
        .unwrap();
    assert!(connected.descriptor >= 1);
    assert_eq!(
        pem_decode(&connected.peer_certificate_pem).unwrap(),
        pem_decode(SERVER_PEM).unwrap()
    );
    assert_eq!(
        channels.protocol_version(connected.descriptor).unwrap(),
        "TLSv1_3"
    );
    assert!(channels.cipher_suite(connected.descriptor).is_ok());

    channels.write(connected.descriptor, b"ping").unwrap();
    let reply = channels.read(connected.descriptor, 0).unwrap();
    assert_eq!(reply, b"pong:ping");
    assert!(channels.is_closed(connected.descriptor));

    channels.close(connected.descriptor).unwrap();
    channels.close(connected.descriptor).unwrap();
    assert!(channels.is_closed(connected.descriptor));
    assert_eq!(channels.open_count(), 0);
    server.join().unwrap();
}

#[test]
fn chain_to_pinned_ca_is_accepted() {
    let (port, server) = spawn_server(server_config(false), Mode::Echo);
    let channels = PinnedChannels::new();
    let d = channels
        .connect("localhost", port, TIMEOUT, CA_PEM, None)
        .unwrap()
        .descriptor;
    channels.write(d, b"hi").unwrap();
    assert_eq!(channels.read(d, 0).unwrap(), b"pong:hi");
    channels.close(d).unwrap();
    server.join().unwrap();
}

#[test]
fn unpinned_server_is_rejected() {
    let (port, server) = spawn_server(server_config(false), Mode::Echo);
    let channels = PinnedChannels::new();
    let err = channels
        .connect("localhost", port, TIMEOUT, OTHER_PEM, None)
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::SecurityCertificateError);
    assert_eq!(channels.open_count(), 0);
    assert!(server.join().unwrap().is_none());
}

#[test]
fn client_certificate_is_signed_through_the_vault() {
    let (port, server) = spawn_server(server_config(true), Mode::Echo);

    let keystore = Arc::new(SoftwareKeystore::in_memory().unwrap());
    keystore
        .import_key("device", KeyAlgorithm::EcSecp256r1, CLIENT_KEY)
        .unwrap();
    let identity = ClientIdentity {
        certificate_pem: CLIENT_PEM.to_string(),
        key_alias: "device".into(),
        crypto: keystore,
    };

    let channels = PinnedChannels::new();
    let d = channels
        .connect("localhost", port, TIMEOUT, CA_PEM, Some(identity))
        .unwrap()
        .descriptor;
    channels.write(d, b"auth").unwrap();
    assert_eq!(channels.read(d, 0).unwrap(), b"pong:auth");
    channels.close(d).unwrap();

    let presented = server.join().unwrap().expect("server saw a client certificate");
    assert_eq!(presented, pem_decode(CLIENT_PEM).unwrap()[0].as_ref());
}

#[test]
fn silent_peer_times_out() {
    let (port, server) = spawn_server(server_config(false), Mode::Silent);
    let channels = PinnedChannels::new();
    let d = channels
        .connect("localhost", port, Duration::from_millis(300), SERVER_PEM, None)
        .unwrap()
        .descriptor;

    let err = channels.read(d, 0).unwrap_err();
    assert_eq!(err.status(), StatusCode::NetworkTimeout);
    let err = channels.read(d, 16).unwrap_err();
    assert_eq!(err.status(), StatusCode::NetworkTimeout);
    assert!(!channels.is_closed(d));

    channels.close_all().unwrap();
    assert!(channels.is_closed(d));
    server.join().unwrap();
}

/// Connect with no timeout to a peer that never speaks, and park a reader
/// on the descriptor.
fn blocked_reader(
    channels: &Arc<PinnedChannels>,
) -> (i32, JoinHandle<tak_core::Result<Vec<u8>>>) {
    let (port, _server) = spawn_server(server_config(false), Mode::Silent);
    let d = channels
        .connect("localhost", port, Duration::ZERO, SERVER_PEM, None)
        .unwrap()
        .descriptor;
    let reader = {
        let channels = Arc::clone(channels);
        thread::spawn(move || channels.read(d, 0))
    };
    thread::sleep(Duration::from_millis(300));
    assert!(!reader.is_finished());
    (d, reader)
}

#[test]
fn close_does_not_wait_for_a_blocked_reader() {
    let channels = Arc::new(PinnedChannels::new());
    let (d, reader) = blocked_reader(&channels);

    let started = Instant::now();
    channels.close(d).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(1), "close took {elapsed:?}");

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.status(), StatusCode::NetworkError);
    assert!(channels.is_closed(d));
}

#[test]
fn close_all_does_not_wait_for_a_blocked_reader() {
    let channels = Arc::new(PinnedChannels::new());
    let (d, reader) = blocked_reader(&channels);

    let started = Instant::now();
    channels.close_all().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(reader.join().unwrap().is_err());
    assert!(channels.is_closed(d));
    assert_eq!(channels.open_count(), 0);
}

#[test]
fn descriptors_are_never_reused() {
    let channels = PinnedChannels::new();
    let mut seen = Vec::new();
    for _ in 0..2 {
        let (port, server) = spawn_server(server_config(false), Mode::Echo);
        let d = channels
            .connect("localhost", port, TIMEOUT, SERVER_PEM, None)
            .unwrap()
            .descriptor;
        channels.write(d, b"x").unwrap();
        channels.read(d, 0).unwrap();
        channels.close(d).unwrap();
        server.join().unwrap();
        seen.push(d);
    }
    assert!(seen[1] > seen[0]);
}

#[test]
fn bad_pin_material_is_a_certificate_error() {
    let channels = PinnedChannels::new();
    let err = channels
        .connect("localhost", 1, TIMEOUT, "garbage", None)
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::SecurityCertificateError);
}
