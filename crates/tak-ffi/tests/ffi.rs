// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The C surface, driven from Rust.

use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use tak_bridge::RevalidationStatus;
use tak_bridge::testing::{FakeHost, ScriptedBackend};
use tak_core::{EncryptionAlgorithm, KeyAlgorithm, Padding, StatusCode, alias};
use tak_ffi::buffer::*;
use tak_ffi::keys::*;
use tak_ffi::monitor::*;
use tak_ffi::storage::*;
use tak_ffi::tls::*;
use tak_ffi::*;
use tak_session::Session;

const OK: i32 = 0;

struct Fixture {
    handle: *mut TakSession,
    host: Arc<FakeHost>,
    backend: Arc<ScriptedBackend>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let license = format!(
            r#"{{"customer_id":"acme","expires_at":"{}","file_protector_key":"{}"}}"#,
            (Utc::now() + chrono::Duration::days(365)).to_rfc3339(),
            "11".repeat(32)
        );
        std::fs::write(dir.path().join("license.json"), license).unwrap();

        let host = Arc::new(FakeHost::new());
        let backend = Arc::new(ScriptedBackend::new());
        let session = Session::builder()
            .host(host.clone())
            .backend(backend.clone())
            .build()
            .unwrap();
        Self {
            handle: TakSession::into_raw(session),
            host,
            backend,
            dir,
        }
    }

    fn initialize(&self) -> i32 {
        let path = CString::new(self.dir.path().to_str().unwrap()).unwrap();
        unsafe { tak_initialize(self.handle, path.as_ptr(), c"license.json".as_ptr()) }
    }

    fn registered() -> Self {
        let f = Self::new();
        assert_eq!(f.initialize(), OK);
        assert_eq!(unsafe { tak_register(f.handle, ptr::null()) }, OK);
        f
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        unsafe { tak_session_free(self.handle) };
    }
}

fn take_bytes(r: TakByteBufferResponse) -> Vec<u8> {
    assert_eq!(r.return_code, OK);
    let bytes = unsafe { r.buffer.as_slice() }.unwrap().to_vec();
    unsafe { tak_buffer_free(r.buffer) };
    bytes
}

fn take_string(r: TakStringResponse) -> String {
    assert_eq!(r.return_code, OK);
    let s = unsafe { CStr::from_ptr(r.value) }.to_str().unwrap().to_string();
    unsafe { tak_string_free(r.value) };
    s
}

#[test]
fn lifecycle_and_storage() {
    let f = Fixture::new();
    assert!(!unsafe { tak_is_initialized(f.handle) });
    assert_eq!(f.initialize(), OK);
    assert_eq!(f.initialize(), StatusCode::AlreadyInitialized.code());

    let reg = unsafe { tak_is_registered(f.handle) };
    assert!(!reg.is_registered);

    assert_eq!(unsafe { tak_register(f.handle, c"beef".as_ptr()) }, OK);
    assert_eq!(
        unsafe { tak_register(f.handle, ptr::null()) },
        StatusCode::AlreadyRegistered.code()
    );
    let id = take_string(unsafe { tak_get_identifier(f.handle) });
    assert_eq!(id.len(), 36);

    let store = c"vault";
    let key = c"token";
    assert_eq!(unsafe { tak_storage_create(f.handle, store.as_ptr()) }, OK);
    assert_eq!(
        unsafe { tak_storage_write(f.handle, store.as_ptr(), key.as_ptr(), b"abc".as_ptr(), 3) },
        OK
    );
    let value = take_bytes(unsafe { tak_storage_read(f.handle, store.as_ptr(), key.as_ptr()) });
    assert_eq!(value, b"abc");
    assert_eq!(
        unsafe { tak_storage_delete_entry(f.handle, store.as_ptr(), c"absent".as_ptr()) },
        OK
    );
    assert_eq!(unsafe { tak_storage_delete(f.handle, store.as_ptr()) }, OK);

    let missing = unsafe { tak_storage_read(f.handle, store.as_ptr(), key.as_ptr()) };
    assert_eq!(missing.return_code, StatusCode::StorageNotFound.code());
    assert!(missing.buffer.data.is_null());

    assert_eq!(unsafe { tak_release(f.handle) }, OK);
    assert!(!unsafe { tak_is_initialized(f.handle) });
}

#[test]
fn null_arguments_are_rejected() {
    let f = Fixture::new();
    assert_eq!(
        unsafe { tak_initialize(ptr::null_mut(), c"/tmp".as_ptr(), c"l".as_ptr()) },
        StatusCode::InvalidParameter.code()
    );
    assert_eq!(
        unsafe { tak_initialize(f.handle, ptr::null(), c"l".as_ptr()) },
        StatusCode::InvalidParameter.code()
    );
    let reg = unsafe { tak_is_registered(ptr::null_mut()) };
    assert!(!reg.is_registered);
    assert_eq!(reg.return_code, StatusCode::InvalidParameter.code());

    assert_eq!(f.initialize(), OK);
    let r = unsafe { tak_file_protector_encrypt(f.handle, ptr::null(), 8) };
    assert_eq!(r.return_code, StatusCode::InvalidParameter.code());
    assert!(unsafe { tak_tls_is_closed(ptr::null_mut(), 1) });
}

#[test]
fn file_protector_over_the_boundary() {
    let f = Fixture::new();
    assert_eq!(f.initialize(), OK);

    let sealed = take_bytes(unsafe { tak_file_protector_encrypt(f.handle, b"asset".as_ptr(), 5) });
    let clear =
        take_bytes(unsafe { tak_file_protector_decrypt(f.handle, sealed.as_ptr(), sealed.len()) });
    assert_eq!(clear, b"asset");

    f.host.add_asset("bundle.bin", sealed);
    let clear = take_bytes(unsafe {
        tak_file_protector_decrypt_from_file(f.handle, c"bundle".as_ptr(), c"bin".as_ptr())
    });
    assert_eq!(clear, b"asset");
}

#[test]
fn keys_over_the_boundary() {
    let f = Fixture::registered();

    let sig = take_bytes(unsafe { tak_sign_with_default_key(f.handle, b"msg".as_ptr(), 3) });
    assert!(!sig.is_empty());

    let cert = take_string(unsafe { tak_get_client_certificate(f.handle) });
    assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));

    assert_eq!(
        unsafe { tak_generate_key(f.handle, c"app".as_ptr(), KeyAlgorithm::Aes256 as i32) },
        OK
    );
    let info = unsafe { tak_get_key_info(f.handle, c"app".as_ptr()) };
    assert_eq!(info.return_code, OK);
    assert_eq!(info.algorithm, KeyAlgorithm::Aes256 as i32);
    assert_eq!(
        unsafe { tak_generate_key(f.handle, c"app2".as_ptr(), 99) },
        StatusCode::InvalidParameter.code()
    );

    let enc = unsafe {
        tak_encrypt(
            f.handle,
            c"app".as_ptr(),
            EncryptionAlgorithm::AesGcm as i32,
            Padding::None as i32,
            b"secret".as_ptr(),
            6,
            ptr::null(),
            0,
        )
    };
    assert_eq!(enc.return_code, OK);
    let clear = take_bytes(unsafe {
        tak_decrypt(
            f.handle,
            c"app".as_ptr(),
            EncryptionAlgorithm::AesGcm as i32,
            Padding::None as i32,
            &enc.output,
        )
    });
    assert_eq!(clear, b"secret");
    unsafe { tak_encryption_output_free(enc.output) };

    let random = take_bytes(unsafe { tak_generate_random(f.handle, 24) });
    assert_eq!(random.len(), 24);

    let reserved = CString::new(alias::INDIVIDUAL_CLIENT_PRIVATE).unwrap();
    assert_eq!(
        unsafe { tak_generate_key(f.handle, reserved.as_ptr(), KeyAlgorithm::Aes256 as i32) },
        StatusCode::InvalidParameter.code()
    );
}

#[test]
fn lock_reported_as_warning() {
    let f = Fixture::registered();
    f.backend.push_status(RevalidationStatus::Locked);
    assert_eq!(
        unsafe { tak_check_integrity(f.handle, ptr::null()) },
        StatusCode::InstanceLocked.code()
    );
    let reg = unsafe { tak_is_registered(f.handle) };
    assert!(reg.is_registered);
    assert_eq!(reg.return_code, StatusCode::InstanceLocked.code());
    assert_eq!(unsafe { tak_reset(f.handle) }, StatusCode::InstanceLocked.code());

    let root = unsafe { tak_get_root_status(f.handle) };
    assert_eq!(root.return_code, OK);
    assert!(!root.value);
    let level = unsafe { tak_get_advanced_root_status(f.handle) };
    assert_eq!(level.value, 0);
}

#[test]
fn monitor_over_the_boundary() {
    extern "C" fn on_crash(_reason: i32) {}

    let f = Fixture::new();
    assert_eq!(f.initialize(), OK);
    assert_eq!(unsafe { tak_set_pre_crash_callback(f.handle, Some(on_crash)) }, OK);
    assert_eq!(
        unsafe { tak_monitor_start(f.handle, 30) },
        StatusCode::InvalidParameter.code()
    );
    assert_eq!(unsafe { tak_monitor_start(f.handle, 45) }, OK);
    assert!(unsafe { tak_monitor_is_active(f.handle, false) }.value);
    assert_eq!(unsafe { tak_monitor_stop(f.handle) }, OK);
    assert!(!unsafe { tak_monitor_is_active(f.handle, true) }.value);
    assert_eq!(unsafe { tak_set_pre_crash_callback(f.handle, None) }, OK);
}

#[test]
fn tls_queries_without_connections() {
    let f = Fixture::new();
    assert_eq!(f.initialize(), OK);
    assert!(unsafe { tak_tls_is_closed(f.handle, 7) });
    assert_eq!(unsafe { tak_tls_close(f.handle, 7) }, OK);
    let suites = take_string(unsafe { tak_tls_get_supported_cipher_suites(f.handle) });
    assert!(suites.contains("TLS13"));

    let host = c"nowhere.example";
    let missing = unsafe { tak_tls_connect_pinned(f.handle, host.as_ptr(), 443, 1000) };
    assert_eq!(missing.return_code, StatusCode::InvalidParameter.code());
    assert_eq!(missing.descriptor, -1);
    assert!(missing.peer_certificate.is_null());
}

#[test]
fn version_strings() {
    let v = unsafe { CStr::from_ptr(tak_get_version()) }.to_str().unwrap();
    assert_eq!(v, env!("CARGO_PKG_VERSION"));
    let build = take_string(tak_get_build_version());
    assert!(build.starts_with(v));
    assert_eq!(tak_logging_init(), OK);
    assert_eq!(tak_logging_init(), OK);
}
