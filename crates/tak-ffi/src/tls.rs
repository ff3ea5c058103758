// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pinned TLS connections, addressed by descriptor.

use std::ffi::c_char;
use std::panic::{self, AssertUnwindSafe};

use tak_core::StatusCode;
use tak_security::Connected;

use crate::buffer::{
    TakByteBufferResponse, TakStringResponse, TakTlsConnectResponse, bytes_in, str_in,
    string_out,
};
use crate::{TakSession, call, session, success};

fn connected(c: Connected) -> tak_core::Result<TakTlsConnectResponse> {
    Ok(TakTlsConnectResponse {
        return_code: StatusCode::Success.code(),
        descriptor: c.descriptor,
        peer_certificate: string_out(c.peer_certificate_pem)?,
    })
}

/// Connect to `fqdn:port`, pinning the certificate shipped as the protected
/// asset `<fqdn>.tak`. `timeout_ms == 0` blocks indefinitely.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_connect_pinned(
    handle: *mut TakSession,
    fqdn: *const c_char,
    port: u16,
    timeout_ms: u64,
) -> TakTlsConnectResponse {
    call(|| unsafe {
        connected(session(handle)?.tls_connect_pinned(str_in(fqdn, "fqdn")?, port, timeout_ms)?)
    })
}

/// Connect trusting the PEM certificates in `trusted_pem`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_connect(
    handle: *mut TakSession,
    fqdn: *const c_char,
    port: u16,
    trusted_pem: *const c_char,
    timeout_ms: u64,
) -> TakTlsConnectResponse {
    call(|| unsafe {
        connected(session(handle)?.tls_connect(
            str_in(fqdn, "fqdn")?,
            port,
            str_in(trusted_pem, "trusted certificates")?,
            timeout_ms,
        )?)
    })
}

/// Up to `max` bytes; `max == 0` reads until the peer closes or the
/// timeout expires.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_read(
    handle: *mut TakSession,
    descriptor: i32,
    max: usize,
) -> TakByteBufferResponse {
    call(|| unsafe { Ok(TakByteBufferResponse::ok(session(handle)?.tls_read(descriptor, max)?)) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_write(
    handle: *mut TakSession,
    descriptor: i32,
    data: *const u8,
    data_len: usize,
) -> i32 {
    call(|| unsafe {
        session(handle)?.tls_write(descriptor, bytes_in(data, data_len)?)?;
        success()
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_close(handle: *mut TakSession, descriptor: i32) -> i32 {
    call(|| unsafe {
        session(handle)?.tls_close(descriptor)?;
        success()
    })
}

/// True for unknown, closed, and peer-closed descriptors, and for a null
/// handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_is_closed(handle: *mut TakSession, descriptor: i32) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the caller passes null or a live handle.
        unsafe { session(handle) }.map_or(true, |s| s.tls_is_closed(descriptor))
    }))
    .unwrap_or(true)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_get_cipher_suite(
    handle: *mut TakSession,
    descriptor: i32,
) -> TakStringResponse {
    call(|| unsafe { TakStringResponse::ok(session(handle)?.tls_cipher_suite(descriptor)?) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_get_version(
    handle: *mut TakSession,
    descriptor: i32,
) -> TakStringResponse {
    call(|| unsafe { TakStringResponse::ok(session(handle)?.tls_protocol_version(descriptor)?) })
}

/// Comma-separated suite names, strongest first.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_tls_get_supported_cipher_suites(
    handle: *mut TakSession,
) -> TakStringResponse {
    call(|| unsafe {
        TakStringResponse::ok(session(handle)?.tls_supported_cipher_suites().join(","))
    })
}
