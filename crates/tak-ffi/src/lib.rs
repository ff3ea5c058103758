// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// C ABI over `tak_session::Session`.
//
// The caller owns an opaque `TakSession*` from `tak_session_new` until
// `tak_session_free`. Every function returns a status code or a fixed-size
// response struct carrying one; data flows out through `TakByteBuffer` and
// C strings that the caller releases with `tak_buffer_free` and
// `tak_string_free`. No panic crosses the boundary: each entry point runs
// under `catch_unwind` and reports a panic as `GeneralError`.

#![allow(clippy::missing_safety_doc)]

pub mod backend;
pub mod buffer;
pub mod keys;
pub mod monitor;
pub mod storage;
pub mod tls;

use std::ffi::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use tracing::{debug, error};

use tak_bridge::BackendClient;
use tak_core::StatusCode;
use tak_core::error::{Result, TakError};
use tak_session::{Session, SessionBuilder};

use crate::backend::{CallbackBackend, TakBackendCallbacks};
use crate::buffer::{
    Response, TakBoolResponse, TakIntResponse, TakIsRegisteredResponse, TakStringResponse,
    opt_str_in, str_in,
};

/// Opaque session handle.
pub struct TakSession {
    session: Session,
}

impl TakSession {
    /// Box `session` for a C caller. Release with [`tak_session_free`].
    pub fn into_raw(session: Session) -> *mut TakSession {
        Box::into_raw(Box::new(TakSession { session }))
    }
}

/// Borrow the session behind `handle`.
///
/// # Safety
///
/// `handle` must be null or a live pointer from this library.
pub(crate) unsafe fn session<'a>(handle: *const TakSession) -> Result<&'a Session> {
    // SAFETY: forwarded to the caller.
    unsafe { handle.as_ref() }
        .map(|h| &h.session)
        .ok_or_else(|| TakError::invalid("session handle is null"))
}

/// Run `body`, turning errors and panics into a failed response.
pub(crate) fn call<R: Response>(body: impl FnOnce() -> Result<R>) -> R {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            debug!(error = %e, "call failed");
            R::failed(e.status())
        }
        Err(_) => {
            error!("panic caught at the C boundary");
            R::failed(StatusCode::GeneralError)
        }
    }
}

pub(crate) fn success() -> Result<i32> {
    Ok(StatusCode::Success.code())
}

fn with_backend(builder: SessionBuilder, callbacks: *const TakBackendCallbacks) -> SessionBuilder {
    // SAFETY: callers of the constructors pass null or a valid struct.
    match unsafe { callbacks.as_ref() } {
        Some(callbacks) => {
            let backend: Arc<dyn BackendClient> = Arc::new(CallbackBackend::new(callbacks));
            builder.backend(backend)
        }
        None => builder,
    }
}

fn new_handle(builder: SessionBuilder) -> *mut TakSession {
    match panic::catch_unwind(AssertUnwindSafe(|| builder.build())) {
        Ok(Ok(session)) => TakSession::into_raw(session),
        Ok(Err(e)) => {
            error!(error = %e, "failed to create session");
            ptr::null_mut()
        }
        Err(_) => {
            error!("panic while creating session");
            ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// Handle and logging
// ---------------------------------------------------------------------------

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
/// Calling it again is harmless.
#[unsafe(no_mangle)]
pub extern "C" fn tak_logging_init() -> i32 {
    call(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
            debug!("tracing subscriber already installed");
        }
        success()
    })
}

/// Create a session on the platform host. `callbacks` may be null, in
/// which case registration reports `NotAvailable`. Returns null on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_session_new(callbacks: *const TakBackendCallbacks) -> *mut TakSession {
    new_handle(with_backend(Session::builder(), callbacks))
}

/// Create a session bound to an explicit Android context.
#[cfg(target_os = "android")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_session_new_android(
    vm: *mut std::ffi::c_void,
    context: *mut std::ffi::c_void,
    callbacks: *const TakBackendCallbacks,
) -> *mut TakSession {
    // SAFETY: the caller passes a valid `JavaVM*` and context `jobject`.
    let host = unsafe { tak_bridge::android::AndroidHost::from_raw(vm, context) };
    new_handle(with_backend(Session::builder().host(Arc::new(host)), callbacks))
}

/// Release the session (if initialized) and free the handle. Null is
/// ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_session_free(handle: *mut TakSession) {
    if handle.is_null() {
        return;
    }
    // SAFETY: the pointer came from `TakSession::into_raw`.
    let boxed = unsafe { Box::from_raw(handle) };
    if panic::catch_unwind(AssertUnwindSafe(move || drop(boxed))).is_err() {
        error!("panic while freeing session");
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Returns `Success`, `LicenseAboutToExpire`, or `InstanceLocked` on success.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_initialize(
    handle: *mut TakSession,
    working_path: *const c_char,
    license_path: *const c_char,
) -> i32 {
    call(|| unsafe {
        let completion = session(handle)?.initialize(
            str_in(working_path, "working path")?,
            str_in(license_path, "license path")?,
        )?;
        Ok(completion.status().code())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_is_initialized(handle: *mut TakSession) -> bool {
    call(|| unsafe { Ok(TakBoolResponse::ok(session(handle)?.is_initialized())) }).value
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_release(handle: *mut TakSession) -> i32 {
    call(|| unsafe {
        session(handle)?.release()?;
        success()
    })
}

/// `user_hash` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_register(handle: *mut TakSession, user_hash: *const c_char) -> i32 {
    call(|| unsafe {
        session(handle)?.register(opt_str_in(user_hash, "user hash")?)?;
        success()
    })
}

/// `return_code` is diagnostic only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_is_registered(handle: *mut TakSession) -> TakIsRegisteredResponse {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the caller passes null or a live handle.
        unsafe { session(handle) }.map(Session::is_registered)
    }));
    let (is_registered, code) = match outcome {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => (false, e.status()),
        Err(_) => (false, StatusCode::GeneralError),
    };
    TakIsRegisteredResponse {
        is_registered,
        return_code: code.code(),
    }
}

/// `attestation` may be null. Returns `Success`, `ReRegisterSuccess`,
/// `LicenseAboutToExpire`, or `InstanceLocked` on success.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_check_integrity(
    handle: *mut TakSession,
    attestation: *const c_char,
) -> i32 {
    call(|| unsafe {
        let completion =
            session(handle)?.check_integrity(opt_str_in(attestation, "attestation")?)?;
        Ok(completion.status().code())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_reset(handle: *mut TakSession) -> i32 {
    call(|| unsafe {
        session(handle)?.reset()?;
        success()
    })
}

/// The device identifier as a UUID string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_identifier(handle: *mut TakSession) -> TakStringResponse {
    call(|| unsafe { TakStringResponse::ok(session(handle)?.device_id()?.to_string()) })
}

// ---------------------------------------------------------------------------
// Version and root status
// ---------------------------------------------------------------------------

/// Static string; do not free.
#[unsafe(no_mangle)]
pub extern "C" fn tak_get_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr().cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn tak_get_build_version() -> TakStringResponse {
    call(|| TakStringResponse::ok(Session::build_version()))
}

/// True only for the highest root level. Always false while locked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_root_status(handle: *mut TakSession) -> TakBoolResponse {
    call(|| unsafe { Ok(TakBoolResponse::ok(session(handle)?.root_status()?)) })
}

/// Root level, 0 (not rooted) to 3 (rooted).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_get_advanced_root_status(handle: *mut TakSession) -> TakIntResponse {
    call(|| unsafe { Ok(TakIntResponse::ok(session(handle)?.advanced_root_status()? as i32)) })
}
