// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Backend client implemented by C callbacks.
//
// Requests are handed to the callback as JSON. The callback answers by
// copying a JSON body into the reply with `tak_backend_reply_set` and
// returning 0, or returns a status code (`NetworkTimeout`, `NetworkError`,
// ...) without setting a body. Callbacks run on a library worker thread.

use std::ffi::{CString, c_char, c_void};

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use tak_bridge::{
    BackendClient, Registration, RegistrationRequest, Revalidation, RevalidationRequest,
    RevalidationStatus,
};
use tak_core::StatusCode;
use tak_core::error::{Result, TakError};

use crate::buffer::bytes_in;

/// Reply slot passed to a backend callback.
pub struct TakBackendReply {
    body: Option<Vec<u8>>,
}

pub type TakBackendCall = unsafe extern "C" fn(
    user_data: *mut c_void,
    request_json: *const c_char,
    reply: *mut TakBackendReply,
) -> i32;

/// Integrator-supplied backend. Null entries report `NotAvailable`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TakBackendCallbacks {
    pub user_data: *mut c_void,
    pub register: Option<TakBackendCall>,
    pub revalidate: Option<TakBackendCall>,
}

/// Copy `len` bytes of JSON into `reply`.
///
/// # Safety
///
/// `reply` must be the pointer passed to the running callback; `data` must
/// be valid for reads of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_backend_reply_set(
    reply: *mut TakBackendReply,
    data: *const u8,
    len: usize,
) -> i32 {
    if reply.is_null() {
        return StatusCode::InvalidParameter.code();
    }
    // SAFETY: forwarded to the caller.
    match unsafe { bytes_in(data, len) } {
        Ok(bytes) => {
            // SAFETY: non-null and exclusively borrowed for the callback.
            unsafe { (*reply).body = Some(bytes.to_vec()) };
            StatusCode::Success.code()
        }
        Err(e) => e.status().code(),
    }
}

#[derive(Debug, Clone, Copy)]
struct UserData(*mut c_void);

// SAFETY: the integrator promises that `user_data` may be used from the
// library's worker thread; the library never dereferences it.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

pub struct CallbackBackend {
    user_data: UserData,
    register: Option<TakBackendCall>,
    revalidate: Option<TakBackendCall>,
}

impl CallbackBackend {
    pub fn new(callbacks: &TakBackendCallbacks) -> Self {
        Self {
            user_data: UserData(callbacks.user_data),
            register: callbacks.register,
            revalidate: callbacks.revalidate,
        }
    }

    fn call(
        &self,
        name: &str,
        call: Option<TakBackendCall>,
        request: serde_json::Value,
    ) -> Result<Vec<u8>> {
        let call = call.ok_or_else(|| TakError::NotAvailable(format!("no {name} callback")))?;
        let request = CString::new(request.to_string())
            .map_err(|_| TakError::General("request contains NUL".into()))?;
        let mut reply = TakBackendReply { body: None };

        // SAFETY: the callback contract is documented on `TakBackendCallbacks`;
        // both pointers outlive the call.
        let code = unsafe { call(self.user_data.0, request.as_ptr(), &mut reply) };
        debug!(callback = name, code, "backend callback returned");

        match code {
            0 => reply
                .body
                .ok_or_else(|| TakError::InvalidServerResponse(format!("{name} reply is empty"))),
            c if c == StatusCode::NetworkTimeout.code() => Err(TakError::NetworkTimeout),
            c if c == StatusCode::NotAvailable.code() => {
                Err(TakError::NotAvailable(format!("{name} callback")))
            }
            c => Err(TakError::Network(format!("{name} callback failed with {c:#x}"))),
        }
    }
}

#[derive(Deserialize)]
struct RegistrationReply {
    device_id: String,
    certificate_pem: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum StatusReply {
    Valid,
    RenewalRequired,
    CertificateExpired,
    Locked,
    Wiped,
}

#[derive(Deserialize)]
struct RevalidationReply {
    status: StatusReply,
    #[serde(default)]
    certificate_pem: Option<String>,
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| TakError::InvalidServerResponse(e.to_string()))
}

impl BackendClient for CallbackBackend {
    fn register(&self, request: &RegistrationRequest) -> Result<Registration> {
        let body = self.call(
            "register",
            self.register,
            json!({
                "customer_id": request.customer_id,
                "fingerprint_hash": request.fingerprint_hash,
                "user_hash": request.user_hash,
                "public_key": hex::encode(&request.public_key),
                "platform": request.platform,
                "previous_device_id": request.previous_device_id.map(|id| id.to_string()),
                "backend_url": request.backend_url,
            }),
        )?;
        let reply: RegistrationReply = parse(&body)?;
        Ok(Registration {
            device_id: reply.device_id,
            certificate_pem: reply.certificate_pem,
        })
    }

    fn revalidate(&self, request: &RevalidationRequest) -> Result<Revalidation> {
        let body = self.call(
            "revalidate",
            self.revalidate,
            json!({
                "customer_id": request.customer_id,
                "device_id": request.device_id.to_string(),
                "fingerprint_hash": request.fingerprint_hash,
                "attestation": request.attestation,
                "backend_url": request.backend_url,
            }),
        )?;
        let reply: RevalidationReply = parse(&body)?;
        let status = match reply.status {
            StatusReply::Valid => RevalidationStatus::Valid,
            StatusReply::RenewalRequired => RevalidationStatus::RenewalRequired,
            StatusReply::CertificateExpired => RevalidationStatus::CertificateExpired,
            StatusReply::Locked => RevalidationStatus::Locked,
            StatusReply::Wiped => RevalidationStatus::Wiped,
        };
        Ok(Revalidation {
            status,
            certificate_pem: reply.certificate_pem,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use tak_core::DeviceId;

    unsafe extern "C" fn echo_register(
        user_data: *mut c_void,
        request: *const c_char,
        reply: *mut TakBackendReply,
    ) -> i32 {
        let request = unsafe { CStr::from_ptr(request) }.to_str().unwrap();
        let seen: serde_json::Value = serde_json::from_str(request).unwrap();
        assert_eq!(seen["customer_id"], "acme");
        assert_eq!(seen["public_key"], "0404");
        assert_eq!(seen["backend_url"], "https://devices.example");
        unsafe { *user_data.cast::<u32>() += 1 };

        let body = concat!(
            r#"{"device_id":"0b7ff1b4-6b7b-4c1b-9a55-7d3a0e8f0a11","#,
            r#""certificate_pem":"pem"}"#
        )
        .as_bytes();
        unsafe { tak_backend_reply_set(reply, body.as_ptr(), body.len()) }
    }

    unsafe extern "C" fn locked(
        _user_data: *mut c_void,
        _request: *const c_char,
        reply: *mut TakBackendReply,
    ) -> i32 {
        let body = br#"{"status":"locked"}"#;
        unsafe { tak_backend_reply_set(reply, body.as_ptr(), body.len()) }
    }

    unsafe extern "C" fn timing_out(
        _user_data: *mut c_void,
        _request: *const c_char,
        _reply: *mut TakBackendReply,
    ) -> i32 {
        StatusCode::NetworkTimeout.code()
    }

    unsafe extern "C" fn silent(
        _user_data: *mut c_void,
        _request: *const c_char,
        _reply: *mut TakBackendReply,
    ) -> i32 {
        0
    }

    fn registration() -> RegistrationRequest {
        RegistrationRequest {
            customer_id: "acme".into(),
            fingerprint_hash: "ab".into(),
            user_hash: None,
            public_key: vec![4, 4],
            platform: "Fake".into(),
            previous_device_id: None,
            backend_url: Some("https://devices.example".into()),
        }
    }

    fn revalidation() -> RevalidationRequest {
        RevalidationRequest {
            customer_id: "acme".into(),
            device_id: DeviceId::new(),
            fingerprint_hash: "ab".into(),
            attestation: None,
            backend_url: None,
        }
    }

    #[test]
    fn register_goes_through_the_callback() {
        let mut calls = 0u32;
        let backend = CallbackBackend::new(&TakBackendCallbacks {
            user_data: (&mut calls as *mut u32).cast(),
            register: Some(echo_register),
            revalidate: Some(locked),
        });
        let reg = backend.register(&registration()).unwrap();
        assert_eq!(reg.certificate_pem, "pem");
        assert!(DeviceId::parse_v4(&reg.device_id).is_ok());
        assert_eq!(
            backend.revalidate(&revalidation()).unwrap().status,
            RevalidationStatus::Locked
        );
        drop(backend);
        assert_eq!(calls, 1);
    }

    #[test]
    fn callback_failures_map_to_errors() {
        let backend = CallbackBackend::new(&TakBackendCallbacks {
            user_data: std::ptr::null_mut(),
            register: Some(timing_out),
            revalidate: Some(silent),
        });
        assert!(matches!(
            backend.register(&registration()),
            Err(TakError::NetworkTimeout)
        ));
        assert!(matches!(
            backend.revalidate(&revalidation()),
            Err(TakError::InvalidServerResponse(_))
        ));
    }

    #[test]
    fn missing_callbacks_are_not_available() {
        let backend = CallbackBackend::new(&TakBackendCallbacks {
            user_data: std::ptr::null_mut(),
            register: None,
            revalidate: None,
        });
        assert_eq!(
            backend.register(&registration()).unwrap_err().status(),
            StatusCode::NotAvailable
        );
    }
}
