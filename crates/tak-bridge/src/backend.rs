// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Registration backend seam.
//
// The wire protocol is owned by the integrator. Calls are blocking; the
// session bounds them with its network timeout.

use tak_core::DeviceId;
use tak_core::error::{Result, TakError};

/// Everything the backend needs to issue a device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub customer_id: String,
    /// SHA-256 hex of the device fingerprint. The raw value never leaves
    /// the device.
    pub fingerprint_hash: String,
    pub user_hash: Option<String>,
    /// Public key of the freshly generated individual signing key.
    pub public_key: Vec<u8>,
    pub platform: String,
    /// Set when renewing an identity that is about to expire.
    pub previous_device_id: Option<DeviceId>,
    /// Endpoint named by the license, if it names one.
    pub backend_url: Option<String>,
}

/// Backend answer to a registration. The device id is unvalidated text;
/// the session rejects anything that is not a UUIDv4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub device_id: String,
    pub certificate_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevalidationRequest {
    pub customer_id: String,
    pub device_id: DeviceId,
    pub fingerprint_hash: String,
    pub attestation: Option<String>,
    pub backend_url: Option<String>,
}

/// Server-directed verdict on an existing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationStatus {
    Valid,
    /// The certificate is close to expiry; the client must re-register.
    RenewalRequired,
    CertificateExpired,
    Locked,
    Wiped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revalidation {
    pub status: RevalidationStatus,
    /// Replacement certificate for the current key, if the backend issued one.
    pub certificate_pem: Option<String>,
}

/// Registration server client.
pub trait BackendClient: Send + Sync {
    fn register(&self, request: &RegistrationRequest) -> Result<Registration>;

    fn revalidate(&self, request: &RevalidationRequest) -> Result<Revalidation>;
}

/// Backend used when the integrator supplies none. Every call reports
/// `NotAvailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl BackendClient for UnavailableBackend {
    fn register(&self, _request: &RegistrationRequest) -> Result<Registration> {
        tracing::warn!("BackendClient::register called without a configured backend");
        Err(TakError::NotAvailable("no backend client configured".into()))
    }

    fn revalidate(&self, _request: &RevalidationRequest) -> Result<Revalidation> {
        tracing::warn!("BackendClient::revalidate called without a configured backend");
        Err(TakError::NotAvailable("no backend client configured".into()))
    }
}
