// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Integer status codes and error classification.
//
// Status codes are the only thing that crosses the C boundary for errors.
// Their numeric values are part of the public ABI and must never change.
// The taxonomy groups errors by how a caller is expected to react.

use crate::error::TakError;

/// Return codes exposed through the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    // -- Success family --
    Success = 0x0000_0000,
    ReRegisterSuccess = 0x0000_0002,

    // -- General --
    GeneralError = 0x000F_0001,
    InvalidParameter = 0x000F_0003,
    InvalidServerResponse = 0x000F_0005,
    MultiThreadError = 0x000F_0006,
    NotAvailable = 0x000F_FFFF,

    // -- Session --
    AlreadyInitialized = 0x0001_0001,
    NotInitialized = 0x0001_0002,

    // -- Device / lifecycle --
    DeviceNoFingerprint = 0x0002_0005,
    LicenseExpired = 0x0002_0006,
    LicenseAboutToExpire = 0x0002_0007,
    ClientCertificateExpired = 0x0002_0008,
    AlreadyRegistered = 0x0002_0009,
    NotRegistered = 0x0002_000A,
    InstanceWiped = 0x0002_000B,
    InstanceLocked = 0x0002_000C,

    // -- Security / network --
    SecuritySslError = 0x0003_0003,
    SecurityCertificateError = 0x0003_0006,
    NetworkTimeout = 0x0003_0008,
    NetworkError = 0x0003_0009,

    // -- Storage --
    StorageError = 0x0005_0001,
    StorageNotFound = 0x0005_0002,
    StorageKeyNotFound = 0x0005_0003,
    StorageAlreadyExists = 0x0005_0004,
    StorageDeviceMismatch = 0x0005_0005,

    // -- Keys --
    SignatureError = 0x0007_0001,
    KeyStoreError = 0x0007_0003,
}

impl StatusCode {
    /// Raw integer value as returned across the C boundary.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the code belongs to the success family (including warnings
    /// where the operation itself completed).
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Success | Self::ReRegisterSuccess | Self::LicenseAboutToExpire
        )
    }
}

impl From<&TakError> for StatusCode {
    fn from(err: &TakError) -> Self {
        err.status()
    }
}

/// Outcome of an operation that completed, possibly with a warning.
///
/// Operations that can only succeed plainly return `Result<T>`; transitions
/// that have more than one way of succeeding return `Result<Completion>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Plain success.
    Completed,
    /// The device re-registered: new identifier and key material.
    ReRegistered,
    /// Success, but the license expires within the grace window.
    LicenseAboutToExpire,
    /// Success, but the instance is remotely locked.
    Locked,
}

impl Completion {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Completed => StatusCode::Success,
            Self::ReRegistered => StatusCode::ReRegisterSuccess,
            Self::LicenseAboutToExpire => StatusCode::LicenseAboutToExpire,
            Self::Locked => StatusCode::InstanceLocked,
        }
    }
}

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    /// Invalid or missing input. Locally detectable, never retried.
    Parameter,
    /// Wrong state for the operation. Surfaced verbatim, no recovery.
    Lifecycle,
    /// Secure storage condition.
    Storage,
    /// Certificate, key, or authentication failure. Never leaks data.
    Security,
    /// Timeout or transport failure. Caller-retriable.
    Network,
    /// Operation-blocking, not process-crashing (license expired, wiped).
    Fatal,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorFamily {
    /// Only network failures are worth retrying as-is.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Network)
    }
}

impl TakError {
    /// Map this error to its ABI status code.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidParameter(_) | Self::KeyNotFound(_) => StatusCode::InvalidParameter,

            Self::NotInitialized => StatusCode::NotInitialized,
            Self::AlreadyInitialized => StatusCode::AlreadyInitialized,
            Self::NotRegistered => StatusCode::NotRegistered,
            Self::AlreadyRegistered => StatusCode::AlreadyRegistered,
            Self::InstanceLocked => StatusCode::InstanceLocked,
            Self::InstanceWiped => StatusCode::InstanceWiped,
            Self::ClientCertificateExpired => StatusCode::ClientCertificateExpired,
            Self::LicenseExpired => StatusCode::LicenseExpired,
            Self::DeviceNoFingerprint => StatusCode::DeviceNoFingerprint,

            Self::StorageNotFound(_) => StatusCode::StorageNotFound,
            Self::StorageKeyNotFound { .. } => StatusCode::StorageKeyNotFound,
            Self::StorageAlreadyExists(_) => StatusCode::StorageAlreadyExists,
            Self::StorageDeviceMismatch => StatusCode::StorageDeviceMismatch,
            Self::Database(_) => StatusCode::StorageError,

            Self::Certificate(_) => StatusCode::SecurityCertificateError,
            Self::Tls(_) => StatusCode::SecuritySslError,
            Self::Signature(_) => StatusCode::SignatureError,
            Self::KeyStore(_) => StatusCode::KeyStoreError,
            // Tamper and corruption are indistinguishable to callers.
            Self::Encryption(_) | Self::Decryption(_) => StatusCode::GeneralError,

            Self::NetworkTimeout => StatusCode::NetworkTimeout,
            Self::Network(_) => StatusCode::NetworkError,
            Self::InvalidServerResponse(_) => StatusCode::InvalidServerResponse,
            Self::NotAvailable(_) => StatusCode::NotAvailable,

            Self::Concurrency(_) => StatusCode::MultiThreadError,
            Self::Io(_) | Self::Serialization(_) | Self::Bridge(_) | Self::General(_) => {
                StatusCode::GeneralError
            }
        }
    }

    /// Classify this error for caller reaction.
    pub fn family(&self) -> ErrorFamily {
        match self {
            Self::InvalidParameter(_) | Self::KeyNotFound(_) => ErrorFamily::Parameter,

            Self::LicenseExpired | Self::InstanceWiped => ErrorFamily::Fatal,

            Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::NotRegistered
            | Self::AlreadyRegistered
            | Self::InstanceLocked
            | Self::ClientCertificateExpired
            | Self::DeviceNoFingerprint => ErrorFamily::Lifecycle,

            Self::StorageNotFound(_)
            | Self::StorageKeyNotFound { .. }
            | Self::StorageAlreadyExists(_)
            | Self::StorageDeviceMismatch
            | Self::Database(_) => ErrorFamily::Storage,

            Self::Certificate(_)
            | Self::Tls(_)
            | Self::Encryption(_)
            | Self::Decryption(_)
            | Self::Signature(_)
            | Self::KeyStore(_) => ErrorFamily::Security,

            Self::NetworkTimeout
            | Self::Network(_)
            | Self::InvalidServerResponse(_)
            | Self::NotAvailable(_) => ErrorFamily::Network,

            Self::Io(_)
            | Self::Serialization(_)
            | Self::Bridge(_)
            | Self::Concurrency(_)
            | Self::General(_) => ErrorFamily::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values_are_stable() {
        assert_eq!(StatusCode::Success.code(), 0);
        assert_eq!(StatusCode::ReRegisterSuccess.code(), 2);
        assert_eq!(StatusCode::InvalidParameter.code(), 0x000F_0003);
        assert_eq!(StatusCode::InstanceLocked.code(), 0x0002_000C);
        assert_eq!(StatusCode::StorageDeviceMismatch.code(), 0x0005_0005);
        assert_eq!(StatusCode::NotAvailable.code(), 0x000F_FFFF);
    }

    #[test]
    fn decryption_failure_is_generic() {
        let err = TakError::Decryption("tag mismatch".into());
        assert_eq!(err.status(), StatusCode::GeneralError);
        assert_eq!(err.family(), ErrorFamily::Security);
    }

    #[test]
    fn only_network_is_retriable() {
        assert!(TakError::NetworkTimeout.family().is_retriable());
        assert!(TakError::Network("reset".into()).family().is_retriable());
        assert!(!TakError::NotRegistered.family().is_retriable());
        assert!(!TakError::invalid("x").family().is_retriable());
        assert!(!TakError::LicenseExpired.family().is_retriable());
    }

    #[test]
    fn completion_warnings_map_to_codes() {
        assert_eq!(Completion::Completed.status(), StatusCode::Success);
        assert_eq!(Completion::ReRegistered.status(), StatusCode::ReRegisterSuccess);
        assert!(Completion::LicenseAboutToExpire.status().is_success());
        assert_eq!(Completion::Locked.status(), StatusCode::InstanceLocked);
    }

    #[test]
    fn storage_key_not_found_keeps_context() {
        let err = TakError::StorageKeyNotFound {
            store: "vault".into(),
            key: "k".into(),
        };
        assert_eq!(err.status(), StatusCode::StorageKeyNotFound);
        assert!(err.to_string().contains("vault"));
    }
}
