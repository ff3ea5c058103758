// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the trusted application kit.

use thiserror::Error;

/// Top-level error type for all tak operations.
///
/// Every variant maps onto exactly one [`StatusCode`](crate::StatusCode) via
/// [`TakError::status`], which is what crosses the C boundary.
#[derive(Debug, Error)]
pub enum TakError {
    // -- Parameter errors --
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // -- Lifecycle errors --
    #[error("session is not initialized")]
    NotInitialized,

    #[error("session is already initialized")]
    AlreadyInitialized,

    #[error("device is not registered")]
    NotRegistered,

    #[error("device is already registered")]
    AlreadyRegistered,

    #[error("instance has been remotely locked")]
    InstanceLocked,

    #[error("instance has been remotely wiped")]
    InstanceWiped,

    #[error("client certificate has expired, registration required")]
    ClientCertificateExpired,

    #[error("license has expired")]
    LicenseExpired,

    #[error("device fingerprint is unavailable")]
    DeviceNoFingerprint,

    // -- Storage errors --
    #[error("secure storage '{0}' not found")]
    StorageNotFound(String),

    #[error("key '{key}' not found in secure storage '{store}'")]
    StorageKeyNotFound { store: String, key: String },

    #[error("secure storage '{0}' already exists")]
    StorageAlreadyExists(String),

    #[error("device mismatch, secure storage has been deleted")]
    StorageDeviceMismatch,

    // -- Security errors --
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("signature generation failed: {0}")]
    Signature(String),

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    // -- Network errors --
    #[error("network operation timed out")]
    NetworkTimeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid server response: {0}")]
    InvalidServerResponse(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    // -- Persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- Platform bridge --
    #[error("platform bridge error: {0}")]
    Bridge(String),

    // -- Internal --
    /// Poisoned lock, or state changed under a call that released it.
    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("{0}")]
    General(String),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TakError>;

impl TakError {
    /// Shorthand for [`TakError::InvalidParameter`].
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidParameter(detail.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for TakError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Concurrency(format!("lock poisoned: {e}"))
    }
}
