// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-agnostic host capabilities.

use tak_core::error::Result;
use tak_core::{RootStatus, RuntimeCrashReason};

/// Everything the session needs from the hosting platform.
///
/// Implementations are shared between the caller's threads and the runtime
/// monitor thread, hence `Send + Sync`.
pub trait HostEnvironment:
    HostContext + DeviceFingerprint + BundledAssets + RuntimeIntegrity + Send + Sync
{
    /// Human-readable platform name (e.g. "Android", "iOS").
    fn platform_name(&self) -> &str;
}

/// Platform context handle (e.g. the Android application context).
///
/// Attached during `initialize`, detached during `release`. The session
/// never holds the handle outside that window.
pub trait HostContext {
    /// Whether `initialize` must fail when no context can be attached.
    fn requires_context(&self) -> bool;

    /// Acquire the context. Errors when the platform requires one and none
    /// was supplied.
    fn attach(&self) -> Result<()>;

    /// Drop any reference taken by `attach`. Idempotent.
    fn detach(&self);

    fn is_attached(&self) -> bool;
}

/// Stable per-device identifier.
pub trait DeviceFingerprint {
    /// Returns `Ok(None)` when the platform cannot produce one.
    fn device_fingerprint(&self) -> Result<Option<String>>;
}

/// Read-only files shipped with the application package.
pub trait BundledAssets {
    /// Bytes of the asset named `name`, or `Ok(None)` when absent.
    fn open_asset(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Device tamper probes used by the root-status queries and the runtime
/// monitor.
pub trait RuntimeIntegrity {
    fn root_status(&self) -> RootStatus;

    /// One sweep of the runtime checks. `Some` means the process must not
    /// continue.
    fn scan(&self) -> Option<RuntimeCrashReason>;
}
