// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator seams and native host bridges.
//
// The session core talks to four collaborators only through the traits in
// this crate: the host environment (platform context, device fingerprint,
// bundled assets, runtime probes), the crypto provider, the key vault, and
// the backend client. Each OS gets its own `HostEnvironment`; desktop and CI
// builds get the stub.

pub mod backend;
pub mod crypto;
pub mod traits;

#[cfg(target_os = "ios")]
pub mod ios;

#[cfg(target_os = "android")]
pub mod android;

#[cfg(not(any(target_os = "ios", target_os = "android")))]
pub mod stub;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod tracer;

pub use backend::{
    BackendClient, Registration, RegistrationRequest, Revalidation, RevalidationRequest,
    RevalidationStatus, UnavailableBackend,
};
pub use crypto::{CryptoProvider, KeyVault};
pub use traits::{BundledAssets, DeviceFingerprint, HostContext, HostEnvironment, RuntimeIntegrity};

/// Host environment for the target operating system.
pub fn platform_host() -> std::sync::Arc<dyn HostEnvironment> {
    #[cfg(target_os = "ios")]
    {
        std::sync::Arc::new(ios::IosHost::new())
    }
    #[cfg(target_os = "android")]
    {
        std::sync::Arc::new(android::AndroidHost::from_ndk_context())
    }
    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        std::sync::Arc::new(stub::StubHost::from_env())
    }
}
