// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scriptable host and backend for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tak_core::error::{Result, TakError};
use tak_core::{RootStatus, RuntimeCrashReason};

use crate::backend::*;
use crate::traits::*;

/// Placeholder certificate handed out by [`ScriptedBackend`].
pub const SCRIPTED_CERTIFICATE_PEM: &str = concat!(
    "-----BEGIN CERTIFICATE-----\n",
    "c2NyaXB0ZWQtZGV2aWNlLWNlcnRpZmljYXRl\n",
    "-----END CERTIFICATE-----\n",
);

/// In-memory host with settable fingerprint, assets, and probe results.
pub struct FakeHost {
    requires_context: bool,
    context_available: AtomicBool,
    attached: AtomicBool,
    fingerprint: Mutex<Option<String>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    root_status: Mutex<RootStatus>,
    violation: Mutex<Option<RuntimeCrashReason>>,
    panic_next_scan: AtomicBool,
    scans: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            requires_context: false,
            context_available: AtomicBool::new(true),
            attached: AtomicBool::new(false),
            fingerprint: Mutex::new(Some("fake-device-0001".into())),
            assets: Mutex::new(HashMap::new()),
            root_status: Mutex::new(RootStatus::NotRooted),
            violation: Mutex::new(None),
            panic_next_scan: AtomicBool::new(false),
            scans: AtomicUsize::new(0),
        }
    }

    /// A host that, like Android, refuses to initialize without a context.
    pub fn requiring_context(available: bool) -> Self {
        let host = Self {
            requires_context: true,
            ..Self::new()
        };
        host.context_available.store(available, Ordering::SeqCst);
        host
    }

    pub fn set_fingerprint(&self, fingerprint: Option<&str>) {
        if let Ok(mut fp) = self.fingerprint.lock() {
            *fp = fingerprint.map(str::to_string);
        }
    }

    pub fn add_asset(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut assets) = self.assets.lock() {
            assets.insert(name.to_string(), bytes.into());
        }
    }

    pub fn set_root_status(&self, status: RootStatus) {
        if let Ok(mut s) = self.root_status.lock() {
            *s = status;
        }
    }

    /// Make every following scan report `reason`.
    pub fn set_violation(&self, reason: Option<RuntimeCrashReason>) {
        if let Ok(mut v) = self.violation.lock() {
            *v = reason;
        }
    }

    /// Make the next scan panic, killing the monitor thread.
    pub fn panic_on_next_scan(&self) {
        self.panic_next_scan.store(true, Ordering::SeqCst);
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEnvironment for FakeHost {
    fn platform_name(&self) -> &str {
        "Fake"
    }
}

impl HostContext for FakeHost {
    fn requires_context(&self) -> bool {
        self.requires_context
    }

    fn attach(&self) -> Result<()> {
        if self.requires_context && !self.context_available.load(Ordering::SeqCst) {
            return Err(TakError::invalid("host context was not supplied"));
        }
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

impl DeviceFingerprint for FakeHost {
    fn device_fingerprint(&self) -> Result<Option<String>> {
        Ok(self.fingerprint.lock()?.clone())
    }
}

impl BundledAssets for FakeHost {
    fn open_asset(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.assets.lock()?.get(name).cloned())
    }
}

impl RuntimeIntegrity for FakeHost {
    fn root_status(&self) -> RootStatus {
        self.root_status
            .lock()
            .map(|s| *s)
            .unwrap_or(RootStatus::NotRooted)
    }

    fn scan(&self) -> Option<RuntimeCrashReason> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.panic_next_scan.swap(false, Ordering::SeqCst) {
            panic!("scripted scan failure");
        }
        self.violation.lock().ok().and_then(|v| *v)
    }
}

/// One scripted backend answer.
pub enum Reply<T> {
    Ok(T),
    Err(TakError),
    /// Sleep, then answer with the next queued reply (or the default).
    Delay(Duration),
}

/// Backend that answers from queues, falling back to a fresh UUIDv4
/// registration and a `Valid` revalidation.
pub struct ScriptedBackend {
    registrations: Mutex<VecDeque<Reply<Registration>>>,
    revalidations: Mutex<VecDeque<Reply<Revalidation>>>,
    register_requests: Mutex<Vec<RegistrationRequest>>,
    revalidate_requests: Mutex<Vec<RevalidationRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(VecDeque::new()),
            revalidations: Mutex::new(VecDeque::new()),
            register_requests: Mutex::new(Vec::new()),
            revalidate_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_registration(&self, reply: Reply<Registration>) {
        if let Ok(mut q) = self.registrations.lock() {
            q.push_back(reply);
        }
    }

    pub fn push_revalidation(&self, reply: Reply<Revalidation>) {
        if let Ok(mut q) = self.revalidations.lock() {
            q.push_back(reply);
        }
    }

    /// Queue a revalidation verdict without a new certificate.
    pub fn push_status(&self, status: RevalidationStatus) {
        self.push_revalidation(Reply::Ok(Revalidation {
            status,
            certificate_pem: None,
        }));
    }

    pub fn register_requests(&self) -> Vec<RegistrationRequest> {
        self.register_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn revalidate_requests(&self) -> Vec<RevalidationRequest> {
        self.revalidate_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn answer<T>(queue: &Mutex<VecDeque<Reply<T>>>, default: impl FnOnce() -> T) -> Result<T> {
        loop {
            let next = queue.lock()?.pop_front();
            match next {
                Some(Reply::Delay(d)) => std::thread::sleep(d),
                Some(Reply::Ok(v)) => return Ok(v),
                Some(Reply::Err(e)) => return Err(e),
                None => return Ok(default()),
            }
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClient for ScriptedBackend {
    fn register(&self, request: &RegistrationRequest) -> Result<Registration> {
        self.register_requests.lock()?.push(request.clone());
        Self::answer(&self.registrations, || Registration {
            device_id: uuid::Uuid::new_v4().to_string(),
            certificate_pem: SCRIPTED_CERTIFICATE_PEM.to_string(),
        })
    }

    fn revalidate(&self, request: &RevalidationRequest) -> Result<Revalidation> {
        self.revalidate_requests.lock()?.push(request.clone());
        Self::answer(&self.revalidations, || Revalidation {
            status: RevalidationStatus::Valid,
            certificate_pem: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tak_core::DeviceId;

    fn request() -> RegistrationRequest {
        RegistrationRequest {
            customer_id: "acme".into(),
            fingerprint_hash: "00".into(),
            user_hash: None,
            public_key: vec![4; 65],
            platform: "Fake".into(),
            previous_device_id: None,
            backend_url: None,
        }
    }

    #[test]
    fn default_registration_is_uuid_v4() {
        let backend = ScriptedBackend::new();
        let reg = backend.register(&request()).unwrap();
        assert!(DeviceId::parse_v4(&reg.device_id).is_ok());
        assert_eq!(backend.register_requests().len(), 1);
    }

    #[test]
    fn queued_replies_come_first() {
        let backend = ScriptedBackend::new();
        backend.push_registration(Reply::Err(TakError::NetworkTimeout));
        assert!(matches!(
            backend.register(&request()),
            Err(TakError::NetworkTimeout)
        ));
        assert!(backend.register(&request()).is_ok());
    }

    #[test]
    fn scripted_scan_panics_once() {
        let host = FakeHost::new();
        host.panic_on_next_scan();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| host.scan()));
        assert!(r.is_err());
        assert_eq!(host.scan(), None);
        assert_eq!(host.scan_count(), 2);
    }

    #[test]
    fn context_requirement() {
        let host = FakeHost::requiring_context(false);
        assert!(host.attach().is_err());
        let host = FakeHost::requiring_context(true);
        assert!(host.attach().is_ok());
    }
}
