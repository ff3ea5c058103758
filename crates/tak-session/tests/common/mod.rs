// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared fixtures for the session integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;

use tak_bridge::testing::{FakeHost, ScriptedBackend};
use tak_core::RuntimeCrashReason;
use tak_security::Terminator;
use tak_session::Session;

pub const LICENSE: &str = "license.json";

pub fn license_json(expires_in: chrono::Duration) -> String {
    format!(
        r#"{{"customer_id":"acme","expires_at":"{}","file_protector_key":"{}"}}"#,
        (Utc::now() + expires_in).to_rfc3339(),
        "5a".repeat(32)
    )
}

pub fn write_license(dir: &Path, expires_in: chrono::Duration) {
    std::fs::write(dir.join(LICENSE), license_json(expires_in)).unwrap();
}

/// Fields drop in order: the session releases before the directory goes.
pub struct Harness {
    pub session: Session,
    pub host: Arc<FakeHost>,
    pub backend: Arc<ScriptedBackend>,
    pub terminations: Arc<Mutex<Vec<RuntimeCrashReason>>>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_license(dir.path(), chrono::Duration::days(365));
        Self::in_dir(dir, Arc::new(FakeHost::new()), Arc::new(ScriptedBackend::new()))
    }

    pub fn in_dir(dir: TempDir, host: Arc<FakeHost>, backend: Arc<ScriptedBackend>) -> Self {
        let terminations = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&terminations);
        let terminator: Terminator = Arc::new(move |reason| log.lock().unwrap().push(reason));
        let session = Session::builder()
            .host(host.clone())
            .backend(backend.clone())
            .terminator(terminator)
            .build()
            .unwrap();
        Self {
            session,
            host,
            backend,
            terminations,
            dir,
        }
    }

    pub fn initialized() -> Self {
        let h = Self::new();
        h.initialize().unwrap();
        h
    }

    pub fn registered() -> Self {
        let h = Self::initialized();
        h.session.register(None).unwrap();
        h
    }

    pub fn initialize(&self) -> tak_core::Result<tak_core::Completion> {
        self.session.initialize(self.dir.path(), LICENSE)
    }

    /// Simulate a process restart: a new session over the same directory,
    /// host, and backend.
    pub fn restart(self) -> Self {
        let Harness {
            session,
            host,
            backend,
            dir,
            ..
        } = self;
        drop(session);
        Self::in_dir(dir, host, backend)
    }

    pub fn write_config(&self, json: &str) {
        std::fs::write(self.dir.path().join("tak.json"), json).unwrap();
    }
}

pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
