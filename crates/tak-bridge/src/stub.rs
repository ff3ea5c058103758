// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Desktop/CI host. No platform context is needed, the fingerprint comes
// from the machine id, and bundled assets are plain files in a directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tak_core::error::{Result, TakError};
use tak_core::{RootStatus, RuntimeCrashReason};

use crate::traits::*;

/// Environment variable naming the bundled asset directory.
pub const ASSET_DIR_ENV: &str = "TAK_ASSET_DIR";

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Host used on non-mobile platforms.
pub struct StubHost {
    asset_dir: PathBuf,
    attached: AtomicBool,
}

impl StubHost {
    pub fn new(asset_dir: impl Into<PathBuf>) -> Self {
        Self {
            asset_dir: asset_dir.into(),
            attached: AtomicBool::new(false),
        }
    }

    /// Asset directory from `TAK_ASSET_DIR`, or `./assets`.
    pub fn from_env() -> Self {
        let dir = std::env::var_os(ASSET_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));
        Self::new(dir)
    }

    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }
}

impl HostEnvironment for StubHost {
    fn platform_name(&self) -> &str {
        "Desktop (stub)"
    }
}

impl HostContext for StubHost {
    fn requires_context(&self) -> bool {
        false
    }

    fn attach(&self) -> Result<()> {
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

impl DeviceFingerprint for StubHost {
    fn device_fingerprint(&self) -> Result<Option<String>> {
        for path in MACHINE_ID_PATHS {
            match std::fs::read_to_string(path) {
                Ok(id) if !id.trim().is_empty() => return Ok(Some(id.trim().to_string())),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(TakError::Io(e)),
            }
        }
        tracing::warn!("no machine id found; device fingerprint unavailable");
        Ok(None)
    }
}

impl BundledAssets for StubHost {
    fn open_asset(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if name.is_empty() || name.contains("..") || Path::new(name).is_absolute() {
            return Err(TakError::invalid(format!("invalid asset name '{name}'")));
        }
        match std::fs::read(self.asset_dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl RuntimeIntegrity for StubHost {
    fn root_status(&self) -> RootStatus {
        RootStatus::NotRooted
    }

    fn scan(&self) -> Option<RuntimeCrashReason> {
        #[cfg(target_os = "linux")]
        if crate::tracer::is_traced() {
            return Some(RuntimeCrashReason::DebuggerDetected);
        }
        None
    }
}
