// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// iOS host via objc2.
//
// iOS needs no context handle: the main bundle and `UIDevice` are reachable
// from any thread. `identifierForVendor` is stable for all apps of one
// vendor on a device and resets when the last of them is uninstalled.

#![cfg(target_os = "ios")]

use std::sync::atomic::{AtomicBool, Ordering};

use objc2::msg_send;
use objc2::rc::Retained;
use objc2::runtime::{AnyClass, AnyObject};
use objc2_foundation::{NSBundle, NSUUID};

use tak_core::error::{Result, TakError};
use tak_core::{RootStatus, RuntimeCrashReason};

use crate::traits::*;

/// iOS implementation of the host environment.
pub struct IosHost {
    attached: AtomicBool,
}

impl IosHost {
    pub fn new() -> Self {
        Self {
            attached: AtomicBool::new(false),
        }
    }
}

impl Default for IosHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEnvironment for IosHost {
    fn platform_name(&self) -> &str {
        "iOS"
    }
}

impl HostContext for IosHost {
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

impl DeviceFingerprint for IosHost {
    fn device_fingerprint(&self) -> Result<Option<String>> {
        let Some(cls) = AnyClass::get(c"UIDevice") else {
            return Err(TakError::Bridge("UIDevice class not found".into()));
        };
        // SAFETY: `+[UIDevice currentDevice]` returns a non-null singleton and
        // `identifierForVendor` a nullable `NSUUID`.
        let device: Option<Retained<AnyObject>> = unsafe { msg_send![cls, currentDevice] };
        let Some(device) = device else {
            return Ok(None);
        };
        let vendor_id: Option<Retained<NSUUID>> =
            unsafe { msg_send![&*device, identifierForVendor] };
        Ok(vendor_id.map(|id| id.UUIDString().to_string()))
    }
}

impl BundledAssets for IosHost {
    /// Read `<name>` from the main bundle's resource directory.
    fn open_asset(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(TakError::invalid(format!("invalid asset name '{name}'")));
        }
        let bundle = NSBundle::mainBundle();
        let Some(root) = bundle.resourcePath() else {
            return Err(TakError::Bridge("main bundle has no resource path".into()));
        };
        let path = std::path::PathBuf::from(root.to_string()).join(name);
        match std::fs::read(&path) {
            Ok(bytes) => {
                tracing::debug!(asset = name, len = bytes.len(), "iOS: asset read");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl RuntimeIntegrity for IosHost {
    fn root_status(&self) -> RootStatus {
        RootStatus::NotRooted
    }

    fn scan(&self) -> Option<RuntimeCrashReason> {
        None
    }
}
