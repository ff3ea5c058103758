// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Runtime configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the optional configuration file inside the working path.
pub const CONFIG_FILE: &str = "tak.json";

/// Tunables for a session. Every field has a default, so a partial
/// `tak.json` only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakConfig {
    /// Upper bound for a single backend round trip.
    pub network_timeout_ms: u64,
    /// Smallest interval the runtime monitor accepts.
    pub monitor_min_interval_secs: u64,
    /// Warning window before license expiry, used when the license omits it.
    pub license_grace_days: i64,
    /// Secure storage database file name.
    pub storage_db: String,
    /// Software key vault database file name.
    pub keystore_db: String,
    /// Session journal database file name.
    pub journal_db: String,
    /// Extension of encrypted pinned certificate assets.
    pub pinned_cert_extension: String,
}

impl Default for TakConfig {
    fn default() -> Self {
        Self {
            network_timeout_ms: 30_000,
            monitor_min_interval_secs: 45,
            license_grace_days: 30,
            storage_db: "storage.db".into(),
            keystore_db: "keystore.db".into(),
            journal_db: "session.db".into(),
            pinned_cert_extension: "tak".into(),
        }
    }
}

impl TakConfig {
    /// Load `tak.json` from `working_path`, falling back to defaults when
    /// the file does not exist.
    pub fn load(working_path: &Path) -> Result<Self> {
        let path = working_path.join(CONFIG_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TakConfig::load(dir.path()).unwrap();
        assert_eq!(cfg, TakConfig::default());
        assert_eq!(cfg.network_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "network_timeout_ms": 500, "pinned_cert_extension": "pin" }"#,
        )
        .unwrap();
        let cfg = TakConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.network_timeout_ms, 500);
        assert_eq!(cfg.pinned_cert_extension, "pin");
        assert_eq!(cfg.monitor_min_interval_secs, 45);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert!(TakConfig::load(dir.path()).is_err());
    }
}
