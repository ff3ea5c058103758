// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Customer license: expiry evaluation and provisioned key material.
//
// A license is a JSON document:
//
//   {
//     "customer_id": "acme",
//     "expires_at": "2027-01-01T00:00:00Z",
//     "grace_days": 30,                      -- optional
//     "file_protector_key": "<64 hex chars>",
//     "default_signing_key": "<hex PKCS#8>", -- optional, P-256
//     "backend_url": "https://..."           -- optional
//   }

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TakError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub customer_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub grace_days: Option<i64>,
    /// Hex-encoded AES-256 key-encryption key shared by every install of
    /// this customer's application.
    pub file_protector_key: String,
    #[serde(default)]
    pub default_signing_key: Option<String>,
    #[serde(default)]
    pub backend_url: Option<String>,
}

/// Result of evaluating a license against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseStatus {
    Valid,
    /// Still valid, but expiring within the grace window.
    AboutToExpire { days_left: i64 },
    Expired,
}

impl License {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let license: Self = serde_json::from_slice(bytes)
            .map_err(|e| TakError::invalid(format!("license: {e}")))?;
        if license.customer_id.trim().is_empty() {
            return Err(TakError::invalid("license: empty customer_id"));
        }
        license.file_protector_key()?;
        license.default_signing_key()?;
        Ok(license)
    }

    /// Compare the expiry against `now`. `default_grace_days` applies when
    /// the license does not carry its own window.
    pub fn evaluate(&self, now: DateTime<Utc>, default_grace_days: i64) -> LicenseStatus {
        if now >= self.expires_at {
            return LicenseStatus::Expired;
        }
        let grace_days = self.grace_days.unwrap_or(default_grace_days).max(0);
        let grace = Duration::try_days(grace_days).unwrap_or(Duration::MAX);
        let remaining = self.expires_at - now;
        if remaining <= grace {
            LicenseStatus::AboutToExpire {
                days_left: remaining.num_days(),
            }
        } else {
            LicenseStatus::Valid
        }
    }

    /// Decoded 32-byte key-encryption key.
    pub fn file_protector_key(&self) -> Result<[u8; 32]> {
        let raw = hex::decode(self.file_protector_key.trim())
            .map_err(|e| TakError::invalid(format!("license: file_protector_key: {e}")))?;
        raw.try_into()
            .map_err(|_| TakError::invalid("license: file_protector_key must be 32 bytes"))
    }

    /// Decoded PKCS#8 document of the customer signing key, if provisioned.
    pub fn default_signing_key(&self) -> Result<Option<Vec<u8>>> {
        self.default_signing_key
            .as_deref()
            .map(|h| {
                hex::decode(h.trim())
                    .map_err(|e| TakError::invalid(format!("license: default_signing_key: {e}")))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(expires_at: DateTime<Utc>, grace_days: Option<i64>) -> License {
        License {
            customer_id: "acme".into(),
            expires_at,
            grace_days,
            file_protector_key: "11".repeat(32),
            default_signing_key: None,
            backend_url: None,
        }
    }

    #[test]
    fn evaluate_windows() {
        let now = Utc::now();
        assert_eq!(
            sample(now + Duration::days(365), None).evaluate(now, 30),
            LicenseStatus::Valid
        );
        assert!(matches!(
            sample(now + Duration::days(10), None).evaluate(now, 30),
            LicenseStatus::AboutToExpire { days_left: 9..=10 }
        ));
        assert_eq!(
            sample(now - Duration::seconds(1), None).evaluate(now, 30),
            LicenseStatus::Expired
        );
        // License-specific window wins over the default.
        assert_eq!(
            sample(now + Duration::days(10), Some(5)).evaluate(now, 30),
            LicenseStatus::Valid
        );
    }

    #[test]
    fn oversized_grace_window_saturates() {
        let now = Utc::now();
        assert!(matches!(
            sample(now + Duration::days(365), Some(i64::MAX)).evaluate(now, 30),
            LicenseStatus::AboutToExpire { days_left: 364..=365 }
        ));
        assert!(matches!(
            sample(now + Duration::days(2), None).evaluate(now, i64::MAX),
            LicenseStatus::AboutToExpire { .. }
        ));
        assert_eq!(
            sample(now + Duration::days(2), Some(i64::MIN)).evaluate(now, 30),
            LicenseStatus::Valid
        );
    }

    #[test]
    fn parses_json() {
        let json = format!(
            concat!(
                r#"{{"customer_id":"acme","expires_at":"2099-01-01T00:00:00Z","#,
                r#""file_protector_key":"{}"}}"#
            ),
            "ab".repeat(32)
        );
        let lic = License::from_json(json.as_bytes()).unwrap();
        assert_eq!(lic.file_protector_key().unwrap(), [0xab; 32]);
        assert!(lic.default_signing_key().unwrap().is_none());
    }

    #[test]
    fn rejects_short_key() {
        let json = concat!(
            r#"{"customer_id":"acme","expires_at":"2099-01-01T00:00:00Z","#,
            r#""file_protector_key":"abcd"}"#
        );
        let err = License::from_json(json.as_bytes()).unwrap_err();
        assert!(matches!(err, TakError::InvalidParameter(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(License::from_json(b"not json").is_err());
    }
}
