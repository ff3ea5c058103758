// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the trusted application kit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TakError};

/// Trust state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No live session. `initialize` is the only legal transition.
    Uninitialized,
    /// License accepted, no device identity.
    Initialized,
    /// Device identity established with the backend.
    Registered,
    /// Registered, but suspended by the backend or the runtime monitor.
    Locked,
    /// The client certificate expired. A new `register` is required.
    CertificateExpired,
    /// All device data was erased by the backend. A fresh `register` is required.
    Wiped,
}

impl SessionState {
    /// Every state except `Uninitialized` belongs to a live session.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Uninitialized)
    }

    /// Identity material exists (possibly suspended).
    pub fn has_identity(self) -> bool {
        matches!(self, Self::Registered | Self::Locked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Registered => "registered",
            Self::Locked => "locked",
            Self::CertificateExpired => "certificate_expired",
            Self::Wiped => "wiped",
        }
    }

    /// Inverse of [`SessionState::as_str`], used when restoring persisted state.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "uninitialized" => Self::Uninitialized,
            "initialized" => Self::Initialized,
            "registered" => Self::Registered,
            "locked" => Self::Locked,
            "certificate_expired" => Self::CertificateExpired,
            "wiped" => Self::Wiped,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-issued device identifier. Always a version 4 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a backend-supplied identifier, rejecting anything but UUIDv4.
    pub fn parse_v4(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s.trim())
            .map_err(|e| TakError::InvalidServerResponse(format!("device id: {e}")))?;
        if uuid.get_version_num() != 4 {
            return Err(TakError::InvalidServerResponse(format!(
                "device id is UUID version {}, expected 4",
                uuid.get_version_num()
            )));
        }
        Ok(Self(uuid))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved key vault aliases.
pub mod alias {
    /// Customer-wide signing key, provisioned with the license.
    pub const DEFAULT_CLIENT_PRIVATE: &str = "default-client-private";
    /// Customer-wide key-encryption key used by the file protector.
    pub const DEFAULT_CLIENT_ENCRYPTION: &str = "default-client-encryption";
    /// Per-device signing key, created at registration.
    pub const INDIVIDUAL_CLIENT_PRIVATE: &str = "individual-client-private";
    /// Per-device encryption key, created at registration.
    pub const INDIVIDUAL_CLIENT_ENCRYPTION: &str = "individual-client-encryption";

    /// Prefix of aliases the library manages internally.
    pub const INTERNAL_PREFIX: &str = "tak.";

    pub const RESERVED: [&str; 4] = [
        DEFAULT_CLIENT_PRIVATE,
        DEFAULT_CLIENT_ENCRYPTION,
        INDIVIDUAL_CLIENT_PRIVATE,
        INDIVIDUAL_CLIENT_ENCRYPTION,
    ];

    /// Whether user code is forbidden from creating a key under `alias`.
    pub fn is_reserved(alias: &str) -> bool {
        RESERVED.contains(&alias) || alias.starts_with(INTERNAL_PREFIX)
    }

    /// Individual-client aliases only exist while registered.
    pub fn is_individual(alias: &str) -> bool {
        alias == INDIVIDUAL_CLIENT_PRIVATE || alias == INDIVIDUAL_CLIENT_ENCRYPTION
    }

    /// Staging alias used while a registration is in flight.
    pub fn staging(alias: &str) -> String {
        format!("{INTERNAL_PREFIX}staging.{alias}")
    }

    /// Vault alias of the data key protecting secure store `store`.
    pub fn storage_key(store: &str) -> String {
        format!("{INTERNAL_PREFIX}storage.{store}")
    }

    /// Validate a user-supplied alias: non-empty, no NUL, not reserved.
    pub fn validate_user(alias: &str) -> crate::Result<()> {
        if alias.is_empty() || alias.contains('\0') {
            return Err(crate::TakError::invalid("alias must be a non-empty string"));
        }
        if is_reserved(alias) {
            return Err(crate::TakError::invalid(format!("alias '{alias}' is reserved")));
        }
        Ok(())
    }
}

/// Key algorithms understood by the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum KeyAlgorithm {
    Aes256 = 0,
    Rsa2048 = 1,
    Rsa1024 = 2,
    EcSecp256r1 = 3,
    Aes128 = 4,
}

impl KeyAlgorithm {
    pub fn from_raw(raw: i32) -> Result<Self> {
        Ok(match raw {
            0 => Self::Aes256,
            1 => Self::Rsa2048,
            2 => Self::Rsa1024,
            3 => Self::EcSecp256r1,
            4 => Self::Aes128,
            _ => return Err(TakError::invalid(format!("unknown key algorithm {raw}"))),
        })
    }

    pub fn is_symmetric(self) -> bool {
        matches!(self, Self::Aes256 | Self::Aes128)
    }

    /// Raw key length in bytes for symmetric algorithms.
    pub fn symmetric_len(self) -> Option<usize> {
        match self {
            Self::Aes256 => Some(32),
            Self::Aes128 => Some(16),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256 => "aes-256",
            Self::Rsa2048 => "rsa-2048",
            Self::Rsa1024 => "rsa-1024",
            Self::EcSecp256r1 => "ec-secp256r1",
            Self::Aes128 => "aes-128",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "aes-256" => Self::Aes256,
            "rsa-2048" => Self::Rsa2048,
            "rsa-1024" => Self::Rsa1024,
            "ec-secp256r1" => Self::EcSecp256r1,
            "aes-128" => Self::Aes128,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum SignatureAlgorithm {
    RsaPkcs1v15 = 0,
    Ecdsa = 1,
}

impl SignatureAlgorithm {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::RsaPkcs1v15),
            1 => Ok(Self::Ecdsa),
            _ => Err(TakError::invalid(format!("unknown signature algorithm {raw}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum HashAlgorithm {
    None = 0,
    Sha224 = 1,
    Sha256 = 2,
    Sha384 = 3,
    Sha512 = 4,
}

impl HashAlgorithm {
    pub fn from_raw(raw: i32) -> Result<Self> {
        Ok(match raw {
            0 => Self::None,
            1 => Self::Sha224,
            2 => Self::Sha256,
            3 => Self::Sha384,
            4 => Self::Sha512,
            _ => return Err(TakError::invalid(format!("unknown hash algorithm {raw}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum EncryptionAlgorithm {
    AesGcm = 0,
    AesEcb = 1,
    AesCbc = 2,
    Ecies = 3,
}

impl EncryptionAlgorithm {
    pub fn from_raw(raw: i32) -> Result<Self> {
        Ok(match raw {
            0 => Self::AesGcm,
            1 => Self::AesEcb,
            2 => Self::AesCbc,
            3 => Self::Ecies,
            _ => return Err(TakError::invalid(format!("unknown encryption algorithm {raw}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum Padding {
    #[default]
    None = 0,
    Pkcs5 = 1,
}

impl Padding {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Pkcs5),
            _ => Err(TakError::invalid(format!("unknown padding {raw}"))),
        }
    }
}

/// Where a key's material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ProtectionLevel {
    WrappedKey = 0,
    WbcExportedObject = 1,
    WbcCommonObject = 2,
    HardwareBackedRef = 3,
    StrongboxRef = 4,
    SecureEnclaveRef = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum WrappingAlgorithm {
    AesCbc = 0,
    AesGcm = 1,
}

impl WrappingAlgorithm {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::AesCbc),
            1 => Ok(Self::AesGcm),
            _ => Err(TakError::invalid(format!("unknown wrapping algorithm {raw}"))),
        }
    }
}

/// Coarse device compromise verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum RootStatus {
    #[default]
    NotRooted = 0,
    MaybeRooted = 1,
    LikelyRooted = 2,
    Rooted = 3,
}

/// Reason the runtime monitor is about to terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RuntimeCrashReason {
    DebuggerDetected = 0,
    RootDetected = 1,
    HookingDetected = 2,
    EmulatorDetected = 3,
    AppRepackagingDetected = 4,
    TamperingDetected = 5,
}

impl RuntimeCrashReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DebuggerDetected => "RUNTIME_DEBUGGER_DETECTED",
            Self::RootDetected => "RUNTIME_ROOT_DETECTED",
            Self::HookingDetected => "RUNTIME_HOOKING_DETECTED",
            Self::EmulatorDetected => "RUNTIME_EMULATOR_DETECTED",
            Self::AppRepackagingDetected => "RUNTIME_APP_REPACKAGING_DETECTED",
            Self::TamperingDetected => "RUNTIME_TAMPERING_DETECTED",
        }
    }
}

impl std::fmt::Display for RuntimeCrashReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a key held in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub alias: String,
    pub algorithm: KeyAlgorithm,
    pub protection_level: ProtectionLevel,
}

/// Output of an encryption, regardless of algorithm. Fields that do not
/// apply to the algorithm are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionOutput {
    pub iv: Vec<u8>,
    pub aad: Vec<u8>,
    pub tag: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Key material encrypted under another vault key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub wrapped: EncryptionOutput,
    pub algorithm: KeyAlgorithm,
    pub wrapping_algorithm: WrappingAlgorithm,
    pub wrapping_key_alias: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_requires_v4() {
        let id = DeviceId::new();
        assert_eq!(DeviceId::parse_v4(&id.to_string()).unwrap(), id);

        // Version 1 UUID.
        let err = DeviceId::parse_v4("c232ab00-9414-11ec-b3c8-9f6bdeced846").unwrap_err();
        assert!(matches!(err, TakError::InvalidServerResponse(_)));

        assert!(DeviceId::parse_v4("not-a-uuid").is_err());
    }

    #[test]
    fn reserved_aliases() {
        for a in alias::RESERVED {
            assert!(alias::is_reserved(a));
        }
        assert!(alias::is_reserved(&alias::storage_key("vault")));
        assert!(alias::is_reserved(&alias::staging(alias::INDIVIDUAL_CLIENT_PRIVATE)));
        assert!(!alias::is_reserved("my-key"));

        assert!(alias::validate_user("my-key").is_ok());
        assert!(alias::validate_user("").is_err());
        assert!(alias::validate_user(alias::DEFAULT_CLIENT_PRIVATE).is_err());
    }

    #[test]
    fn individual_aliases() {
        assert!(alias::is_individual(alias::INDIVIDUAL_CLIENT_ENCRYPTION));
        assert!(!alias::is_individual(alias::DEFAULT_CLIENT_ENCRYPTION));
    }

    #[test]
    fn state_names_round_trip() {
        for s in [
            SessionState::Uninitialized,
            SessionState::Initialized,
            SessionState::Registered,
            SessionState::Locked,
            SessionState::CertificateExpired,
            SessionState::Wiped,
        ] {
            assert_eq!(SessionState::parse(s.as_str()), Some(s));
        }
        assert!(!SessionState::Uninitialized.is_live());
        assert!(SessionState::Locked.has_identity());
    }

    #[test]
    fn key_algorithm_raw_values() {
        assert_eq!(KeyAlgorithm::from_raw(3).unwrap(), KeyAlgorithm::EcSecp256r1);
        assert!(KeyAlgorithm::from_raw(9).is_err());
        assert_eq!(KeyAlgorithm::Aes128.symmetric_len(), Some(16));
        assert_eq!(KeyAlgorithm::parse("aes-256"), Some(KeyAlgorithm::Aes256));
    }
}
