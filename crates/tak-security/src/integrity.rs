// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SHA-256 digests for device binding and certificate logging.

use sha2::{Digest, Sha256};

/// SHA-256 of `data` as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of a device fingerprint. Only this value is persisted or sent to
/// the backend.
pub fn fingerprint_hash(fingerprint: &str) -> String {
    hash_bytes(fingerprint.as_bytes())
}
