// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cryptographic capability seams.
//
// `CryptoProvider` performs operations with keys it never hands out;
// `KeyVault` owns the key material and its aliases. On mobile both are
// backed by the platform key store; desktop and CI use the software
// keystore in `tak-security`.

use std::path::Path;

use tak_core::error::Result;
use tak_core::{
    EncryptionAlgorithm, EncryptionOutput, HashAlgorithm, KeyAlgorithm, KeyInfo, Padding,
    SignatureAlgorithm, WrappedKey,
};

/// Signing, encryption, and randomness.
pub trait CryptoProvider: Send + Sync {
    /// Hash `data` with `hash` and sign the digest with the key at `alias`.
    fn sign(
        &self,
        alias: &str,
        signature: SignatureAlgorithm,
        hash: HashAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>>;

    /// Encrypt under the key at `alias`. A caller-supplied `iv` is used
    /// verbatim; otherwise a fresh one is generated.
    fn encrypt(
        &self,
        alias: &str,
        algorithm: EncryptionAlgorithm,
        padding: Padding,
        cleartext: &[u8],
        iv: Option<&[u8]>,
    ) -> Result<EncryptionOutput>;

    /// AES-GCM under the key at `alias`, authenticating `aad` alongside the
    /// ciphertext. The returned output carries `aad` so that `decrypt`
    /// verifies it.
    fn encrypt_aead(&self, alias: &str, cleartext: &[u8], aad: &[u8])
    -> Result<EncryptionOutput>;

    /// Reverse of `encrypt`. Authentication failures never release plaintext.
    fn decrypt(
        &self,
        alias: &str,
        algorithm: EncryptionAlgorithm,
        padding: Padding,
        output: &EncryptionOutput,
    ) -> Result<Vec<u8>>;

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>>;

    /// AES-GCM with a raw key that never enters the vault.
    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<EncryptionOutput>;

    /// Reverse of `seal`, authenticating `output.aad`.
    fn open(&self, key: &[u8], output: &EncryptionOutput) -> Result<Vec<u8>>;
}

/// Alias-addressed key store.
///
/// The vault enforces no alias policy of its own; reserved-alias rules are
/// applied by the session before it reaches here.
pub trait KeyVault: Send + Sync {
    /// Open (or create) the backing store under `working_path`.
    fn open(&self, working_path: &Path) -> Result<()>;

    /// Release the backing store. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn generate_key(&self, alias: &str, algorithm: KeyAlgorithm) -> Result<()>;

    /// Store existing material (raw AES bytes or a PKCS#8 document),
    /// replacing any key already under `alias`.
    fn import_key(&self, alias: &str, algorithm: KeyAlgorithm, material: &[u8]) -> Result<()>;

    /// Unwrap `wrapped` with the key it names and store the result under
    /// `alias`.
    fn load_wrapped_key(&self, wrapped: &WrappedKey, alias: &str) -> Result<()>;

    fn public_key(&self, alias: &str) -> Result<Vec<u8>>;

    fn key_info(&self, alias: &str) -> Result<KeyInfo>;

    fn contains(&self, alias: &str) -> Result<bool>;

    /// Attach a PEM certificate to the key at `alias`.
    fn store_certificate(&self, alias: &str, pem: &str) -> Result<()>;

    fn certificate(&self, alias: &str) -> Result<Option<String>>;

    /// Move a key (and its certificate) to a new alias, replacing whatever
    /// was there. Used to promote staged registration keys.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove the key at `alias`. Absent aliases are not an error.
    fn delete(&self, alias: &str) -> Result<()>;

    /// Erase every key.
    fn wipe(&self) -> Result<()>;
}
