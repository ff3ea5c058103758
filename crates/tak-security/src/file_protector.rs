// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// File protector: envelope encryption for bundled assets and payloads.
//
// Each call draws a fresh 32-byte content key, encrypts the payload with it
// (AES-256-GCM), and wraps the content key under the customer key-encryption
// key held in the vault. The content key never enters the vault.
//
// Layout:
//
//   "TFP1" | wrap iv (12) | wrap tag (16) | wrapped key (32)
//          | iv (12)      | tag (16)      | ciphertext (n)

use std::sync::Arc;

use tracing::{debug, instrument};

use tak_bridge::{BundledAssets, CryptoProvider};
use tak_core::error::{Result, TakError};
use tak_core::{EncryptionAlgorithm, EncryptionOutput, Padding, alias};

const MAGIC: &[u8; 4] = b"TFP1";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Size of everything before the ciphertext.
pub const HEADER_LEN: usize = MAGIC.len() + IV_LEN + TAG_LEN + KEY_LEN + IV_LEN + TAG_LEN;

/// Stateless envelope encryption under `DEFAULT_CLIENT_ENCRYPTION`.
pub struct FileProtector {
    crypto: Arc<dyn CryptoProvider>,
}

impl FileProtector {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto }
    }

    #[instrument(skip_all, fields(len = cleartext.len()))]
    pub fn encrypt(&self, cleartext: &[u8]) -> Result<Vec<u8>> {
        let content_key = self.crypto.random_bytes(KEY_LEN)?;
        let wrap = self.crypto.encrypt(
            alias::DEFAULT_CLIENT_ENCRYPTION,
            EncryptionAlgorithm::AesGcm,
            Padding::None,
            &content_key,
            None,
        )?;
        let body = self.crypto.seal(&content_key, cleartext, MAGIC)?;

        check_len("wrap iv", &wrap.iv, IV_LEN)?;
        check_len("wrap tag", &wrap.tag, TAG_LEN)?;
        check_len("wrapped key", &wrap.ciphertext, KEY_LEN)?;
        check_len("iv", &body.iv, IV_LEN)?;
        check_len("tag", &body.tag, TAG_LEN)?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&wrap.iv);
        out.extend_from_slice(&wrap.tag);
        out.extend_from_slice(&wrap.ciphertext);
        out.extend_from_slice(&body.iv);
        out.extend_from_slice(&body.tag);
        out.extend_from_slice(&body.ciphertext);
        debug!(out_len = out.len(), "payload protected");
        Ok(out)
    }

    /// Reverse of [`encrypt`](Self::encrypt). Malformed input is
    /// `InvalidParameter`; any authentication failure is `Decryption` and
    /// releases nothing.
    #[instrument(skip_all, fields(len = input.len()))]
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() < HEADER_LEN {
            return Err(TakError::invalid(format!(
                "protected payload is {} bytes, shorter than the {HEADER_LEN}-byte header",
                input.len()
            )));
        }
        let (magic, rest) = input.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(TakError::invalid("not a protected payload"));
        }
        let (wrap_iv, rest) = rest.split_at(IV_LEN);
        let (wrap_tag, rest) = rest.split_at(TAG_LEN);
        let (wrapped_key, rest) = rest.split_at(KEY_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let content_key = self.crypto.decrypt(
            alias::DEFAULT_CLIENT_ENCRYPTION,
            EncryptionAlgorithm::AesGcm,
            Padding::None,
            &EncryptionOutput {
                iv: wrap_iv.to_vec(),
                tag: wrap_tag.to_vec(),
                ciphertext: wrapped_key.to_vec(),
                ..EncryptionOutput::default()
            },
        )?;

        let plaintext = self.crypto.open(
            &content_key,
            &EncryptionOutput {
                iv: iv.to_vec(),
                aad: MAGIC.to_vec(),
                tag: tag.to_vec(),
                ciphertext: ciphertext.to_vec(),
                ..EncryptionOutput::default()
            },
        )?;
        debug!(out_len = plaintext.len(), "payload recovered");
        Ok(plaintext)
    }

    /// Decrypt the bundled asset `<name>.<extension>`.
    pub fn decrypt_asset<A: BundledAssets + ?Sized>(
        &self,
        assets: &A,
        name: &str,
        extension: &str,
    ) -> Result<Vec<u8>> {
        if name.is_empty() {
            return Err(TakError::invalid("asset name must not be empty"));
        }
        let file = if extension.is_empty() {
            name.to_string()
        } else {
            format!("{name}.{extension}")
        };
        let bytes = assets
            .open_asset(&file)?
            .ok_or_else(|| TakError::invalid(format!("asset '{file}' not found")))?;
        self.decrypt(&bytes)
    }
}

fn check_len(what: &str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(TakError::Encryption(format!(
            "{what} is {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::SoftwareKeystore;
    use tak_bridge::KeyVault;
    use tak_bridge::testing::FakeHost;
    use tak_core::{KeyAlgorithm, StatusCode};

    fn protector() -> (Arc<SoftwareKeystore>, FileProtector) {
        let ks = Arc::new(SoftwareKeystore::in_memory().unwrap());
        ks.import_key(alias::DEFAULT_CLIENT_ENCRYPTION, KeyAlgorithm::Aes256, &[0x11; 32])
            .unwrap();
        let fp = FileProtector::new(ks.clone());
        (ks, fp)
    }

    #[test]
    fn round_trip() {
        let (_, fp) = protector();
        for payload in [&b""[..], &b"x"[..], &[0xA5; 4096][..]] {
            let sealed = fp.encrypt(payload).unwrap();
            assert_eq!(sealed.len(), HEADER_LEN + payload.len());
            assert_eq!(&sealed[..4], MAGIC);
            assert_eq!(fp.decrypt(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn fresh_key_per_call() {
        let (_, fp) = protector();
        assert_ne!(fp.encrypt(b"same").unwrap(), fp.encrypt(b"same").unwrap());
    }

    #[test]
    fn truncated_or_foreign_input_is_invalid_parameter() {
        let (_, fp) = protector();
        let sealed = fp.encrypt(b"payload").unwrap();
        let err = fp.decrypt(&sealed[..HEADER_LEN - 1]).unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidParameter);

        let mut foreign = sealed.clone();
        foreign[0] = b'X';
        assert_eq!(fp.decrypt(&foreign).unwrap_err().status(), StatusCode::InvalidParameter);
    }

    #[test]
    fn tampering_is_general_error() {
        let (_, fp) = protector();
        let mut sealed = fp.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        let err = fp.decrypt(&sealed).unwrap_err();
        assert_eq!(err.status(), StatusCode::GeneralError);

        let mut wrapped = fp.encrypt(b"payload").unwrap();
        wrapped[40] ^= 0x01;
        assert_eq!(fp.decrypt(&wrapped).unwrap_err().status(), StatusCode::GeneralError);
    }

    #[test]
    fn other_customer_key_cannot_decrypt() {
        let (_, fp) = protector();
        let sealed = fp.encrypt(b"payload").unwrap();

        let other = Arc::new(SoftwareKeystore::in_memory().unwrap());
        other
            .import_key(alias::DEFAULT_CLIENT_ENCRYPTION, KeyAlgorithm::Aes256, &[0x22; 32])
            .unwrap();
        let err = FileProtector::new(other).decrypt(&sealed).unwrap_err();
        assert!(matches!(err, TakError::Decryption(_)));
    }

    #[test]
    fn decrypts_named_asset() {
        let (_, fp) = protector();
        let host = FakeHost::new();
        host.add_asset("config.bin", fp.encrypt(b"bundled").unwrap());

        assert_eq!(fp.decrypt_asset(&host, "config", "bin").unwrap(), b"bundled");
        let err = fp.decrypt_asset(&host, "absent", "bin").unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidParameter);
    }
}
