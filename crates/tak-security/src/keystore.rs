// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Software key vault and crypto provider backed by `ring` and SQLite.
//
// This is the desktop/CI stand-in for the platform key store. Key material
// is held in the database file under the working path; on devices the
// hardware-backed vault supplied by the integrator takes its place.
//
// Supported: AES-128/256-GCM, ECDSA P-256 with SHA-256, RSA PKCS#1 v1.5
// signing with imported 2048-bit keys. Everything else is `NotAvailable`.
//
// Schema:
//   keys(
//     alias       TEXT PRIMARY KEY,
//     algorithm   TEXT NOT NULL,   -- KeyAlgorithm::as_str
//     material    BLOB NOT NULL,   -- raw AES bytes or PKCS#8 DER
//     public_key  BLOB,            -- SEC1 point or RSAPublicKey DER
//     certificate TEXT,            -- PEM, attached after registration
//     created_at  TEXT NOT NULL    -- RFC 3339
//   )

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use ring::aead::{self, AES_128_GCM, AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    self, ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, KeyPair, RsaEncoding, RsaKeyPair,
};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, instrument};

use tak_bridge::{CryptoProvider, KeyVault};
use tak_core::error::{Result, TakError};
use tak_core::{
    EncryptionAlgorithm, EncryptionOutput, HashAlgorithm, KeyAlgorithm, KeyInfo, Padding,
    ProtectionLevel, SignatureAlgorithm, WrappedKey, WrappingAlgorithm,
};

/// AES-GCM tag length in bytes.
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Local error helpers
// ---------------------------------------------------------------------------

fn db_err(e: rusqlite::Error) -> TakError {
    TakError::KeyStore(e.to_string())
}

fn unsupported(what: &str) -> TakError {
    TakError::NotAvailable(format!("{what} is not supported by the software key vault"))
}

// ---------------------------------------------------------------------------
// AES-GCM primitives
// ---------------------------------------------------------------------------

fn gcm_algorithm(key_len: usize) -> Result<&'static aead::Algorithm> {
    match key_len {
        32 => Ok(&AES_256_GCM),
        16 => Ok(&AES_128_GCM),
        n => Err(TakError::invalid(format!("AES key must be 16 or 32 bytes, got {n}"))),
    }
}

fn gcm_key(key: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(gcm_algorithm(key.len())?, key)
        .map_err(|_| TakError::Encryption("invalid AES key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn gcm_seal(
    key: &[u8],
    iv: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<EncryptionOutput> {
    let key = gcm_key(key)?;
    let mut in_out = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(iv), Aad::from(aad), &mut in_out)
        .map_err(|_| TakError::Encryption("AES-GCM seal failed".into()))?;
    Ok(EncryptionOutput {
        iv: iv.to_vec(),
        aad: aad.to_vec(),
        tag: tag.as_ref().to_vec(),
        ephemeral_key: Vec::new(),
        ciphertext: in_out,
    })
}

fn gcm_open(key: &[u8], output: &EncryptionOutput) -> Result<Vec<u8>> {
    if output.iv.len() != NONCE_LEN {
        return Err(TakError::invalid(format!("IV must be {NONCE_LEN} bytes")));
    }
    if output.tag.len() != TAG_LEN {
        return Err(TakError::invalid(format!("tag must be {TAG_LEN} bytes")));
    }
    let key = gcm_key(key)?;
    let nonce = Nonce::try_assume_unique_for_key(&output.iv)
        .map_err(|_| TakError::invalid("malformed IV"))?;
    let mut in_out = Vec::with_capacity(output.ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(&output.ciphertext);
    in_out.extend_from_slice(&output.tag);
    let plaintext = key
        .open_in_place(nonce, Aad::from(output.aad.as_slice()), &mut in_out)
        .map_err(|_| TakError::Decryption("authentication failed".into()))?;
    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

struct StoredKey {
    algorithm: KeyAlgorithm,
    material: Vec<u8>,
    public_key: Option<Vec<u8>>,
}

/// `KeyVault` + `CryptoProvider` implementation in software.
pub struct SoftwareKeystore {
    db_name: String,
    conn: Mutex<Option<Connection>>,
    rng: SystemRandom,
}

impl SoftwareKeystore {
    /// A closed keystore that will use `<working_path>/<db_name>` once
    /// opened.
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            conn: Mutex::new(None),
            rng: SystemRandom::new(),
        }
    }

    /// An already-open, in-memory keystore (useful for tests and benches).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        create_schema(&conn)?;
        Ok(Self {
            db_name: String::new(),
            conn: Mutex::new(Some(conn)),
            rng: SystemRandom::new(),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock()?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| TakError::KeyStore("key vault is not open".into()))?;
        f(conn)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|_| TakError::General("system RNG failure".into()))
    }

    fn fresh_iv(&self) -> Result<[u8; NONCE_LEN]> {
        let mut iv = [0u8; NONCE_LEN];
        self.fill_random(&mut iv)?;
        Ok(iv)
    }

    fn load(&self, alias: &str) -> Result<StoredKey> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT algorithm, material, public_key FROM keys WHERE alias = ?1",
                    params![alias],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;
            let (algorithm, material, public_key) =
                row.ok_or_else(|| TakError::KeyNotFound(alias.to_string()))?;
            let algorithm = KeyAlgorithm::parse(&algorithm)
                .ok_or_else(|| TakError::KeyStore(format!("corrupt algorithm for '{alias}'")))?;
            Ok(StoredKey {
                algorithm,
                material,
                public_key,
            })
        })
    }

    fn load_symmetric(&self, alias: &str) -> Result<StoredKey> {
        let key = self.load(alias)?;
        if !key.algorithm.is_symmetric() {
            return Err(TakError::invalid(format!("key '{alias}' is not an AES key")));
        }
        Ok(key)
    }

    fn upsert(
        &self,
        alias: &str,
        algorithm: KeyAlgorithm,
        material: &[u8],
        public_key: Option<&[u8]>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO keys (alias, algorithm, material, public_key, certificate, created_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5)
                 ON CONFLICT(alias) DO UPDATE SET
                    algorithm = excluded.algorithm,
                    material = excluded.material,
                    public_key = excluded.public_key,
                    certificate = NULL,
                    created_at = excluded.created_at",
                params![alias, algorithm.as_str(), material, public_key, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Validate `material` for `algorithm` and derive its public part.
    fn derive_public(&self, algorithm: KeyAlgorithm, material: &[u8]) -> Result<Option<Vec<u8>>> {
        match algorithm {
            KeyAlgorithm::Aes256 | KeyAlgorithm::Aes128 => {
                let expected = algorithm.symmetric_len().unwrap_or_default();
                if material.len() != expected {
                    return Err(TakError::invalid(format!(
                        "{} key must be {expected} bytes, got {}",
                        algorithm.as_str(),
                        material.len()
                    )));
                }
                Ok(None)
            }
            KeyAlgorithm::EcSecp256r1 => {
                let kp =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, material, &self.rng)
                        .map_err(|e| TakError::invalid(format!("P-256 PKCS#8 rejected: {e}")))?;
                Ok(Some(kp.public_key().as_ref().to_vec()))
            }
            KeyAlgorithm::Rsa2048 => {
                let kp = RsaKeyPair::from_pkcs8(material)
                    .map_err(|e| TakError::invalid(format!("RSA PKCS#8 rejected: {e}")))?;
                if kp.public().modulus_len() != 256 {
                    return Err(TakError::invalid("RSA key is not 2048 bits"));
                }
                Ok(Some(kp.public_key().as_ref().to_vec()))
            }
            KeyAlgorithm::Rsa1024 => Err(unsupported("RSA-1024")),
        }
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS keys (
            alias       TEXT PRIMARY KEY,
            algorithm   TEXT NOT NULL,
            material    BLOB NOT NULL,
            public_key  BLOB,
            certificate TEXT,
            created_at  TEXT NOT NULL
        );",
    )
    .map_err(db_err)
}

impl KeyVault for SoftwareKeystore {
    #[instrument(skip_all, fields(path = %working_path.display()))]
    fn open(&self, working_path: &Path) -> Result<()> {
        let conn = Connection::open(working_path.join(&self.db_name)).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        create_schema(&conn)?;
        *self.conn.lock()? = Some(conn);
        debug!("software key vault opened");
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut conn) = self.conn.lock() {
            if conn.take().is_some() {
                debug!("software key vault closed");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    #[instrument(skip(self), fields(algorithm = algorithm.as_str()))]
    fn generate_key(&self, alias: &str, algorithm: KeyAlgorithm) -> Result<()> {
        let (material, public_key) = match algorithm {
            KeyAlgorithm::Aes256 | KeyAlgorithm::Aes128 => {
                let mut key = vec![0u8; algorithm.symmetric_len().unwrap_or(32)];
                self.fill_random(&mut key)?;
                (key, None)
            }
            KeyAlgorithm::EcSecp256r1 => {
                let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.rng)
                    .map_err(|e| TakError::KeyStore(format!("P-256 generation failed: {e}")))?;
                let material = doc.as_ref().to_vec();
                let public = self.derive_public(algorithm, &material)?;
                (material, public)
            }
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa1024 => {
                return Err(unsupported("RSA key generation"));
            }
        };
        self.upsert(alias, algorithm, &material, public_key.as_deref())?;
        debug!("key generated");
        Ok(())
    }

    #[instrument(skip(self, material), fields(algorithm = algorithm.as_str()))]
    fn import_key(&self, alias: &str, algorithm: KeyAlgorithm, material: &[u8]) -> Result<()> {
        let public_key = self.derive_public(algorithm, material)?;
        self.upsert(alias, algorithm, material, public_key.as_deref())?;
        debug!("key imported");
        Ok(())
    }

    #[instrument(skip(self, wrapped), fields(wrapping_key = %wrapped.wrapping_key_alias))]
    fn load_wrapped_key(&self, wrapped: &WrappedKey, alias: &str) -> Result<()> {
        let material = match wrapped.wrapping_algorithm {
            WrappingAlgorithm::AesGcm => {
                let kek = self.load_symmetric(&wrapped.wrapping_key_alias)?;
                gcm_open(&kek.material, &wrapped.wrapped)?
            }
            WrappingAlgorithm::AesCbc => return Err(unsupported("AES-CBC unwrapping")),
        };
        self.import_key(alias, wrapped.algorithm, &material)
    }

    fn public_key(&self, alias: &str) -> Result<Vec<u8>> {
        let key = self.load(alias)?;
        key.public_key
            .ok_or_else(|| TakError::invalid(format!("key '{alias}' has no public part")))
    }

    fn key_info(&self, alias: &str) -> Result<KeyInfo> {
        let key = self.load(alias)?;
        Ok(KeyInfo {
            alias: alias.to_string(),
            algorithm: key.algorithm,
            protection_level: ProtectionLevel::WrappedKey,
        })
    }

    fn contains(&self, alias: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM keys WHERE alias = ?1", params![alias], |_| Ok(()))
                .optional()
                .map_err(db_err)?;
            Ok(found.is_some())
        })
    }

    fn store_certificate(&self, alias: &str, pem: &str) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE keys SET certificate = ?2 WHERE alias = ?1",
                    params![alias, pem],
                )
                .map_err(db_err)?;
            if n == 0 {
                return Err(TakError::KeyNotFound(alias.to_string()));
            }
            Ok(())
        })
    }

    fn certificate(&self, alias: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT certificate FROM keys WHERE alias = ?1",
                params![alias],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| TakError::KeyNotFound(alias.to_string()))
        })
    }

    #[instrument(skip(self))]
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            tx.execute("DELETE FROM keys WHERE alias = ?1", params![to])
                .map_err(db_err)?;
            let n = tx
                .execute(
                    "UPDATE keys SET alias = ?2 WHERE alias = ?1",
                    params![from, to],
                )
                .map_err(db_err)?;
            if n == 0 {
                return Err(TakError::KeyNotFound(from.to_string()));
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn delete(&self, alias: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM keys WHERE alias = ?1", params![alias])
                .map_err(db_err)?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn wipe(&self) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM keys", []).map_err(db_err)?;
            debug!(removed = n, "key vault wiped");
            Ok(())
        })
    }
}

impl CryptoProvider for SoftwareKeystore {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn sign(
        &self,
        alias: &str,
        scheme: SignatureAlgorithm,
        hash: HashAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let key = self.load(alias)?;
        match (key.algorithm, scheme) {
            (KeyAlgorithm::EcSecp256r1, SignatureAlgorithm::Ecdsa) => {
                if hash != HashAlgorithm::Sha256 {
                    return Err(unsupported("ECDSA P-256 with a hash other than SHA-256"));
                }
                let kp = EcdsaKeyPair::from_pkcs8(
                    &ECDSA_P256_SHA256_ASN1_SIGNING,
                    &key.material,
                    &self.rng,
                )
                .map_err(|e| TakError::Signature(format!("key load failed: {e}")))?;
                let sig = kp
                    .sign(&self.rng, data)
                    .map_err(|e| TakError::Signature(format!("signing failed: {e}")))?;
                Ok(sig.as_ref().to_vec())
            }
            (KeyAlgorithm::Rsa2048, SignatureAlgorithm::RsaPkcs1v15) => {
                let padding: &'static dyn RsaEncoding = match hash {
                    HashAlgorithm::Sha256 => &signature::RSA_PKCS1_SHA256,
                    HashAlgorithm::Sha384 => &signature::RSA_PKCS1_SHA384,
                    HashAlgorithm::Sha512 => &signature::RSA_PKCS1_SHA512,
                    _ => return Err(unsupported("RSA PKCS#1 with this hash")),
                };
                let kp = RsaKeyPair::from_pkcs8(&key.material)
                    .map_err(|e| TakError::Signature(format!("key load failed: {e}")))?;
                let mut sig = vec![0u8; kp.public().modulus_len()];
                kp.sign(padding, &self.rng, data, &mut sig)
                    .map_err(|e| TakError::Signature(format!("signing failed: {e}")))?;
                Ok(sig)
            }
            (algorithm, _) => Err(TakError::invalid(format!(
                "key '{alias}' ({}) cannot produce a {scheme:?} signature",
                algorithm.as_str()
            ))),
        }
    }

    #[instrument(skip(self, cleartext, iv), fields(len = cleartext.len()))]
    fn encrypt(
        &self,
        alias: &str,
        algorithm: EncryptionAlgorithm,
        padding: Padding,
        cleartext: &[u8],
        iv: Option<&[u8]>,
    ) -> Result<EncryptionOutput> {
        if algorithm != EncryptionAlgorithm::AesGcm {
            return Err(unsupported(&format!("{algorithm:?} encryption")));
        }
        if padding != Padding::None {
            return Err(TakError::invalid("AES-GCM does not take padding"));
        }
        let iv = match iv {
            Some(iv) => <[u8; NONCE_LEN]>::try_from(iv)
                .map_err(|_| TakError::invalid(format!("IV must be {NONCE_LEN} bytes")))?,
            None => self.fresh_iv()?,
        };
        let key = self.load_symmetric(alias)?;
        gcm_seal(&key.material, iv, &[], cleartext)
    }

    #[instrument(skip(self, cleartext, aad), fields(len = cleartext.len()))]
    fn encrypt_aead(&self, alias: &str, cleartext: &[u8], aad: &[u8]) -> Result<EncryptionOutput> {
        let key = self.load_symmetric(alias)?;
        gcm_seal(&key.material, self.fresh_iv()?, aad, cleartext)
    }

    #[instrument(skip(self, output), fields(len = output.ciphertext.len()))]
    fn decrypt(
        &self,
        alias: &str,
        algorithm: EncryptionAlgorithm,
        padding: Padding,
        output: &EncryptionOutput,
    ) -> Result<Vec<u8>> {
        if algorithm != EncryptionAlgorithm::AesGcm {
            return Err(unsupported(&format!("{algorithm:?} decryption")));
        }
        if padding != Padding::None {
            return Err(TakError::invalid("AES-GCM does not take padding"));
        }
        let key = self.load_symmetric(alias)?;
        gcm_open(&key.material, output)
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.fill_random(&mut buf)?;
        Ok(buf)
    }

    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<EncryptionOutput> {
        gcm_seal(key, self.fresh_iv()?, aad, plaintext)
    }

    fn open(&self, key: &[u8], output: &EncryptionOutput) -> Result<Vec<u8>> {
        gcm_open(key, output)
    }
}
