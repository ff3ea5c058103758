// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Secure storage: named, encrypted key-value stores bound to the device.
//
// Each store has its own AES-256 data key in the vault under
// `tak.storage.<name>`. Values are sealed with AES-GCM; the associated data
// is `store || 0x00 || key`, so a ciphertext cannot be replayed under
// another entry. The database records the SHA-256 of the device
// fingerprint it was created on; when that changes every store is deleted.
//
// Schema:
//   device(id = 1, fingerprint_hash TEXT NOT NULL)
//   stores(name TEXT PRIMARY KEY, created_at TEXT NOT NULL)
//   entries(
//     store      TEXT NOT NULL REFERENCES stores(name) ON DELETE CASCADE,
//     key        TEXT NOT NULL,
//     iv         BLOB NOT NULL,
//     tag        BLOB NOT NULL,
//     ciphertext BLOB NOT NULL,
//     updated_at TEXT NOT NULL,
//     PRIMARY KEY (store, key)
//   )

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument, warn};

use tak_bridge::{CryptoProvider, KeyVault};
use tak_core::error::{Result, TakError};
use tak_core::{EncryptionAlgorithm, EncryptionOutput, KeyAlgorithm, Padding, alias};

/// Convert a `rusqlite::Error` into a `TakError::Database`.
fn db_err(e: rusqlite::Error) -> TakError {
    TakError::Database(e.to_string())
}

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS device (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        fingerprint_hash TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS stores (
        name       TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS entries (
        store      TEXT NOT NULL REFERENCES stores(name) ON DELETE CASCADE,
        key        TEXT NOT NULL,
        iv         BLOB NOT NULL,
        tag        BLOB NOT NULL,
        ciphertext BLOB NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (store, key)
    );";

fn entry_aad(store: &str, key: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(store.len() + key.len() + 1);
    aad.extend_from_slice(store.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key.as_bytes());
    aad
}

fn validate(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('\0') {
        return Err(TakError::invalid(format!("{what} must be a non-empty string")));
    }
    Ok(())
}

/// Device-bound encrypted key-value stores.
pub struct SecureStorage {
    conn: Mutex<Connection>,
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
    vault: Arc<dyn KeyVault>,
    crypto: Arc<dyn CryptoProvider>,
}

impl SecureStorage {
    /// Open (or create) the storage database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(
        path: impl AsRef<Path>,
        vault: Arc<dyn KeyVault>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        Self::with_connection(conn, vault, crypto)
    }

    /// In-memory storage (useful for tests).
    pub fn open_in_memory(
        vault: Arc<dyn KeyVault>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn, vault, crypto)
    }

    fn with_connection(
        conn: Connection,
        vault: Arc<dyn KeyVault>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!("secure storage opened");
        Ok(Self {
            conn: Mutex::new(conn),
            locks: Mutex::new(HashMap::new()),
            vault,
            crypto,
        })
    }

    /// Per-name lock. An entry lives as long as someone holds it; dead
    /// entries are pruned whenever a new one is made.
    fn store_lock(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock()?;
        if let Some(lock) = locks.get(name).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(name.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    fn store_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock()?;
        let found = conn
            .query_row("SELECT 1 FROM stores WHERE name = ?1", params![name], |_| Ok(()))
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    fn require_store(&self, name: &str) -> Result<()> {
        if self.store_exists(name)? {
            Ok(())
        } else {
            Err(TakError::StorageNotFound(name.to_string()))
        }
    }

    /// Bind the storage to `fingerprint_hash` on first use, and delete every
    /// store when a different device shows up.
    #[instrument(skip_all)]
    pub fn verify_device(&self, fingerprint_hash: &str) -> Result<()> {
        let bound: Option<String> = {
            let conn = self.conn.lock()?;
            conn.query_row("SELECT fingerprint_hash FROM device WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?
        };

        match bound {
            Some(hash) if hash == fingerprint_hash => Ok(()),
            Some(_) => {
                warn!("device fingerprint changed; deleting all secure stores");
                self.wipe_all()?;
                self.bind(fingerprint_hash)?;
                Err(TakError::StorageDeviceMismatch)
            }
            None => self.bind(fingerprint_hash),
        }
    }

    fn bind(&self, fingerprint_hash: &str) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO device (id, fingerprint_hash) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET fingerprint_hash = excluded.fingerprint_hash",
            params![fingerprint_hash],
        )
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str) -> Result<()> {
        validate("storage name", name)?;
        let lock = self.store_lock(name)?;
        let _guard = lock.lock()?;

        if self.store_exists(name)? {
            return Err(TakError::StorageAlreadyExists(name.to_string()));
        }

        let key_alias = alias::storage_key(name);
        self.vault.generate_key(&key_alias, KeyAlgorithm::Aes256)?;

        let inserted = {
            let conn = self.conn.lock()?;
            conn.execute(
                "INSERT INTO stores (name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)
        };
        if let Err(e) = inserted {
            if let Err(rollback) = self.vault.delete(&key_alias) {
                warn!(alias = %key_alias, "failed to discard store key: {rollback}");
            }
            return Err(e);
        }

        info!("secure store created");
        Ok(())
    }

    /// Insert or replace one entry. A single SQL upsert, so concurrent
    /// writers leave exactly one of their values.
    #[instrument(skip(self, value), fields(len = value.len()))]
    pub fn write(&self, name: &str, key: &str, value: &[u8]) -> Result<()> {
        validate("storage name", name)?;
        validate("storage key", key)?;
        let lock = self.store_lock(name)?;
        let _guard = lock.lock()?;
        self.require_store(name)?;

        let sealed = self
            .crypto
            .encrypt_aead(&alias::storage_key(name), value, &entry_aad(name, key))?;

        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO entries (store, key, iv, tag, ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(store, key) DO UPDATE SET
                iv = excluded.iv,
                tag = excluded.tag,
                ciphertext = excluded.ciphertext,
                updated_at = excluded.updated_at",
            params![
                name,
                key,
                sealed.iv,
                sealed.tag,
                sealed.ciphertext,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        debug!("entry written");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn read(&self, name: &str, key: &str) -> Result<Vec<u8>> {
        validate("storage name", name)?;
        validate("storage key", key)?;
        let lock = self.store_lock(name)?;
        let _guard = lock.lock()?;
        self.require_store(name)?;

        let row = {
            let conn = self.conn.lock()?;
            conn.query_row(
                "SELECT iv, tag, ciphertext FROM entries WHERE store = ?1 AND key = ?2",
                params![name, key],
                |row| {
                    Ok(EncryptionOutput {
                        iv: row.get(0)?,
                        tag: row.get(1)?,
                        ciphertext: row.get(2)?,
                        ..EncryptionOutput::default()
                    })
                },
            )
            .optional()
            .map_err(db_err)?
        };
        let mut sealed = row.ok_or_else(|| TakError::StorageKeyNotFound {
            store: name.to_string(),
            key: key.to_string(),
        })?;
        sealed.aad = entry_aad(name, key);

        self.crypto.decrypt(
            &alias::storage_key(name),
            EncryptionAlgorithm::AesGcm,
            Padding::None,
            &sealed,
        )
    }

    /// Remove one entry. Absent keys are not an error.
    #[instrument(skip(self))]
    pub fn delete_entry(&self, name: &str, key: &str) -> Result<()> {
        validate("storage name", name)?;
        validate("storage key", key)?;
        let lock = self.store_lock(name)?;
        let _guard = lock.lock()?;
        self.require_store(name)?;

        let conn = self.conn.lock()?;
        let n = conn
            .execute(
                "DELETE FROM entries WHERE store = ?1 AND key = ?2",
                params![name, key],
            )
            .map_err(db_err)?;
        debug!(removed = n, "entry deleted");
        Ok(())
    }

    /// Remove a store, its entries, and its data key.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str) -> Result<()> {
        validate("storage name", name)?;
        let lock = self.store_lock(name)?;
        let _guard = lock.lock()?;

        let n = {
            let conn = self.conn.lock()?;
            conn.execute("DELETE FROM stores WHERE name = ?1", params![name])
                .map_err(db_err)?
        };
        if n == 0 {
            return Err(TakError::StorageNotFound(name.to_string()));
        }
        self.vault.delete(&alias::storage_key(name))?;
        info!("secure store deleted");
        Ok(())
    }

    pub fn store_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare("SELECT name FROM stores ORDER BY name")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(db_err)?);
        }
        Ok(names)
    }

    /// Delete every store, every data key, and the device binding.
    #[instrument(skip(self))]
    pub fn wipe_all(&self) -> Result<()> {
        let names = self.store_names()?;
        {
            let conn = self.conn.lock()?;
            conn.execute_batch("DELETE FROM entries; DELETE FROM stores; DELETE FROM device;")
                .map_err(db_err)?;
        }
        for name in &names {
            self.vault.delete(&alias::storage_key(name))?;
        }
        self.locks.lock()?.retain(|_, lock| lock.strong_count() > 0);
        info!(stores = names.len(), "secure storage wiped");
        Ok(())
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }
}
