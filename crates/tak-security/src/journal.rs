// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session journal: the persisted device identity plus an append-only log of
// trust-state transitions.
//
// Schema:
//   identity(
//     id               INTEGER PRIMARY KEY CHECK (id = 1),
//     state            TEXT NOT NULL,   -- SessionState::as_str
//     device_id        TEXT NOT NULL,   -- UUIDv4
//     fingerprint_hash TEXT NOT NULL,   -- SHA-256 hex of the fingerprint
//     registered_at    TEXT NOT NULL    -- RFC 3339
//   )
//   transitions(
//     id         INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp  TEXT NOT NULL,
//     from_state TEXT NOT NULL,
//     to_state   TEXT NOT NULL,
//     event      TEXT NOT NULL,
//     details    TEXT
//   )

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use tak_core::error::{Result, TakError};
use tak_core::{DeviceId, SessionState};

// ---------------------------------------------------------------------------
// Local error helpers
// ---------------------------------------------------------------------------

/// Convert a `rusqlite::Error` into a `TakError::Database`.
fn db_err(e: rusqlite::Error) -> TakError {
    TakError::Database(e.to_string())
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identity (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        state            TEXT NOT NULL,
        device_id        TEXT NOT NULL,
        fingerprint_hash TEXT NOT NULL,
        registered_at    TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS transitions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp  TEXT NOT NULL,
        from_state TEXT NOT NULL,
        to_state   TEXT NOT NULL,
        event      TEXT NOT NULL,
        details    TEXT
    );";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Identity that survives a process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    /// `Registered` or `Locked`.
    pub state: SessionState,
    pub device_id: DeviceId,
    pub fingerprint_hash: String,
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub id: i64,
    pub timestamp: String,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub details: Option<String>,
}

/// SQLite-backed identity record and transition log.
pub struct SessionJournal {
    conn: Mutex<Connection>,
}

impl SessionJournal {
    /// Open (or create) the journal database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!("session journal opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory journal (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The persisted identity, if any. Rows that no longer parse are
    /// treated as absent.
    pub fn load_identity(&self) -> Result<Option<PersistedIdentity>> {
        let conn = self.conn.lock()?;
        let row = conn
            .query_row(
                "SELECT state, device_id, fingerprint_hash FROM identity WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((state, device_id, fingerprint_hash)) = row else {
            return Ok(None);
        };
        let state = SessionState::parse(&state).filter(|s| s.has_identity());
        let device_id = DeviceId::parse_v4(&device_id).ok();
        match (state, device_id) {
            (Some(state), Some(device_id)) => Ok(Some(PersistedIdentity {
                state,
                device_id,
                fingerprint_hash,
            })),
            _ => {
                warn!("ignoring unreadable persisted identity");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, fields(state = %identity.state, device_id = %identity.device_id))]
    pub fn save_identity(&self, identity: &PersistedIdentity) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO identity (id, state, device_id, fingerprint_hash, registered_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                device_id = excluded.device_id,
                fingerprint_hash = excluded.fingerprint_hash,
                registered_at = CASE
                    WHEN identity.device_id = excluded.device_id THEN identity.registered_at
                    ELSE excluded.registered_at
                END",
            params![
                identity.state.as_str(),
                identity.device_id.to_string(),
                identity.fingerprint_hash,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        debug!("identity persisted");
        Ok(())
    }

    pub fn clear_identity(&self) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM identity", []).map_err(db_err)?;
        debug!("identity cleared");
        Ok(())
    }

    /// Append one transition to the log.
    #[instrument(skip(self, details), fields(%from, %to, %event))]
    pub fn record(
        &self,
        from: SessionState,
        to: SessionState,
        event: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO transitions (timestamp, from_state, to_state, event, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Utc::now().to_rfc3339(), from.as_str(), to.as_str(), event, details],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// The most recent `limit` transitions, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<TransitionEntry>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, from_state, to_state, event, details
                 FROM transitions
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(TransitionEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    from_state: row.get(2)?,
                    to_state: row.get(3)?,
                    event: row.get(4)?,
                    details: row.get(5)?,
                })
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(state: SessionState) -> PersistedIdentity {
        PersistedIdentity {
            state,
            device_id: DeviceId::new(),
            fingerprint_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn identity_round_trip() {
        let journal = SessionJournal::open_in_memory().unwrap();
        assert!(journal.load_identity().unwrap().is_none());

        let id = identity(SessionState::Registered);
        journal.save_identity(&id).unwrap();
        assert_eq!(journal.load_identity().unwrap(), Some(id.clone()));

        let locked = PersistedIdentity {
            state: SessionState::Locked,
            ..id
        };
        journal.save_identity(&locked).unwrap();
        assert_eq!(journal.load_identity().unwrap().unwrap().state, SessionState::Locked);

        journal.clear_identity().unwrap();
        assert!(journal.load_identity().unwrap().is_none());
    }

    #[test]
    fn history_is_newest_first() {
        let journal = SessionJournal::open_in_memory().unwrap();
        journal
            .record(SessionState::Uninitialized, SessionState::Initialized, "initialized", None)
            .unwrap();
        journal
            .record(
                SessionState::Initialized,
                SessionState::Registered,
                "registered",
                Some("device"),
            )
            .unwrap();

        let entries = journal.history(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "registered");
        assert_eq!(entries[0].details.as_deref(), Some("device"));
        assert_eq!(entries[1].to_state, "initialized");

        assert_eq!(journal.history(1).unwrap().len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");
        let id = identity(SessionState::Registered);
        {
            let journal = SessionJournal::open(&path).unwrap();
            journal.save_identity(&id).unwrap();
        }
        let journal = SessionJournal::open(&path).unwrap();
        assert_eq!(journal.load_identity().unwrap(), Some(id));
    }

    #[test]
    fn unreadable_identity_is_ignored() {
        let journal = SessionJournal::open_in_memory().unwrap();
        {
            let conn = journal.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO identity VALUES (1, 'initialized', 'not-a-uuid', 'x', 'now')",
                [],
            )
            .unwrap();
        }
        assert!(journal.load_identity().unwrap().is_none());
    }
}
