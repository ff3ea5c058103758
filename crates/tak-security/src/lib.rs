// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trust services built on the collaborator seams.
//
// A software key vault for desktop and CI, device-bound secure storage,
// envelope encryption for bundled assets, certificate-pinned TLS channels,
// the runtime integrity monitor, and the persisted session journal.

pub mod file_protector;
pub mod integrity;
pub mod journal;
pub mod keystore;
pub mod monitor;
pub mod storage;
pub mod tls;

pub use file_protector::FileProtector;
pub use integrity::{fingerprint_hash, hash_bytes};
pub use journal::{PersistedIdentity, SessionJournal, TransitionEntry};
pub use keystore::SoftwareKeystore;
pub use monitor::{PreCrashCallback, RuntimeMonitor, Terminator, ViolationSink};
pub use storage::SecureStorage;
pub use tls::{ClientIdentity, Connected, PinnedChannels};
