// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The session handle.
//
// A `Session` owns one device identity for its lifetime: it is initialized
// against a working directory and a license, registers with the backend,
// and gates every storage, key, file-protector, TLS, and monitor operation
// on the trust state machine in `state`.

pub mod session;
pub mod state;

pub use session::{Session, SessionBuilder};
pub use state::{Event, IntegrityVerdict, StateMachine};

/// Crate version reported by `Session::version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
