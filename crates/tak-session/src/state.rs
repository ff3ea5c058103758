// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trust state machine.
//
//   Uninitialized ─initialize─▶ Initialized ─register─▶ Registered ⇄ Locked
//                                  ▲  ▲                    │
//               device mismatch ───┘  └── reset            ├──▶ CertificateExpired
//                                                          └──▶ Wiped
//
//   CertificateExpired and Wiped both return to Registered on register.
//
// `StateMachine::apply` is the only way the session changes state. The
// transition table itself is the pure function `StateMachine::next`.

use tak_core::SessionState;
use tak_core::error::{Result, TakError};

/// Server-directed (or locally detected) outcome of an integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityVerdict {
    Valid,
    /// Identity renewed: new device id and key material.
    Renewed,
    CertificateExpired,
    Locked,
    Wiped,
    /// The device fingerprint changed since registration.
    DeviceMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Initialized,
    /// Identity restored from the journal during `initialize`.
    Restored(SessionState),
    Registered,
    Verdict(IntegrityVerdict),
    Reset,
    Released,
    ViolationDetected,
}

impl Event {
    /// Short name recorded in the transition journal.
    pub fn name(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Restored(_) => "restored",
            Self::Registered => "registered",
            Self::Verdict(IntegrityVerdict::Valid) => "verdict_valid",
            Self::Verdict(IntegrityVerdict::Renewed) => "verdict_renewed",
            Self::Verdict(IntegrityVerdict::CertificateExpired) => "verdict_certificate_expired",
            Self::Verdict(IntegrityVerdict::Locked) => "verdict_locked",
            Self::Verdict(IntegrityVerdict::Wiped) => "verdict_wiped",
            Self::Verdict(IntegrityVerdict::DeviceMismatch) => "verdict_device_mismatch",
            Self::Reset => "reset",
            Self::Released => "released",
            Self::ViolationDetected => "violation_detected",
        }
    }
}

/// Error for an operation that needs identity material in `state`.
fn not_registered(state: SessionState) -> TakError {
    match state {
        SessionState::Uninitialized => TakError::NotInitialized,
        SessionState::Locked => TakError::InstanceLocked,
        SessionState::CertificateExpired => TakError::ClientCertificateExpired,
        SessionState::Wiped => TakError::InstanceWiped,
        SessionState::Initialized | SessionState::Registered => TakError::NotRegistered,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    state: SessionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The state `event` leads to from `state`, or the error the triggering
    /// operation reports.
    pub fn next(state: SessionState, event: Event) -> Result<SessionState> {
        use SessionState as S;

        match event {
            Event::Initialized => match state {
                S::Uninitialized => Ok(S::Initialized),
                _ => Err(TakError::AlreadyInitialized),
            },

            Event::Restored(restored) => match (state, restored) {
                (S::Initialized, S::Registered | S::Locked) => Ok(restored),
                (S::Uninitialized, _) => Err(TakError::NotInitialized),
                _ => Err(TakError::General(format!(
                    "cannot restore {restored} from {state}"
                ))),
            },

            Event::Registered => match state {
                S::Initialized | S::Wiped | S::CertificateExpired => Ok(S::Registered),
                S::Registered => Err(TakError::AlreadyRegistered),
                S::Locked => Err(TakError::InstanceLocked),
                S::Uninitialized => Err(TakError::NotInitialized),
            },

            Event::Verdict(verdict) => {
                if !state.has_identity() {
                    return Err(not_registered(state));
                }
                Ok(match verdict {
                    IntegrityVerdict::Valid | IntegrityVerdict::Renewed => S::Registered,
                    IntegrityVerdict::CertificateExpired => S::CertificateExpired,
                    IntegrityVerdict::Locked => S::Locked,
                    IntegrityVerdict::Wiped => S::Wiped,
                    IntegrityVerdict::DeviceMismatch => S::Initialized,
                })
            }

            Event::Reset => match state {
                S::Uninitialized => Err(TakError::NotInitialized),
                S::Locked => Err(TakError::InstanceLocked),
                _ => Ok(S::Initialized),
            },

            Event::Released => match state {
                S::Uninitialized => Err(TakError::NotInitialized),
                _ => Ok(S::Uninitialized),
            },

            Event::ViolationDetected => Ok(match state {
                S::Registered => S::Locked,
                other => other,
            }),
        }
    }

    /// Apply `event`, returning `(from, to)`. The state is unchanged on error.
    pub fn apply(&mut self, event: Event) -> Result<(SessionState, SessionState)> {
        let from = self.state;
        let to = Self::next(from, event)?;
        self.state = to;
        Ok((from, to))
    }

    // -- Gates ---------------------------------------------------------------

    /// Any live session.
    pub fn require_initialized(&self) -> Result<()> {
        if self.state.is_live() {
            Ok(())
        } else {
            Err(TakError::NotInitialized)
        }
    }

    /// A live session that is not locked.
    pub fn require_unlocked(&self) -> Result<()> {
        self.require_initialized()?;
        if self.state == SessionState::Locked {
            return Err(TakError::InstanceLocked);
        }
        Ok(())
    }

    /// Registered and unlocked.
    pub fn require_registered(&self) -> Result<()> {
        if self.state == SessionState::Registered {
            Ok(())
        } else {
            Err(not_registered(self.state))
        }
    }

    /// Registered or locked: the identity exists, possibly suspended.
    pub fn require_identity(&self) -> Result<()> {
        if self.state.has_identity() {
            Ok(())
        } else {
            Err(not_registered(self.state))
        }
    }
}
