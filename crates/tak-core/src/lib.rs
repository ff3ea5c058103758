// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core types, status codes, and error definitions shared across all crates.

pub mod config;
pub mod error;
pub mod license;
pub mod status;
pub mod types;

pub use config::TakConfig;
pub use error::{Result, TakError};
pub use license::{License, LicenseStatus};
pub use status::{Completion, ErrorFamily, StatusCode};
pub use types::*;
