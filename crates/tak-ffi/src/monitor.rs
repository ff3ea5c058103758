// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Runtime integrity monitor.

use std::sync::Arc;

use tak_core::RuntimeCrashReason;
use tak_security::PreCrashCallback;

use crate::buffer::TakBoolResponse;
use crate::{TakSession, call, session, success};

/// Receives the `RuntimeCrashReason` value just before the process is
/// terminated. Runs on the monitor thread.
pub type TakPreCrashCallback = extern "C" fn(reason: i32);

/// Start checking every `interval_secs` seconds (at least 45).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_monitor_start(handle: *mut TakSession, interval_secs: u64) -> i32 {
    call(|| unsafe {
        session(handle)?.monitor_start(interval_secs)?;
        success()
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_monitor_stop(handle: *mut TakSession) -> i32 {
    call(|| unsafe {
        session(handle)?.monitor_stop()?;
        success()
    })
}

/// With `relaunch`, a monitor whose thread died is restarted first.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_monitor_is_active(
    handle: *mut TakSession,
    relaunch: bool,
) -> TakBoolResponse {
    call(|| unsafe { Ok(TakBoolResponse::ok(session(handle)?.monitor_is_active(relaunch)?)) })
}

/// Install (or with null, clear) the pre-crash callback.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tak_set_pre_crash_callback(
    handle: *mut TakSession,
    callback: Option<TakPreCrashCallback>,
) -> i32 {
    call(|| unsafe {
        let callback = callback.map(|cb| -> PreCrashCallback {
            Arc::new(move |reason: RuntimeCrashReason| cb(reason as i32))
        });
        session(handle)?.set_pre_crash_callback(callback)?;
        success()
    })
}
