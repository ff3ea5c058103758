// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Tracer detection via procfs, shared by the Linux-kernel hosts.

/// Whether another process is ptrace-attached to this one.
pub(crate) fn is_traced() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| tracer_pid(&status).is_some_and(|pid| pid != 0))
        .unwrap_or(false)
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|v| v.trim().parse().ok())
}
