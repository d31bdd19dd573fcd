// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use crate::systemd::error::Result;
use crate::systemd::TASKS_MAX;

/// Returns the property for the pids limit. Zero cannot be set and means
/// one task, a negative limit is unlimited.
pub fn max(max: i64) -> Result<(&'static str, u64)> {
    let max = match max {
        0 => 1,
        max if max < 0 => u64::MAX,
        max => max as u64,
    };
    Ok((TASKS_MAX, max))
}
