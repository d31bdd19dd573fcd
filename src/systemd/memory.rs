// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use crate::systemd::error::{Error, Result};
use crate::systemd::{MEMORY_HIGH, MEMORY_LIMIT, MEMORY_LOW, MEMORY_MAX, MEMORY_MIN, MEMORY_SWAP_MAX};

/// Negative limits, i.e. -1, are unlimited.
fn bytes(value: i64) -> u64 {
    if value < 0 {
        u64::MAX
    } else {
        value as u64
    }
}

/// Returns the property for memory limit.
pub fn limit(limit: i64, v2: bool) -> Result<(&'static str, u64)> {
    let id = if v2 { MEMORY_MAX } else { MEMORY_LIMIT };

    Ok((id, bytes(limit)))
}

/// Returns the property for memory low.
pub fn low(low: i64, v2: bool) -> Result<(&'static str, u64)> {
    if !v2 {
        return Err(Error::CgroupsV1NotSupported);
    }

    Ok((MEMORY_LOW, bytes(low)))
}

/// Returns the property for memory high.
pub fn high(high: i64, v2: bool) -> Result<(&'static str, u64)> {
    if !v2 {
        return Err(Error::CgroupsV1NotSupported);
    }

    Ok((MEMORY_HIGH, bytes(high)))
}

/// Returns the property for memory min.
pub fn min(min: i64, v2: bool) -> Result<(&'static str, u64)> {
    if !v2 {
        return Err(Error::CgroupsV1NotSupported);
    }

    Ok((MEMORY_MIN, bytes(min)))
}

/// Returns the property for memory swap.
pub fn swap(swap: i64, v2: bool) -> Result<(&'static str, u64)> {
    if !v2 {
        return Err(Error::CgroupsV1NotSupported);
    }

    Ok((MEMORY_SWAP_MAX, bytes(swap)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_properties() {
        assert_eq!(limit(1024, false).unwrap(), (MEMORY_LIMIT, 1024));
        assert_eq!(limit(-1, true).unwrap(), (MEMORY_MAX, u64::MAX));
        assert_eq!(swap(-1, true).unwrap(), (MEMORY_SWAP_MAX, u64::MAX));
        assert!(low(1024, false).is_err());
        assert!(high(1024, false).is_err());
        assert_eq!(min(4096, true).unwrap(), (MEMORY_MIN, 4096));
    }
}
