// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use log::debug;

use crate::systemd::error::{Error, Result};
use crate::systemd::{
    Property, CPU_QUOTA_PERIOD_US, CPU_QUOTA_PER_SEC_US, CPU_SHARES, CPU_SYSTEMD_VERSION,
    CPU_WEIGHT,
};

/// The CFS period the kernel uses when none is given, in microseconds.
pub const DEFAULT_CPU_QUOTA_PERIOD: u64 = 100_000;

/// systemd stores the quota as a percentage of one CPU.
const QUOTA_GRANULARITY_US: u64 = 10_000;

/// Returns the property for CPU shares.
///
/// Please note that if the shares is obtained from OCI runtime spec, it
/// MUST be converted, see [1] and `cpu_shares_to_cgroup_v2()`.
///
/// 1: https://github.com/containers/crun/blob/main/crun.1.md#cgroup-v2
pub fn shares(shares: u64, v2: bool) -> Result<(&'static str, u64)> {
    let id = if v2 { CPU_WEIGHT } else { CPU_SHARES };

    Ok((id, shares))
}

/// Returns the property for CPU period.
pub fn period(period: u64, systemd_version: usize) -> Result<(&'static str, u64)> {
    if systemd_version < CPU_SYSTEMD_VERSION {
        return Err(Error::ObsoleteSystemd);
    }

    Ok((CPU_QUOTA_PERIOD_US, period))
}

/// Return the property for CPU quota, given per second of CPU time.
pub fn quota(quota: u64) -> Result<(&'static str, u64)> {
    Ok((CPU_QUOTA_PER_SEC_US, quota))
}

/// Returns the properties for a CFS `quota` and `period`, zero meaning
/// unset, along with the quota cgroupfs has to be written with to match
/// what systemd will apply.
///
/// A negative quota is unlimited. A positive one is rounded up to the
/// next 10ms per second, as anything finer would be lost by systemd.
pub fn quota_and_period(
    quota: i64,
    period: u64,
    systemd_version: usize,
) -> (Vec<Property>, Option<i64>) {
    let mut props: Vec<Property> = vec![];

    if period != 0 {
        match self::period(period, systemd_version) {
            Ok((id, period)) => props.push((id.to_string(), period.into())),
            Err(_) => debug!(
                "systemd v{} is too old to support {}, only setting it in cgroupfs",
                systemd_version, CPU_QUOTA_PERIOD_US
            ),
        }
    }

    if quota == 0 && period == 0 {
        return (props, None);
    }

    // USEC_INFINITY
    let mut per_sec = u64::MAX;
    let mut effective = None;
    if quota > 0 {
        let period = if period == 0 {
            DEFAULT_CPU_QUOTA_PERIOD
        } else {
            period
        };
        per_sec = (quota as u64).saturating_mul(1_000_000) / period;
        if per_sec % QUOTA_GRANULARITY_US != 0 {
            per_sec = (per_sec / QUOTA_GRANULARITY_US + 1) * QUOTA_GRANULARITY_US;
        }
        effective = Some((per_sec.saturating_mul(period) / 1_000_000) as i64);
    }

    // Infallible
    if let Ok((id, per_sec)) = self::quota(per_sec) {
        props.push((id.to_string(), per_sec.into()));
    }

    (props, effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systemd::props::Value;

    fn find(props: &[Property], key: &str) -> Option<u64> {
        props.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
            Value::U64(n) => Some(*n),
            _ => None,
        })
    }

    #[test]
    fn test_quota_rounding() {
        let (props, effective) = quota_and_period(123456, 0, 245);
        assert_eq!(find(&props, CPU_QUOTA_PER_SEC_US), Some(1_240_000));
        assert_eq!(find(&props, CPU_QUOTA_PERIOD_US), None);
        assert_eq!(effective, Some(124_000));

        let (props, effective) = quota_and_period(500_000, 900_000, 245);
        assert_eq!(find(&props, CPU_QUOTA_PER_SEC_US), Some(560_000));
        assert_eq!(find(&props, CPU_QUOTA_PERIOD_US), Some(900_000));
        assert_eq!(effective, Some(504_000));

        let (props, effective) = quota_and_period(500_000, 1_000_000, 245);
        assert_eq!(find(&props, CPU_QUOTA_PER_SEC_US), Some(500_000));
        assert_eq!(effective, Some(500_000));
    }

    #[test]
    fn test_quota_unlimited_and_unset() {
        let (props, effective) = quota_and_period(-1, 100_000, 245);
        assert_eq!(find(&props, CPU_QUOTA_PER_SEC_US), Some(u64::MAX));
        assert_eq!(effective, None);

        let (props, effective) = quota_and_period(0, 0, 245);
        assert!(props.is_empty());
        assert_eq!(effective, None);
    }

    #[test]
    fn test_period_needs_recent_systemd() {
        let (props, _) = quota_and_period(50_000, 200_000, CPU_SYSTEMD_VERSION - 1);
        assert_eq!(find(&props, CPU_QUOTA_PERIOD_US), None);
        assert_eq!(find(&props, CPU_QUOTA_PER_SEC_US), Some(250_000));
        assert!(period(200_000, CPU_SYSTEMD_VERSION).is_ok());
    }
}
