// Copyright (c) 2018 Levente Kurusa
// Copyright (c) 2020-2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Cgroup managers for Linux containers.
//!
//! A [`Manager`] creates the cgroup of a container, moves processes into
//! it, applies [`Resources`], freezes it, reports [`CgroupStats`] and
//! finally removes it. Four backends are available, see [`Backend`]:
//! cgroupfs v1 and v2 written directly, or a transient systemd unit on
//! top of either.

use std::fmt;
use std::str::FromStr;

pub mod config;
pub use config::{Cgroup, Resources};
pub mod devices;
pub mod fs;
pub mod manager;
pub use manager::{
    new_manager, Backend, Fs2Manager, FsManager, LegacySystemdManager, Manager,
    UnifiedSystemdManager,
};
#[cfg(feature = "oci")]
pub mod oci;
pub mod stats;
pub use stats::CgroupStats;
pub mod systemd;

/// The maximum value for CPU shares in cgroups v1
pub const CPU_SHARES_V1_MAX: u64 = 262144;
/// The maximum value for CPU weight in cgroups v2
pub const CPU_WEIGHT_V2_MAX: u64 = 10000;

/// The current state of the control group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FreezerState {
    /// The state is unknown, e.g. there is no freezer.
    Undefined,
    /// The processes in the control group are _not_ frozen.
    Thawed,
    /// The processes in the control group are in the processes of being frozen.
    Freezing,
    /// The processes in the control group are frozen.
    Frozen,
}

impl FreezerState {
    /// The value of the state in `freezer.state` of cgroup v1.
    pub fn as_str(self) -> &'static str {
        match self {
            FreezerState::Undefined => "",
            FreezerState::Thawed => "THAWED",
            FreezerState::Freezing => "FREEZING",
            FreezerState::Frozen => "FROZEN",
        }
    }
}

impl fmt::Display for FreezerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FreezerState {
    type Err = fs::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(FreezerState::Undefined),
            "THAWED" => Ok(FreezerState::Thawed),
            "FREEZING" => Ok(FreezerState::Freezing),
            "FROZEN" => Ok(FreezerState::Frozen),
            s => Err(fs::error::Error::parse(format!(
                "invalid freezer state {:?}",
                s
            ))),
        }
    }
}

/// A structure representing a `pid`. Currently implementations exist for `u64` and
/// `std::process::Child`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CgroupPid {
    /// The process identifier
    pub pid: u64,
}

impl From<u64> for CgroupPid {
    fn from(u: u64) -> CgroupPid {
        CgroupPid { pid: u }
    }
}

impl From<&std::process::Child> for CgroupPid {
    fn from(u: &std::process::Child) -> CgroupPid {
        CgroupPid { pid: u.id() as u64 }
    }
}
