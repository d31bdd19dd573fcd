// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Configuration of a control group and of the resources it limits.
//!
//! Numeric knobs are `Option`s, `None` leaving the current kernel value
//! untouched.

use std::collections::HashMap;
use std::fmt;

use crate::devices::DeviceRule;
use crate::systemd::Property;
use crate::FreezerState;

/// A control group to be managed.
///
/// Either `path` or `name` (with an optional `parent`) identifies the
/// cgroup. For systemd managers `parent` is the slice and `name` the unit,
/// or a slice itself when it ends with `.slice`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cgroup {
    pub name: String,
    pub parent: String,
    pub path: String,
    /// Prefix of the scope unit name, e.g. `docker` for
    /// `docker-<name>.scope`.
    pub scope_prefix: String,
    pub resources: Resources,
    pub systemd: bool,
    /// Extra unit properties appended when a unit is started.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub systemd_props: Vec<Property>,
    pub rootless: bool,
    pub owner_uid: Option<u32>,
}

impl Cgroup {
    pub fn with_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_name(parent: &str, name: &str) -> Self {
        Self {
            parent: parent.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WeightDevice {
    pub major: i64,
    pub minor: i64,
    pub weight: Option<u16>,
    pub leaf_weight: Option<u16>,
}

impl WeightDevice {
    /// Line for `blkio.weight_device`, or `None` when there is no weight.
    pub fn weight_string(&self) -> Option<String> {
        self.weight
            .map(|weight| format!("{}:{} {}", self.major, self.minor, weight))
    }

    /// Line for `blkio.leaf_weight_device`.
    pub fn leaf_weight_string(&self) -> Option<String> {
        self.leaf_weight
            .map(|weight| format!("{}:{} {}", self.major, self.minor, weight))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottleDevice {
    pub major: i64,
    pub minor: i64,
    pub rate: u64,
}

impl fmt::Display for ThrottleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.major, self.minor, self.rate)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HugepageLimit {
    /// Page size as named by the kernel, e.g. `2MB`.
    pub page_size: String,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IfPrioMap {
    pub interface: String,
    pub priority: i64,
}

impl fmt::Display for IfPrioMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.interface, self.priority)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RdmaLimit {
    pub hca_handles: Option<u32>,
    pub hca_objects: Option<u32>,
}

impl RdmaLimit {
    /// Line for `rdma.max`. Unset limits are written as `max`.
    pub fn rdma_string(&self, device: &str) -> String {
        let limit = |value: Option<u32>| match value {
            Some(value) => value.to_string(),
            None => "max".to_string(),
        };
        format!(
            "{} hca_handle={} hca_object={}",
            device,
            limit(self.hca_handles),
            limit(self.hca_objects)
        )
    }
}

/// Every knob a manager may apply. A manager only projects the fields
/// meaningful to its backend, e.g. `cpu_shares` for cgroup v1 and
/// `cpu_weight` for cgroup v2.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resources {
    /// Device rules, applied on top of an implicit deny-all.
    pub devices: Vec<DeviceRule>,

    /// Memory limit in bytes, -1 for unlimited.
    pub memory: Option<i64>,
    pub memory_reservation: Option<i64>,
    /// Memory plus swap limit in bytes, -1 for unlimited.
    pub memory_swap: Option<i64>,
    pub memory_swappiness: Option<u64>,
    pub oom_kill_disable: bool,

    pub cpu_shares: Option<u64>,
    pub cpu_weight: Option<u64>,
    /// CFS quota in microseconds, -1 for unlimited.
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpu_burst: Option<u64>,
    pub cpu_rt_runtime: Option<i64>,
    pub cpu_rt_period: Option<u64>,
    /// SCHED_IDLE for the whole cgroup when 1.
    pub cpu_idle: Option<i64>,

    pub cpuset_cpus: String,
    pub cpuset_mems: String,

    /// 0 is read as 1, negative values as unlimited.
    pub pids_limit: Option<i64>,

    pub blkio_weight: Option<u16>,
    pub blkio_leaf_weight: Option<u16>,
    pub blkio_weight_device: Vec<WeightDevice>,
    pub blkio_throttle_read_bps_device: Vec<ThrottleDevice>,
    pub blkio_throttle_write_bps_device: Vec<ThrottleDevice>,
    pub blkio_throttle_read_iops_device: Vec<ThrottleDevice>,
    pub blkio_throttle_write_iops_device: Vec<ThrottleDevice>,

    pub freezer: Option<FreezerState>,
    pub hugetlb_limit: Vec<HugepageLimit>,
    pub rdma: HashMap<String, RdmaLimit>,

    pub net_prio_ifpriomap: Vec<IfPrioMap>,
    pub net_cls_classid: Option<u32>,

    /// Raw cgroup v2 files, e.g. `memory.high` to `"max"`.
    pub unified: HashMap<String, String>,

    /// Leave the device policy untouched, e.g. for a pod's parent cgroup
    /// whose children carry their own rules.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub skip_devices: bool,
    /// Do not freeze the cgroup around systemd property updates.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub skip_freeze_on_set: bool,
    /// Refuse memory limits below the current usage.
    pub memory_check_before_update: bool,
}

impl Resources {
    pub(crate) fn has_memory_limits(&self) -> bool {
        self.memory.is_some() || self.memory_swap.is_some() || self.memory_reservation.is_some()
    }

    pub(crate) fn has_cpu_quota(&self) -> bool {
        self.cpu_quota.is_some() || self.cpu_period.is_some()
    }

    pub(crate) fn has_cpuset(&self) -> bool {
        !self.cpuset_cpus.is_empty() || !self.cpuset_mems.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_strings() {
        let device = WeightDevice {
            major: 8,
            minor: 0,
            weight: Some(500),
            leaf_weight: None,
        };
        assert_eq!(device.weight_string().unwrap(), "8:0 500");
        assert_eq!(device.leaf_weight_string(), None);

        let throttle = ThrottleDevice {
            major: 8,
            minor: 16,
            rate: 1048576,
        };
        assert_eq!(throttle.to_string(), "8:16 1048576");

        let prio = IfPrioMap {
            interface: "eth0".to_string(),
            priority: 5,
        };
        assert_eq!(prio.to_string(), "eth0 5");

        let rdma = RdmaLimit {
            hca_handles: Some(3),
            hca_objects: None,
        };
        assert_eq!(rdma.rdma_string("mlx5_1"), "mlx5_1 hca_handle=3 hca_object=max");
    }
}
