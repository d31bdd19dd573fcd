// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Conversion of the resources of an OCI runtime spec.

use std::convert::TryFrom;

use oci_spec::runtime::{
    LinuxBlockIo, LinuxCpu, LinuxDeviceCgroup, LinuxMemory, LinuxNetwork, LinuxResources,
};

use crate::config::{HugepageLimit, IfPrioMap, RdmaLimit, Resources, ThrottleDevice, WeightDevice};
use crate::devices::{DeviceRule, DeviceType, Permissions};
use crate::manager::{Error, Result};

/// Negative numbers, e.g. -1, match every device.
fn device_number(n: Option<i64>) -> Option<u32> {
    n.and_then(|n| u32::try_from(n).ok())
}

impl TryFrom<&LinuxDeviceCgroup> for DeviceRule {
    type Error = Error;

    fn try_from(device: &LinuxDeviceCgroup) -> Result<Self> {
        let typ = device.typ().unwrap_or_default();
        let kind = typ
            .as_str()
            .chars()
            .next()
            .and_then(DeviceType::from_char)
            .ok_or_else(|| Error::invalid(format!("invalid device type {:?}", typ.as_str())))?;

        // No access means full access.
        let permissions = match device.access().as_deref() {
            None | Some("") => Permissions::all(),
            Some(access) => access.parse()?,
        };

        Ok(DeviceRule::new(
            kind,
            device_number(device.major()),
            device_number(device.minor()),
            permissions,
            device.allow(),
        ))
    }
}

fn memory(r: &mut Resources, memory: &LinuxMemory) {
    r.memory = memory.limit();
    r.memory_reservation = memory.reservation();
    r.memory_swap = memory.swap();
    r.memory_swappiness = memory.swappiness();
    r.oom_kill_disable = memory.disable_oom_killer().unwrap_or_default();
}

fn cpu(r: &mut Resources, cpu: &LinuxCpu) {
    r.cpu_shares = cpu.shares();
    r.cpu_quota = cpu.quota();
    r.cpu_burst = cpu.burst();
    r.cpu_period = cpu.period();
    r.cpu_rt_runtime = cpu.realtime_runtime();
    r.cpu_rt_period = cpu.realtime_period();
    r.cpu_idle = cpu.idle();
    r.cpuset_cpus = cpu.cpus().clone().unwrap_or_default();
    r.cpuset_mems = cpu.mems().clone().unwrap_or_default();
}

fn block_io(r: &mut Resources, blkio: &LinuxBlockIo) {
    r.blkio_weight = blkio.weight();
    r.blkio_leaf_weight = blkio.leaf_weight();

    if let Some(devices) = blkio.weight_device() {
        r.blkio_weight_device = devices
            .iter()
            .map(|device| WeightDevice {
                major: device.major(),
                minor: device.minor(),
                weight: device.weight(),
                leaf_weight: device.leaf_weight(),
            })
            .collect();
    }

    let throttles = [
        (blkio.throttle_read_bps_device(), &mut r.blkio_throttle_read_bps_device),
        (blkio.throttle_write_bps_device(), &mut r.blkio_throttle_write_bps_device),
        (blkio.throttle_read_iops_device(), &mut r.blkio_throttle_read_iops_device),
        (blkio.throttle_write_iops_device(), &mut r.blkio_throttle_write_iops_device),
    ];
    for (devices, target) in throttles {
        if let Some(devices) = devices {
            *target = devices
                .iter()
                .map(|device| ThrottleDevice {
                    major: device.major(),
                    minor: device.minor(),
                    rate: device.rate(),
                })
                .collect();
        }
    }
}

fn network(r: &mut Resources, network: &LinuxNetwork) {
    r.net_cls_classid = network.class_id();
    if let Some(priorities) = network.priorities() {
        r.net_prio_ifpriomap = priorities
            .iter()
            .map(|priority| IfPrioMap {
                interface: priority.name().clone(),
                priority: i64::from(priority.priority()),
            })
            .collect();
    }
}

impl TryFrom<&LinuxResources> for Resources {
    type Error = Error;

    fn try_from(linux: &LinuxResources) -> Result<Self> {
        let mut r = Resources::default();

        if let Some(devices) = linux.devices() {
            r.devices = devices
                .iter()
                .map(DeviceRule::try_from)
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(m) = linux.memory() {
            memory(&mut r, m);
        }
        if let Some(c) = linux.cpu() {
            cpu(&mut r, c);
        }
        if let Some(pids) = linux.pids() {
            r.pids_limit = Some(pids.limit());
        }
        if let Some(blkio) = linux.block_io() {
            block_io(&mut r, blkio);
        }
        if let Some(limits) = linux.hugepage_limits() {
            r.hugetlb_limit = limits
                .iter()
                .map(|limit| HugepageLimit {
                    page_size: limit.page_size().clone(),
                    // Negative limits are unlimited.
                    limit: u64::try_from(limit.limit()).unwrap_or(u64::MAX),
                })
                .collect();
        }
        if let Some(n) = linux.network() {
            network(&mut r, n);
        }
        if let Some(rdma) = linux.rdma() {
            r.rdma = rdma
                .iter()
                .map(|(device, limit)| {
                    let limit = RdmaLimit {
                        hca_handles: limit.hca_handles(),
                        hca_objects: limit.hca_objects(),
                    };
                    (device.clone(), limit)
                })
                .collect();
        }
        if let Some(unified) = linux.unified() {
            r.unified = unified.clone();
        }

        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ErrorKind;

    const RESOURCES: &str = r#"{
        "devices": [
            {"allow": false, "access": "rwm"},
            {"allow": true, "type": "c", "major": 1, "minor": 3, "access": "rw"},
            {"allow": true, "type": "b", "major": 8}
        ],
        "memory": {
            "limit": 536870912,
            "reservation": 268435456,
            "swap": 1073741824,
            "swappiness": 10,
            "disableOOMKiller": true
        },
        "cpu": {
            "shares": 1024,
            "quota": 50000,
            "period": 100000,
            "realtimeRuntime": 950000,
            "realtimePeriod": 1000000,
            "cpus": "0-1",
            "mems": "0",
            "idle": 0
        },
        "pids": {"limit": 64},
        "blockIO": {
            "weight": 500,
            "weightDevice": [{"major": 8, "minor": 0, "weight": 300}],
            "throttleReadBpsDevice": [{"major": 8, "minor": 0, "rate": 1048576}],
            "throttleWriteIOPSDevice": [{"major": 8, "minor": 16, "rate": 100}]
        },
        "hugepageLimits": [{"pageSize": "2MB", "limit": 209715200}],
        "network": {
            "classID": 1048577,
            "priorities": [{"name": "eth0", "priority": 5}]
        },
        "rdma": {"mlx5_1": {"hcaHandles": 3, "hcaObjects": 10000}},
        "unified": {"memory.high": "max"}
    }"#;

    #[test]
    fn test_resources_from_oci() {
        let linux: LinuxResources = serde_json::from_str(RESOURCES).unwrap();
        let r = Resources::try_from(&linux).unwrap();

        assert_eq!(
            r.devices,
            vec![
                DeviceRule::all(false),
                DeviceRule::new(
                    DeviceType::Char,
                    Some(1),
                    Some(3),
                    Permissions::READ | Permissions::WRITE,
                    true
                ),
                DeviceRule::new(DeviceType::Block, Some(8), None, Permissions::all(), true),
            ]
        );

        assert_eq!(r.memory, Some(536870912));
        assert_eq!(r.memory_reservation, Some(268435456));
        assert_eq!(r.memory_swap, Some(1073741824));
        assert_eq!(r.memory_swappiness, Some(10));
        assert!(r.oom_kill_disable);

        assert_eq!(r.cpu_shares, Some(1024));
        assert_eq!(r.cpu_quota, Some(50000));
        assert_eq!(r.cpu_period, Some(100000));
        assert_eq!(r.cpu_rt_runtime, Some(950000));
        assert_eq!(r.cpu_rt_period, Some(1000000));
        assert_eq!(r.cpu_idle, Some(0));
        assert_eq!(r.cpuset_cpus, "0-1");
        assert_eq!(r.cpuset_mems, "0");

        assert_eq!(r.pids_limit, Some(64));

        assert_eq!(r.blkio_weight, Some(500));
        assert_eq!(
            r.blkio_weight_device[0].weight_string().unwrap(),
            "8:0 300"
        );
        assert_eq!(r.blkio_throttle_read_bps_device[0].to_string(), "8:0 1048576");
        assert_eq!(r.blkio_throttle_write_iops_device[0].to_string(), "8:16 100");
        assert!(r.blkio_throttle_write_bps_device.is_empty());

        assert_eq!(
            r.hugetlb_limit,
            vec![HugepageLimit {
                page_size: "2MB".to_string(),
                limit: 209715200,
            }]
        );
        assert_eq!(r.net_cls_classid, Some(1048577));
        assert_eq!(r.net_prio_ifpriomap[0].to_string(), "eth0 5");
        assert_eq!(
            r.rdma["mlx5_1"].rdma_string("mlx5_1"),
            "mlx5_1 hca_handle=3 hca_object=10000"
        );
        assert_eq!(r.unified["memory.high"], "max");
    }

    #[test]
    fn test_invalid_device_type() {
        let linux: LinuxResources =
            serde_json::from_str(r#"{"devices": [{"allow": true, "type": "p"}]}"#).unwrap();
        let err = Resources::try_from(&linux).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let linux: LinuxResources = serde_json::from_str(
            r#"{"devices": [{"allow": true, "type": "c", "access": "rwx"}]}"#,
        )
        .unwrap();
        let err = Resources::try_from(&linux).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_empty_resources() {
        let linux: LinuxResources = serde_json::from_str("{}").unwrap();
        let r = Resources::try_from(&linux).unwrap();
        assert!(r.devices.is_empty());
        assert_eq!(r.memory, None);
        assert!(r.unified.is_empty());
    }
}
