// Copyright 2021-2023 Kata Contributors
// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Managers driving a transient systemd unit, with cgroupfs filling in
//! whatever systemd has no property for.

use std::collections::HashMap;

use log::{debug, warn};

use crate::config::{Cgroup, Resources};
use crate::devices;
use crate::manager::conv::{
    blkio_weight_to_io_weight, cpu_shares_to_cgroup_v2, memory_swap_to_cgroup_v2,
};
use crate::manager::error::{Error, Result};
use crate::manager::fs2::unified_controller;
use crate::systemd::cpu::{self, DEFAULT_CPU_QUOTA_PERIOD};
use crate::systemd::dbus::Bus;
use crate::systemd::error::Error as SystemdError;
use crate::systemd::props::PropertiesBuilder;
use crate::systemd::{
    cpuset, memory, pids, Property, SystemdClient, BLOCK_IO_WEIGHT, CPUSET_SYSTEMD_VERSION,
    CPU_WEIGHT, DEFAULT_DESCRIPTION, DEFAULT_SLICE, IO_WEIGHT, MEMORY_HIGH, MEMORY_LOW,
    MEMORY_MAX, MEMORY_MIN, MEMORY_SWAP_MAX, SCOPE_SUFFIX, SLICE_SUFFIX, TIMEOUT_STOP_USEC,
};
use crate::{CgroupPid, FreezerState};

mod legacy;
pub use legacy::LegacySystemdManager;
mod unified;
pub use unified::UnifiedSystemdManager;

/// Since this version `CPUWeight=0` puts the unit into `cpu.idle`.
const CPU_IDLE_SYSTEMD_VERSION: usize = 252;

/// The slice rootless units go to by default.
const USER_SLICE: &str = "user.slice";

/// The device policy of a unit, with its allow list.
pub(crate) type DevicePolicy = (String, Vec<(String, String)>);

fn new_unit_name(scope_prefix: &str, name: &str) -> String {
    // By default, we create a scope unless the user explicitly asks
    // for a slice.
    if !name.ends_with(SLICE_SUFFIX) {
        if scope_prefix.is_empty() {
            // {name}.scope
            return format!("{}{}", name, SCOPE_SUFFIX);
        }
        // {scope_prefix}-{name}.scope
        return format!("{}-{}{}", scope_prefix, name, SCOPE_SUFFIX);
    }

    name.to_string()
}

fn slice_name(config: &Cgroup) -> String {
    if !config.parent.is_empty() {
        config.parent.clone()
    } else if config.rootless {
        USER_SLICE.to_string()
    } else {
        DEFAULT_SLICE.to_string()
    }
}

/// A transient unit and what is known of the systemd instance running
/// it.
pub(crate) struct Unit {
    name: String,
    slice: String,
    bus: Bus,
    client: SystemdClient,
    version: Option<usize>,
    /// Properties set before the unit was started.
    pending: Vec<Property>,
}

impl Unit {
    pub(crate) fn new(config: &Cgroup) -> Result<Self> {
        if config.name.is_empty() {
            return Err(Error::invalid("systemd cgroup: unit name must be set"));
        }
        let name = new_unit_name(&config.scope_prefix, &config.name);
        let bus = if config.rootless {
            Bus::Session
        } else {
            Bus::System
        };
        let client = SystemdClient::new(&name, bus, vec![])?;

        Ok(Self {
            name,
            slice: slice_name(config),
            bus,
            client,
            version: None,
            pending: vec![],
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn slice(&self) -> &str {
        &self.slice
    }

    pub(crate) fn client(&self) -> &SystemdClient {
        &self.client
    }

    /// The major version of systemd, asked once.
    pub(crate) fn systemd_version(&mut self) -> Result<usize> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        let version = self.client.systemd_version()?;
        self.version = Some(version);
        Ok(version)
    }

    /// The properties the unit is started with.
    pub(crate) fn start_properties(
        &self,
        config: &Cgroup,
        pid: Option<CgroupPid>,
        v2: bool,
    ) -> Vec<Property> {
        let mut builder = PropertiesBuilder::default_cgroup(&self.slice, &self.name, v2)
            .description(format!("{} {}", DEFAULT_DESCRIPTION, config.name));
        if let Some(pid) = pid {
            builder = builder.pids(vec![pid.pid as u32]);
        }

        let mut props = builder.build();
        props.extend(config.systemd_props.iter().cloned());
        props
    }

    /// Start the unit with `props`. A unit of the same name which is
    /// already running is reused, `pid` then joins it in `subcgroup`.
    pub(crate) fn start(
        &mut self,
        mut props: Vec<Property>,
        pid: Option<CgroupPid>,
        subcgroup: &str,
    ) -> Result<()> {
        for prop in self.pending.iter() {
            match props.iter_mut().find(|(key, _)| *key == prop.0) {
                Some(existing) => existing.1 = prop.1.clone(),
                None => props.push(prop.clone()),
            }
        }
        self.client = SystemdClient::new(&self.name, self.bus, props)?;

        match self.client.start() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_unit_exists() => {
                debug!("unit {} exists, err: {}", self.name, err);
            }
            Err(err) => return Err(err.into()),
        }

        let pid = match pid {
            Some(pid) => pid,
            // Nothing to join, the unit is there.
            None => return Ok(()),
        };

        // A failed unit keeps its name until reset.
        if let Err(err) = self.client.reset_failed() {
            warn!("failed to reset unit {}: {}", self.name, err);
        }
        match self.client.start() {
            Ok(()) => Ok(()),
            Err(err) if err.is_unit_exists() => {
                self.client.add_process(pid, subcgroup)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stop the unit. A unit which is gone is fine.
    pub(crate) fn stop(&self) -> Result<()> {
        self.client.stop()?;
        Ok(())
    }

    pub(crate) fn set_properties(&mut self, props: &[Property]) -> Result<()> {
        if props.is_empty() {
            return Ok(());
        }
        self.client.set_properties(props)?;
        Ok(())
    }

    /// The systemd sends SIGTERM to processes in the unit on stop. Once a
    /// timeout occurs, SIGKILL will be sent to the processes.
    ///
    /// The item could be retrieved by:
    ///
    /// ```bash
    /// $ systemctl show <unit> -p TimeoutStopUSec
    /// ```
    pub(crate) fn set_term_timeout(&mut self, timeout_in_sec: u64) -> Result<()> {
        let prop: Property = (
            TIMEOUT_STOP_USEC.to_string(),
            timeout_in_sec.saturating_mul(1_000_000).into(),
        );
        self.pending.retain(|(key, _)| key != TIMEOUT_STOP_USEC);
        self.pending.push(prop.clone());
        self.set_properties(&[prop])
    }

    /// The device policy of the running unit. A unit which does not exist
    /// has the systemd defaults.
    pub(crate) fn device_policy(&self) -> Option<DevicePolicy> {
        match self.client.device_policy() {
            Ok(policy) => Some(policy),
            Err(err) if err.is_no_such_unit() => Some(("auto".to_string(), vec![])),
            Err(err) => {
                debug!("failed to get device policy of {}: {}", self.name, err);
                None
            }
        }
    }
}

/// Whether the cgroup is frozen while unit properties are updated, and
/// whether it is thawed afterwards.
///
/// Updating the device rules of a unit briefly denies every device, so
/// the processes are frozen meanwhile unless nothing can change.
pub(crate) fn freeze_plan(
    resources: &Resources,
    device_policy: Option<&DevicePolicy>,
    current: FreezerState,
) -> (bool, bool) {
    if resources.skip_devices {
        if resources.skip_freeze_on_set {
            return (false, false);
        }
        if let Some((policy, allow)) = device_policy {
            // Everything is allowed already.
            if policy == "auto" && allow.is_empty() {
                return (false, false);
            }
        }
    }

    if current == FreezerState::Frozen {
        return (false, false);
    }

    (true, resources.freezer != Some(FreezerState::Frozen))
}

/// The unit properties of `resources` for cgroup v1, along with the CPU
/// quota cgroupfs has to be written with.
pub(crate) fn v1_properties(
    resources: &Resources,
    systemd_version: usize,
) -> Result<(Vec<Property>, Option<i64>)> {
    let mut props = devices::systemd::properties(resources, systemd_version)?;
    let mut push = |(id, value): (&str, u64)| props.push((id.to_string(), value.into()));

    if let Some(limit) = resources.memory.filter(|limit| *limit != 0) {
        push(memory::limit(limit, false)?);
    }
    if let Some(shares) = resources.cpu_shares.filter(|shares| *shares != 0) {
        push(cpu::shares(shares, false)?);
    }
    if let Some(weight) = resources.blkio_weight.filter(|weight| *weight != 0) {
        push((BLOCK_IO_WEIGHT, u64::from(weight)));
    }
    if let Some(limit) = resources.pids_limit {
        push(pids::max(limit)?);
    }

    let (quota_props, quota) = cpu::quota_and_period(
        resources.cpu_quota.unwrap_or(0),
        resources.cpu_period.unwrap_or(0),
        systemd_version,
    );
    props.extend(quota_props);
    props.extend(cpuset::properties(
        &resources.cpuset_cpus,
        &resources.cpuset_mems,
        systemd_version,
    )?);

    Ok((props, quota))
}

/// The unit properties of `resources` for cgroup v2, along with the CPU
/// quota cgroupfs has to be written with.
pub(crate) fn v2_properties(
    resources: &Resources,
    systemd_version: usize,
) -> Result<(Vec<Property>, Option<i64>)> {
    let mut props = devices::systemd::properties(resources, systemd_version)?;
    let mut push = |(id, value): (&str, u64)| props.push((id.to_string(), value.into()));

    if let Some(limit) = resources.memory.filter(|limit| *limit != 0) {
        push(memory::limit(limit, true)?);
    }
    if let Some(low) = resources.memory_reservation.filter(|low| *low != 0) {
        push(memory::low(low, true)?);
    }
    let swap = memory_swap_to_cgroup_v2(
        resources.memory_swap.unwrap_or(0),
        resources.memory.unwrap_or(0),
    )?;
    if swap != 0 {
        push(memory::swap(swap, true)?);
    }

    let idle = resources.cpu_idle.unwrap_or(0) != 0;
    if idle && systemd_version >= CPU_IDLE_SYSTEMD_VERSION {
        push((CPU_WEIGHT, 0));
    } else {
        let weight = resources
            .cpu_weight
            .or_else(|| resources.cpu_shares.map(cpu_shares_to_cgroup_v2))
            .filter(|weight| *weight != 0);
        if let Some(weight) = weight {
            push(cpu::shares(weight, true)?);
        }
    }

    if let Some(weight) = resources.blkio_weight.filter(|weight| *weight != 0) {
        push((IO_WEIGHT, blkio_weight_to_io_weight(u64::from(weight))));
    }
    if let Some(limit) = resources.pids_limit {
        push(pids::max(limit)?);
    }

    let (quota_props, quota) = cpu::quota_and_period(
        resources.cpu_quota.unwrap_or(0),
        resources.cpu_period.unwrap_or(0),
        systemd_version,
    );
    props.extend(quota_props);
    props.extend(cpuset::properties(
        &resources.cpuset_cpus,
        &resources.cpuset_mems,
        systemd_version,
    )?);
    props.extend(unified_properties(&resources.unified, systemd_version)?);

    Ok((props, quota))
}

fn bad_unified_key(key: &str, value: &str) -> SystemdError {
    SystemdError::BadUnifiedKey {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// A memory or pids limit, "max" being unlimited.
fn unified_limit(key: &str, value: &str) -> Result<u64> {
    if value == "max" {
        return Ok(u64::MAX);
    }
    value
        .parse::<u64>()
        .map_err(|_| bad_unified_key(key, value).into())
}

/// The unit properties of the unified keys systemd knows about. Other
/// keys are only written to cgroupfs.
pub(crate) fn unified_properties(
    unified: &HashMap<String, String>,
    systemd_version: usize,
) -> Result<Vec<Property>> {
    let mut props: Vec<Property> = vec![];
    let idle = unified.get("cpu.idle").map(|v| v.trim()) == Some("1")
        && systemd_version >= CPU_IDLE_SYSTEMD_VERSION;

    let mut keys: Vec<&String> = unified.keys().collect();
    keys.sort();
    for key in keys {
        unified_controller(key)?;
        let value = unified[key].trim();

        match key.as_str() {
            "cpu.idle" => {
                if idle {
                    props.push((CPU_WEIGHT.to_string(), 0u64.into()));
                }
            }
            "cpu.weight" => {
                if idle {
                    warn!("cpu.idle is set, ignoring cpu.weight {}", value);
                    continue;
                }
                let weight = value
                    .parse::<u64>()
                    .map_err(|_| bad_unified_key(key, value))?;
                props.push((CPU_WEIGHT.to_string(), weight.into()));
            }
            "cpu.max" => {
                let fields: Vec<&str> = value.split_whitespace().collect();
                if fields.is_empty() || fields.len() > 2 {
                    return Err(bad_unified_key(key, value).into());
                }
                let quota = match fields[0] {
                    "max" => 0,
                    quota => quota
                        .parse::<i64>()
                        .ok()
                        .filter(|quota| *quota > 0)
                        .ok_or_else(|| bad_unified_key(key, value))?,
                };
                let period = match fields.get(1) {
                    Some(period) => period
                        .parse::<u64>()
                        .ok()
                        .filter(|period| *period > 0)
                        .ok_or_else(|| bad_unified_key(key, value))?,
                    None => DEFAULT_CPU_QUOTA_PERIOD,
                };
                let (quota_props, _) = cpu::quota_and_period(quota, period, systemd_version);
                props.extend(quota_props);
            }
            "cpuset.cpus" | "cpuset.mems" => {
                if systemd_version < CPUSET_SYSTEMD_VERSION {
                    debug!(
                        "systemd v{} is too old for {}, only setting it in cgroupfs",
                        systemd_version, key
                    );
                    continue;
                }
                let (id, mask) = if key == "cpuset.cpus" {
                    cpuset::cpus(value)
                } else {
                    cpuset::mems(value)
                }
                .map_err(|_| bad_unified_key(key, value))?;
                props.push((id.to_string(), mask.into()));
            }
            "memory.high" | "memory.low" | "memory.min" | "memory.max" | "memory.swap.max" => {
                let id = match key.as_str() {
                    "memory.high" => MEMORY_HIGH,
                    "memory.low" => MEMORY_LOW,
                    "memory.min" => MEMORY_MIN,
                    "memory.max" => MEMORY_MAX,
                    _ => MEMORY_SWAP_MAX,
                };
                props.push((id.to_string(), unified_limit(key, value)?.into()));
            }
            "pids.max" => {
                let (id, max) = if value == "max" {
                    pids::max(-1)?
                } else {
                    let max = value
                        .parse::<i64>()
                        .map_err(|_| bad_unified_key(key, value))?;
                    pids::max(max)?
                };
                props.push((id.to_string(), max.into()));
            }
            _ => debug!("unified key {} has no systemd property, cgroupfs only", key),
        }
    }

    Ok(props)
}

/// Apply the effective CPU quota to a copy of `resources`.
pub(crate) fn with_quota(resources: &Resources, quota: Option<i64>) -> Resources {
    let mut resources = resources.clone();
    if quota.is_some() {
        resources.cpu_quota = quota;
    }
    resources
}
