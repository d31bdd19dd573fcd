// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Cgroup v1 manager writing cgroupfs directly, one directory per
//! subsystem hierarchy.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::statfs::{statfs, CGROUP_SUPER_MAGIC};

use crate::config::{Cgroup, Resources};
use crate::devices;
use crate::fs::error::{Error as CgroupfsError, ErrorKind as CgroupfsErrorKind};
use crate::fs::mountinfo::{find_cgroup_mountpoint, own_cgroup_path};
use crate::fs::utils::{
    get_cgroup_param_uint, join_path, read_procs, remove_paths, write_cgroup_proc,
};
use crate::fs::{read_file, write_file};
use crate::manager::error::{Error, Result};
use crate::manager::{
    check_freeze_request, inner_path, Lifecycle, Manager, DEFAULT_FREEZE_TIMEOUT,
};
use crate::stats::{collect, CgroupStats, ControllerKind, StatsOptions};
use crate::{CgroupPid, FreezerState};

/// Hierarchies joined by the manager.
pub(crate) const SUBSYSTEMS: &[&str] = &[
    "cpuset",
    "devices",
    "memory",
    "cpu",
    "cpuacct",
    "pids",
    "blkio",
    "hugetlb",
    "net_cls",
    "net_prio",
    "perf_event",
    "freezer",
    "rdma",
    "misc",
    "name=systemd",
];

const CPUSET_CPUS: &str = "cpuset.cpus";
const CPUSET_MEMS: &str = "cpuset.mems";

const MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const MEMORY_SWAP_LIMIT: &str = "memory.memsw.limit_in_bytes";
const MEMORY_USAGE: &str = "memory.usage_in_bytes";

const CPU_SHARES: &str = "cpu.shares";
const CPU_CFS_PERIOD: &str = "cpu.cfs_period_us";
const CPU_CFS_QUOTA: &str = "cpu.cfs_quota_us";
const CPU_CFS_BURST: &str = "cpu.cfs_burst_us";
const CPU_RT_PERIOD: &str = "cpu.rt_period_us";
const CPU_RT_RUNTIME: &str = "cpu.rt_runtime_us";

const FREEZER_STATE: &str = "freezer.state";
const FREEZER_SELF_FREEZING: &str = "freezer.self_freezing";

/// Attempts between two thaws of a cgroup stuck in FREEZING.
const FREEZE_THAW_EVERY: usize = 50;

pub struct FsManager {
    config: Cgroup,
    /// Absolute cgroup paths by subsystem, e.g. "cpu" ->
    /// "/sys/fs/cgroup/cpu/kata/sandbox".
    paths: HashMap<String, String>,
    state: Lifecycle,
    freeze_timeout: Duration,
}

impl FsManager {
    /// Create a manager for the cgroup described by `config`, finding
    /// each subsystem in the mount table.
    pub fn new(config: &Cgroup) -> Result<Self> {
        if !config.resources.unified.is_empty() {
            return Err(Error::V1NoUnified);
        }

        let inner = inner_path(config)?;
        let mut paths = HashMap::new();
        for subsystem in SUBSYSTEMS {
            match subsystem_path(&inner, subsystem) {
                Ok(path) => {
                    paths.insert(subsystem.to_string(), path);
                }
                // The devices controller guards the host, it may only be
                // missing when device rules are not managed at all.
                Err(err) if err.is_not_exist() => {
                    if *subsystem == "devices" && !config.resources.skip_devices {
                        return Err(Error::SubsystemNotMounted(subsystem.to_string()));
                    }
                    debug!("subsystem {} not mounted, skipping", subsystem);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Self::with_paths(config, paths)
    }

    /// Create a manager over known subsystem paths.
    pub fn with_paths(config: &Cgroup, paths: HashMap<String, String>) -> Result<Self> {
        if !config.resources.unified.is_empty() {
            return Err(Error::V1NoUnified);
        }

        Ok(Self {
            config: config.clone(),
            paths,
            state: Lifecycle::Unapplied,
            freeze_timeout: DEFAULT_FREEZE_TIMEOUT,
        })
    }

    pub(crate) fn ensure_applied(&self) -> Result<()> {
        self.state.ensure_applied()
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        self.state.ensure_alive()
    }

    fn subsystem_dir(&self, subsystem: &str) -> &str {
        self.paths.get(subsystem).map(String::as_str).unwrap_or("")
    }

    /// The directory listing the processes of the cgroup.
    fn procs_dir(&self) -> Option<&str> {
        self.paths
            .get("devices")
            .or_else(|| self.paths.get("pids"))
            .or_else(|| self.paths.values().next())
            .map(String::as_str)
    }

    fn join(&self, subsystem: &str, dir: &str, pid: Option<CgroupPid>) -> Result<()> {
        if subsystem == "cpuset" {
            cpuset_ensure_parent(Path::new(dir))?;
        }
        fs::create_dir_all(dir).map_err(|err| CgroupfsError::from(err).context(dir))?;

        // A task with a real-time policy is only admitted by a cgroup
        // with enough rt runtime.
        if subsystem == "cpu" {
            set_rt_sched(dir, &self.config.resources)?;
        }

        write_cgroup_proc(dir, pid)?;
        Ok(())
    }

    fn set_subsystem(&self, subsystem: &str, dir: &str, resources: &Resources) -> Result<()> {
        match subsystem {
            "cpuset" => set_cpuset(dir, resources),
            "devices" => devices::v1::set(dir, resources).map_err(Error::from),
            "memory" => set_memory(dir, resources),
            "cpu" => set_cpu(dir, resources),
            "pids" => set_pids(dir, resources),
            "blkio" => set_blkio(dir, resources),
            "hugetlb" => set_hugetlb(dir, resources),
            "rdma" => set_rdma(dir, resources),
            "net_prio" => set_net_prio(dir, resources),
            "net_cls" => set_net_cls(dir, resources),
            "freezer" => match resources.freezer {
                Some(FreezerState::Undefined) | None => Ok(()),
                Some(state) => self.freeze_dir(dir, state),
            },
            _ => Ok(()),
        }
    }

    fn freeze_dir(&self, dir: &str, state: FreezerState) -> Result<()> {
        check_freeze_request(state)?;
        if state == FreezerState::Thawed {
            write_file(dir, FREEZER_STATE, FreezerState::Thawed.as_str())?;
            return Ok(());
        }

        let result = freeze_until_frozen(dir, self.freeze_timeout);
        if result.is_err() {
            // Leaving the cgroup FROZEN or FREEZING would hang its tasks.
            if let Err(err) = write_file(dir, FREEZER_STATE, FreezerState::Thawed.as_str()) {
                warn!("failed to thaw {} after a failed freeze: {}", dir, err);
            }
        }
        result
    }
}

impl Manager for FsManager {
    fn apply(&mut self, pid: Option<CgroupPid>) -> Result<()> {
        self.ensure_alive()?;

        let mut paths: Vec<(&String, &String)> = self.paths.iter().collect();
        paths.sort();
        for (subsystem, dir) in paths {
            if let Err(err) = self.join(subsystem, dir, pid) {
                // Unprivileged callers rarely own every hierarchy.
                if self.config.rootless && err.is_cgroupfs(CgroupfsErrorKind::PermissionDenied) {
                    debug!("rootless: unable to join {}: {}", dir, err);
                    continue;
                }
                return Err(err);
            }
        }

        self.state = Lifecycle::Applied;
        Ok(())
    }

    fn set(&mut self, resources: &Resources) -> Result<()> {
        self.ensure_applied()?;
        if !resources.unified.is_empty() {
            return Err(Error::V1NoUnified);
        }

        for subsystem in SUBSYSTEMS {
            let dir = self.subsystem_dir(subsystem);
            if let Err(err) = self.set_subsystem(subsystem, dir, resources) {
                // Devices are not expected to work without privileges.
                if self.config.rootless && *subsystem == "devices" {
                    debug!("rootless: ignoring devices error: {}", err);
                    continue;
                }
                if dir.is_empty() {
                    return Err(Error::SubsystemNotMounted(subsystem.to_string()));
                }
                return Err(err);
            }
        }

        self.config.resources = resources.clone();
        Ok(())
    }

    fn stats(&self, options: &StatsOptions) -> Result<CgroupStats> {
        self.ensure_applied()?;

        let sources = ControllerKind::V1.iter().filter_map(|kind| {
            self.paths
                .get(kind.subsystem())
                .map(|dir| (dir.as_str(), *kind))
        });
        Ok(collect(sources, options)?)
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        self.ensure_applied()?;
        let dir = self.paths.get("freezer").ok_or(Error::FreezerUnsupported)?;
        self.freeze_dir(dir, state)
    }

    fn freezer_state(&self) -> Result<FreezerState> {
        self.ensure_alive()?;
        match self.paths.get("freezer") {
            Some(dir) => Ok(freezer_state(dir)?),
            None => Ok(FreezerState::Undefined),
        }
    }

    fn destroy(&mut self) -> Result<()> {
        remove_paths(self.paths.values())?;
        self.state = Lifecycle::Destroyed;
        Ok(())
    }

    fn path(&self, subsystem: &str) -> String {
        self.subsystem_dir(subsystem).to_string()
    }

    fn paths(&self) -> &HashMap<String, String> {
        &self.paths
    }

    fn pids(&self) -> Result<Vec<CgroupPid>> {
        self.ensure_alive()?;
        let dir = self
            .procs_dir()
            .ok_or_else(|| Error::SubsystemNotMounted("devices".to_string()))?;
        Ok(read_procs(dir)?)
    }

    fn exists(&self) -> bool {
        self.procs_dir()
            .map(|dir| Path::new(dir).exists())
            .unwrap_or(false)
    }

    fn set_freeze_timeout(&mut self, timeout: Duration) {
        self.freeze_timeout = timeout;
    }

    fn systemd(&self) -> bool {
        false
    }

    fn v2(&self) -> bool {
        false
    }
}

fn subsystem_path(inner: &str, subsystem: &str) -> crate::fs::error::Result<String> {
    if inner.starts_with('/') {
        let mountpoint = find_cgroup_mountpoint("", subsystem)?;
        return Ok(join_path(&mountpoint, inner));
    }
    // Nested containers without a cgroup namespace see the host paths.
    let own = own_cgroup_path(subsystem)?;
    Ok(join_path(&own, inner))
}

/// Create the missing cpuset ancestors of `current`, each inheriting the
/// cpus and mems of its parent, as the kernel leaves them empty.
fn cpuset_ensure_parent(current: &Path) -> Result<()> {
    let parent = match current.parent() {
        Some(parent) => parent,
        None => return Ok(()),
    };

    match statfs(parent) {
        Ok(stat) if stat.filesystem_type() != CGROUP_SUPER_MAGIC => return Ok(()),
        Ok(_) | Err(Errno::ENOENT) => {}
        Err(errno) => {
            return Err(CgroupfsError::from(errno)
                .context(format!("statfs {}", parent.display()))
                .into())
        }
    }

    cpuset_ensure_parent(parent)?;
    match fs::create_dir(current) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(CgroupfsError::from(err)
                .context(current.display().to_string())
                .into())
        }
    }
    cpuset_copy_if_needed(&current.to_string_lossy(), &parent.to_string_lossy())
}

/// Fill the empty `cpuset.cpus` and `cpuset.mems` of `current` from
/// `parent`.
fn cpuset_copy_if_needed(current: &str, parent: &str) -> Result<()> {
    let read = |dir: &str, file: &str| match read_file(dir, file) {
        Ok(content) => Ok(content.trim().to_string()),
        // Not a cpuset directory.
        Err(err) if err.is_not_exist() => Ok(String::new()),
        Err(err) => Err(err),
    };

    for file in &[CPUSET_CPUS, CPUSET_MEMS] {
        if !read(current, *file)?.is_empty() {
            continue;
        }
        let inherited = read(parent, *file)?;
        if inherited.is_empty() {
            continue;
        }
        write_file(current, file, &inherited)?;
    }
    Ok(())
}

fn set_cpuset(dir: &str, resources: &Resources) -> Result<()> {
    if !resources.cpuset_cpus.is_empty() {
        write_file(dir, CPUSET_CPUS, &resources.cpuset_cpus)?;
    }
    if !resources.cpuset_mems.is_empty() {
        write_file(dir, CPUSET_MEMS, &resources.cpuset_mems)?;
    }
    Ok(())
}

fn set_memory_limit(dir: &str, limit: i64) -> Result<()> {
    match write_file(dir, MEMORY_LIMIT, &limit.to_string()) {
        Ok(()) => Ok(()),
        // The kernel refuses a limit below the current usage.
        Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
            let usage = get_cgroup_param_uint(dir, MEMORY_USAGE).unwrap_or(0);
            Err(Error::BelowUsage {
                what: "memory",
                limit,
                usage,
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn set_swap_limit(dir: &str, limit: i64) -> Result<()> {
    write_file(dir, MEMORY_SWAP_LIMIT, &limit.to_string())?;
    Ok(())
}

/// Write the memory and memory+swap limits in the order the kernel
/// accepts: memory+swap can never be below memory.
fn set_memory_and_swap(dir: &str, resources: &Resources) -> Result<()> {
    let memory = resources.memory.unwrap_or(0);
    let mut swap = resources.memory_swap.unwrap_or(0);

    // Unlimited memory with an unset swap means unlimited swap too, when
    // the kernel accounts swap at all.
    if memory == -1 && swap == 0 && Path::new(dir).join(MEMORY_SWAP_LIMIT).exists() {
        swap = -1;
    }

    if memory != 0 && swap != 0 {
        let current = get_cgroup_param_uint(dir, MEMORY_LIMIT)?;
        if swap == -1 || current < swap as u64 {
            set_swap_limit(dir, swap)?;
            return set_memory_limit(dir, memory);
        }
    }

    if memory != 0 {
        set_memory_limit(dir, memory)?;
    }
    if swap != 0 {
        set_swap_limit(dir, swap)?;
    }
    Ok(())
}

fn set_memory(dir: &str, resources: &Resources) -> Result<()> {
    if let Some(swappiness) = resources.memory_swappiness {
        if swappiness > 100 {
            return Err(Error::invalid(format!(
                "invalid memory swappiness value: {} (valid range is 0-100)",
                swappiness
            )));
        }
    }

    set_memory_and_swap(dir, resources)?;

    if let Some(reservation) = resources.memory_reservation.filter(|r| *r != 0) {
        write_file(dir, "memory.soft_limit_in_bytes", &reservation.to_string())?;
    }
    if resources.oom_kill_disable {
        write_file(dir, "memory.oom_control", "1")?;
    }
    if let Some(swappiness) = resources.memory_swappiness {
        write_file(dir, "memory.swappiness", &swappiness.to_string())?;
    }
    Ok(())
}

fn set_cpu(dir: &str, resources: &Resources) -> Result<()> {
    if let Some(shares) = resources.cpu_shares.filter(|s| *s != 0) {
        write_file(dir, CPU_SHARES, &shares.to_string())?;
        // The kernel clamps out of range shares silently.
        let read = get_cgroup_param_uint(dir, CPU_SHARES)?;
        if shares > read {
            return Err(Error::invalid(format!(
                "the maximum allowed cpu-shares is {}",
                read
            )));
        } else if shares < read {
            return Err(Error::invalid(format!(
                "the minimum allowed cpu-shares is {}",
                read
            )));
        }
    }

    let quota = resources.cpu_quota.unwrap_or(0);

    // A period or a burst rejected with EINVAL may only fit once the new
    // quota is in place, they are then written again after it.
    let mut period = None;
    if let Some(value) = resources.cpu_period.filter(|p| *p != 0) {
        match write_file(dir, CPU_CFS_PERIOD, &value.to_string()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) && quota != 0 => {
                period = Some(value)
            }
            Err(err) => return Err(err.into()),
        }
    }

    let mut burst = None;
    if let Some(value) = resources.cpu_burst {
        match write_file(dir, CPU_CFS_BURST, &value.to_string()) {
            Ok(()) => {}
            // Kernels before 5.14 have no burst.
            Err(err) if err.is_not_exist() => {}
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) && quota != 0 => {
                burst = Some(value)
            }
            Err(err) => return Err(err.into()),
        }
    }

    if quota != 0 {
        write_file(dir, CPU_CFS_QUOTA, &quota.to_string())?;
        if let Some(period) = period {
            write_file(dir, CPU_CFS_PERIOD, &period.to_string())?;
        }
        if let Some(burst) = burst {
            write_file(dir, CPU_CFS_BURST, &burst.to_string())?;
        }
    }

    if let Some(idle) = resources.cpu_idle {
        write_file(dir, "cpu.idle", &idle.to_string())?;
    }

    set_rt_sched(dir, resources)
}

/// Write the real-time period and runtime, which the kernel validates
/// against each other.
fn set_rt_sched(dir: &str, resources: &Resources) -> Result<()> {
    let runtime = resources.cpu_rt_runtime.unwrap_or(0);

    let mut period = None;
    if let Some(value) = resources.cpu_rt_period.filter(|p| *p != 0) {
        match write_file(dir, CPU_RT_PERIOD, &value.to_string()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) && runtime != 0 => {
                period = Some(value)
            }
            Err(err) => return Err(err.into()),
        }
    }

    if runtime != 0 {
        write_file(dir, CPU_RT_RUNTIME, &runtime.to_string())?;
        if let Some(period) = period {
            write_file(dir, CPU_RT_PERIOD, &period.to_string())?;
        }
    }
    Ok(())
}

/// The `pids.max` value of a limit: 0 still lets one task in.
pub(crate) fn pids_max(limit: i64) -> String {
    match limit {
        0 => "1".to_string(),
        limit if limit < 0 => "max".to_string(),
        limit => limit.to_string(),
    }
}

fn set_pids(dir: &str, resources: &Resources) -> Result<()> {
    if let Some(limit) = resources.pids_limit {
        write_file(dir, "pids.max", &pids_max(limit))?;
    }
    Ok(())
}

fn set_blkio(dir: &str, resources: &Resources) -> Result<()> {
    // Kernels with the BFQ scheduler name the weight after it.
    let (weight_file, weight_device_file) = if Path::new(dir).join("blkio.bfq.weight").exists() {
        ("blkio.bfq.weight", "blkio.bfq.weight_device")
    } else {
        ("blkio.weight", "blkio.weight_device")
    };

    if let Some(weight) = resources.blkio_weight.filter(|w| *w != 0) {
        write_file(dir, weight_file, &weight.to_string())?;
    }
    if let Some(weight) = resources.blkio_leaf_weight.filter(|w| *w != 0) {
        write_file(dir, "blkio.leaf_weight", &weight.to_string())?;
    }
    for device in resources.blkio_weight_device.iter() {
        if let Some(line) = device.weight_string() {
            write_file(dir, weight_device_file, &line)?;
        }
        if let Some(line) = device.leaf_weight_string() {
            write_file(dir, "blkio.leaf_weight_device", &line)?;
        }
    }

    let throttles = [
        (
            "blkio.throttle.read_bps_device",
            &resources.blkio_throttle_read_bps_device,
        ),
        (
            "blkio.throttle.write_bps_device",
            &resources.blkio_throttle_write_bps_device,
        ),
        (
            "blkio.throttle.read_iops_device",
            &resources.blkio_throttle_read_iops_device,
        ),
        (
            "blkio.throttle.write_iops_device",
            &resources.blkio_throttle_write_iops_device,
        ),
    ];
    for (file, devices) in throttles.iter() {
        for device in devices.iter() {
            write_file(dir, file, &device.to_string())?;
        }
    }
    Ok(())
}

fn set_hugetlb(dir: &str, resources: &Resources) -> Result<()> {
    let mut skip_rsvd = false;
    for limit in resources.hugetlb_limit.iter() {
        let value = limit.limit.to_string();
        write_file(
            dir,
            &format!("hugetlb.{}.limit_in_bytes", limit.page_size),
            &value,
        )?;
        if skip_rsvd {
            continue;
        }
        // Reservations are accounted since 5.7.
        match write_file(
            dir,
            &format!("hugetlb.{}.rsvd.limit_in_bytes", limit.page_size),
            &value,
        ) {
            Ok(()) => {}
            Err(err) if err.is_not_exist() => skip_rsvd = true,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub(crate) fn set_rdma(dir: &str, resources: &Resources) -> Result<()> {
    for (device, limit) in resources.rdma.iter() {
        write_file(dir, "rdma.max", &limit.rdma_string(device))?;
    }
    Ok(())
}

fn set_net_prio(dir: &str, resources: &Resources) -> Result<()> {
    for prio in resources.net_prio_ifpriomap.iter() {
        write_file(dir, "net_prio.ifpriomap", &prio.to_string())?;
    }
    Ok(())
}

fn set_net_cls(dir: &str, resources: &Resources) -> Result<()> {
    if let Some(classid) = resources.net_cls_classid.filter(|c| *c != 0) {
        write_file(dir, "net_cls.classid", &classid.to_string())?;
    }
    Ok(())
}

/// Write FROZEN until the kernel reports the cgroup frozen. New tasks
/// joining the cgroup may keep it in FREEZING, an occasional thaw gives
/// the freeze another chance.
fn freeze_until_frozen(dir: &str, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let mut attempt = 0;
    while start.elapsed() < timeout {
        if attempt % FREEZE_THAW_EVERY == FREEZE_THAW_EVERY - 1 {
            if let Err(err) = write_file(dir, FREEZER_STATE, FreezerState::Thawed.as_str()) {
                warn!("failed to thaw {} between freeze attempts: {}", dir, err);
            }
            thread::sleep(Duration::from_millis(10));
        }

        write_file(dir, FREEZER_STATE, FreezerState::Frozen.as_str())?;
        if attempt % 25 == 24 {
            thread::sleep(Duration::from_micros(10));
        }

        let state = read_file(dir, FREEZER_STATE)?;
        match state.trim() {
            "FREEZING" => {}
            "FROZEN" => {
                if attempt > 1 {
                    debug!("{} frozen after {} retries", dir, attempt);
                }
                return Ok(());
            }
            other => {
                return Err(Error::invalid(format!(
                    "unexpected state {} while freezing",
                    other
                )))
            }
        }
        attempt += 1;
    }
    Err(Error::FreezeTimeout(timeout))
}

fn freezer_state(dir: &str) -> crate::fs::error::Result<FreezerState> {
    loop {
        let state = match read_file(dir, FREEZER_STATE) {
            Ok(state) => state,
            Err(err) if err.is_not_exist() || err.raw_os_error() == Some(libc::ENODEV) => {
                return Ok(FreezerState::Undefined)
            }
            Err(err) => return Err(err),
        };

        match state.trim() {
            "THAWED" => return Ok(FreezerState::Thawed),
            // FROZEN is inherited from frozen ancestors too.
            "FROZEN" => {
                return match read_file(dir, FREEZER_SELF_FREEZING) {
                    Ok(own) => match own.trim() {
                        "0" => Ok(FreezerState::Thawed),
                        "1" => Ok(FreezerState::Frozen),
                        other => Err(CgroupfsError::parse(format!(
                            "unknown {} state: {:?}",
                            FREEZER_SELF_FREEZING, other
                        ))),
                    },
                    Err(err)
                        if err.is_not_exist() || err.raw_os_error() == Some(libc::ENODEV) =>
                    {
                        Ok(FreezerState::Frozen)
                    }
                    Err(err) => Err(err),
                };
            }
            // Settles shortly.
            "FREEZING" => thread::sleep(Duration::from_millis(1)),
            other => {
                return Err(CgroupfsError::parse(format!(
                    "unknown {} {:?}",
                    FREEZER_STATE, other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HugepageLimit, ThrottleDevice, WeightDevice};
    use crate::manager::ErrorKind;
    use tempfile::TempDir;

    fn subsystem_dir(root: &str, subsystem: &str) -> String {
        format!("{}/{}/sandbox", root, subsystem)
    }

    fn manager(root: &str, subsystems: &[&str]) -> FsManager {
        let paths = subsystems
            .iter()
            .map(|s| (s.to_string(), subsystem_dir(root, s)))
            .collect();
        let mut config = Cgroup::with_path("/sandbox");
        config.resources.skip_devices = true;
        FsManager::with_paths(&config, paths).unwrap()
    }

    fn base_resources() -> Resources {
        Resources {
            skip_devices: true,
            ..Default::default()
        }
    }

    fn content(dir: &str, file: &str) -> String {
        fs::read_to_string(format!("{}/{}", dir, file)).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["cpu", "memory"]);

        let resources = base_resources();
        assert!(matches!(manager.set(&resources), Err(Error::NotApplied)));
        assert!(matches!(
            manager.stats(&StatsOptions::default()),
            Err(Error::NotApplied)
        ));
        assert!(matches!(
            manager.freeze(FreezerState::Frozen),
            Err(Error::NotApplied)
        ));

        manager.apply(None).unwrap();
        assert!(Path::new(&subsystem_dir(root, "cpu")).is_dir());
        assert!(Path::new(&subsystem_dir(root, "memory")).is_dir());
        assert!(manager.exists());
        assert_eq!(manager.path("cpu"), subsystem_dir(root, "cpu"));
        assert_eq!(manager.path("blkio"), "");

        manager.destroy().unwrap();
        assert!(!Path::new(&subsystem_dir(root, "cpu")).exists());
        manager.destroy().unwrap();
        assert!(matches!(manager.set(&resources), Err(Error::Destroyed)));
        assert!(matches!(manager.apply(None), Err(Error::Destroyed)));
    }

    #[test]
    fn test_unified_rejected() {
        let mut config = Cgroup::with_path("/sandbox");
        config
            .resources
            .unified
            .insert("memory.high".to_string(), "max".to_string());
        let err = FsManager::with_paths(&config, HashMap::new()).err().unwrap();
        assert!(matches!(err, Error::V1NoUnified));
    }

    #[test]
    fn test_set_memory_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["memory"]);
        manager.apply(None).unwrap();
        let dir = subsystem_dir(root, "memory");
        fs::write(format!("{}/{}", dir, MEMORY_LIMIT), "1000").unwrap();

        let resources = Resources {
            memory: Some(2000),
            memory_swap: Some(3000),
            memory_reservation: Some(1500),
            memory_swappiness: Some(10),
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&dir, MEMORY_LIMIT), "2000");
        assert_eq!(content(&dir, MEMORY_SWAP_LIMIT), "3000");
        assert_eq!(content(&dir, "memory.soft_limit_in_bytes"), "1500");
        assert_eq!(content(&dir, "memory.swappiness"), "10");

        let resources = Resources {
            memory_swappiness: Some(101),
            ..base_resources()
        };
        assert_eq!(manager.set(&resources).unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_set_cpu() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        // The cpuset hierarchy is mounted, only the cgroup is missing.
        fs::create_dir(format!("{}/cpuset", root)).unwrap();
        let mut manager = manager(root, &["cpu", "cpuset"]);
        manager.apply(None).unwrap();

        let resources = Resources {
            cpu_shares: Some(512),
            cpu_quota: Some(50_000),
            cpu_period: Some(100_000),
            cpu_rt_runtime: Some(1000),
            cpu_rt_period: Some(10_000),
            cpuset_cpus: "0-1".to_string(),
            ..base_resources()
        };
        manager.set(&resources).unwrap();

        let dir = subsystem_dir(root, "cpu");
        assert_eq!(content(&dir, CPU_SHARES), "512");
        assert_eq!(content(&dir, CPU_CFS_QUOTA), "50000");
        assert_eq!(content(&dir, CPU_CFS_PERIOD), "100000");
        assert_eq!(content(&dir, CPU_RT_RUNTIME), "1000");
        assert_eq!(content(&dir, CPU_RT_PERIOD), "10000");
        assert_eq!(content(&subsystem_dir(root, "cpuset"), CPUSET_CPUS), "0-1");
    }

    #[test]
    fn test_set_pids_and_blkio() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["pids", "blkio", "hugetlb"]);
        manager.apply(None).unwrap();

        let pids = subsystem_dir(root, "pids");
        for (limit, expected) in &[(0, "1"), (-1, "max"), (64, "64")] {
            let resources = Resources {
                pids_limit: Some(*limit),
                ..base_resources()
            };
            manager.set(&resources).unwrap();
            assert_eq!(content(&pids, "pids.max"), *expected);
        }

        let blkio = subsystem_dir(root, "blkio");
        fs::write(format!("{}/blkio.bfq.weight", blkio), "100").unwrap();
        let resources = Resources {
            blkio_weight: Some(300),
            blkio_weight_device: vec![WeightDevice {
                major: 8,
                minor: 0,
                weight: Some(400),
                leaf_weight: None,
            }],
            blkio_throttle_read_bps_device: vec![ThrottleDevice {
                major: 8,
                minor: 0,
                rate: 1024,
            }],
            hugetlb_limit: vec![HugepageLimit {
                page_size: "2MB".to_string(),
                limit: 4096,
            }],
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&blkio, "blkio.bfq.weight"), "300");
        assert_eq!(content(&blkio, "blkio.bfq.weight_device"), "8:0 400");
        assert_eq!(content(&blkio, "blkio.throttle.read_bps_device"), "8:0 1024");
        assert!(!Path::new(&blkio).join("blkio.weight").exists());

        let hugetlb = subsystem_dir(root, "hugetlb");
        assert_eq!(content(&hugetlb, "hugetlb.2MB.limit_in_bytes"), "4096");
        assert_eq!(content(&hugetlb, "hugetlb.2MB.rsvd.limit_in_bytes"), "4096");
    }

    #[test]
    fn test_set_missing_subsystem() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["cpu"]);
        manager.apply(None).unwrap();

        let resources = Resources {
            pids_limit: Some(10),
            ..base_resources()
        };
        let err = manager.set(&resources).unwrap_err();
        assert!(matches!(err, Error::SubsystemNotMounted(ref s) if s == "pids"));

        // Nothing to write, nothing to complain about.
        manager.set(&base_resources()).unwrap();
    }

    #[test]
    fn test_freeze() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["freezer"]);
        manager.apply(None).unwrap();
        let dir = subsystem_dir(root, "freezer");

        manager.freeze(FreezerState::Frozen).unwrap();
        assert_eq!(content(&dir, FREEZER_STATE), "FROZEN");
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Frozen);

        // Frozen by an ancestor only.
        fs::write(format!("{}/{}", dir, FREEZER_SELF_FREEZING), "0\n").unwrap();
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Thawed);

        manager.freeze(FreezerState::Thawed).unwrap();
        assert_eq!(content(&dir, FREEZER_STATE), "THAWED");
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Thawed);

        assert!(manager.freeze(FreezerState::Freezing).is_err());
    }

    #[test]
    fn test_freezer_missing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["cpu"]);
        manager.apply(None).unwrap();
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Undefined);
        assert!(matches!(
            manager.freeze(FreezerState::Frozen),
            Err(Error::FreezerUnsupported)
        ));
    }

    #[test]
    fn test_cpuset_copy_if_needed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let parent = root;
        let child = format!("{}/child", parent);
        fs::create_dir(&child).unwrap();
        fs::write(format!("{}/{}", parent, CPUSET_CPUS), "0-3\n").unwrap();
        fs::write(format!("{}/{}", parent, CPUSET_MEMS), "0\n").unwrap();
        fs::write(format!("{}/{}", child, CPUSET_CPUS), "\n").unwrap();
        fs::write(format!("{}/{}", child, CPUSET_MEMS), "1\n").unwrap();

        cpuset_copy_if_needed(&child, parent).unwrap();
        assert_eq!(content(&child, CPUSET_CPUS), "0-3");
        assert_eq!(content(&child, CPUSET_MEMS), "1\n");
    }

    #[test]
    fn test_stats() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root, &["pids", "cpu"]);
        manager.apply(None).unwrap();

        let pids = subsystem_dir(root, "pids");
        fs::write(format!("{}/pids.current", pids), "3\n").unwrap();
        fs::write(format!("{}/pids.max", pids), "max\n").unwrap();

        let stats = manager.stats(&StatsOptions::default()).unwrap();
        assert_eq!(stats.pids.current, 3);
        assert_eq!(stats.pids.limit, 0);
    }
}
