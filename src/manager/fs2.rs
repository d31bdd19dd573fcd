// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Cgroup v2 manager writing cgroupfs directly.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::{Cgroup, Resources};
use crate::devices::{self, Emulator};
use crate::fs::error::ErrorKind as CgroupfsErrorKind;
use crate::fs::mountinfo::own_cgroup_path;
use crate::fs::utils::{
    get_cgroup_param_uint, join_path, read_procs, remove_path, write_cgroup_proc,
};
use crate::fs::{read_file, write_file, write_file_by_line, CGROUPFS_ROOT};
use crate::manager::conv::{
    blkio_weight_to_io_weight, cpu_shares_to_cgroup_v2, memory_swap_to_cgroup_v2,
};
use crate::manager::error::{Error, Result};
use crate::manager::fs::{pids_max, set_rdma};
use crate::manager::{
    check_freeze_request, inner_path, Lifecycle, Manager, DEFAULT_FREEZE_TIMEOUT,
};
use crate::stats::{collect, CgroupStats, ControllerKind, StatsOptions};
use crate::{CgroupPid, FreezerState};

const CGROUP_CONTROLLERS: &str = "cgroup.controllers";
const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";
const CGROUP_TYPE: &str = "cgroup.type";
const CGROUP_FREEZE: &str = "cgroup.freeze";
const CGROUP_EVENTS: &str = "cgroup.events";

const MEMORY_SWAP_MAX: &str = "memory.swap.max";

/// How often `cgroup.events` is read while waiting for a freeze.
const FREEZE_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Fs2Manager {
    config: Cgroup,
    /// The cgroup2 mount the cgroup lives in.
    root: String,
    dir: String,
    /// The single unified path, keyed by the empty subsystem.
    paths: HashMap<String, String>,
    state: Lifecycle,
    freeze_timeout: Duration,
}

impl Fs2Manager {
    pub fn new(config: &Cgroup) -> Result<Self> {
        let inner = inner_path(config)?;
        let dir = if inner.starts_with('/') {
            join_path(CGROUPFS_ROOT, &inner)
        } else {
            join_path(&own_cgroup_path("")?, &inner)
        };
        Ok(Self::with_root(config, CGROUPFS_ROOT, &dir))
    }

    /// Create a manager over a known cgroup directory.
    pub fn with_path(config: &Cgroup, dir: &str) -> Self {
        Self::with_root(config, CGROUPFS_ROOT, dir)
    }

    pub(crate) fn with_root(config: &Cgroup, root: &str, dir: &str) -> Self {
        let mut paths = HashMap::new();
        paths.insert(String::new(), dir.to_string());
        Self {
            config: config.clone(),
            root: root.to_string(),
            dir: dir.to_string(),
            paths,
            state: Lifecycle::Unapplied,
            freeze_timeout: DEFAULT_FREEZE_TIMEOUT,
        }
    }

    pub(crate) fn dir(&self) -> &str {
        &self.dir
    }

    pub(crate) fn ensure_applied(&self) -> Result<()> {
        self.state.ensure_applied()
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        self.state.ensure_alive()
    }

    /// Create the cgroup directory and its missing ancestors, delegating
    /// every available controller down to it. New directories are
    /// recorded in `created`, deepest last.
    fn create_path(&self, created: &mut Vec<PathBuf>) -> Result<()> {
        let relative = Path::new(&self.dir)
            .strip_prefix(&self.root)
            .map_err(|_| Error::invalid(format!("invalid cgroup path {}", self.dir)))?;

        let available = read_file(&self.root, CGROUP_CONTROLLERS)?;
        let controllers: Vec<String> = available
            .split_whitespace()
            .map(|c| format!("+{}", c))
            .collect();

        let domain = needs_domain_controllers(&self.config.resources);
        let elements: Vec<_> = relative.components().collect();
        let mut current = PathBuf::from(&self.root);
        for i in 0..=elements.len() {
            if i > 0 {
                current.push(elements[i - 1]);
                match fs::create_dir(&current) {
                    Ok(()) => created.push(current.clone()),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => {
                        return Err(crate::fs::error::Error::from(err)
                            .context(current.display().to_string())
                            .into())
                    }
                }
                check_cgroup_type(&current.to_string_lossy(), domain)?;
            }

            // The leaf keeps its controllers for itself.
            if i < elements.len() {
                enable_controllers(&current.to_string_lossy(), &controllers);
            }
        }
        Ok(())
    }

    fn set_resources(&self, resources: &Resources) -> Result<()> {
        let dir = self.dir.as_str();

        if let Some(limit) = resources.pids_limit {
            write_file(dir, "pids.max", &pids_max(limit))?;
        }
        set_memory(dir, resources)?;
        set_io(dir, resources)?;
        set_cpu(dir, resources)?;

        check_devices(resources)?;

        if !resources.cpuset_cpus.is_empty() {
            write_file(dir, "cpuset.cpus", &resources.cpuset_cpus)?;
        }
        if !resources.cpuset_mems.is_empty() {
            write_file(dir, "cpuset.mems", &resources.cpuset_mems)?;
        }

        set_hugetlb(dir, resources)?;
        set_rdma(dir, resources)?;

        match resources.freezer {
            Some(FreezerState::Undefined) | None => {}
            Some(state) => self.freeze_dir(state)?,
        }

        self.set_unified(&resources.unified)
    }

    fn set_unified(&self, unified: &HashMap<String, String>) -> Result<()> {
        let mut keys: Vec<&String> = unified.keys().collect();
        keys.sort();
        for key in keys {
            let controller = unified_controller(key)?;
            if let Err(err) = write_file_by_line(&self.dir, key, &unified[key]) {
                if err.is_not_exist() || err.kind() == CgroupfsErrorKind::PermissionDenied {
                    let available = read_file(&self.dir, CGROUP_CONTROLLERS).unwrap_or_default();
                    if !available.split_whitespace().any(|c| c == controller) {
                        return Err(Error::ControllerNotAvailable(controller.to_string()));
                    }
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn freeze_dir(&self, state: FreezerState) -> Result<()> {
        check_freeze_request(state)?;

        if !Path::new(&self.dir).join(CGROUP_FREEZE).exists() {
            // Without a freezer nothing is frozen, so thawing is done.
            return match state {
                FreezerState::Frozen => Err(Error::FreezerUnsupported),
                _ => Ok(()),
            };
        }

        match state {
            FreezerState::Frozen => {
                write_file(&self.dir, CGROUP_FREEZE, "1")?;
                if let Err(err) = wait_frozen(&self.dir, self.freeze_timeout) {
                    if let Err(thaw_err) = write_file(&self.dir, CGROUP_FREEZE, "0") {
                        warn!("failed to thaw {}: {}", self.dir, thaw_err);
                    }
                    return Err(err);
                }
            }
            _ => write_file(&self.dir, CGROUP_FREEZE, "0")?,
        }
        Ok(())
    }
}

impl Manager for Fs2Manager {
    fn apply(&mut self, pid: Option<CgroupPid>) -> Result<()> {
        self.ensure_alive()?;

        let mut created = vec![];
        if let Err(err) = self.create_path(&mut created) {
            for dir in created.iter().rev() {
                if let Err(err) = fs::remove_dir(dir) {
                    warn!("failed to clean up {}: {}", dir.display(), err);
                }
            }
            // An unprivileged caller with no cgroup of its own may do
            // without one.
            if self.config.rootless
                && self.config.path.is_empty()
                && err.is_cgroupfs(CgroupfsErrorKind::PermissionDenied)
            {
                debug!("rootless: unable to create {}: {}", self.dir, err);
                self.state = Lifecycle::Applied;
                return Ok(());
            }
            return Err(err);
        }

        write_cgroup_proc(&self.dir, pid)?;
        self.state = Lifecycle::Applied;
        Ok(())
    }

    fn set(&mut self, resources: &Resources) -> Result<()> {
        self.ensure_applied()?;
        self.set_resources(resources)?;
        self.config.resources = resources.clone();
        Ok(())
    }

    fn stats(&self, options: &StatsOptions) -> Result<CgroupStats> {
        self.ensure_applied()?;
        let sources = ControllerKind::V2
            .iter()
            .map(|kind| (self.dir.as_str(), *kind));
        Ok(collect(sources, options)?)
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        self.ensure_applied()?;
        self.freeze_dir(state)
    }

    fn freezer_state(&self) -> Result<FreezerState> {
        self.ensure_alive()?;
        let freeze = match read_file(&self.dir, CGROUP_FREEZE) {
            Ok(freeze) => freeze,
            Err(err) if err.is_not_exist() || err.raw_os_error() == Some(libc::ENODEV) => {
                return Ok(FreezerState::Undefined)
            }
            Err(err) => return Err(err.into()),
        };
        match freeze.trim() {
            "0" => Ok(FreezerState::Thawed),
            "1" => {
                if is_frozen(&read_file(&self.dir, CGROUP_EVENTS)?) {
                    Ok(FreezerState::Frozen)
                } else {
                    Ok(FreezerState::Freezing)
                }
            }
            other => Err(Error::invalid(format!(
                "unknown {} value {:?}",
                CGROUP_FREEZE, other
            ))),
        }
    }

    fn destroy(&mut self) -> Result<()> {
        remove_path(&self.dir)?;
        self.state = Lifecycle::Destroyed;
        Ok(())
    }

    fn path(&self, _subsystem: &str) -> String {
        self.dir.clone()
    }

    fn paths(&self) -> &HashMap<String, String> {
        &self.paths
    }

    fn pids(&self) -> Result<Vec<CgroupPid>> {
        self.ensure_alive()?;
        Ok(read_procs(&self.dir)?)
    }

    fn exists(&self) -> bool {
        Path::new(&self.dir).exists()
    }

    fn set_freeze_timeout(&mut self, timeout: Duration) {
        self.freeze_timeout = timeout;
    }

    fn systemd(&self) -> bool {
        false
    }

    fn v2(&self) -> bool {
        true
    }
}

/// Whether `resources` asks for controllers a threaded cgroup cannot
/// have.
fn needs_domain_controllers(resources: &Resources) -> bool {
    resources.has_memory_limits()
        || resources.cpu_shares.is_some()
        || resources.cpu_weight.is_some()
        || resources.has_cpu_quota()
        || resources.cpu_idle.is_some()
        || resources.blkio_weight.is_some()
        || !resources.blkio_weight_device.is_empty()
        || !resources.blkio_throttle_read_bps_device.is_empty()
        || !resources.blkio_throttle_write_bps_device.is_empty()
        || !resources.blkio_throttle_read_iops_device.is_empty()
        || !resources.blkio_throttle_write_iops_device.is_empty()
        || !resources.hugetlb_limit.is_empty()
}

/// Refuse to enter a cgroup whose mode cannot host domain controllers
/// when they are needed.
fn check_cgroup_type(dir: &str, domain: bool) -> Result<()> {
    let cgroup_type = read_file(dir, CGROUP_TYPE).unwrap_or_default();
    match cgroup_type.trim() {
        // An internal process sits in the tree above.
        "domain invalid" => {
            if domain {
                return Err(Error::invalid(format!(
                    "cannot enter cgroupv2 {} with domain controllers, it is in an invalid state",
                    dir
                )));
            }
            // Only thread-aware controllers are wanted.
            if let Err(err) = write_file(dir, CGROUP_TYPE, "threaded") {
                debug!("unable to switch {} to threaded: {}", dir, err);
            }
        }
        mode @ "domain threaded" | mode @ "threaded" => {
            if domain {
                return Err(Error::invalid(format!(
                    "cannot enter cgroupv2 {} with domain controllers, it is in {} mode",
                    dir, mode
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Enable `controllers` for the children of `dir`. When the kernel
/// refuses the whole set they are tried one by one.
fn enable_controllers(dir: &str, controllers: &[String]) {
    if controllers.is_empty() {
        return;
    }
    if write_file(dir, CGROUP_SUBTREE_CONTROL, &controllers.join(" ")).is_ok() {
        return;
    }
    // Controllers missing here fail later, in set.
    for controller in controllers {
        if let Err(err) = write_file(dir, CGROUP_SUBTREE_CONTROL, controller) {
            debug!("unable to enable {} in {}: {}", controller, dir, err);
        }
    }
}

/// Reject memory limits at or below what the cgroup already uses. The
/// check races with the workload and only catches obvious mistakes.
pub(crate) fn check_memory_usage(dir: &str, resources: &Resources) -> Result<()> {
    if !resources.memory_check_before_update {
        return Ok(());
    }
    let memory = resources.memory.unwrap_or(0);
    let swap = resources.memory_swap.unwrap_or(0);
    if memory <= 0 && swap <= 0 {
        return Ok(());
    }

    let usage = match get_cgroup_param_uint(dir, "memory.current") {
        Ok(usage) => usage,
        Err(_) => return Ok(()),
    };
    if swap > 0 && swap as u64 <= usage {
        return Err(Error::BelowUsage {
            what: "memory+swap",
            limit: swap,
            usage,
        });
    }
    if memory > 0 && memory as u64 <= usage {
        return Err(Error::BelowUsage {
            what: "memory",
            limit: memory,
            usage,
        });
    }
    Ok(())
}

/// The cgroup v2 value of a limit where -1 means unlimited and 0 unset.
fn limit_value(limit: i64) -> Option<String> {
    match limit {
        0 => None,
        limit if limit < 0 => Some("max".to_string()),
        limit => Some(limit.to_string()),
    }
}

fn set_memory(dir: &str, resources: &Resources) -> Result<()> {
    if !resources.has_memory_limits() {
        return Ok(());
    }
    check_memory_usage(dir, resources)?;

    let memory = resources.memory.unwrap_or(0);
    let memory_swap = resources.memory_swap.unwrap_or(0);
    let swap = memory_swap_to_cgroup_v2(memory_swap, memory)?;
    let swap_value = match limit_value(swap) {
        // Memory and memory+swap are equal, no swap at all.
        None if memory_swap > 0 => Some("0".to_string()),
        value => value,
    };
    if let Some(value) = swap_value {
        if let Err(err) = write_file(dir, MEMORY_SWAP_MAX, &value) {
            // Without swap accounting, unlimited or no swap is a given.
            if !(err.is_not_exist() && (value == "max" || value == "0")) {
                return Err(err.into());
            }
        }
    }

    if let Some(value) = limit_value(memory) {
        write_file(dir, "memory.max", &value)?;
    }
    if let Some(value) = resources.memory_reservation.and_then(limit_value) {
        write_file(dir, "memory.low", &value)?;
    }
    Ok(())
}

fn set_io(dir: &str, resources: &Resources) -> Result<()> {
    let weight = resources.blkio_weight.filter(|w| *w != 0);
    let bfq = (weight.is_some() || !resources.blkio_weight_device.is_empty())
        && Path::new(dir).join("io.bfq.weight").exists();

    if let Some(weight) = weight {
        if bfq {
            write_file(dir, "io.bfq.weight", &weight.to_string())?;
        } else {
            let weight = blkio_weight_to_io_weight(u64::from(weight));
            write_file(dir, "io.weight", &weight.to_string())?;
        }
    }
    // Only BFQ weighs devices.
    if bfq {
        for device in resources.blkio_weight_device.iter() {
            if let Some(line) = device.weight_string() {
                write_file(dir, "io.bfq.weight", &line)?;
            }
        }
    }

    let throttles = [
        ("rbps", &resources.blkio_throttle_read_bps_device),
        ("wbps", &resources.blkio_throttle_write_bps_device),
        ("riops", &resources.blkio_throttle_read_iops_device),
        ("wiops", &resources.blkio_throttle_write_iops_device),
    ];
    for (name, devices) in throttles.iter() {
        for device in devices.iter() {
            let line = format!("{}:{} {}={}", device.major, device.minor, name, device.rate);
            write_file(dir, "io.max", &line)?;
        }
    }
    Ok(())
}

/// The `cpu.max` line: the quota, or "max", then the period when set.
fn cpu_max(quota: i64, period: u64) -> String {
    let mut line = if quota > 0 {
        quota.to_string()
    } else {
        "max".to_string()
    };
    if period != 0 {
        line.push_str(&format!(" {}", period));
    }
    line
}

fn set_cpu(dir: &str, resources: &Resources) -> Result<()> {
    if let Some(idle) = resources.cpu_idle {
        write_file(dir, "cpu.idle", &idle.to_string())?;
    }

    let weight = resources
        .cpu_weight
        .or_else(|| resources.cpu_shares.map(cpu_shares_to_cgroup_v2))
        .filter(|w| *w != 0);
    if let Some(weight) = weight {
        write_file(dir, "cpu.weight", &weight.to_string())?;
    }

    let quota = resources.cpu_quota.unwrap_or(0);
    let period = resources.cpu_period.unwrap_or(0);

    // A burst above the old quota is refused until the new quota is in.
    let mut burst = None;
    if let Some(value) = resources.cpu_burst {
        match write_file(dir, "cpu.max.burst", &value.to_string()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) && quota != 0 => {
                burst = Some(value)
            }
            Err(err) => return Err(err.into()),
        }
    }

    if quota != 0 || period != 0 {
        write_file(dir, "cpu.max", &cpu_max(quota, period))?;
        if let Some(burst) = burst {
            write_file(dir, "cpu.max.burst", &burst.to_string())?;
        }
    }
    Ok(())
}

/// Device rules need an eBPF program on cgroup v2, which is not
/// supported here. Without one every device is allowed, which is all an
/// allow-all policy asks for.
fn check_devices(resources: &Resources) -> Result<()> {
    if resources.skip_devices || resources.devices.is_empty() {
        return Ok(());
    }
    if devices::v1::running_in_user_ns() {
        debug!("in a user namespace, ignoring device rules");
        return Ok(());
    }
    if Emulator::from_rules(&resources.devices)?.is_allow_all() {
        return Ok(());
    }
    Err(Error::DevicesUnsupported)
}

fn set_hugetlb(dir: &str, resources: &Resources) -> Result<()> {
    let mut skip_rsvd = false;
    for limit in resources.hugetlb_limit.iter() {
        let value = limit.limit.to_string();
        write_file(dir, &format!("hugetlb.{}.max", limit.page_size), &value)?;
        if skip_rsvd {
            continue;
        }
        match write_file(dir, &format!("hugetlb.{}.rsvd.max", limit.page_size), &value) {
            Ok(()) => {}
            Err(err) if err.is_not_exist() => skip_rsvd = true,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// The controller of a unified key, e.g. `memory` for `memory.high`.
pub(crate) fn unified_controller(key: &str) -> Result<&str> {
    if key.contains('/') {
        return Err(Error::invalid(format!(
            "unified resource {:?} must be a file name (no slashes)",
            key
        )));
    }
    match key.split_once('.') {
        Some((controller, _)) if !controller.is_empty() => Ok(controller),
        _ => Err(Error::invalid(format!(
            "unified resource {:?} must be in the form CONTROLLER.PARAMETER",
            key
        ))),
    }
}

fn is_frozen(events: &str) -> bool {
    events
        .lines()
        .filter_map(|line| line.strip_prefix("frozen "))
        .any(|value| value.trim() == "1")
}

fn wait_frozen(dir: &str, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if is_frozen(&read_file(dir, CGROUP_EVENTS)?) {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::FreezeTimeout(timeout));
        }
        thread::sleep(FREEZE_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HugepageLimit, ThrottleDevice};
    use crate::devices::DeviceRule;
    use crate::manager::ErrorKind;
    use tempfile::TempDir;

    fn base_resources() -> Resources {
        Resources {
            skip_devices: true,
            ..Default::default()
        }
    }

    fn content(dir: &str, file: &str) -> String {
        fs::read_to_string(format!("{}/{}", dir, file)).unwrap()
    }

    /// A manager for `root/kata/sandbox`, with `cpu memory pids` at the
    /// root.
    fn manager(root: &str) -> Fs2Manager {
        fs::write(
            format!("{}/{}", root, CGROUP_CONTROLLERS),
            "cpu memory pids\n",
        )
        .unwrap();
        let dir = format!("{}/kata/sandbox", root);
        Fs2Manager::with_root(&Cgroup::with_path("/kata/sandbox"), root, &dir)
    }

    fn applied(root: &str) -> Fs2Manager {
        let mut manager = manager(root);
        manager.apply(None).unwrap();
        manager
    }

    #[test]
    fn test_apply_enables_controllers() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root);
        assert!(!manager.exists());
        manager.apply(None).unwrap();
        assert!(manager.exists());

        let kata = format!("{}/kata", root);
        assert_eq!(
            content(root, CGROUP_SUBTREE_CONTROL),
            "+cpu +memory +pids"
        );
        assert_eq!(content(&kata, CGROUP_SUBTREE_CONTROL), "+cpu +memory +pids");
        assert!(!Path::new(manager.dir()).join(CGROUP_SUBTREE_CONTROL).exists());
        assert_eq!(manager.path("memory"), manager.dir());
        assert_eq!(manager.paths()[""], manager.dir());
    }

    #[test]
    fn test_apply_outside_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = Fs2Manager::with_root(&Cgroup::default(), root, "/elsewhere");
        assert_eq!(manager.apply(None).unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_apply_domain_invalid() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let kata = format!("{}/kata", root);
        fs::create_dir(&kata).unwrap();
        fs::write(format!("{}/{}", kata, CGROUP_TYPE), "domain invalid\n").unwrap();

        let mut config = Cgroup::with_path("/kata/sandbox");
        config.resources.memory = Some(1 << 30);
        let dir = format!("{}/sandbox", kata);
        fs::write(format!("{}/{}", root, CGROUP_CONTROLLERS), "memory\n").unwrap();

        let mut manager = Fs2Manager::with_root(&config, root, &dir);
        assert!(manager.apply(None).is_err());
        // Only what the failed apply created is removed.
        assert!(Path::new(&kata).exists());
        assert!(!Path::new(&dir).exists());

        // Thread-aware controllers turn the parent threaded.
        config.resources = Resources {
            cpuset_cpus: "0".to_string(),
            ..base_resources()
        };
        let mut manager = Fs2Manager::with_root(&config, root, &dir);
        manager.apply(None).unwrap();
        assert_eq!(content(&kata, CGROUP_TYPE), "threaded");
    }

    #[test]
    fn test_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = manager(root);
        assert!(matches!(manager.set(&base_resources()), Err(Error::NotApplied)));
        assert!(matches!(
            manager.freeze(FreezerState::Thawed),
            Err(Error::NotApplied)
        ));

        manager.apply(None).unwrap();
        manager.destroy().unwrap();
        assert!(!manager.exists());
        manager.destroy().unwrap();
        assert!(matches!(
            manager.stats(&StatsOptions::default()),
            Err(Error::Destroyed)
        ));
    }

    #[test]
    fn test_set_memory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = applied(root);
        let dir = manager.dir().to_string();

        let resources = Resources {
            memory: Some(2000),
            memory_swap: Some(3000),
            memory_reservation: Some(1000),
            pids_limit: Some(0),
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&dir, "memory.max"), "2000");
        assert_eq!(content(&dir, MEMORY_SWAP_MAX), "1000");
        assert_eq!(content(&dir, "memory.low"), "1000");
        assert_eq!(content(&dir, "pids.max"), "1");

        // Equal limits disable swap.
        let resources = Resources {
            memory: Some(2000),
            memory_swap: Some(2000),
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&dir, MEMORY_SWAP_MAX), "0");

        let resources = Resources {
            memory: Some(-1),
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&dir, "memory.max"), "max");
        assert_eq!(content(&dir, MEMORY_SWAP_MAX), "max");
    }

    #[test]
    fn test_memory_guard() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = applied(root);
        let dir = manager.dir().to_string();
        fs::write(format!("{}/memory.current", dir), "4096\n").unwrap();

        let mut resources = Resources {
            memory: Some(1024),
            ..base_resources()
        };
        manager.set(&resources).unwrap();

        resources.memory_check_before_update = true;
        let err = manager.set(&resources).unwrap_err();
        assert!(matches!(err, Error::BelowUsage { usage: 4096, .. }));

        resources.memory = Some(8192);
        manager.set(&resources).unwrap();

        // Unreadable usage lets the update through.
        fs::remove_file(format!("{}/memory.current", dir)).unwrap();
        resources.memory = Some(1024);
        manager.set(&resources).unwrap();
    }

    #[test]
    fn test_set_cpu_and_io() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = applied(root);
        let dir = manager.dir().to_string();

        let resources = Resources {
            cpu_shares: Some(1024),
            cpu_quota: Some(50_000),
            cpu_period: Some(100_000),
            cpu_burst: Some(1000),
            blkio_weight: Some(500),
            blkio_throttle_write_iops_device: vec![ThrottleDevice {
                major: 8,
                minor: 16,
                rate: 100,
            }],
            hugetlb_limit: vec![HugepageLimit {
                page_size: "1GB".to_string(),
                limit: 1 << 30,
            }],
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&dir, "cpu.weight"), "39");
        assert_eq!(content(&dir, "cpu.max"), "50000 100000");
        assert_eq!(content(&dir, "cpu.max.burst"), "1000");
        assert_eq!(content(&dir, "io.weight"), "4950");
        assert_eq!(content(&dir, "io.max"), "8:16 wiops=100");
        assert_eq!(content(&dir, "hugetlb.1GB.max"), "1073741824");

        let resources = Resources {
            cpu_weight: Some(200),
            cpu_shares: Some(1024),
            cpu_quota: Some(-1),
            ..base_resources()
        };
        manager.set(&resources).unwrap();
        assert_eq!(content(&dir, "cpu.weight"), "200");
        assert_eq!(content(&dir, "cpu.max"), "max");
    }

    #[test]
    fn test_cpu_max() {
        assert_eq!(cpu_max(20_000, 0), "20000");
        assert_eq!(cpu_max(-1, 100_000), "max 100000");
        assert_eq!(cpu_max(0, 50_000), "max 50000");
    }

    #[test]
    fn test_devices() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = applied(root);

        // Nothing to enforce without an eBPF program.
        let allow_all = Resources {
            devices: vec![DeviceRule::all(false), DeviceRule::all(true)],
            ..Default::default()
        };
        manager.set(&allow_all).unwrap();

        let mut resources = Resources {
            devices: vec![DeviceRule::all(false), "c 1:3 rwm".parse().unwrap()],
            ..Default::default()
        };
        if devices::v1::running_in_user_ns() {
            manager.set(&resources).unwrap();
        } else {
            let err = manager.set(&resources).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unsupported);
        }

        resources.skip_devices = true;
        manager.set(&resources).unwrap();
        manager.set(&Resources::default()).unwrap();
    }

    #[test]
    fn test_set_unified() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = applied(root);

        let mut resources = base_resources();
        resources
            .unified
            .insert("memory.high".to_string(), "max".to_string());
        manager.set(&resources).unwrap();
        assert_eq!(content(manager.dir(), "memory.high"), "max");

        for key in &["../memory.high", "memory", ".high"] {
            let mut resources = base_resources();
            resources.unified.insert(key.to_string(), "1".to_string());
            assert_eq!(
                manager.set(&resources).unwrap_err().kind(),
                ErrorKind::Invalid
            );
        }
    }

    #[test]
    fn test_freeze() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let mut manager = applied(root);
        let dir = manager.dir().to_string();

        // No freezer.
        assert!(matches!(
            manager.freeze(FreezerState::Frozen),
            Err(Error::FreezerUnsupported)
        ));
        manager.freeze(FreezerState::Thawed).unwrap();
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Undefined);

        fs::write(format!("{}/{}", dir, CGROUP_FREEZE), "0\n").unwrap();
        fs::write(format!("{}/{}", dir, CGROUP_EVENTS), "populated 1\nfrozen 1\n").unwrap();
        manager.freeze(FreezerState::Frozen).unwrap();
        assert_eq!(content(&dir, CGROUP_FREEZE), "1");
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Frozen);

        manager.freeze(FreezerState::Thawed).unwrap();
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Thawed);

        // The kernel never reports the cgroup frozen.
        fs::write(format!("{}/{}", dir, CGROUP_EVENTS), "populated 1\nfrozen 0\n").unwrap();
        manager.set_freeze_timeout(Duration::from_millis(30));
        let err = manager.freeze(FreezerState::Frozen).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(content(&dir, CGROUP_FREEZE), "0");
    }

    #[test]
    fn test_stats() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_str().unwrap();
        let manager = applied(root);
        let dir = manager.dir();
        fs::write(format!("{}/pids.current", dir), "2\n").unwrap();
        fs::write(format!("{}/pids.max", dir), "100\n").unwrap();

        let stats = manager.stats(&StatsOptions::default()).unwrap();
        assert_eq!(stats.pids.current, 2);
        assert_eq!(stats.pids.limit, 100);
    }
}
