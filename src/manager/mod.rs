// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Cgroup managers: cgroupfs v1 and v2, and systemd on top of either.

use std::collections::HashMap;
use std::time::Duration;

mod conv;
mod error;
pub use error::{Error, ErrorKind, Result};
mod fs;
pub use fs::FsManager;
mod fs2;
pub use fs2::Fs2Manager;
mod systemd;
pub use self::systemd::{LegacySystemdManager, UnifiedSystemdManager};

use crate::config::{Cgroup, Resources};
use crate::fs::mountinfo::is_cgroup2_unified_mode;
use crate::fs::utils::{clean_path, join_path};
use crate::stats::{CgroupStats, StatsOptions};
use crate::{CgroupPid, FreezerState};

/// How long a freeze may take before it is given up.
pub const DEFAULT_FREEZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Manage the cgroup of a container, from creation to removal.
pub trait Manager: Send + Sync {
    /// Create the cgroup and move the process into it. `None` only
    /// creates the cgroup.
    fn apply(&mut self, pid: Option<CgroupPid>) -> Result<()>;

    /// Set the resources to the cgroup.
    fn set(&mut self, resources: &Resources) -> Result<()>;

    /// Get cgroup stats.
    fn stats(&self, options: &StatsOptions) -> Result<CgroupStats>;

    /// Freeze or thaw the processes of the cgroup.
    fn freeze(&self, state: FreezerState) -> Result<()>;

    fn freezer_state(&self) -> Result<FreezerState>;

    /// Remove the cgroup. Removing it twice is fine.
    fn destroy(&mut self) -> Result<()>;

    /// Get the absolute cgroup path of a subsystem, empty when the
    /// subsystem is not managed. For cgroup v2 the subsystem is ignored.
    fn path(&self, subsystem: &str) -> String;

    /// Get the mappings of subsystems to their absolute paths.
    fn paths(&self) -> &HashMap<String, String>;

    /// Get the list of pids joint to the cgroup.
    fn pids(&self) -> Result<Vec<CgroupPid>>;

    fn exists(&self) -> bool;

    /// Set how long `freeze` waits for the cgroup to be frozen.
    fn set_freeze_timeout(&mut self, timeout: Duration);

    /// Indicate whether the cgroup manager is using systemd.
    fn systemd(&self) -> bool;

    /// Indicate whether the cgroup manager is using cgroup v2.
    fn v2(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    FsV1,
    FsV2,
    SystemdLegacy,
    SystemdUnified,
}

impl Backend {
    /// The backend matching the host's cgroup mode.
    pub fn probe(systemd: bool) -> Self {
        match (systemd, is_cgroup2_unified_mode()) {
            (false, false) => Backend::FsV1,
            (false, true) => Backend::FsV2,
            (true, false) => Backend::SystemdLegacy,
            (true, true) => Backend::SystemdUnified,
        }
    }
}

pub fn new_manager(config: &Cgroup, backend: Backend) -> Result<Box<dyn Manager>> {
    let manager: Box<dyn Manager> = match backend {
        Backend::FsV1 => Box::new(FsManager::new(config)?),
        Backend::FsV2 => Box::new(Fs2Manager::new(config)?),
        Backend::SystemdLegacy => Box::new(LegacySystemdManager::new(config)?),
        Backend::SystemdUnified => Box::new(UnifiedSystemdManager::new(config)?),
    };
    Ok(manager)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Unapplied,
    Applied,
    Destroyed,
}

impl Lifecycle {
    pub(crate) fn ensure_alive(self) -> Result<()> {
        match self {
            Lifecycle::Destroyed => Err(Error::Destroyed),
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_applied(self) -> Result<()> {
        match self {
            Lifecycle::Unapplied => Err(Error::NotApplied),
            Lifecycle::Applied => Ok(()),
            Lifecycle::Destroyed => Err(Error::Destroyed),
        }
    }
}

/// The cgroup of `config` relative to a hierarchy: absolute paths start
/// at the mount root, relative ones at the caller's own cgroup.
pub(crate) fn inner_path(config: &Cgroup) -> Result<String> {
    if !config.path.is_empty() {
        if !config.name.is_empty() || !config.parent.is_empty() {
            return Err(Error::invalid(
                "cgroup: either path or name and parent should be used",
            ));
        }
        return Ok(clean_path(&config.path));
    }

    // Name and parent never escape the hierarchy.
    let inner = join_path("/", &join_path(&config.parent, &config.name));
    if inner == "/" && config.name.is_empty() {
        return Err(Error::invalid("cgroup: no path nor name given"));
    }
    Ok(inner)
}

/// Freeze requests only take the two stable states.
pub(crate) fn check_freeze_request(state: FreezerState) -> Result<()> {
    match state {
        FreezerState::Frozen | FreezerState::Thawed => Ok(()),
        _ => Err(Error::invalid(format!(
            "invalid freezer state {:?} requested",
            state
        ))),
    }
}
