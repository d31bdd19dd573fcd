// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{Cgroup, Resources};
use crate::fs::mountinfo::find_cgroup_mountpoint;
use crate::fs::utils::join_path;
use crate::manager::error::{Error, Result};
use crate::manager::fs::SUBSYSTEMS;
use crate::manager::systemd::{freeze_plan, v1_properties, with_quota, Unit};
use crate::manager::{FsManager, Manager};
use crate::stats::{CgroupStats, StatsOptions};
use crate::systemd::utils::expand_slice;
use crate::systemd::Property;
use crate::{CgroupPid, FreezerState};

/// A systemd unit on cgroup v1. Resources systemd has properties for go
/// through the unit, the rest is written to cgroupfs.
pub struct LegacySystemdManager {
    config: Cgroup,
    unit: Unit,
    fs: FsManager,
}

impl LegacySystemdManager {
    pub fn new(config: &Cgroup) -> Result<Self> {
        if config.rootless {
            return Err(Error::invalid("cgroup v1 with systemd does not support rootless"));
        }
        if !config.resources.unified.is_empty() {
            return Err(Error::V1NoUnified);
        }

        let unit = Unit::new(config)?;
        let slice = expand_slice(unit.slice())?;
        let inner = join_path(&slice, unit.name());

        let mut paths = HashMap::new();
        for subsystem in SUBSYSTEMS {
            match find_cgroup_mountpoint("", subsystem) {
                Ok(mountpoint) => {
                    paths.insert(subsystem.to_string(), join_path(&mountpoint, &inner));
                }
                Err(err) if err.is_not_exist() => {
                    debug!("subsystem {} not mounted, skipping", subsystem);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let fs = FsManager::with_paths(config, paths)?;
        Ok(Self {
            config: config.clone(),
            unit,
            fs,
        })
    }

    /// See `set_term_timeout()` of the unit.
    pub fn set_term_timeout(&mut self, timeout_in_sec: u64) -> Result<()> {
        self.unit.set_term_timeout(timeout_in_sec)
    }

    /// Update the unit properties with the cgroup frozen, so that the
    /// processes never see the transient deny-all device rule.
    fn set_properties_frozen(&mut self, resources: &Resources, props: &[Property]) -> Result<()> {
        let policy = if resources.skip_devices && !resources.skip_freeze_on_set {
            self.unit.device_policy()
        } else {
            None
        };
        let current = self.fs.freezer_state()?;
        let (needs_freeze, needs_thaw) = freeze_plan(resources, policy.as_ref(), current);

        if needs_freeze {
            if let Err(err) = self.fs.freeze(FreezerState::Frozen) {
                if !matches!(err, Error::FreezerUnsupported) {
                    if needs_thaw {
                        if let Err(err) = self.fs.freeze(FreezerState::Thawed) {
                            warn!("failed to thaw {}: {}", self.unit.name(), err);
                        }
                    }
                    return Err(err);
                }
                info!("freezer not available, updating {} unfrozen", self.unit.name());
            }
        }

        let result = self.unit.set_properties(props);
        if needs_freeze && needs_thaw {
            if let Err(err) = self.fs.freeze(FreezerState::Thawed) {
                warn!("failed to thaw {}: {}", self.unit.name(), err);
            }
        }
        result
    }
}

impl Manager for LegacySystemdManager {
    fn apply(&mut self, pid: Option<CgroupPid>) -> Result<()> {
        self.fs.ensure_alive()?;

        let props = self.unit.start_properties(&self.config, pid, false);
        self.unit.start(props, pid, "/")?;

        // Join the hierarchies systemd does not manage.
        self.fs.apply(pid)
    }

    fn set(&mut self, resources: &Resources) -> Result<()> {
        self.fs.ensure_applied()?;
        if !resources.unified.is_empty() {
            return Err(Error::V1NoUnified);
        }

        let version = self.unit.systemd_version()?;
        let (props, quota) = v1_properties(resources, version)?;
        self.set_properties_frozen(resources, &props)?;

        self.fs.set(&with_quota(resources, quota))
    }

    fn stats(&self, options: &StatsOptions) -> Result<CgroupStats> {
        self.fs.stats(options)
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        self.fs.freeze(state)
    }

    fn freezer_state(&self) -> Result<FreezerState> {
        self.fs.freezer_state()
    }

    fn destroy(&mut self) -> Result<()> {
        let stopped = self.unit.stop();
        let removed = self.fs.destroy();
        stopped.and(removed)
    }

    fn path(&self, subsystem: &str) -> String {
        self.fs.path(subsystem)
    }

    fn paths(&self) -> &HashMap<String, String> {
        self.fs.paths()
    }

    fn pids(&self) -> Result<Vec<CgroupPid>> {
        self.fs.pids()
    }

    fn exists(&self) -> bool {
        self.fs.exists()
    }

    fn set_freeze_timeout(&mut self, timeout: Duration) {
        self.fs.set_freeze_timeout(timeout)
    }

    fn systemd(&self) -> bool {
        true
    }

    fn v2(&self) -> bool {
        false
    }
}
