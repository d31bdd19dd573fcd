// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::chown;
use std::path::Path;
use std::time::Duration;

use log::debug;

use crate::config::{Cgroup, Resources};
use crate::fs::utils::join_path;
use crate::fs::CGROUPFS_ROOT;
use crate::manager::error::Result;
use crate::manager::fs2::check_memory_usage;
use crate::manager::systemd::{v2_properties, with_quota, Unit};
use crate::manager::{Fs2Manager, Manager};
use crate::stats::{CgroupStats, StatsOptions};
use crate::systemd::utils::expand_slice;
use crate::{CgroupPid, FreezerState};

/// Files a delegated cgroup hands over to its owner, as listed by the
/// kernel.
const DELEGATE_FILE: &str = "/sys/kernel/cgroup/delegate";

const DEFAULT_DELEGATED_FILES: &[&str] =
    &["cgroup.procs", "cgroup.subtree_control", "cgroup.threads"];

/// A systemd unit on cgroup v2. The unit gets every resource systemd has
/// a property for, cgroupfs gets them all.
pub struct UnifiedSystemdManager {
    config: Cgroup,
    unit: Unit,
    fs: Fs2Manager,
}

impl UnifiedSystemdManager {
    pub fn new(config: &Cgroup) -> Result<Self> {
        let unit = Unit::new(config)?;
        let mut slice = expand_slice(unit.slice())?;
        if config.rootless {
            // The slice lives below the cgroup of the user instance.
            let base = unit.client().control_group()?;
            slice = join_path(&base, &slice);
        }
        let dir = join_path(CGROUPFS_ROOT, &join_path(&slice, unit.name()));

        Ok(Self {
            config: config.clone(),
            fs: Fs2Manager::with_path(config, &dir),
            unit,
        })
    }

    /// See `set_term_timeout()` of the unit.
    pub fn set_term_timeout(&mut self, timeout_in_sec: u64) -> Result<()> {
        self.unit.set_term_timeout(timeout_in_sec)
    }

    /// Processes join the `init` sub-cgroup when there is one, e.g. in
    /// a container nested in a container.
    fn subcgroup(&self) -> &'static str {
        if Path::new(self.fs.dir()).join("init").is_dir() {
            "/init"
        } else {
            "/"
        }
    }
}

impl Manager for UnifiedSystemdManager {
    fn apply(&mut self, pid: Option<CgroupPid>) -> Result<()> {
        self.fs.ensure_alive()?;

        let resources = &self.config.resources;
        check_memory_usage(self.fs.dir(), resources)?;
        let version = self.unit.systemd_version()?;
        let (resource_props, _) = v2_properties(resources, version)?;

        let mut props = self.unit.start_properties(&self.config, pid, true);
        props.extend(resource_props);
        let subcgroup = self.subcgroup();
        self.unit.start(props, pid, subcgroup)?;

        // systemd moved the process, only the path is left to set up.
        self.fs.apply(None)?;

        if let Some(uid) = self.config.owner_uid {
            chown_delegated(self.fs.dir(), uid)?;
        }
        Ok(())
    }

    fn set(&mut self, resources: &Resources) -> Result<()> {
        self.fs.ensure_applied()?;
        check_memory_usage(self.fs.dir(), resources)?;

        let version = self.unit.systemd_version()?;
        let (props, quota) = v2_properties(resources, version)?;
        self.unit.set_properties(&props)?;

        // Device rules are enforced by systemd alone.
        let mut resources = with_quota(resources, quota);
        resources.skip_devices = true;
        self.fs.set(&resources)
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
        true
    }
}

fn delegated_files() -> Vec<String> {
    match std::fs::read_to_string(DELEGATE_FILE) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect(),
        Err(err) => {
            debug!("unable to read {}: {}, using defaults", DELEGATE_FILE, err);
            DEFAULT_DELEGATED_FILES
                .iter()
                .map(|file| file.to_string())
                .collect()
        }
    }
}

/// Hand the cgroup directory and its delegated files over to `uid`.
fn chown_delegated(dir: &str, uid: u32) -> Result<()> {
    let dir = Path::new(dir);
    let files = delegated_files();
    let paths = std::iter::once(dir.to_path_buf()).chain(files.iter().map(|file| dir.join(file)));

    for path in paths {
        match chown(&path, Some(uid), None) {
            Ok(()) => {}
            // Not every file exists on every kernel.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, not chowned", path.display());
            }
            Err(err) => return Err(crate::fs::error::Error::from_io(err).into()),
        }
    }
    Ok(())
}
