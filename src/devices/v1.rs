// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Device rules for the cgroup v1 `devices` controller.

use std::fs;

use crate::config::Resources;
use crate::devices::{DeviceRule, Emulator, Error, Result};
use crate::fs::{read_file, write_file};

pub const DEVICES_ALLOW: &str = "devices.allow";
pub const DEVICES_DENY: &str = "devices.deny";
pub const DEVICES_LIST: &str = "devices.list";

/// `devices.list` cannot be emulated on a regular filesystem.
const SKIP_FINAL_CHECK: bool = cfg!(test);

/// A single write to the devices controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceWrite {
    pub file: &'static str,
    pub value: String,
}

/// The writes turning any current policy into deny-all followed by
/// `rules`.
///
/// The current policy cannot be read reliably while siblings are being
/// updated, so it is never looked at: resetting first means the policy is
/// at most briefly more restrictive than requested, never more permissive.
pub fn reconcile(rules: &[DeviceRule]) -> Vec<DeviceWrite> {
    let mut writes = Vec::with_capacity(rules.len() + 1);
    writes.push(DeviceWrite {
        file: DEVICES_DENY,
        value: DeviceRule::all(false).to_string(),
    });
    writes.extend(rules.iter().map(|rule| DeviceWrite {
        file: if rule.allow { DEVICES_ALLOW } else { DEVICES_DENY },
        value: rule.to_string(),
    }));
    writes
}

/// Whether the process runs in a user namespace, where the devices
/// controller cannot be written.
pub fn running_in_user_ns() -> bool {
    let uid_map = match fs::read_to_string("/proc/self/uid_map") {
        Ok(uid_map) => uid_map,
        Err(_) => return false,
    };
    let fields: Vec<&str> = uid_map.split_whitespace().collect();
    fields != ["0", "0", "4294967295"]
}

/// Apply the device rules of `resources` to the cgroup at `dir`.
pub fn set(dir: &str, resources: &Resources) -> Result<()> {
    if resources.skip_devices || running_in_user_ns() {
        return Ok(());
    }

    // Rejects rules the kernel would silently ignore before anything is
    // written.
    let target = Emulator::from_rules(&resources.devices)?;

    for write in reconcile(&resources.devices) {
        write_file(dir, write.file, &write.value)?;
    }

    if SKIP_FINAL_CHECK {
        return Ok(());
    }

    let current = Emulator::from_list(&read_file(dir, DEVICES_LIST)?)?;
    if target.is_deny_list() != current.is_deny_list() {
        return Err(Error::ModeMismatch);
    }
    // Exceptions of a deny-list are not listed.
    if !target.is_deny_list() && target != current {
        return Err(Error::Mismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceType, Permissions};
    use crate::fs::utils::get_cgroup_param_string;
    use tempfile::TempDir;

    fn rules() -> Vec<DeviceRule> {
        vec![
            DeviceRule::new(DeviceType::Char, Some(1), Some(3), Permissions::all(), true),
            DeviceRule::new(DeviceType::Char, Some(136), None, Permissions::all(), true),
            DeviceRule::new(DeviceType::Char, Some(1), Some(3), Permissions::MKNOD, false),
            DeviceRule::new(DeviceType::Block, None, None, Permissions::MKNOD, true),
        ]
    }

    #[test]
    fn test_reconcile_starts_with_deny_all() {
        let writes = reconcile(&rules());
        let values: Vec<(&str, &str)> = writes
            .iter()
            .map(|w| (w.file, w.value.as_str()))
            .collect();
        assert_eq!(
            values,
            vec![
                (DEVICES_DENY, "a *:* rwm"),
                (DEVICES_ALLOW, "c 1:3 rwm"),
                (DEVICES_ALLOW, "c 136:* rwm"),
                (DEVICES_DENY, "c 1:3 m"),
                (DEVICES_ALLOW, "b *:* m"),
            ]
        );

        assert_eq!(reconcile(&[]).len(), 1);
    }

    #[test]
    fn test_reconcile_ignores_prior_policy() {
        let rules = rules();
        let target = Emulator::from_rules(&rules).unwrap();

        let priors = ["a *:* rwm", "c 1:3 r\nb 8:0 rwm", "c 5:1 rwm\nc 136:* rwm"];
        for prior in priors.iter() {
            let mut kernel = Emulator::from_list(prior).unwrap();
            for write in reconcile(&rules) {
                let mut rule: DeviceRule = write.value.parse().unwrap();
                rule.allow = write.file == DEVICES_ALLOW;
                kernel.apply(&rule).unwrap();
            }
            assert_eq!(kernel, target, "prior policy {:?}", prior);
        }
    }

    #[test]
    fn test_set_writes_deny_all_then_rules() {
        if running_in_user_ns() {
            eprintln!("Test skipped, running in a user namespace");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();
        fs::write(format!("{}/{}", dir, DEVICES_LIST), "a *:* rwm").unwrap();

        let resources = Resources {
            devices: vec![DeviceRule::new(
                DeviceType::Char,
                Some(1),
                Some(5),
                Permissions::all(),
                true,
            )],
            ..Default::default()
        };
        set(dir, &resources).unwrap();

        let deny = get_cgroup_param_string(dir, DEVICES_DENY).unwrap();
        assert!(deny.starts_with('a'), "{}", deny);
        let allow = get_cgroup_param_string(dir, DEVICES_ALLOW).unwrap();
        assert_eq!(allow, "c 1:5 rwm");
    }

    #[test]
    fn test_set_skip_devices() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();
        let resources = Resources {
            skip_devices: true,
            devices: rules(),
            ..Default::default()
        };
        set(dir, &resources).unwrap();
        assert!(!std::path::Path::new(dir).join(DEVICES_DENY).exists());
    }
}
