// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Translation of device rules into the `DevicePolicy` and `DeviceAllow`
//! unit properties.

use std::fs;
use std::path::Path;

use log::{debug, warn};

use crate::config::Resources;
use crate::devices::{DeviceType, Emulator, Error, Result};
use crate::systemd::props::Value;
use crate::systemd::{Property, DEVICE_ALLOW, DEVICE_POLICY};

const PROC_DEVICES: &str = "/proc/devices";

/// systemd accepts `char-MAJOR` and `block-MAJOR` entries since this
/// version.
const DEVICE_MAJOR_SYSTEMD_VERSION: usize = 240;

fn group_prefix(kind: DeviceType) -> Option<&'static str> {
    match kind {
        DeviceType::Char => Some("char-"),
        DeviceType::Block => Some("block-"),
        DeviceType::All => None,
    }
}

fn node_dir(kind: DeviceType) -> Option<&'static str> {
    match kind {
        DeviceType::Char => Some("/dev/char"),
        DeviceType::Block => Some("/dev/block"),
        DeviceType::All => None,
    }
}

fn policy(policy: &str) -> Property {
    (DEVICE_POLICY.to_string(), Value::from(policy))
}

fn allow_list(entries: Vec<(String, String)>) -> Property {
    (DEVICE_ALLOW.to_string(), Value::DeviceAllow(entries))
}

/// The unit properties enforcing the device rules of `resources` on top
/// of deny-all.
///
/// `DeviceAllow` is first cleared, as systemd appends to the list of a
/// running unit.
pub fn properties(resources: &Resources, systemd_version: usize) -> Result<Vec<Property>> {
    if resources.skip_devices {
        return Ok(vec![]);
    }

    let mut props = vec![allow_list(vec![]), policy("strict")];

    let emulator = Emulator::from_rules(&resources.devices)?;
    if emulator.is_deny_list() {
        if emulator.is_allow_all() {
            return Ok(vec![policy("auto"), allow_list(vec![])]);
        }
        // Exceptions of a deny-list have no systemd equivalent.
        warn!("systemd doesn't support deny-list device rules, applying a temporary deny-all rule");
        return Ok(props);
    }

    let mut entries = vec![];
    for rule in emulator.exceptions() {
        let (prefix, dir) = match (group_prefix(rule.kind), node_dir(rule.kind)) {
            (Some(prefix), Some(dir)) => (prefix, dir),
            _ => continue,
        };

        let path = match (rule.major, rule.minor) {
            (None, Some(_)) => {
                warn!("systemd doesn't support '*:n' device rules, skipping {}", rule);
                continue;
            }
            (None, None) => format!("{}*", prefix),
            (Some(major), None) => {
                if systemd_version >= DEVICE_MAJOR_SYSTEMD_VERSION {
                    format!("{}{}", prefix, major)
                } else {
                    let group = classify(rule.kind, major)?;
                    if group.is_empty() {
                        warn!("could not find a device group for {}, skipping", rule);
                        continue;
                    }
                    group
                }
            }
            (Some(major), Some(minor)) => {
                let path = format!("{}/{}:{}", dir, major, minor);
                // Older systemd rejects nodes that do not exist.
                if systemd_version < DEVICE_MAJOR_SYSTEMD_VERSION && !Path::new(&path).exists() {
                    debug!("skipping device rule {}, {} does not exist", rule, path);
                    continue;
                }
                path
            }
        };
        entries.push((path, rule.permissions.to_string()));
    }

    props.push(allow_list(entries));
    Ok(props)
}

/// Look `major` up in the device groups of the kernel, e.g. `char-pts`
/// for the char major 136. An empty string means no group matches.
pub fn classify(kind: DeviceType, major: u32) -> Result<String> {
    let content = fs::read_to_string(PROC_DEVICES)
        .map_err(|err| crate::fs::error::Error::from(err).context(PROC_DEVICES))?;
    classify_in(&content, kind, major)
}

/// `classify` over the content of `/proc/devices`.
pub fn classify_in(content: &str, kind: DeviceType, major: u32) -> Result<String> {
    let prefix = match group_prefix(kind) {
        Some(prefix) => prefix,
        None => return Ok(String::new()),
    };

    let mut current = None;
    for line in content.lines() {
        let line = line.trim();
        match line {
            "" => continue,
            "Character devices:" => {
                current = Some(DeviceType::Char);
                continue;
            }
            "Block devices:" => {
                current = Some(DeviceType::Block);
                continue;
            }
            _ => {}
        }

        if current != Some(kind) {
            continue;
        }

        let (number, name) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::ProcDevices(line.to_string()))?;
        let number: u32 = number
            .parse()
            .map_err(|_| Error::ProcDevices(line.to_string()))?;
        if number == major {
            return Ok(format!("{}{}", prefix, name.trim()));
        }
    }

    Ok(String::new())
}
