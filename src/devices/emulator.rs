// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use std::collections::BTreeMap;

use crate::devices::{DeviceRule, DeviceType, Error, Permissions, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeviceMeta {
    kind: DeviceType,
    major: Option<u32>,
    minor: Option<u32>,
}

impl DeviceMeta {
    fn rule(&self, permissions: Permissions, allow: bool) -> DeviceRule {
        DeviceRule::new(self.kind, self.major, self.minor, permissions, allow)
    }
}

/// Model of the cgroup v1 devices controller: a default mode plus a set
/// of exceptions to it.
///
/// In allow-list mode (the default) the exceptions are what is allowed,
/// in deny-list mode they are what is denied. Writing `a` to either
/// `devices.allow` or `devices.deny` switches the mode and drops every
/// exception.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Emulator {
    default_allow: bool,
    rules: BTreeMap<DeviceMeta, Permissions>,
}

impl Emulator {
    /// The policy resulting from `rules` applied on top of deny-all.
    pub fn from_rules(rules: &[DeviceRule]) -> Result<Self> {
        let mut emulator = Self::default();
        for rule in rules {
            emulator.apply(rule)?;
        }
        Ok(emulator)
    }

    /// Load the current policy from the content of `devices.list`.
    ///
    /// The kernel lists `a *:* rwm` alone for a deny-list without
    /// exceptions; the exceptions of a deny-list cannot be read back.
    pub fn from_list(list: &str) -> Result<Self> {
        let mut emulator = Self::default();
        for line in list.lines().filter(|line| !line.trim().is_empty()) {
            let rule: DeviceRule = line.parse()?;
            emulator.apply(&rule)?;
        }
        Ok(emulator)
    }

    /// Whether devices not listed are allowed.
    pub fn is_deny_list(&self) -> bool {
        self.default_allow
    }

    pub fn is_allow_all(&self) -> bool {
        self.default_allow && self.rules.is_empty()
    }

    /// The exceptions in a stable order, as rules of the opposite of the
    /// default mode.
    pub fn exceptions(&self) -> Vec<DeviceRule> {
        self.rules
            .iter()
            .map(|(meta, perms)| meta.rule(*perms, !self.default_allow))
            .collect()
    }

    /// Apply a rule as if written to `devices.allow` or `devices.deny`.
    pub fn apply(&mut self, rule: &DeviceRule) -> Result<()> {
        if rule.kind == DeviceType::All {
            *self = Self {
                default_allow: rule.allow,
                rules: BTreeMap::new(),
            };
            return Ok(());
        }

        let meta = DeviceMeta {
            kind: rule.kind,
            major: rule.major,
            minor: rule.minor,
        };
        // An allow in allow-list mode, or a deny in deny-list mode, adds
        // an exception. The opposite removes one.
        if rule.allow != self.default_allow {
            self.add(meta, rule.permissions);
            Ok(())
        } else {
            self.remove(meta, rule.permissions)
        }
    }

    fn add(&mut self, meta: DeviceMeta, perms: Permissions) {
        *self.rules.entry(meta).or_default() |= perms;
    }

    fn remove(&mut self, meta: DeviceMeta, perms: Permissions) -> Result<()> {
        // The kernel silently ignores a removal that is only covered by a
        // wildcard exception, leaving the access in place.
        let wildcards = [
            DeviceMeta { major: None, ..meta },
            DeviceMeta { minor: None, ..meta },
            DeviceMeta {
                major: None,
                minor: None,
                ..meta
            },
        ];
        for wildcard in wildcards.iter().filter(|wildcard| **wildcard != meta) {
            let covered = self.rules.get(wildcard).copied().unwrap_or_default();
            if covered.intersects(perms) {
                return Err(Error::WildcardHole {
                    rule: meta.rule(perms, self.default_allow).to_string(),
                    wildcard: wildcard.rule(covered, !self.default_allow).to_string(),
                });
            }
        }

        if let Some(existing) = self.rules.get_mut(&meta) {
            existing.remove(perms);
            if existing.is_empty() {
                self.rules.remove(&meta);
            }
        }
        Ok(())
    }
}
