// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Device access rules and their translation to the devices controller
//! and to systemd.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

mod emulator;
pub use emulator::Emulator;
pub mod systemd;
pub mod v1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid device rule {0:?}")]
    InvalidRule(String),

    #[error("invalid device permissions {0:?}")]
    InvalidPermissions(String),

    #[error("invalid device type {0:?}")]
    InvalidType(char),

    #[error("requested rule [{rule}] not supported by devices cgroupv1 (cannot punch hole in existing wildcard rule [{wildcard}])")]
    WildcardHole { rule: String, wildcard: String },

    #[error("unable to parse /proc/devices line {0:?}")]
    ProcDevices(String),

    #[error("resulting devices cgroup doesn't precisely match target")]
    Mismatch,

    #[error("resulting devices cgroup doesn't match target mode")]
    ModeMismatch,

    #[error("cgroupfs error: {0}")]
    Cgroupfs(#[from] crate::fs::error::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceType {
    /// Every device, only meaningful as `a *:* rwm`.
    All,
    Char,
    Block,
}

impl DeviceType {
    pub fn as_char(self) -> char {
        match self {
            DeviceType::All => 'a',
            DeviceType::Char => 'c',
            DeviceType::Block => 'b',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'a' => Some(DeviceType::All),
            'c' | 'u' => Some(DeviceType::Char),
            'b' => Some(DeviceType::Block),
            _ => None,
        }
    }
}

bitflags! {
    /// Access to a device node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct Permissions: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const MKNOD = 0b100;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Permissions::READ) {
            write!(f, "r")?;
        }
        if self.contains(Permissions::WRITE) {
            write!(f, "w")?;
        }
        if self.contains(Permissions::MKNOD) {
            write!(f, "m")?;
        }
        Ok(())
    }
}

impl FromStr for Permissions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut perms = Permissions::empty();
        for c in s.chars() {
            perms |= match c {
                'r' => Permissions::READ,
                'w' => Permissions::WRITE,
                'm' => Permissions::MKNOD,
                _ => return Err(Error::InvalidPermissions(s.to_string())),
            };
        }
        Ok(perms)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Permissions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Permissions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A device rule. `None` major or minor numbers match every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceRule {
    pub kind: DeviceType,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub permissions: Permissions,
    pub allow: bool,
}

impl DeviceRule {
    pub fn new(
        kind: DeviceType,
        major: Option<u32>,
        minor: Option<u32>,
        permissions: Permissions,
        allow: bool,
    ) -> Self {
        Self {
            kind,
            major,
            minor,
            permissions,
            allow,
        }
    }

    /// The `a *:* rwm` rule, allowing or denying every device.
    pub fn all(allow: bool) -> Self {
        Self::new(DeviceType::All, None, None, Permissions::all(), allow)
    }
}

fn number(n: Option<u32>) -> String {
    match n {
        Some(n) => n.to_string(),
        None => "*".to_string(),
    }
}

/// The kernel syntax, e.g. `c 1:5 rwm`.
impl fmt::Display for DeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} {}",
            self.kind.as_char(),
            number(self.major),
            number(self.minor),
            self.permissions
        )
    }
}

/// Parse the kernel syntax used by `devices.list`. The rule is an allow
/// rule, as `devices.list` only lists what is allowed.
impl FromStr for DeviceRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRule(s.to_string());
        let mut fields = s.split_whitespace();
        let (kind, numbers, perms) = match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(kind), Some(numbers), Some(perms), None) => (kind, numbers, perms),
            _ => return Err(invalid()),
        };

        let mut chars = kind.chars();
        let kind = match (chars.next(), chars.next()) {
            (Some(c), None) => DeviceType::from_char(c).ok_or(Error::InvalidType(c))?,
            _ => return Err(invalid()),
        };

        let (major, minor) = numbers.split_once(':').ok_or_else(invalid)?;
        let parse_number = |n: &str| -> Result<Option<u32>> {
            if n == "*" {
                return Ok(None);
            }
            n.parse::<u32>().map(Some).map_err(|_| invalid())
        };

        let permissions: Permissions = perms.parse()?;
        if permissions.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            kind,
            major: parse_number(major)?,
            minor: parse_number(minor)?,
            permissions,
            allow: true,
        })
    }
}

impl TryFrom<&str> for DeviceRule {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_rule_syntax() {
        let rule: DeviceRule = "c 1:5 rwm".parse().unwrap();
        assert_eq!(
            rule,
            DeviceRule::new(DeviceType::Char, Some(1), Some(5), Permissions::all(), true)
        );
        assert_eq!(rule.to_string(), "c 1:5 rwm");

        let rule = DeviceRule::try_from("b 8:* rw").unwrap();
        assert_eq!(rule.major, Some(8));
        assert_eq!(rule.minor, None);
        assert_eq!(rule.permissions, Permissions::READ | Permissions::WRITE);

        assert_eq!(DeviceRule::all(false).to_string(), "a *:* rwm");
        assert_eq!("a *:* rwm".parse::<DeviceRule>().unwrap(), DeviceRule::all(true));
    }

    #[test]
    fn test_invalid_device_rules() {
        for rule in ["", "c 1:5", "c 1:5 rwm x", "x 1:5 rwm", "c 1-5 rwm", "c a:5 rwm", "c 1:5 rwx", "c 1:5 -", "cc 1:5 r"].iter() {
            assert!(rule.parse::<DeviceRule>().is_err(), "{:?}", rule);
        }
    }

    #[test]
    fn test_permissions() {
        assert_eq!("mwr".parse::<Permissions>().unwrap().to_string(), "rwm");
        assert_eq!("".parse::<Permissions>().unwrap(), Permissions::empty());
        assert!("rwx".parse::<Permissions>().is_err());
    }
}
