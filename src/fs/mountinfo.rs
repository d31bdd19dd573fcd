// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Discovery of cgroup mounts through `/proc/self/mountinfo`.

use std::collections::HashSet;
use std::fs;

use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};

use crate::fs::error::{Error, ErrorKind, Result};
use crate::fs::root::CGROUPFS_ROOT;
use crate::fs::utils::{clean_path, join_path, proc_cgroups};

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
pub const CGROUP_NAME_PREFIX: &str = "name=";

/// Controllers a v1 hierarchy can carry, beside `name=` hierarchies.
const V1_SUBSYSTEMS: &[&str] = &[
    "cpuset",
    "cpu",
    "cpuacct",
    "memory",
    "devices",
    "freezer",
    "net_cls",
    "net_prio",
    "blkio",
    "perf_event",
    "pids",
    "hugetlb",
    "rdma",
    "misc",
];

/// A cgroup v1 hierarchy mount.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mount {
    pub mountpoint: String,
    /// The cgroup of the hierarchy that is mounted, `/` unless the
    /// mount namespace only sees part of it.
    pub root: String,
    /// Controllers of the hierarchy, `name=` hierarchies without the
    /// prefix.
    pub subsystems: Vec<String>,
}

/// A raw `/proc/self/mountinfo` entry, limited to the fields used here.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountInfo {
    root: String,
    mountpoint: String,
    fs_type: String,
    super_options: String,
}

/// Undo the octal escapes the kernel applies to spaces, tabs, newlines
/// and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_mountinfo(content: &str) -> Result<Vec<MountInfo>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
            let (left, right) = line
                .split_once(" - ")
                .ok_or_else(|| Error::parse(format!("mountinfo line {:?} has no separator", line)))?;
            let left: Vec<&str> = left.split(' ').collect();
            let right: Vec<&str> = right.split(' ').collect();
            if left.len() < 6 || right.len() < 3 {
                return Err(Error::parse(format!(
                    "mountinfo line {:?} has too few fields",
                    line
                )));
            }
            Ok(MountInfo {
                root: unescape(left[3]),
                mountpoint: unescape(left[4]),
                fs_type: right[0].to_string(),
                super_options: right[2].to_string(),
            })
        })
        .collect()
}

fn subsystems_of(info: &MountInfo) -> Vec<String> {
    info.super_options
        .split(',')
        .filter_map(|opt| {
            if let Some(name) = opt.strip_prefix(CGROUP_NAME_PREFIX) {
                return Some(name.to_string());
            }
            if V1_SUBSYSTEMS.contains(&opt) {
                return Some(opt.to_string());
            }
            None
        })
        .collect()
}

/// The cgroup v1 mounts listed in `content`. Unless `all` is set, only
/// the first mount of each hierarchy is kept, as bind mounts of the same
/// hierarchy would otherwise shadow it.
fn cgroup_mounts_from(content: &str, all: bool) -> Result<Vec<Mount>> {
    let mut seen = HashSet::new();
    let mut mounts = vec![];
    for info in parse_mountinfo(content)? {
        if info.fs_type != "cgroup" {
            continue;
        }
        let subsystems: Vec<String> = subsystems_of(&info)
            .into_iter()
            .filter(|ss| all || !seen.contains(ss))
            .collect();
        if subsystems.is_empty() {
            continue;
        }
        seen.extend(subsystems.iter().cloned());
        mounts.push(Mount {
            mountpoint: info.mountpoint,
            root: info.root,
            subsystems,
        });
    }
    Ok(mounts)
}

/// Read the cgroup v1 mounts of the current mount namespace.
pub fn cgroup_mounts(all: bool) -> Result<Vec<Mount>> {
    let content = fs::read_to_string(MOUNTINFO_PATH)
        .map_err(|err| Error::from(err).context(MOUNTINFO_PATH))?;
    cgroup_mounts_from(&content, all)
}

fn find_mountpoint_and_root(
    content: &str,
    prefix: &str,
    subsystem: &str,
) -> Result<(String, String)> {
    let subsystem = subsystem.trim_start_matches(CGROUP_NAME_PREFIX);
    parse_mountinfo(content)?
        .into_iter()
        .filter(|info| info.fs_type == "cgroup" && info.mountpoint.starts_with(prefix))
        .find(|info| subsystems_of(info).iter().any(|ss| ss == subsystem))
        .map(|info| (info.mountpoint, info.root))
        .ok_or_else(|| {
            Error::new(ErrorKind::NotExist).context(format!("mountpoint for {} not found", subsystem))
        })
}

/// Return the mountpoint and the mounted root of the v1 hierarchy
/// carrying `subsystem`, considering mountpoints below `prefix` only.
pub fn find_cgroup_mountpoint_and_root(prefix: &str, subsystem: &str) -> Result<(String, String)> {
    if is_cgroup2_unified_mode() {
        return Ok((CGROUPFS_ROOT.to_string(), "/".to_string()));
    }
    let content = fs::read_to_string(MOUNTINFO_PATH)
        .map_err(|err| Error::from(err).context(MOUNTINFO_PATH))?;
    find_mountpoint_and_root(&content, prefix, subsystem)
}

pub fn find_cgroup_mountpoint(prefix: &str, subsystem: &str) -> Result<String> {
    find_cgroup_mountpoint_and_root(prefix, subsystem).map(|(mountpoint, _)| mountpoint)
}

/// Translate a cgroup as seen in `/proc/self/cgroup` into a path below a
/// mount whose root is `root`. Nested containers see the host's cgroup
/// paths while only a subtree is mounted.
fn rebase_on_mount(mountpoint: &str, root: &str, cgroup: &str) -> String {
    let root = clean_path(root);
    let cgroup = clean_path(cgroup);
    let relative = if root == "/" {
        cgroup.as_str()
    } else {
        match cgroup.strip_prefix(root.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => cgroup.as_str(),
        }
    };
    join_path(mountpoint, relative)
}

/// The cgroup directory the calling process lives in for `subsystem`. On
/// a unified host `subsystem` is ignored.
pub fn own_cgroup_path(subsystem: &str) -> Result<String> {
    let cgroups = proc_cgroups(None)?;
    if is_cgroup2_unified_mode() {
        let cgroup = cgroups
            .get("")
            .ok_or_else(|| Error::new(ErrorKind::NotExist).context("no unified cgroup entry"))?;
        return Ok(join_path(CGROUPFS_ROOT, cgroup));
    }

    let key = subsystem.trim_start_matches(CGROUP_NAME_PREFIX);
    let cgroup = cgroups
        .get(key)
        .or_else(|| cgroups.get(&format!("{}{}", CGROUP_NAME_PREFIX, key)))
        .ok_or_else(|| {
            Error::new(ErrorKind::NotExist).context(format!("no cgroup entry for {}", subsystem))
        })?;
    let (mountpoint, root) = find_cgroup_mountpoint_and_root("", subsystem)?;
    Ok(rebase_on_mount(&mountpoint, &root, cgroup))
}

/// Whether `/sys/fs/cgroup` is a cgroup2 mount.
pub fn is_cgroup2_unified_mode() -> bool {
    statfs(CGROUPFS_ROOT)
        .map(|stat| stat.filesystem_type() == CGROUP2_SUPER_MAGIC)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEDORA_MOUNTINFO: &str = "\
15 35 0:3 / /proc rw,nosuid,nodev,noexec,relatime shared:5 - proc proc rw
23 16 0:18 / /sys/fs/cgroup rw,nosuid,nodev,noexec shared:9 - tmpfs tmpfs rw,seclabel,mode=755
24 23 0:19 / /sys/fs/cgroup/systemd rw,nosuid,nodev,noexec,relatime shared:10 - cgroup cgroup rw,xattr,release_agent=/usr/lib/systemd/systemd-cgroups-agent,name=systemd
26 23 0:21 / /sys/fs/cgroup/cpuset rw,nosuid,nodev,noexec,relatime shared:11 - cgroup cgroup rw,cpuset,clone_children
27 23 0:22 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid,nodev,noexec,relatime shared:12 - cgroup cgroup rw,cpuacct,cpu,clone_children
28 23 0:23 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:13 - cgroup cgroup rw,memory,clone_children
29 23 0:24 / /sys/fs/cgroup/devices rw,nosuid,nodev,noexec,relatime shared:14 - cgroup cgroup rw,devices,clone_children
30 23 0:25 / /sys/fs/cgroup/freezer rw,nosuid,nodev,noexec,relatime shared:15 - cgroup cgroup rw,freezer,clone_children
31 23 0:26 / /sys/fs/cgroup/net_cls rw,nosuid,nodev,noexec,relatime shared:16 - cgroup cgroup rw,net_cls,clone_children
32 23 0:27 / /sys/fs/cgroup/blkio rw,nosuid,nodev,noexec,relatime shared:17 - cgroup cgroup rw,blkio,clone_children
35 1 253:2 / / rw,relatime shared:1 - ext4 /dev/mapper/ssd-root--f20 rw,seclabel,data=ordered
31 21 0:23 / /DATA/foo_bla_bla rw,relatime - cifs //foo/BLA\\040BLA\\040BLA/ rw,sec=ntlm,cache=loose,unc=\\\\foo\\BLA BLA BLA,username=my_login";

    const DOCKER_MOUNTINFO: &str = "\
120 119 0:39 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime - tmpfs tmpfs rw,mode=755
121 120 0:19 /system.slice/docker-dc4e.scope /sys/fs/cgroup/systemd rw,nosuid,nodev,noexec,relatime - cgroup cgroup rw,xattr,release_agent=/lib/systemd/systemd-cgroups-agent,name=systemd
124 120 0:22 /system.slice/docker-dc4e.scope /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime - cgroup cgroup rw,memory
125 120 0:23 /system.slice/docker-dc4e.scope /sys/fs/cgroup/net_cls,net_prio rw,nosuid,nodev,noexec,relatime - cgroup cgroup rw,net_cls,net_prio";

    const BEDROCK_MOUNTINFO: &str = "\
125 120 0:29 / /sys/fs/cgroup/systemd rw,nosuid,nodev,noexec,relatime shared:17 - cgroup cgroup rw,xattr,name=systemd
129 124 0:29 / /bedrock/strata/arch/sys/fs/cgroup/systemd rw,nosuid,nodev,noexec,relatime shared:17 - cgroup cgroup rw,xattr,name=systemd
140 120 0:32 / /sys/fs/cgroup/net_cls,net_prio rw,nosuid,nodev,noexec,relatime shared:48 - cgroup cgroup rw,net_cls,net_prio
144 124 0:32 / /bedrock/strata/arch/sys/fs/cgroup/net_cls,net_prio rw,nosuid,nodev,noexec,relatime shared:48 - cgroup cgroup rw,net_cls,net_prio";

    #[test]
    fn test_cgroup_mounts() {
        let mounts = cgroup_mounts_from(FEDORA_MOUNTINFO, false).unwrap();
        assert_eq!(mounts.len(), 8);
        let cpu = mounts.iter().find(|m| m.subsystems.contains(&"cpu".to_string())).unwrap();
        assert_eq!(cpu.mountpoint, "/sys/fs/cgroup/cpu,cpuacct");
        assert_eq!(cpu.subsystems, vec!["cpuacct", "cpu"]);
        assert_eq!(cpu.root, "/");
        let systemd = mounts.iter().find(|m| m.subsystems == vec!["systemd"]).unwrap();
        assert_eq!(systemd.mountpoint, "/sys/fs/cgroup/systemd");

        let mounts = cgroup_mounts_from(DOCKER_MOUNTINFO, false).unwrap();
        assert_eq!(mounts.len(), 3);
        assert!(mounts.iter().all(|m| m.root == "/system.slice/docker-dc4e.scope"));
    }

    #[test]
    fn test_cgroup_mounts_all() {
        assert_eq!(cgroup_mounts_from(BEDROCK_MOUNTINFO, false).unwrap().len(), 2);
        assert_eq!(cgroup_mounts_from(BEDROCK_MOUNTINFO, true).unwrap().len(), 4);
        assert_eq!(
            cgroup_mounts_from(FEDORA_MOUNTINFO, true).unwrap(),
            cgroup_mounts_from(FEDORA_MOUNTINFO, false).unwrap()
        );
    }

    #[test]
    fn test_cgroup2_mount_is_ignored() {
        let content = "\
25 21 0:22 / /sys/fs/cgroup/systemd rw,nosuid,nodev,noexec,relatime shared:5 - cgroup2 cgroup2 rw,nsdelegate
26 21 0:23 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:6 - cgroup cgroup rw,memory";
        let mounts = cgroup_mounts_from(content, true).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mountpoint, "/sys/fs/cgroup/memory");
    }

    #[test]
    fn test_find_mountpoint_and_root() {
        let content = "\
35 27 0:29 / /foo rw,nosuid,nodev,noexec,relatime shared:18 - cgroup cgroup rw,devices
35 27 0:29 / /sys/fs/cgroup/devices rw,nosuid,nodev,noexec,relatime shared:18 - cgroup cgroup rw,devices";
        let (mountpoint, root) = find_mountpoint_and_root(content, "/sys/fs", "devices").unwrap();
        assert_eq!(mountpoint, "/sys/fs/cgroup/devices");
        assert_eq!(root, "/");
        let (mountpoint, _) = find_mountpoint_and_root(content, "", "devices").unwrap();
        assert_eq!(mountpoint, "/foo");

        let err = find_mountpoint_and_root(content, "", "memory").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);

        let (mountpoint, _) =
            find_mountpoint_and_root(FEDORA_MOUNTINFO, "", "name=systemd").unwrap();
        assert_eq!(mountpoint, "/sys/fs/cgroup/systemd");
    }

    #[test]
    fn test_unescape() {
        let infos = parse_mountinfo(FEDORA_MOUNTINFO).unwrap();
        assert_eq!(infos.last().unwrap().mountpoint, "/DATA/foo_bla_bla");
        assert_eq!(unescape("/mnt/a\\040b"), "/mnt/a b");
        assert_eq!(unescape("/mnt/a\\"), "/mnt/a\\");
        assert!(parse_mountinfo("garbage").is_err());
    }

    #[test]
    fn test_rebase_on_mount() {
        assert_eq!(
            rebase_on_mount("/sys/fs/cgroup/memory", "/", "/user.slice"),
            "/sys/fs/cgroup/memory/user.slice"
        );
        assert_eq!(
            rebase_on_mount(
                "/sys/fs/cgroup/memory",
                "/system.slice/docker-dc4e.scope",
                "/system.slice/docker-dc4e.scope/nested"
            ),
            "/sys/fs/cgroup/memory/nested"
        );
        assert_eq!(
            rebase_on_mount("/sys/fs/cgroup/memory", "/docker", "/docker"),
            "/sys/fs/cgroup/memory"
        );
    }
}
