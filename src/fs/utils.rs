// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Helpers for parsing cgroupfs files and for managing cgroup
//! directories.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;

use crate::fs::error::{Error, ErrorKind, Result};
use crate::fs::file::{open_file, read_file, retrying_write};
use crate::CgroupPid;

pub const CGROUP_PROCS: &str = "cgroup.procs";

const WRITE_PROC_RETRIES: usize = 5;
const WRITE_PROC_DELAY: Duration = Duration::from_millis(30);

const RMDIR_RETRIES: usize = 10;
const RMDIR_INITIAL_DELAY: Duration = Duration::from_millis(1);

/// Lexically clean `path`: collapse repeated slashes, drop `.` elements
/// and resolve `..` against the preceding element. `..` never walks above
/// the root of an absolute path.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join an inner cgroup path onto a mountpoint, never leaving the
/// mountpoint.
pub fn join_path(base: &str, path: &str) -> String {
    let inner = clean_path(&format!("/{}", path));
    if inner == "/" {
        return clean_path(base);
    }
    clean_path(&format!("{}{}", base, inner))
}

/// Parse an unsigned cgroup value. Negative values, which some kernels
/// report for limits, are read as 0; values beyond `u64` saturate.
pub fn parse_uint(s: &str) -> Result<u64> {
    let s = s.trim();
    if s == "max" {
        return Ok(u64::MAX);
    }

    if let Ok(value) = s.parse::<u64>() {
        return Ok(value);
    }

    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::parse(format!("unable to parse {:?} as a uint", s)));
    }
    if s.starts_with('-') {
        Ok(0)
    } else {
        Ok(u64::MAX)
    }
}

/// Parse a `key value` line, e.g. `nr_periods 2048`.
pub fn parse_key_value(line: &str) -> Result<(&str, u64)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) => Ok((key, parse_uint(value)?)),
        _ => Err(Error::parse(format!(
            "line {:?} is not in key value format",
            line
        ))),
    }
}

/// Parse the value of an item from a tuple string split by whitespace.
///
/// For example, we have a tuple string like:
///
/// let tuple_str: &str = "system 100000\nuser 200000";
///
/// assert_eq!(
///     parse_value_from_tuples::<u64>(tuple_str, "user"),
///     Some(200000),
/// );
pub fn parse_value_from_tuples<T>(tuple_str: &str, item: &str) -> Option<T>
where
    T: FromStr,
{
    tuple_str.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let current_item = parts.next()?;
        let value = parts.next()?;
        if current_item != item {
            return None;
        }
        value.parse::<T>().ok()
    })
}

/// Read a single unsigned value, `max` reading as `u64::MAX`.
pub fn get_cgroup_param_uint(dir: &str, file: &str) -> Result<u64> {
    let content = read_file(dir, file)?;
    parse_uint(&content).map_err(|err| err.context(format!("{}/{}", dir, file)))
}

/// Read a single signed value, `max` reading as `i64::MAX`.
pub fn get_cgroup_param_int(dir: &str, file: &str) -> Result<i64> {
    let content = read_file(dir, file)?;
    let content = content.trim();
    if content == "max" {
        return Ok(i64::MAX);
    }
    content.parse::<i64>().map_err(|err| {
        Error::with_cause(ErrorKind::Parse, err).context(format!("{}/{}", dir, file))
    })
}

pub fn get_cgroup_param_string(dir: &str, file: &str) -> Result<String> {
    Ok(read_file(dir, file)?.trim().to_string())
}

/// Parse the content of `/proc/<pid>/cgroup` into a map from controller
/// (or `name=` hierarchy) to the cgroup path. On a unified host the only
/// key is the empty string.
pub fn parse_cgroup_file(content: &str) -> Result<HashMap<String, String>> {
    let mut cgroups = HashMap::new();

    // Expected line format: `4:cpu,cpuacct:/user.slice`
    for line in content.lines() {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() < 3 {
            return Err(Error::parse(format!(
                "invalid cgroup entry: must contain at least two colons: {}",
                line
            )));
        }
        for subsystem in parts[1].split(',') {
            cgroups.insert(subsystem.to_string(), parts[2].to_string());
        }
    }

    Ok(cgroups)
}

/// Cgroups of the process `pid`, or of the calling process.
pub fn proc_cgroups(pid: Option<CgroupPid>) -> Result<HashMap<String, String>> {
    let path = match pid {
        Some(pid) => format!("/proc/{}/cgroup", pid.pid),
        None => "/proc/self/cgroup".to_string(),
    };
    let content = fs::read_to_string(&path).map_err(|err| Error::from(err).context(path))?;
    parse_cgroup_file(&content)
}

/// Move `pid` into the cgroup at `dir`. `None` leaves the cgroup empty.
///
/// Tasks still in `TASK_NEW` state are refused with `EINVAL`, so that
/// error is retried a few times.
pub fn write_cgroup_proc(dir: &str, pid: Option<CgroupPid>) -> Result<()> {
    if dir.is_empty() {
        return Err(Error::new(ErrorKind::InvalidPath)
            .context(format!("no such directory for {}", CGROUP_PROCS)));
    }
    let pid = match pid {
        Some(pid) => pid,
        None => return Ok(()),
    };

    let mut file = open_file(dir, CGROUP_PROCS, libc::O_WRONLY)?;
    let data = pid.pid.to_string();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match retrying_write(&mut file, data.as_bytes()) {
            Ok(()) => return Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) && attempt < WRITE_PROC_RETRIES => {
                thread::sleep(WRITE_PROC_DELAY);
            }
            Err(err) => {
                return Err(Error::from(err).context(format!(
                    "failed to write {} to {}/{}",
                    data, dir, CGROUP_PROCS
                )))
            }
        }
    }
}

/// Processes in the cgroup at `dir`.
pub fn read_procs(dir: &str) -> Result<Vec<CgroupPid>> {
    let content = read_file(dir, CGROUP_PROCS)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim().parse::<u64>().map(CgroupPid::from).map_err(|err| {
                Error::with_cause(ErrorKind::Parse, err)
                    .context(format!("{}/{}: {:?}", dir, CGROUP_PROCS, line))
            })
        })
        .collect()
}

fn rmdir(path: &Path, retry: bool) -> io::Result<()> {
    let mut delay = RMDIR_INITIAL_DELAY;
    let mut tries = RMDIR_RETRIES;
    loop {
        let err = match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        match Errno::from_i32(err.raw_os_error().unwrap_or(0)) {
            Errno::ENOENT => return Ok(()),
            Errno::EINTR => continue,
            Errno::EBUSY if retry && tries > 0 => {
                thread::sleep(delay);
                delay *= 2;
                tries -= 1;
            }
            _ => return Err(err),
        }
    }
}

/// Remove a cgroup directory and all of its sub-cgroups. A path that does
/// not exist is removed already.
pub fn remove_path(path: &str) -> Result<()> {
    let path = Path::new(path);
    // Leaf cgroups go away with a single rmdir.
    if rmdir(path, false).is_ok() {
        return Ok(());
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::from(err).context(format!("remove {}", path.display()))),
    };
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            remove_path(&entry.path().to_string_lossy())?;
        }
    }

    rmdir(path, true).map_err(|err| Error::from(err).context(format!("rmdir {}", path.display())))
}

/// Remove every path. A failure does not stop the removal of the other
/// paths, and the returned error names every path left behind.
pub fn remove_paths<'a, I>(paths: I) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut errors: Vec<Error> = paths
        .into_iter()
        .filter_map(|path| remove_path(path).err())
        .collect();

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        n => {
            let kind = errors[0].kind();
            let causes = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::new(kind).context(format!("failed to remove {} paths: {}", n, causes)))
        }
    }
}
