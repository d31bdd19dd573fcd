// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use log::debug;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::statfs::{fstatfs, CGROUP2_SUPER_MAGIC, CGROUP_SUPER_MAGIC};

use crate::fs::error::{Error, ErrorKind, Result};
use crate::fs::root::{self, CGROUPFS_ROOT};
use crate::fs::utils::clean_path;

/// Test builds emulate cgroupfs on top of a regular filesystem: written
/// files are created on demand and the filesystem type is not checked.
const TEST_MODE: bool = cfg!(test);

const CGROUPFS_PREFIX: &str = "/sys/fs/cgroup/";

/// Open `file` in the cgroup directory `dir`.
///
/// Paths below `/sys/fs/cgroup` are resolved through the cached root
/// handle, or opened and then verified to still be within the cgroup
/// filesystem when `openat2(2)` is not available.
pub fn open_file(dir: &str, file: &str, flags: i32) -> Result<File> {
    if dir.is_empty() {
        return Err(Error::new(ErrorKind::InvalidPath)
            .context(format!("no directory specified for {}", file)));
    }
    if !dir.starts_with('/') {
        return Err(Error::new(ErrorKind::InvalidPath).context(format!("open {}/{}", dir, file)));
    }

    let mut flags = flags;
    let mut mode = 0;
    if TEST_MODE && flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
        flags |= libc::O_TRUNC | libc::O_CREAT;
        mode = 0o600;
    }

    // `file` may never walk up, `dir` may not leave the cgroupfs once it
    // claims to be in it.
    let path = clean_path(&format!("{}/{}", dir, clean_path(&format!("/{}", file))));
    let in_cgroupfs = dir == CGROUPFS_ROOT || dir.starts_with(CGROUPFS_PREFIX);
    if in_cgroupfs && path != CGROUPFS_ROOT && !path.starts_with(CGROUPFS_PREFIX) {
        return Err(Error::new(ErrorKind::Security).context(format!("open {}/{}", dir, file)));
    }

    if !in_cgroupfs {
        return open_plain(&path, flags, mode);
    }

    let rel_path = path.strip_prefix(CGROUPFS_PREFIX).unwrap_or(".");
    match root::open_beneath(rel_path, flags, mode) {
        Some(result) => result,
        None => open_verified(&path, flags, mode),
    }
}

fn open_plain(path: &str, flags: i32, mode: u32) -> Result<File> {
    let oflag = OFlag::from_bits_truncate(flags | libc::O_CLOEXEC);
    let mode = Mode::from_bits_truncate(mode);
    loop {
        match fcntl::open(path, oflag, mode) {
            // SAFETY: the descriptor was just opened and is owned by nobody else.
            Ok(fd) => return Ok(unsafe { File::from_raw_fd(fd) }),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(Error::from(errno).context(format!("open {}", path))),
        }
    }
}

/// Fallback for hosts without `openat2(2)`: open, then check that what
/// got opened is still part of the cgroup filesystem.
fn open_verified(path: &str, flags: i32, mode: u32) -> Result<File> {
    let file = open_plain(path, flags, mode)?;

    let real = fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd()))
        .map_err(|err| Error::from(err).context(format!("verify {}", path)))?;
    if real != Path::new(CGROUPFS_ROOT) && !real.starts_with(CGROUPFS_PREFIX) {
        return Err(Error::new(ErrorKind::Security)
            .context(format!("{} resolved to {}", path, real.display())));
    }

    if !TEST_MODE {
        let stat = fstatfs(&file)
            .map_err(|errno| Error::from(errno).context(format!("fstatfs {}", path)))?;
        let fs_type = stat.filesystem_type();
        if fs_type != CGROUP_SUPER_MAGIC && fs_type != CGROUP2_SUPER_MAGIC {
            return Err(Error::new(ErrorKind::Security)
                .context(format!("{} is not on a cgroup filesystem", path)));
        }
    }

    Ok(file)
}

/// Read the whole content of a cgroup file.
pub fn read_file(dir: &str, file: &str) -> Result<String> {
    let mut fd = open_file(dir, file, libc::O_RDONLY)?;
    let mut content = String::new();
    fd.read_to_string(&mut content)
        .map_err(|err| Error::from(err).context(format!("read {}/{}", dir, file)))?;
    Ok(content)
}

/// Write `data` to a cgroup file, in a single `write(2)` as far as the
/// kernel allows.
pub fn write_file(dir: &str, file: &str, data: &str) -> Result<()> {
    let mut fd = open_file(dir, file, libc::O_WRONLY)?;
    retrying_write(&mut fd, data.as_bytes())
        .map_err(|err| Error::from(err).context(format!("write {:?} to {}/{}", data, dir, file)))
}

/// Write a multi-line value one line at a time, as files like
/// `rdma.max` or `net_prio.ifpriomap` only take one entry per write.
pub fn write_file_by_line(dir: &str, file: &str, data: &str) -> Result<()> {
    let mut fd = open_file(dir, file, libc::O_WRONLY)?;
    for line in data.lines().filter(|line| !line.is_empty()) {
        retrying_write(&mut fd, line.as_bytes()).map_err(|err| {
            Error::from(err).context(format!("write {:?} to {}/{}", line, dir, file))
        })?;
    }
    Ok(())
}

/// Write the whole buffer, transparently restarting on `EINTR`.
pub(crate) fn retrying_write<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    let mut buf = data;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                debug!("interrupted while writing {:?}, retrying", String::from_utf8_lossy(data));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
