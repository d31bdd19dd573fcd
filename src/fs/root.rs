// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Process-wide handle to the cgroup filesystem root.
//!
//! Every open below `/sys/fs/cgroup` is resolved relative to one cached
//! directory handle with `openat2(2)`, so that neither `..`, symlinks nor
//! (on cgroup v2) mount crossings can lead outside of the cgroup tree.
//!
//! The handle may go stale, e.g. when a careless caller closes a file
//! descriptor it does not own and the number gets reused. Such a state is
//! reported to every caller observing it as `StaleRootHandle`, and the
//! first of them resets the handle. The next open reopens it, exactly
//! once, under the state lock.

use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use nix::sys::statfs::{fstatfs, CGROUP2_SUPER_MAGIC};

use crate::fs::error::{Error, ErrorKind, Result};

pub const CGROUPFS_ROOT: &str = "/sys/fs/cgroup";

/// Argument of `openat2(2)`, see `include/uapi/linux/openat2.h`.
#[repr(C)]
struct OpenHow {
    flags: u64,
    mode: u64,
    resolve: u64,
}

#[derive(Debug)]
struct RootHandle {
    /// The descriptor is intentionally never closed: once the handle is
    /// found stale its number belongs to somebody else.
    fd: RawFd,
    resolve: u64,
}

enum RootState {
    Unprepared,
    Ready(Arc<RootHandle>),
    /// `openat2(2)` or the cgroup root is not usable on this host.
    Unavailable,
}

static ROOT: Mutex<RootState> = Mutex::new(RootState::Unprepared);
static OPENED: AtomicU64 = AtomicU64::new(0);

fn lock() -> MutexGuard<'static, RootState> {
    ROOT.lock().unwrap_or_else(PoisonError::into_inner)
}

fn openat2(dirfd: RawFd, path: &str, flags: i32, mode: u32, resolve: u64) -> io::Result<File> {
    let cpath =
        CString::new(path).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let how = OpenHow {
        flags: (flags | libc::O_CLOEXEC) as u64,
        mode: mode as u64,
        resolve,
    };

    loop {
        // SAFETY: `cpath` and `how` outlive the call, and the size passed
        // matches the structure handed to the kernel.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_openat2,
                dirfd,
                cpath.as_ptr(),
                &how as *const OpenHow,
                std::mem::size_of::<OpenHow>(),
            )
        };
        if ret >= 0 {
            // SAFETY: the kernel just handed us this descriptor.
            return Ok(unsafe { File::from_raw_fd(ret as RawFd) });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

impl RootHandle {
    fn open() -> io::Result<Self> {
        // Going through openat2 here as well tells us early whether the
        // syscall is available at all.
        let root = openat2(
            libc::AT_FDCWD,
            CGROUPFS_ROOT,
            libc::O_DIRECTORY | libc::O_PATH,
            0,
            0,
        )?;
        let stat = fstatfs(&root).map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

        let mut resolve = libc::RESOLVE_BENEATH | libc::RESOLVE_NO_MAGICLINKS;
        if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
            // A single mountpoint and no "cpu,cpuacct" style symlinks.
            resolve |= libc::RESOLVE_NO_XDEV | libc::RESOLVE_NO_SYMLINKS;
        }

        Ok(Self {
            fd: root.into_raw_fd(),
            resolve,
        })
    }

    /// Returns where the handle points to when it is not the cgroup root
    /// anymore.
    fn stale_target(&self, err: &io::Error) -> Option<String> {
        if err.raw_os_error() == Some(libc::EBADF) {
            return Some("<closed>".to_string());
        }
        let dest = fs::read_link(format!("/proc/thread-self/fd/{}", self.fd)).ok()?;
        if dest == Path::new(CGROUPFS_ROOT) {
            return None;
        }
        Some(dest.display().to_string())
    }

    fn open_beneath(self: &Arc<Self>, rel_path: &str, flags: i32, mode: u32) -> Result<File> {
        let err = match openat2(self.fd, rel_path, flags, mode, self.resolve) {
            Ok(file) => return Ok(file),
            Err(err) => err,
        };

        if let Some(dest) = self.stale_target(&err) {
            let msg = format!(
                "cgroup root handle {} unexpectedly opened to {} != {}",
                self.fd, dest, CGROUPFS_ROOT
            );
            reset(self);
            return Err(Error::with_cause(ErrorKind::StaleRootHandle, err).context(msg));
        }

        let err = match err.raw_os_error() {
            Some(libc::EXDEV) | Some(libc::ELOOP) => Error::with_cause(ErrorKind::Security, err),
            _ => Error::from_io(err),
        };
        Err(err.context(format!("openat2 {}/{}", CGROUPFS_ROOT, rel_path)))
    }
}

/// Returns the current handle, opening it if needed. `None` means callers
/// have to use the open-then-verify fallback.
fn prepare() -> Option<Arc<RootHandle>> {
    let mut state = lock();
    match &*state {
        RootState::Ready(handle) => return Some(handle.clone()),
        RootState::Unavailable => return None,
        RootState::Unprepared => {}
    }

    match RootHandle::open() {
        Ok(handle) => {
            OPENED.fetch_add(1, Ordering::SeqCst);
            debug!("opened cgroup root handle {}", handle.fd);
            let handle = Arc::new(handle);
            *state = RootState::Ready(handle.clone());
            Some(handle)
        }
        Err(err) => {
            debug!("cgroup root handle unavailable, falling back: {}", err);
            *state = RootState::Unavailable;
            None
        }
    }
}

/// Drop `stale` as the current handle. Callers holding an older or a
/// newer handle than the current one are no-ops, which makes the reopen
/// single-flight.
fn reset(stale: &Arc<RootHandle>) {
    let mut state = lock();
    if let RootState::Ready(current) = &*state {
        if Arc::ptr_eq(current, stale) {
            info!("resetting stale cgroup root handle {}", stale.fd);
            *state = RootState::Unprepared;
        }
    }
}

/// Open `rel_path` beneath the cgroup root. Returns `None` when the root
/// handle cannot be used on this host.
pub(crate) fn open_beneath(rel_path: &str, flags: i32, mode: u32) -> Option<Result<File>> {
    let handle = prepare()?;
    Some(handle.open_beneath(rel_path, flags, mode))
}

#[cfg(test)]
pub(crate) fn open_count() -> u64 {
    OPENED.load(Ordering::SeqCst)
}

/// Swap in a handle pointing to `fd`, emulating a descriptor reuse.
#[cfg(test)]
fn invalidate(fd: RawFd) {
    let mut state = lock();
    let resolve = match &*state {
        RootState::Ready(handle) => handle.resolve,
        _ => libc::RESOLVE_BENEATH,
    };
    *state = RootState::Ready(Arc::new(RootHandle { fd, resolve }));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    use serial_test::serial;

    use super::*;

    const CALLERS: usize = 128;

    fn probe_file() -> Option<&'static str> {
        ["cgroup.procs", "memory/cgroup.procs", "cpu/cgroup.procs"]
            .iter()
            .find(|f| Path::new(CGROUPFS_ROOT).join(f).exists())
            .copied()
    }

    #[test]
    #[serial]
    fn test_open_beneath_rejects_escape() {
        if open_beneath(".", libc::O_RDONLY, 0).is_none() {
            eprintln!("Test skipped, openat2 unavailable");
            return;
        }

        let err = open_beneath("../../../etc/passwd", libc::O_RDONLY, 0)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    #[serial]
    fn test_concurrent_reopen_of_stale_handle() {
        let file = match probe_file() {
            Some(file) => file,
            None => {
                eprintln!("Test skipped, no cgroupfs?");
                return;
            }
        };
        if open_beneath(file, libc::O_RDONLY, 0).is_none() {
            eprintln!("Test skipped, openat2 unavailable");
            return;
        }

        let decoy = File::open(std::env::temp_dir()).unwrap().into_raw_fd();
        invalidate(decoy);
        let before = open_count();

        let stale_seen = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));
        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let stale_seen = stale_seen.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if let Err(err) = open_beneath(file, libc::O_RDONLY, 0).unwrap() {
                        assert_eq!(err.kind(), ErrorKind::StaleRootHandle, "{}", err);
                        assert!(err.to_string().contains("unexpectedly opened to"));
                        stale_seen.fetch_add(1, Ordering::SeqCst);
                    }
                    // Whatever happened before, the handle is healed now.
                    open_beneath(file, libc::O_RDONLY, 0).unwrap().unwrap();
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert!(stale_seen.load(Ordering::SeqCst) >= 1);
        assert_eq!(open_count() - before, 1);
        open_beneath(file, libc::O_RDONLY, 0).unwrap().unwrap();

        // The stale descriptor number has been left alone.
        assert!(nix::fcntl::fcntl(decoy, nix::fcntl::FcntlArg::F_GETFD).is_ok());
    }
}
