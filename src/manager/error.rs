// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use std::time::Duration;

use crate::devices::Error as DevicesError;
use crate::fs::error::{Error as CgroupfsError, ErrorKind as CgroupfsErrorKind};
use crate::systemd::dbus::error::Error as DbusError;
use crate::systemd::error::Error as SystemdError;

pub type Result<T> = std::result::Result<T, Error>;

/// What a failed manager call amounts to, whatever layer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotExist,
    PermissionDenied,
    Unsupported,
    /// A path resolved outside of the cgroup filesystem.
    Security,
    Timeout,
    /// Malformed configuration or a call out of lifecycle order.
    Invalid,
    Other,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cgroup not applied yet")]
    NotApplied,

    #[error("cgroup already destroyed")]
    Destroyed,

    #[error("unable to freeze cgroup within {0:?}")]
    FreezeTimeout(Duration),

    #[error("cgroup v1 does not support unified resources")]
    V1NoUnified,

    #[error("device rules are not supported on cgroup v2")]
    DevicesUnsupported,

    #[error("freezer not supported")]
    FreezerUnsupported,

    #[error("cgroup subsystem {0} not mounted")]
    SubsystemNotMounted(String),

    #[error("controller {0} not available")]
    ControllerNotAvailable(String),

    #[error("{what} limit {limit} is not above the current usage {usage}")]
    BelowUsage {
        what: &'static str,
        limit: i64,
        usage: u64,
    },

    #[error("cgroupfs error: {0}")]
    Cgroupfs(#[from] CgroupfsError),

    #[error("devices error: {0}")]
    Devices(#[from] DevicesError),

    #[error("systemd error: {0}")]
    Systemd(#[from] SystemdError),

    #[error("dbus error: {0}")]
    Dbus(#[from] DbusError),
}

fn cgroupfs_kind(err: &CgroupfsError) -> ErrorKind {
    match err.kind() {
        CgroupfsErrorKind::NotExist => ErrorKind::NotExist,
        CgroupfsErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        CgroupfsErrorKind::Unsupported => ErrorKind::Unsupported,
        CgroupfsErrorKind::Security | CgroupfsErrorKind::StaleRootHandle => ErrorKind::Security,
        CgroupfsErrorKind::InvalidPath
        | CgroupfsErrorKind::Parse
        | CgroupfsErrorKind::InvalidBytesSize => ErrorKind::Invalid,
        CgroupfsErrorKind::Busy | CgroupfsErrorKind::Io => ErrorKind::Other,
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::NotApplied
            | Error::Destroyed
            | Error::V1NoUnified
            | Error::BelowUsage { .. } => ErrorKind::Invalid,
            Error::FreezeTimeout(_) => ErrorKind::Timeout,
            Error::DevicesUnsupported | Error::FreezerUnsupported => ErrorKind::Unsupported,
            Error::SubsystemNotMounted(_) | Error::ControllerNotAvailable(_) => {
                ErrorKind::NotExist
            }
            Error::Cgroupfs(err) => cgroupfs_kind(err),
            Error::Devices(DevicesError::Cgroupfs(err)) => cgroupfs_kind(err),
            Error::Devices(DevicesError::Mismatch)
            | Error::Devices(DevicesError::ModeMismatch)
            | Error::Devices(DevicesError::ProcDevices(_)) => ErrorKind::Other,
            Error::Devices(_) => ErrorKind::Invalid,
            Error::Systemd(SystemdError::ObsoleteSystemd)
            | Error::Systemd(SystemdError::CgroupsV1NotSupported) => ErrorKind::Unsupported,
            Error::Systemd(_) => ErrorKind::Invalid,
            Error::Dbus(err) if err.is_no_such_unit() => ErrorKind::NotExist,
            Error::Dbus(DbusError::InvalidProperties) => ErrorKind::Invalid,
            Error::Dbus(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Whether the error is a cgroupfs error of `kind`.
    pub(crate) fn is_cgroupfs(&self, kind: CgroupfsErrorKind) -> bool {
        match self {
            Error::Cgroupfs(err) | Error::Devices(DevicesError::Cgroupfs(err)) => {
                err.kind() == kind
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = Error::from(CgroupfsError::new(CgroupfsErrorKind::NotExist));
        assert_eq!(err.kind(), ErrorKind::NotExist);
        assert!(err.is_cgroupfs(CgroupfsErrorKind::NotExist));

        let err = Error::from(DevicesError::Cgroupfs(CgroupfsError::new(
            CgroupfsErrorKind::PermissionDenied,
        )));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = Error::from(CgroupfsError::new(CgroupfsErrorKind::StaleRootHandle));
        assert_eq!(err.kind(), ErrorKind::Security);

        assert_eq!(
            Error::FreezeTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(Error::DevicesUnsupported.kind(), ErrorKind::Unsupported);
        assert_eq!(Error::V1NoUnified.kind(), ErrorKind::Invalid);
        assert_eq!(
            Error::from(SystemdError::ObsoleteSystemd).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            Error::from(DevicesError::InvalidRule("x".to_string())).kind(),
            ErrorKind::Invalid
        );
    }
}
