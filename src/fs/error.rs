// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use std::error::Error as StdError;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// The kind of a cgroupfs access failure.
#[derive(thiserror::Error, Debug, Eq, PartialEq, Clone, Copy)]
pub enum ErrorKind {
    #[error("no such file or directory")]
    NotExist,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid path")]
    InvalidPath,

    /// Resolution of a path escaped the cgroup root.
    #[error("path resolution escaped the cgroup root")]
    Security,

    /// The cached root handle points somewhere else than the cgroup root,
    /// the caller may retry once the handle has been reset.
    #[error("stale cgroup root handle")]
    StaleRootHandle,

    #[error("device or resource busy")]
    Busy,

    #[error("operation not supported")]
    Unsupported,

    #[error("unable to parse cgroup file")]
    Parse,

    #[error("invalid bytes size")]
    InvalidBytesSize,

    #[error("cgroup filesystem error")]
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{}: ", context)?;
        }
        match &self.cause {
            Some(cause) => write!(f, "{} caused by: {}", self.kind, cause),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            cause: None,
        }
    }

    pub fn with_cause<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: 'static + Send + Sync + StdError,
    {
        Self {
            kind,
            context: None,
            cause: Some(Box::new(cause)),
        }
    }

    /// Build a parse error carrying a human readable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse).context(msg)
    }

    /// Attach a context, typically the path being operated on.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Classify an I/O error by its errno.
    pub fn from_io(err: io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(libc::ENOENT) => ErrorKind::NotExist,
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => {
                ErrorKind::PermissionDenied
            }
            Some(libc::EBUSY) => ErrorKind::Busy,
            Some(libc::ENODEV) | Some(libc::EOPNOTSUPP) => ErrorKind::Unsupported,
            _ => match err.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotExist,
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::Io,
            },
        };
        Self::with_cause(kind, err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The errno carried by the underlying I/O error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.cause
            .as_ref()
            .and_then(|cause| cause.downcast_ref::<io::Error>())
            .and_then(|err| err.raw_os_error())
    }

    pub fn is_not_exist(&self) -> bool {
        self.kind == ErrorKind::NotExist
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

impl From<nix::Error> for Error {
    fn from(errno: nix::Error) -> Self {
        Self::from_io(io::Error::from_raw_os_error(errno as i32))
    }
}
