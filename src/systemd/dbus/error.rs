// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid properties")]
    InvalidProperties,

    #[error("corrupted systemd version {0:?}")]
    CorruptedSystemdVersion(String),

    #[error("dbus error: {0}")]
    Dbus(#[from] zbus::Error),
}

impl Error {
    /// Whether the error is systemd reporting that the unit exists.
    pub fn is_unit_exists(&self) -> bool {
        self.dbus_error_name() == Some(crate::systemd::UNIT_EXISTS)
    }

    pub fn is_no_such_unit(&self) -> bool {
        self.dbus_error_name() == Some(crate::systemd::NO_SUCH_UNIT)
    }

    fn dbus_error_name(&self) -> Option<&str> {
        match self {
            Error::Dbus(zbus::Error::MethodError(name, _, _)) => Some(name.as_str()),
            _ => None,
        }
    }
}
