// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Connections to the bus, shared by every client of the process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use zbus::blocking::{Connection, Proxy};
use zbus::{Error, Result};

use crate::systemd::dbus::systemd_manager_proxy::ManagerProxyBlocking as SystemManager;

const SYSTEMD_SERVICE: &str = "org.freedesktop.systemd1";

/// The bus systemd is reached on: the system instance, or the user
/// instance for rootless callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bus {
    System,
    Session,
}

impl Default for Bus {
    fn default() -> Self {
        Bus::System
    }
}

static SYSTEM_CONNECTION: Mutex<Option<Arc<Connection>>> = Mutex::new(None);
static SESSION_CONNECTION: Mutex<Option<Arc<Connection>>> = Mutex::new(None);

impl Bus {
    fn slot(self) -> MutexGuard<'static, Option<Arc<Connection>>> {
        let slot = match self {
            Bus::System => &SYSTEM_CONNECTION,
            Bus::Session => &SESSION_CONNECTION,
        };
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the shared connection to `bus`, connecting on first use.
fn connection(bus: Bus) -> Result<Arc<Connection>> {
    let mut slot = bus.slot();
    if let Some(conn) = slot.as_ref() {
        return Ok(Arc::clone(conn));
    }

    let conn = Arc::new(match bus {
        Bus::System => Connection::system()?,
        Bus::Session => Connection::session()?,
    });
    *slot = Some(Arc::clone(&conn));
    Ok(conn)
}

/// Empty `slot` if it still holds `stale`. Returns whether it did.
fn take_if_current<T>(slot: &mut Option<Arc<T>>, stale: &Arc<T>) -> bool {
    let is_current = matches!(slot, Some(current) if Arc::ptr_eq(current, stale));
    if is_current {
        slot.take();
    }
    is_current
}

/// Drop `stale` as the shared connection, e.g. once the bus went away.
/// A connection another caller already replaced it with is kept. The
/// next call reconnects.
fn reset(bus: Bus, stale: &Arc<Connection>) {
    if take_if_current(&mut bus.slot(), stale) {
        debug!("reset the {:?} bus connection", bus);
    }
}

/// Run `f` over the shared connection, reconnecting and retrying once
/// when the connection turns out to be broken.
fn with_connection<T, F>(bus: Bus, f: F) -> Result<T>
where
    F: Fn(&Connection) -> Result<T>,
{
    let conn = connection(bus)?;
    match f(conn.as_ref()) {
        Err(Error::InputOutput(err)) => {
            debug!("bus connection failed: {}, reconnecting", err);
            reset(bus, &conn);
            f(connection(bus)?.as_ref())
        }
        result => result,
    }
}

/// Run `f` against the systemd manager object.
pub(crate) fn with_systemd_manager<T, F>(bus: Bus, f: F) -> Result<T>
where
    F: Fn(&SystemManager<'_>) -> Result<T>,
{
    with_connection(bus, |conn| {
        let proxy = SystemManager::new(conn)?;
        f(&proxy)
    })
}

/// Run `f` against the unit object at `path` through `interface`, e.g.
/// `org.freedesktop.systemd1.Scope`.
pub(crate) fn with_unit<T, F>(bus: Bus, path: &str, interface: &str, f: F) -> Result<T>
where
    F: Fn(&Proxy<'_>) -> Result<T>,
{
    with_connection(bus, |conn| {
        let proxy = Proxy::new(conn, SYSTEMD_SERVICE, path.to_string(), interface.to_string())?;
        f(&proxy)
    })
}
