// Copyright 2021-2023 Kata Contributors
// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use crate::systemd::dbus::error::{Error, Result};
use crate::systemd::dbus::proxy::{with_systemd_manager, with_unit, Bus};
use crate::systemd::props::{ZbusProperty, ZbusPropertyRef};
use crate::systemd::utils::{is_scope_unit, is_slice_unit, parse_systemd_version};
use crate::systemd::{Property, DEVICE_ALLOW, DEVICE_POLICY, PIDS, UNIT_MODE_REPLACE};
use crate::CgroupPid;

const SCOPE_INTERFACE: &str = "org.freedesktop.systemd1.Scope";
const SLICE_INTERFACE: &str = "org.freedesktop.systemd1.Slice";

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SystemdClient {
    /// The name of the systemd unit (slice or scope)
    unit: String,
    bus: Bus,
    props: Vec<Property>,
}

impl SystemdClient {
    pub fn new(unit: &str, bus: Bus, props: Vec<Property>) -> Result<Self> {
        Ok(Self {
            unit: unit.to_string(),
            bus,
            props,
        })
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }
}

fn to_zbus(props: &[Property]) -> Vec<ZbusProperty<'_>> {
    props.iter().map(|(k, v)| (k.clone(), v.into())).collect()
}

impl SystemdClient {
    /// Start a slice or a scope unit controlled and supervised by systemd.
    ///
    /// A unit that already exists is reported as such, see
    /// `Error::is_unit_exists()`.
    ///
    /// For more information, see:
    /// https://www.freedesktop.org/software/systemd/man/latest/systemd.unit.html
    /// https://www.freedesktop.org/software/systemd/man/latest/systemd.slice.html
    /// https://www.freedesktop.org/software/systemd/man/latest/systemd.scope.html
    pub fn start(&self) -> Result<()> {
        // A scope cannot exist without processes.
        if is_scope_unit(&self.unit) && !self.props.iter().any(|(k, _)| k == PIDS) {
            return Err(Error::InvalidProperties);
        }

        let props = to_zbus(&self.props);
        let props_ref: Vec<ZbusPropertyRef<'_>> =
            props.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let props_ref_ref: Vec<&ZbusPropertyRef<'_>> = props_ref.iter().collect();

        with_systemd_manager(self.bus, |manager| {
            manager
                .start_transient_unit(&self.unit, UNIT_MODE_REPLACE, &props_ref_ref, &[])
                .map(|_| ())
        })?;

        Ok(())
    }

    /// Stop the current transient unit, the processes will be killed on
    /// unit stop, see [1].
    ///
    /// 1. https://www.freedesktop.org/software/systemd/man/latest/systemd.kill.html#KillMode=
    pub fn stop(&self) -> Result<()> {
        let ret = with_systemd_manager(self.bus, |manager| {
            manager.stop_unit(&self.unit, UNIT_MODE_REPLACE).map(|_| ())
        });
        ignore_no_such_unit(ret)?;

        // If we stop the unit and it still exists, it may be in a failed
        // state, so we will try to reset it.
        if self.exists() {
            self.reset_failed()?;
        }

        Ok(())
    }

    /// Reset the failed state of the unit, so that its name may be used
    /// again.
    pub fn reset_failed(&self) -> Result<()> {
        let ret = with_systemd_manager(self.bus, |manager| manager.reset_failed_unit(&self.unit));
        ignore_no_such_unit(ret)?;
        Ok(())
    }

    /// Set properties for the unit through dbus `SetUnitProperties`.
    pub fn set_properties(&mut self, properties: &[Property]) -> Result<()> {
        for new in properties {
            // Try to update the value first, if fails, append it.
            if let Some(existing) = self.props.iter_mut().find(|p| p.0 == new.0) {
                existing.1 = new.1.clone();
            } else {
                self.props.push((new.0.clone(), new.1.clone()));
            }
        }

        // The unit must exist before setting properties.
        if !self.exists() {
            return Ok(());
        }

        let props = to_zbus(properties);
        let props_ref: Vec<ZbusPropertyRef<'_>> =
            props.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let props_ref_ref: Vec<&ZbusPropertyRef<'_>> = props_ref.iter().collect();

        with_systemd_manager(self.bus, |manager| {
            manager.set_unit_properties(&self.unit, true, &props_ref_ref)
        })?;

        Ok(())
    }

    /// Get the systemd version.
    pub fn systemd_version(&self) -> Result<usize> {
        let version = with_systemd_manager(self.bus, |manager| manager.version())?;
        parse_systemd_version(&version).map_err(|_| Error::CorruptedSystemdVersion(version))
    }

    /// Get the cgroup of the systemd instance, e.g.
    /// `/user.slice/user-1000.slice/user@1000.service` for a user one.
    pub fn control_group(&self) -> Result<String> {
        let cgroup = with_systemd_manager(self.bus, |manager| manager.control_group())?;
        Ok(cgroup)
    }

    /// Check if the unit exists.
    pub fn exists(&self) -> bool {
        with_systemd_manager(self.bus, |manager| manager.get_unit(&self.unit))
            .map(|_| true)
            .unwrap_or_default()
    }

    /// Add a process (tgid) to the unit through dbus
    /// `AttachProcessesToUnit`.
    pub fn add_process(&self, pid: CgroupPid, subcgroup: &str) -> Result<()> {
        with_systemd_manager(self.bus, |manager| {
            manager.attach_processes_to_unit(&self.unit, subcgroup, &[pid.pid as u32])
        })?;

        Ok(())
    }

    /// Read the `DevicePolicy` and `DeviceAllow` properties of the
    /// running unit.
    pub fn device_policy(&self) -> Result<(String, Vec<(String, String)>)> {
        let path = with_systemd_manager(self.bus, |manager| manager.get_unit(&self.unit))?;
        let interface = if is_slice_unit(&self.unit) {
            SLICE_INTERFACE
        } else {
            SCOPE_INTERFACE
        };

        let policy = with_unit(self.bus, path.as_str(), interface, |unit| {
            unit.get_property::<String>(DEVICE_POLICY)
        })?;
        let allow = with_unit(self.bus, path.as_str(), interface, |unit| {
            unit.get_property::<Vec<(String, String)>>(DEVICE_ALLOW)
        })?;

        Ok((policy, allow))
    }
}

fn ignore_no_such_unit(result: zbus::Result<()>) -> Result<bool> {
    match result.map_err(Error::from) {
        Ok(()) => Ok(false),
        Err(err) if err.is_no_such_unit() => Ok(true),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
pub mod tests {
    //! Unit tests for the SystemdClient
    //!
    //! They talk to the system instance of systemd and are skipped on
    //! hosts without one.

    use std::fs;
    use std::path::Path;
    use std::process::Command;
    use std::thread::{self, sleep};
    use std::time::Duration;

    use rand::distributions::Alphanumeric;
    use rand::Rng;
    use serial_test::serial;

    use crate::fs::mountinfo::is_cgroup2_unified_mode;
    use crate::systemd::dbus::client::*;
    use crate::systemd::props::{PropertiesBuilder, Value};
    use crate::systemd::utils::expand_slice;
    use crate::systemd::{DEFAULT_DESCRIPTION, DESCRIPTION, PIDS};
    use crate::tests::{spawn_sleep_inf, systemd_version};

    const TEST_SLICE: &str = "cgroupsmanager-test.slice";

    fn test_unit() -> String {
        let rand_string: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect();
        format!("cri-pod{}.scope", rand_string)
    }

    #[macro_export]
    macro_rules! skip_if_no_systemd {
        () => {
            if $crate::tests::systemd_version().is_none() {
                eprintln!("Test skipped, no systemd?");
                return;
            }
        };
    }

    fn systemd_show(unit: &str) -> String {
        let output = Command::new("systemctl")
            .arg("show")
            .arg(unit)
            .output()
            .expect("Failed to execute systemctl show command");
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    fn start_default_cgroup(pid: CgroupPid, unit: &str) -> SystemdClient {
        let v2 = is_cgroup2_unified_mode();
        let mut props = PropertiesBuilder::default_cgroup(TEST_SLICE, unit, v2).build();
        props.push((PIDS.to_string(), vec![pid.pid as u32].into()));
        let cgroup = SystemdClient::new(unit, Bus::System, props).unwrap();
        // Stop the unit if it exists.
        cgroup.stop().unwrap();

        cgroup.start().unwrap();
        cgroup.add_process(pid, "/").unwrap();
        cgroup
    }

    fn stop_cgroup(cgroup: &SystemdClient) {
        cgroup.stop().unwrap();
    }

    #[test]
    #[serial]
    fn test_start() {
        skip_if_no_systemd!();

        let v2 = is_cgroup2_unified_mode();
        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        let base = expand_slice(TEST_SLICE).unwrap();

        // Check if the cgroup exists in the filesystem
        let full_base = if v2 {
            format!("/sys/fs/cgroup/{}", base)
        } else {
            format!("/sys/fs/cgroup/memory/{}", base)
        };
        assert!(
            Path::new(&full_base).exists(),
            "Cgroup base path does not exist: {}",
            full_base
        );

        // PIDs
        let cgroup_procs_path = format!("{}/{}/cgroup.procs", full_base, &unit);
        for i in 0..5 {
            let content = fs::read_to_string(&cgroup_procs_path);
            if let Ok(content) = &content {
                if content.contains(&child.id().to_string()) {
                    break;
                }
            }
            // Retry attempts exhausted, resulting in failure
            if i == 4 {
                let content = content.as_ref().unwrap();
                assert!(
                    content.contains(&child.id().to_string()),
                    "Cgroup procs does not contain the child process ID"
                );
            }
            // Wait 500ms before next retrying
            sleep(Duration::from_millis(500));
        }

        let output = systemd_show(cgroup.unit());
        assert!(
            output
                .lines()
                .any(|line| line == format!("Slice={}", TEST_SLICE)),
            "Slice not found"
        );
        assert!(
            output.lines().any(|line| line == "Delegate=yes"),
            "Delegate not set"
        );
        assert!(
            output.lines().any(|line| line == "CPUAccounting=yes"),
            "CPUAccounting not set"
        );
        // IOAccounting for v2, and BlockIOAccounting for v1
        let io_accounting = if v2 {
            "IOAccounting=yes"
        } else {
            "BlockIOAccounting=yes"
        };
        assert!(
            output.lines().any(|line| line == io_accounting),
            "{} not set",
            io_accounting
        );
        assert!(
            output.lines().any(|line| line == "ActiveState=active"),
            "Unit is not active"
        );

        stop_cgroup(&cgroup);
        child.wait().unwrap();
    }

    #[test]
    #[serial]
    fn test_start_existing_unit() {
        skip_if_no_systemd!();

        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        let err = cgroup.start().unwrap_err();
        assert!(err.is_unit_exists(), "unexpected error: {}", err);

        stop_cgroup(&cgroup);
        child.wait().unwrap();
    }

    #[test]
    #[serial]
    fn test_stop() {
        skip_if_no_systemd!();

        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        let output = systemd_show(cgroup.unit());
        assert!(
            output.lines().any(|line| line == "ActiveState=active"),
            "Unit is not active"
        );

        stop_cgroup(&cgroup);

        let output = systemd_show(cgroup.unit());
        assert!(
            output.lines().any(|line| line == "ActiveState=inactive"),
            "Unit is not inactive"
        );

        // Stopping a unit which is gone is fine.
        stop_cgroup(&cgroup);

        child.wait().unwrap();
    }

    #[test]
    #[serial]
    fn test_set_properties() {
        skip_if_no_systemd!();

        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let mut cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        let output = systemd_show(cgroup.unit());
        assert!(
            output.lines().any(|line| line
                == format!(
                    "Description={} {}:{}",
                    DEFAULT_DESCRIPTION, TEST_SLICE, unit
                )),
            "Initial description not set correctly"
        );

        let properties = [(DESCRIPTION.to_string(), "container1 description".into())];
        cgroup.set_properties(&properties).unwrap();
        assert!(cgroup
            .props
            .iter()
            .any(|(k, v)| { k == DESCRIPTION && v == &"container1 description".into() }));

        let output = systemd_show(cgroup.unit());
        assert!(
            output
                .lines()
                .any(|line| line == "Description=container1 description"),
            "Updated description not set correctly"
        );

        stop_cgroup(&cgroup);
        child.wait().unwrap();
    }

    #[test]
    #[serial]
    fn test_device_policy() {
        skip_if_no_systemd!();

        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let mut cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        let properties = [
            (DEVICE_POLICY.to_string(), "strict".into()),
            (
                DEVICE_ALLOW.to_string(),
                Value::DeviceAllow(vec![("/dev/null".to_string(), "rw".to_string())]),
            ),
        ];
        cgroup.set_properties(&properties).unwrap();

        let (policy, allow) = cgroup.device_policy().unwrap();
        assert_eq!(policy, "strict");
        assert!(allow.iter().any(|(path, _)| path == "/dev/null"));

        stop_cgroup(&cgroup);
        child.wait().unwrap();
    }

    #[test]
    fn test_systemd_version() {
        skip_if_no_systemd!();

        let unit = test_unit();
        let cgroup = SystemdClient::new(&unit, Bus::System, vec![]).unwrap();
        let version = cgroup.systemd_version().unwrap();

        let expected_version = systemd_version().unwrap();
        assert_eq!(version, expected_version, "Systemd version mismatch");
    }

    #[test]
    fn test_concurrent_clients_share_connection() {
        skip_if_no_systemd!();

        let handles: Vec<_> = (0..600)
            .map(|i| {
                thread::spawn(move || {
                    let unit = format!("cgroupsmanager-concurrent-{}.scope", i);
                    let client = SystemdClient::new(&unit, Bus::System, vec![]).unwrap();
                    client.systemd_version().unwrap();
                    assert!(!client.exists());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn test_exists() {
        skip_if_no_systemd!();

        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        assert!(cgroup.exists(), "Cgroup should exist after starting");

        stop_cgroup(&cgroup);
        child.wait().unwrap();
    }

    #[test]
    #[serial]
    fn test_add_process() {
        skip_if_no_systemd!();
        if !is_cgroup2_unified_mode() {
            eprintln!("Test skipped, cgroup v2 only");
            return;
        }

        let unit = test_unit();
        let mut child = spawn_sleep_inf();
        let cgroup = start_default_cgroup(CgroupPid::from(child.id() as u64), &unit);

        let mut child1 = spawn_sleep_inf();
        let pid1 = CgroupPid::from(child1.id() as u64);
        cgroup.add_process(pid1, "/").unwrap();

        let cgroup_procs_path = format!(
            "/sys/fs/cgroup/{}/{}/cgroup.procs",
            expand_slice(TEST_SLICE).unwrap(),
            unit
        );
        for i in 0..5 {
            let content = fs::read_to_string(&cgroup_procs_path);
            if let Ok(content) = content {
                assert!(
                    content.contains(&child1.id().to_string()),
                    "Cgroup procs does not contain the child1 process ID"
                );
                break;
            }
            // Retry attempts exhausted, resulting in failure
            if i == 4 {
                content.unwrap();
            }
            // Wait 500ms before next retrying
            sleep(Duration::from_millis(500));
        }

        stop_cgroup(&cgroup);
        child.wait().unwrap();
        child1.wait().unwrap();
    }
}
