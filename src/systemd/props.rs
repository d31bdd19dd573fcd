// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

use zbus::zvariant::Value as ZbusValue;

use crate::systemd::utils::is_slice_unit;
use crate::systemd::{
    BLOCK_IO_ACCOUNTING, CPU_ACCOUNTING, DEFAULT_DEPENDENCIES, DEFAULT_DESCRIPTION, DELEGATE,
    DESCRIPTION, IO_ACCOUNTING, MEMORY_ACCOUNTING, PIDS, SLICE, TASKS_ACCOUNTING, WANTS,
};

/// A unit property: its name and its typed value.
pub type Property = (String, Value);

pub(crate) type ZbusProperty<'a> = (String, ZbusValue<'a>);
pub(crate) type ZbusPropertyRef<'a> = (&'a str, &'a ZbusValue<'a>);

/// Value of a unit property, mirroring the D-Bus types systemd expects.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Bool(bool),
    U64(u64),
    I64(i64),
    String(String),
    /// `au`, e.g. `PIDs`.
    ArrayU32(Vec<u32>),
    /// `ay`, e.g. `AllowedCPUs`.
    Bytes(Vec<u8>),
    /// `a(ss)` of device path and permissions, i.e. `DeviceAllow`.
    DeviceAllow(Vec<(String, String)>),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::U64(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u32>> for Value {
    fn from(value: Vec<u32>) -> Self {
        Value::ArrayU32(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<'a> From<&'a Value> for ZbusValue<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Bool(b) => ZbusValue::Bool(*b),
            Value::U64(n) => ZbusValue::U64(*n),
            Value::I64(n) => ZbusValue::I64(*n),
            Value::String(s) => ZbusValue::Str(s.as_str().into()),
            Value::ArrayU32(arr) => ZbusValue::Array(arr.clone().into()),
            Value::Bytes(bytes) => ZbusValue::Array(bytes.clone().into()),
            Value::DeviceAllow(entries) => ZbusValue::Array(entries.clone().into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PropertiesBuilder {
    cpu_accounting: Option<bool>,
    memory_accounting: Option<bool>,
    task_accounting: Option<bool>,
    // IO_ACCOUNTING for cgroup v2 and BLOCK_IO_ACCOUNTING for cgroup v1.
    io_accounting: Option<bool>,
    v2: bool,
    default_dependencies: Option<bool>,
    description: Option<String>,
    wants: Option<String>,
    slice: Option<String>,
    delegate: Option<bool>,
    pids: Option<Vec<u32>>,
}

impl PropertiesBuilder {
    /// The properties every transient unit is started with.
    pub fn default_cgroup(slice: &str, unit: &str, v2: bool) -> Self {
        let mut builder = Self::default()
            .cpu_accounting(true)
            .memory_accounting(true)
            .task_accounting(true)
            .io_accounting(true, v2)
            .default_dependencies(false)
            .description(format!("{} {}:{}", DEFAULT_DESCRIPTION, slice, unit));

        if is_slice_unit(unit) {
            // If we create a slice, the parent is defined via a Wants=.
            builder = builder.wants(slice.to_string());
        } else {
            // Otherwise it's a scope, which we put into a Slice=.
            builder = builder.slice(slice.to_string());
            // Assume scopes always support delegation (supported since systemd v218).
            builder = builder.delegate(true);
        }

        builder
    }

    pub fn cpu_accounting(mut self, enabled: bool) -> Self {
        self.cpu_accounting = Some(enabled);
        self
    }

    pub fn memory_accounting(mut self, enabled: bool) -> Self {
        self.memory_accounting = Some(enabled);
        self
    }

    pub fn task_accounting(mut self, enabled: bool) -> Self {
        self.task_accounting = Some(enabled);
        self
    }

    pub fn io_accounting(mut self, enabled: bool, v2: bool) -> Self {
        self.io_accounting = Some(enabled);
        self.v2 = v2;
        self
    }

    pub fn default_dependencies(mut self, enabled: bool) -> Self {
        self.default_dependencies = Some(enabled);
        self
    }

    pub fn description(mut self, desc: String) -> Self {
        self.description = Some(desc);
        self
    }

    pub fn wants(mut self, wants: String) -> Self {
        self.wants = Some(wants);
        self
    }

    pub fn slice(mut self, slice: String) -> Self {
        self.slice = Some(slice);
        self
    }

    pub fn delegate(mut self, enabled: bool) -> Self {
        self.delegate = Some(enabled);
        self
    }

    pub fn pids(mut self, pids: Vec<u32>) -> Self {
        self.pids = Some(pids);
        self
    }

    pub fn build(self) -> Vec<Property> {
        let mut props: Vec<Property> = vec![];
        let mut push = |key: &str, value: Value| props.push((key.to_string(), value));

        if let Some(cpu_accounting) = self.cpu_accounting {
            push(CPU_ACCOUNTING, cpu_accounting.into());
        }

        if let Some(memory_accounting) = self.memory_accounting {
            push(MEMORY_ACCOUNTING, memory_accounting.into());
        }

        if let Some(task_accounting) = self.task_accounting {
            push(TASKS_ACCOUNTING, task_accounting.into());
        }

        if let Some(io_accounting) = self.io_accounting {
            if self.v2 {
                push(IO_ACCOUNTING, io_accounting.into());
            } else {
                push(BLOCK_IO_ACCOUNTING, io_accounting.into());
            }
        }

        if let Some(default_dependencies) = self.default_dependencies {
            push(DEFAULT_DEPENDENCIES, default_dependencies.into());
        }

        let description = self
            .description
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());
        push(DESCRIPTION, description.into());

        if let Some(wants) = self.wants {
            push(WANTS, wants.into());
        }

        if let Some(slice) = self.slice {
            push(SLICE, slice.into());
        }

        if let Some(delegate) = self.delegate {
            push(DELEGATE, delegate.into());
        }

        if let Some(pids) = self.pids {
            push(PIDS, pids.into());
        }

        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get<'a>(props: &'a [Property], key: &str) -> Option<&'a Value> {
        props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[test]
    fn test_default_scope_properties() {
        let props = PropertiesBuilder::default_cgroup("system.slice", "ctr.scope", true)
            .pids(vec![42])
            .build();

        assert_eq!(get(&props, SLICE), Some(&Value::from("system.slice")));
        assert_eq!(get(&props, DELEGATE), Some(&Value::Bool(true)));
        assert_eq!(get(&props, WANTS), None);
        assert_eq!(get(&props, IO_ACCOUNTING), Some(&Value::Bool(true)));
        assert_eq!(get(&props, BLOCK_IO_ACCOUNTING), None);
        assert_eq!(get(&props, DEFAULT_DEPENDENCIES), Some(&Value::Bool(false)));
        assert_eq!(get(&props, PIDS), Some(&Value::ArrayU32(vec![42])));
        assert_eq!(
            get(&props, DESCRIPTION),
            Some(&Value::from(format!(
                "{} system.slice:ctr.scope",
                DEFAULT_DESCRIPTION
            )))
        );
    }

    #[test]
    fn test_default_slice_properties() {
        let props = PropertiesBuilder::default_cgroup("system.slice", "pod.slice", false).build();

        assert_eq!(get(&props, WANTS), Some(&Value::from("system.slice")));
        assert_eq!(get(&props, SLICE), None);
        assert_eq!(get(&props, DELEGATE), None);
        assert_eq!(get(&props, BLOCK_IO_ACCOUNTING), Some(&Value::Bool(true)));
        assert_eq!(get(&props, IO_ACCOUNTING), None);
    }

    #[test]
    fn test_zbus_value() {
        let value = Value::DeviceAllow(vec![("char-pts".to_string(), "rwm".to_string())]);
        let zvalue = ZbusValue::from(&value);
        assert_eq!(zvalue.value_signature().to_string(), "a(ss)");

        let value = Value::Bytes(vec![0b11]);
        assert_eq!(ZbusValue::from(&value).value_signature().to_string(), "ay");
    }
}
