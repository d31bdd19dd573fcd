// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Decoders of the cgroup v2 controllers, which mostly expose flat
//! key-value files in microseconds.

use std::collections::HashMap;

use crate::fs::error::{Error, Result};
use crate::fs::hugetlb::hugepage_sizes;
use crate::fs::read_file;
use crate::fs::utils::{get_cgroup_param_uint, parse_key_value, parse_uint};
use crate::stats::psi::read_psi;
use crate::stats::v1::parse_stat_map;
use crate::stats::{
    parse_cpuset_list, BlkioStatEntry, BlkioStats, CpuStats, CpusetStats, HugetlbStats,
    MemoryData, MemoryStats, MiscStats, PartialStats,
};

const NANOS_PER_MICRO: u64 = 1000;

fn usec_to_nsec(usec: u64) -> u64 {
    usec.saturating_mul(NANOS_PER_MICRO)
}

/// `cpu.stat` and `cpu.pressure`.
pub fn cpu(dir: &str) -> Result<PartialStats> {
    let content = read_file(dir, "cpu.stat")?;
    let mut stats = CpuStats::default();
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let (key, value) = parse_key_value(line)?;
        match key {
            "usage_usec" => stats.cpu_usage.total_usage = usec_to_nsec(value),
            "user_usec" => stats.cpu_usage.usage_in_usermode = usec_to_nsec(value),
            "system_usec" => stats.cpu_usage.usage_in_kernelmode = usec_to_nsec(value),
            "nr_periods" => stats.throttling_data.periods = value,
            "nr_throttled" => stats.throttling_data.throttled_periods = value,
            "throttled_usec" => stats.throttling_data.throttled_time = usec_to_nsec(value),
            "nr_bursts" => stats.burst_data.bursts_periods = value,
            "burst_usec" => stats.burst_data.burst_time = usec_to_nsec(value),
            _ => {}
        }
    }
    stats.psi = read_psi(dir, "cpu.pressure")?;
    Ok(PartialStats::Cpu(stats))
}

pub fn cpuset(dir: &str) -> Result<PartialStats> {
    Ok(PartialStats::Cpuset(CpusetStats {
        cpus: parse_cpuset_list(&read_file(dir, "cpuset.cpus.effective")?)?,
        mems: parse_cpuset_list(&read_file(dir, "cpuset.mems.effective")?)?,
        ..Default::default()
    }))
}

/// Read `memory[.swap].{current,peak,max}`. The root cgroup has none of
/// them, nor has a cgroup without swap accounting the swap ones.
fn memory_data(dir: &str, module: &str) -> Result<MemoryData> {
    let read = |name: &str| get_cgroup_param_uint(dir, &format!("{}.{}", module, name));

    let usage = match read("current") {
        Ok(usage) => usage,
        Err(err) if err.is_not_exist() => return Ok(MemoryData::default()),
        Err(err) => return Err(err),
    };
    let max_usage = match read("peak") {
        Ok(peak) => peak,
        // Added in Linux 5.19.
        Err(err) if err.is_not_exist() => 0,
        Err(err) => return Err(err),
    };
    Ok(MemoryData {
        usage,
        max_usage,
        failcnt: 0,
        limit: read("max")?,
    })
}

pub fn memory(dir: &str) -> Result<PartialStats> {
    let stats = parse_stat_map(&read_file(dir, "memory.stat")?)?;
    let usage = memory_data(dir, "memory")?;
    let swap_only = memory_data(dir, "memory.swap")?;

    // Memory plus swap, as cgroups v1 reports it.
    let swap_usage = MemoryData {
        usage: usage.usage.saturating_add(swap_only.usage),
        max_usage: 0,
        failcnt: 0,
        limit: usage.limit.saturating_add(swap_only.limit),
    };

    Ok(PartialStats::Memory(MemoryStats {
        cache: stats.get("file").copied().unwrap_or_default(),
        usage,
        swap_usage,
        swap_only_usage: swap_only,
        use_hierarchy: true,
        stats,
        psi: read_psi(dir, "memory.pressure")?,
        ..Default::default()
    }))
}

fn entry(major: u64, minor: u64, op: &str, value: u64) -> BlkioStatEntry {
    BlkioStatEntry {
        major,
        minor,
        op: op.to_string(),
        value,
    }
}

/// Map `io.stat` onto the tables of cgroups v1:
///
/// ```text
/// 8:0 rbytes=90430464 wbytes=0 rios=3318 wios=0 dbytes=0 dios=0
/// ```
///
/// The keys of the io-cost model (`cost.usage` and so on) fill in their
/// own tables, other keys are skipped.
pub fn parse_io_stat(content: &str) -> Result<BlkioStats> {
    let mut stats = BlkioStats::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let device = match fields.next() {
            Some(device) => device,
            None => continue,
        };
        let invalid = || Error::parse(format!("invalid io.stat line {:?}", line));
        let (major, minor) = device.split_once(':').ok_or_else(invalid)?;
        let major = parse_uint(major)?;
        let minor = parse_uint(minor)?;

        for field in fields {
            let (key, value) = field.split_once('=').ok_or_else(invalid)?;
            let (table, op) = match key {
                "rbytes" => (&mut stats.io_service_bytes_recursive, "Read"),
                "wbytes" => (&mut stats.io_service_bytes_recursive, "Write"),
                "rios" => (&mut stats.io_serviced_recursive, "Read"),
                "wios" => (&mut stats.io_serviced_recursive, "Write"),
                "cost.usage" => (&mut stats.io_cost_usage, "Count"),
                "cost.wait" => (&mut stats.io_cost_wait, "Count"),
                "cost.indebt" => (&mut stats.io_cost_indebt, "Count"),
                "cost.indelay" => (&mut stats.io_cost_indelay, "Count"),
                _ => continue,
            };
            table.push(entry(major, minor, op, parse_uint(value)?));
        }
    }
    Ok(stats)
}

pub fn io(dir: &str) -> Result<PartialStats> {
    let mut stats = parse_io_stat(&read_file(dir, "io.stat")?)?;
    stats.psi = read_psi(dir, "io.pressure")?;
    Ok(PartialStats::Blkio(stats))
}

pub fn hugetlb(dir: &str) -> Result<PartialStats> {
    hugetlb_sizes(dir, &hugepage_sizes()?)
}

fn hugetlb_sizes(dir: &str, sizes: &[String]) -> Result<PartialStats> {
    let mut stats = HashMap::new();
    for size in sizes {
        let usage = get_cgroup_param_uint(dir, &format!("hugetlb.{}.current", size))?;
        let events = read_file(dir, &format!("hugetlb.{}.events", size))?;
        let failcnt = events
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_key_value)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .find(|(key, _)| *key == "max")
            .map(|(_, value)| value)
            .unwrap_or_default();
        stats.insert(
            size.clone(),
            HugetlbStats {
                usage,
                max_usage: 0,
                failcnt,
            },
        );
    }
    Ok(PartialStats::Hugetlb(stats))
}

/// `misc.current` and `misc.events`, whose keys carry a `.max` suffix.
pub fn misc(dir: &str) -> Result<PartialStats> {
    let mut stats: HashMap<String, MiscStats> = HashMap::new();
    for (key, usage) in parse_stat_map(&read_file(dir, "misc.current")?)? {
        stats.entry(key).or_default().usage = usage;
    }
    for (key, events) in parse_stat_map(&read_file(dir, "misc.events")?)? {
        let key = key.strip_suffix(".max").map(str::to_string).unwrap_or(key);
        stats.entry(key).or_default().events = events;
    }
    Ok(PartialStats::Misc(stats))
}
