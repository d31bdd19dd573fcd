// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Decoders of the cgroup v1 controllers, where every value lives in a
//! file of its own.

use std::collections::HashMap;

use crate::fs::error::{Error, Result};
use crate::fs::hugetlb::hugepage_sizes;
use crate::fs::read_file;
use crate::fs::utils::{
    get_cgroup_param_int, get_cgroup_param_uint, parse_key_value, parse_uint,
};
use crate::stats::{
    parse_cpuset_list, BlkioStatEntry, BlkioStats, BurstData, CpuUsage, CpusetStats,
    HugetlbStats, MemoryData, MemoryStats, PartialStats, ThrottlingData,
};

const NANOS_PER_SECOND: u64 = 1_000_000_000;
/// USER_HZ, the unit of `cpuacct.stat`.
const CLOCK_TICKS: u64 = 100;

/// `cpu.stat`: throttling and bursts.
pub fn cpu(dir: &str) -> Result<PartialStats> {
    let content = read_file(dir, "cpu.stat")?;
    let mut throttling = ThrottlingData::default();
    let mut burst = BurstData::default();
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let (key, value) = parse_key_value(line)?;
        match key {
            "nr_periods" => throttling.periods = value,
            "nr_throttled" => throttling.throttled_periods = value,
            "throttled_time" => throttling.throttled_time = value,
            "nr_bursts" => burst.bursts_periods = value,
            "burst_time" => burst.burst_time = value,
            _ => {}
        }
    }
    Ok(PartialStats::CpuThrottling(throttling, burst))
}

fn parse_uints(content: &str) -> Result<Vec<u64>> {
    content.split_whitespace().map(parse_uint).collect()
}

/// `cpuacct.usage_all`, a table of per-cpu user and system usage:
///
/// ```text
/// cpu user system
/// 0 962250696038415 637727786389114
/// ```
///
/// Returns the (kernel, user) columns. The file is missing on older
/// kernels.
fn percpu_usage_in_modes(dir: &str) -> Result<(Vec<u64>, Vec<u64>)> {
    let content = match read_file(dir, "cpuacct.usage_all") {
        Ok(content) => content,
        Err(err) if err.is_not_exist() => return Ok((vec![], vec![])),
        Err(err) => return Err(err),
    };

    let mut kernel = vec![];
    let mut user = vec![];
    for line in content.lines().skip(1).filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(Error::parse(format!("invalid cpuacct.usage_all line {:?}", line)));
        }
        user.push(parse_uint(fields[1])?);
        kernel.push(parse_uint(fields[2])?);
    }
    Ok((kernel, user))
}

/// `cpuacct`: usage in total, per cpu, and in user and kernel mode.
pub fn cpuacct(dir: &str) -> Result<PartialStats> {
    let mut usage = CpuUsage {
        total_usage: get_cgroup_param_uint(dir, "cpuacct.usage")?,
        percpu_usage: parse_uints(&read_file(dir, "cpuacct.usage_percpu")?)?,
        ..Default::default()
    };

    for line in read_file(dir, "cpuacct.stat")?.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (key, ticks) = parse_key_value(line)?;
        let nanos = ticks.saturating_mul(NANOS_PER_SECOND / CLOCK_TICKS);
        match key {
            "user" => usage.usage_in_usermode = nanos,
            "system" => usage.usage_in_kernelmode = nanos,
            _ => {}
        }
    }

    let (kernel, user) = percpu_usage_in_modes(dir)?;
    usage.percpu_usage_in_kernelmode = kernel;
    usage.percpu_usage_in_usermode = user;

    Ok(PartialStats::CpuUsage(usage))
}

pub fn cpuset(dir: &str) -> Result<PartialStats> {
    let flag = |file: &str| get_cgroup_param_uint(dir, file);
    Ok(PartialStats::Cpuset(CpusetStats {
        cpus: parse_cpuset_list(&read_file(dir, "cpuset.cpus")?)?,
        mems: parse_cpuset_list(&read_file(dir, "cpuset.mems")?)?,
        cpu_exclusive: flag("cpuset.cpu_exclusive")?,
        mem_hardwall: flag("cpuset.mem_hardwall")?,
        mem_exclusive: flag("cpuset.mem_exclusive")?,
        memory_migrate: flag("cpuset.memory_migrate")?,
        memory_spread_page: flag("cpuset.memory_spread_page")?,
        memory_spread_slab: flag("cpuset.memory_spread_slab")?,
        memory_pressure: flag("cpuset.memory_pressure")?,
        sched_load_balance: flag("cpuset.sched_load_balance")?,
        sched_relax_domain_level: get_cgroup_param_int(dir, "cpuset.sched_relax_domain_level")?,
    }))
}

/// Read the usage files of `memory[.module]`. Optional modules which are
/// not compiled in or not enabled read as zero.
fn memory_data(dir: &str, module: &str) -> Result<MemoryData> {
    let prefix = if module.is_empty() {
        "memory.".to_string()
    } else {
        format!("memory.{}.", module)
    };
    let read = |name: &str| get_cgroup_param_uint(dir, &format!("{}{}", prefix, name));

    let usage = match read("usage_in_bytes") {
        Ok(usage) => usage,
        Err(err) if err.is_not_exist() && !module.is_empty() => return Ok(MemoryData::default()),
        Err(err) => return Err(err),
    };
    Ok(MemoryData {
        usage,
        max_usage: read("max_usage_in_bytes")?,
        failcnt: read("failcnt")?,
        limit: read("limit_in_bytes")?,
    })
}

pub(crate) fn parse_stat_map(content: &str) -> Result<HashMap<String, u64>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_key_value(line).map(|(key, value)| (key.to_string(), value)))
        .collect()
}

pub fn memory(dir: &str) -> Result<PartialStats> {
    let stats = parse_stat_map(&read_file(dir, "memory.stat")?)?;
    let use_hierarchy = get_cgroup_param_uint(dir, "memory.use_hierarchy")? == 1;

    Ok(PartialStats::Memory(MemoryStats {
        cache: stats.get("cache").copied().unwrap_or_default(),
        usage: memory_data(dir, "")?,
        swap_usage: memory_data(dir, "memsw")?,
        kernel_usage: memory_data(dir, "kmem")?,
        kernel_tcp_usage: memory_data(dir, "kmem.tcp")?,
        use_hierarchy,
        stats,
        ..Default::default()
    }))
}

/// Parse a blkio table such as `blkio.io_serviced_recursive`:
///
/// ```text
/// 8:0 Read 100
/// 8:0 Write 200
/// Total 300
/// ```
///
/// Tables without operations, like `blkio.time_recursive`, have two
/// columns.
fn parse_blkio_table(content: &str) -> Result<Vec<BlkioStatEntry>> {
    let mut entries = vec![];
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (device, op, value) = match fields.as_slice() {
            [] => continue,
            ["Total", _] => continue,
            [device, value] => (*device, "", *value),
            [device, op, value] => (*device, *op, *value),
            _ => return Err(Error::parse(format!("invalid blkio line {:?}", line))),
        };
        let (major, minor) = device
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("invalid blkio line {:?}", line)))?;
        entries.push(BlkioStatEntry {
            major: parse_uint(major)?,
            minor: parse_uint(minor)?,
            op: op.to_string(),
            value: parse_uint(value)?,
        });
    }
    Ok(entries)
}

fn blkio_table(dir: &str, file: &str) -> Result<Vec<BlkioStatEntry>> {
    match read_file(dir, file) {
        Ok(content) => parse_blkio_table(&content),
        Err(err) if err.is_not_exist() => Ok(vec![]),
        Err(err) => Err(err),
    }
}

/// Tables of the CFQ scheduler, or of the throttling policy when CFQ is
/// not in use.
pub fn blkio(dir: &str) -> Result<PartialStats> {
    let serviced = blkio_table(dir, "blkio.io_serviced_recursive")?;
    if serviced.is_empty() {
        return Ok(PartialStats::Blkio(BlkioStats {
            io_service_bytes_recursive: blkio_table(
                dir,
                "blkio.throttle.io_service_bytes_recursive",
            )?,
            io_serviced_recursive: blkio_table(dir, "blkio.throttle.io_serviced_recursive")?,
            ..Default::default()
        }));
    }

    Ok(PartialStats::Blkio(BlkioStats {
        io_service_bytes_recursive: blkio_table(dir, "blkio.io_service_bytes_recursive")?,
        io_serviced_recursive: serviced,
        io_queued_recursive: blkio_table(dir, "blkio.io_queued_recursive")?,
        io_service_time_recursive: blkio_table(dir, "blkio.io_service_time_recursive")?,
        io_wait_time_recursive: blkio_table(dir, "blkio.io_wait_time_recursive")?,
        io_merged_recursive: blkio_table(dir, "blkio.io_merged_recursive")?,
        io_time_recursive: blkio_table(dir, "blkio.time_recursive")?,
        sectors_recursive: blkio_table(dir, "blkio.sectors_recursive")?,
        ..Default::default()
    }))
}

pub fn hugetlb(dir: &str) -> Result<PartialStats> {
    hugetlb_sizes(dir, &hugepage_sizes()?)
}

fn hugetlb_sizes(dir: &str, sizes: &[String]) -> Result<PartialStats> {
    let mut stats = HashMap::new();
    for size in sizes {
        let read = |name: &str| get_cgroup_param_uint(dir, &format!("hugetlb.{}.{}", size, name));
        stats.insert(
            size.clone(),
            HugetlbStats {
                usage: read("usage_in_bytes")?,
                max_usage: read("max_usage_in_bytes")?,
                failcnt: read("failcnt")?,
            },
        );
    }
    Ok(PartialStats::Hugetlb(stats))
}
