// Copyright (c) 2018 Levente Kurusa
// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Resource usage statistics of a cgroup.
//!
//! Every controller is decoded on its own from its directory into a
//! `PartialStats`, which is then merged into one `CgroupStats`.

use std::collections::HashMap;

use bitflags::bitflags;
use log::warn;

use crate::fs::error::{Error, Result};
use crate::fs::utils::{get_cgroup_param_string, get_cgroup_param_uint, parse_uint};

pub mod psi;
pub mod v1;
pub mod v2;

pub use psi::{PsiData, PsiStats};

#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CgroupStats {
    pub cpu: CpuStats,
    pub cpuset: CpusetStats,
    pub memory: MemoryStats,
    pub pids: PidsStats,
    pub blkio: BlkioStats,
    /// Keyed by page size, e.g. `2MB`.
    pub hugetlb: HashMap<String, HugetlbStats>,
    pub rdma: RdmaStats,
    /// Keyed by resource name.
    pub misc: HashMap<String, MiscStats>,
}

#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub throttling_data: ThrottlingData,
    pub burst_data: BurstData,
    pub psi: Option<PsiStats>,
}

/// CPU time consumed, in nanoseconds.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuUsage {
    /// Read from `cpuacct.usage` in cgroups v1 and from `usage_usec` of
    /// `cpu.stat` in cgroups v2.
    pub total_usage: u64,
    /// Read from `cpuacct.usage_percpu`. Only available in cgroups v1.
    pub percpu_usage: Vec<u64>,
    /// Read from `cpuacct.usage_all`. Only available in cgroups v1.
    pub percpu_usage_in_kernelmode: Vec<u64>,
    pub percpu_usage_in_usermode: Vec<u64>,
    pub usage_in_kernelmode: u64,
    pub usage_in_usermode: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottlingData {
    /// Number of periods with throttling active.
    pub periods: u64,
    /// Number of periods when the cgroup hit its throttling limit.
    pub throttled_periods: u64,
    /// Aggregate time the cgroup was throttled for, in nanoseconds.
    pub throttled_time: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BurstData {
    /// Number of periods in which a burst occurred.
    pub bursts_periods: u64,
    /// Cumulative wall time of bursts, in nanoseconds.
    pub burst_time: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpusetStats {
    pub cpus: Vec<u16>,
    pub mems: Vec<u16>,
    // The flags below are only available in cgroups v1.
    pub cpu_exclusive: u64,
    pub mem_hardwall: u64,
    pub mem_exclusive: u64,
    pub memory_migrate: u64,
    pub memory_spread_page: u64,
    pub memory_spread_slab: u64,
    pub memory_pressure: u64,
    pub sched_load_balance: u64,
    pub sched_relax_domain_level: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryData {
    /// Read from `memory[.X].usage_in_bytes` in cgroups v1 and
    /// `memory[.swap].current` in cgroups v2.
    pub usage: u64,
    /// Read from `memory[.X].max_usage_in_bytes` in cgroups v1 and
    /// `memory[.swap].peak` in cgroups v2.
    pub max_usage: u64,
    /// Only available in cgroups v1.
    pub failcnt: u64,
    /// `u64::MAX` when unlimited.
    pub limit: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryStats {
    /// Page cache, the `cache` key of `memory.stat` in cgroups v1 and the
    /// `file` key in cgroups v2.
    pub cache: u64,
    pub usage: MemoryData,
    /// Memory plus swap.
    pub swap_usage: MemoryData,
    /// Swap alone. Only available in cgroups v2.
    pub swap_only_usage: MemoryData,
    pub kernel_usage: MemoryData,
    pub kernel_tcp_usage: MemoryData,
    pub use_hierarchy: bool,
    /// Every key of `memory.stat`.
    pub stats: HashMap<String, u64>,
    pub psi: Option<PsiStats>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PidsStats {
    /// Read from `pids.current`.
    pub current: u64,
    /// Read from `pids.max`, 0 when unlimited.
    pub limit: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlkioStatEntry {
    pub major: u64,
    pub minor: u64,
    pub op: String,
    pub value: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlkioStats {
    pub io_service_bytes_recursive: Vec<BlkioStatEntry>,
    pub io_serviced_recursive: Vec<BlkioStatEntry>,
    pub io_queued_recursive: Vec<BlkioStatEntry>,
    pub io_service_time_recursive: Vec<BlkioStatEntry>,
    pub io_wait_time_recursive: Vec<BlkioStatEntry>,
    pub io_merged_recursive: Vec<BlkioStatEntry>,
    pub io_time_recursive: Vec<BlkioStatEntry>,
    pub sectors_recursive: Vec<BlkioStatEntry>,
    // The io-cost model, only available in cgroups v2.
    pub io_cost_usage: Vec<BlkioStatEntry>,
    pub io_cost_wait: Vec<BlkioStatEntry>,
    pub io_cost_indebt: Vec<BlkioStatEntry>,
    pub io_cost_indelay: Vec<BlkioStatEntry>,
    pub psi: Option<PsiStats>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HugetlbStats {
    pub usage: u64,
    /// Only available in cgroups v1.
    pub max_usage: u64,
    pub failcnt: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RdmaEntry {
    pub device: String,
    pub hca_handles: u32,
    pub hca_objects: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RdmaStats {
    pub current: Vec<RdmaEntry>,
    pub max: Vec<RdmaEntry>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MiscStats {
    pub usage: u64,
    /// Number of times the usage was about to exceed the limit.
    pub events: u64,
}

bitflags! {
    /// Controllers whose statistics are wanted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Controllers: u32 {
        const CPU = 1 << 0;
        const CPUSET = 1 << 1;
        const MEMORY = 1 << 2;
        const PIDS = 1 << 3;
        const IO = 1 << 4;
        const HUGETLB = 1 << 5;
        const RDMA = 1 << 6;
        const MISC = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsOptions {
    /// Empty selects every available controller.
    pub controllers: Controllers,
}

impl StatsOptions {
    pub fn new(controllers: Controllers) -> Self {
        Self { controllers }
    }

    pub fn selects(&self, controller: Controllers) -> bool {
        self.controllers.is_empty() || self.controllers.intersects(controller)
    }

    /// Explicitly requested controllers have their failures reported.
    pub fn is_mandatory(&self, controller: Controllers) -> bool {
        self.controllers.intersects(controller)
    }
}

/// The stats files of a controller, by hierarchy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    CpuV1,
    CpuAcctV1,
    CpusetV1,
    MemoryV1,
    PidsV1,
    BlkioV1,
    HugetlbV1,
    RdmaV1,
    CpuV2,
    CpusetV2,
    MemoryV2,
    PidsV2,
    IoV2,
    HugetlbV2,
    RdmaV2,
    MiscV2,
}

impl ControllerKind {
    pub const V1: [ControllerKind; 8] = [
        ControllerKind::CpuV1,
        ControllerKind::CpuAcctV1,
        ControllerKind::CpusetV1,
        ControllerKind::MemoryV1,
        ControllerKind::PidsV1,
        ControllerKind::BlkioV1,
        ControllerKind::HugetlbV1,
        ControllerKind::RdmaV1,
    ];

    pub const V2: [ControllerKind; 8] = [
        ControllerKind::CpuV2,
        ControllerKind::CpusetV2,
        ControllerKind::MemoryV2,
        ControllerKind::PidsV2,
        ControllerKind::IoV2,
        ControllerKind::HugetlbV2,
        ControllerKind::RdmaV2,
        ControllerKind::MiscV2,
    ];

    /// The selection flag covering this kind.
    pub fn controller(self) -> Controllers {
        match self {
            ControllerKind::CpuV1 | ControllerKind::CpuAcctV1 | ControllerKind::CpuV2 => {
                Controllers::CPU
            }
            ControllerKind::CpusetV1 | ControllerKind::CpusetV2 => Controllers::CPUSET,
            ControllerKind::MemoryV1 | ControllerKind::MemoryV2 => Controllers::MEMORY,
            ControllerKind::PidsV1 | ControllerKind::PidsV2 => Controllers::PIDS,
            ControllerKind::BlkioV1 | ControllerKind::IoV2 => Controllers::IO,
            ControllerKind::HugetlbV1 | ControllerKind::HugetlbV2 => Controllers::HUGETLB,
            ControllerKind::RdmaV1 | ControllerKind::RdmaV2 => Controllers::RDMA,
            ControllerKind::MiscV2 => Controllers::MISC,
        }
    }

    /// The cgroup v1 subsystem holding the files of this kind.
    pub fn subsystem(self) -> &'static str {
        match self {
            ControllerKind::CpuV1 | ControllerKind::CpuV2 => "cpu",
            ControllerKind::CpuAcctV1 => "cpuacct",
            ControllerKind::CpusetV1 | ControllerKind::CpusetV2 => "cpuset",
            ControllerKind::MemoryV1 | ControllerKind::MemoryV2 => "memory",
            ControllerKind::PidsV1 | ControllerKind::PidsV2 => "pids",
            ControllerKind::BlkioV1 => "blkio",
            ControllerKind::IoV2 => "io",
            ControllerKind::HugetlbV1 | ControllerKind::HugetlbV2 => "hugetlb",
            ControllerKind::RdmaV1 | ControllerKind::RdmaV2 => "rdma",
            ControllerKind::MiscV2 => "misc",
        }
    }
}

/// What one controller contributes to a `CgroupStats`.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialStats {
    /// Everything about the CPU, cgroups v2.
    Cpu(CpuStats),
    /// `cpu.stat` of cgroups v1.
    CpuThrottling(ThrottlingData, BurstData),
    /// `cpuacct` of cgroups v1.
    CpuUsage(CpuUsage),
    Cpuset(CpusetStats),
    Memory(MemoryStats),
    Pids(PidsStats),
    Blkio(BlkioStats),
    Hugetlb(HashMap<String, HugetlbStats>),
    Rdma(RdmaStats),
    Misc(HashMap<String, MiscStats>),
}

impl CgroupStats {
    pub fn merge(&mut self, partial: PartialStats) {
        match partial {
            PartialStats::Cpu(cpu) => self.cpu = cpu,
            PartialStats::CpuThrottling(throttling, burst) => {
                self.cpu.throttling_data = throttling;
                self.cpu.burst_data = burst;
            }
            PartialStats::CpuUsage(usage) => self.cpu.cpu_usage = usage,
            PartialStats::Cpuset(cpuset) => self.cpuset = cpuset,
            PartialStats::Memory(memory) => self.memory = memory,
            PartialStats::Pids(pids) => self.pids = pids,
            PartialStats::Blkio(blkio) => self.blkio = blkio,
            PartialStats::Hugetlb(hugetlb) => self.hugetlb.extend(hugetlb),
            PartialStats::Rdma(rdma) => self.rdma = rdma,
            PartialStats::Misc(misc) => self.misc.extend(misc),
        }
    }
}

/// Decode the statistics of `kind` from the cgroup directory `dir`.
pub fn decode(dir: &str, kind: ControllerKind) -> Result<PartialStats> {
    match kind {
        ControllerKind::CpuV1 => v1::cpu(dir),
        ControllerKind::CpuAcctV1 => v1::cpuacct(dir),
        ControllerKind::CpusetV1 => v1::cpuset(dir),
        ControllerKind::MemoryV1 => v1::memory(dir),
        ControllerKind::PidsV1 | ControllerKind::PidsV2 => pids(dir),
        ControllerKind::BlkioV1 => v1::blkio(dir),
        ControllerKind::HugetlbV1 => v1::hugetlb(dir),
        ControllerKind::RdmaV1 | ControllerKind::RdmaV2 => rdma(dir),
        ControllerKind::CpuV2 => v2::cpu(dir),
        ControllerKind::CpusetV2 => v2::cpuset(dir),
        ControllerKind::MemoryV2 => v2::memory(dir),
        ControllerKind::IoV2 => v2::io(dir),
        ControllerKind::HugetlbV2 => v2::hugetlb(dir),
        ControllerKind::MiscV2 => v2::misc(dir),
    }
}

/// Decode every selected kind from its directory into one snapshot.
///
/// Failures of controllers named in `options` are returned, the others
/// are skipped.
pub fn collect<'a, I>(sources: I, options: &StatsOptions) -> Result<CgroupStats>
where
    I: IntoIterator<Item = (&'a str, ControllerKind)>,
{
    let mut stats = CgroupStats::default();
    for (dir, kind) in sources {
        let controller = kind.controller();
        if !options.selects(controller) {
            continue;
        }
        match decode(dir, kind) {
            Ok(partial) => stats.merge(partial),
            Err(err) if options.is_mandatory(controller) => {
                return Err(err.context(format!("{:?} stats of {}", kind, dir)))
            }
            Err(err) if err.is_not_exist() => {}
            Err(err) => warn!("unable to read {:?} stats of {}: {}", kind, dir, err),
        }
    }
    Ok(stats)
}

/// `pids.current` and `pids.max`, identical in both hierarchies.
fn pids(dir: &str) -> Result<PartialStats> {
    let current = get_cgroup_param_uint(dir, "pids.current")?;
    let max = get_cgroup_param_string(dir, "pids.max")?;
    let limit = if max == "max" { 0 } else { parse_uint(&max)? };
    Ok(PartialStats::Pids(PidsStats { current, limit }))
}

/// A line of `rdma.current` or `rdma.max`, e.g.
/// `mlx5_1 hca_handle=3 hca_object=max`.
fn parse_rdma_entry(line: &str) -> Result<RdmaEntry> {
    let mut fields = line.split_whitespace();
    let device = fields
        .next()
        .ok_or_else(|| Error::parse(format!("invalid rdma entry {:?}", line)))?;
    let mut entry = RdmaEntry {
        device: device.to_string(),
        ..Default::default()
    };
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| Error::parse(format!("invalid rdma entry {:?}", line)))?;
        let value = if value == "max" {
            u32::MAX
        } else {
            value
                .parse()
                .map_err(|_| Error::parse(format!("invalid rdma entry {:?}", line)))?
        };
        match key {
            "hca_handle" => entry.hca_handles = value,
            "hca_object" => entry.hca_objects = value,
            _ => {}
        }
    }
    Ok(entry)
}

fn parse_rdma_file(dir: &str, file: &str) -> Result<Vec<RdmaEntry>> {
    get_cgroup_param_string(dir, file)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_rdma_entry)
        .collect()
}

fn rdma(dir: &str) -> Result<PartialStats> {
    Ok(PartialStats::Rdma(RdmaStats {
        current: parse_rdma_file(dir, "rdma.current")?,
        max: parse_rdma_file(dir, "rdma.max")?,
    }))
}

/// Parse a cpu or memory node list such as `0-3,7`.
pub(crate) fn parse_cpuset_list(list: &str) -> Result<Vec<u16>> {
    let invalid = || Error::parse(format!("invalid cpuset list {:?}", list));
    let mut values = vec![];
    for part in list.trim().split(',').filter(|part| !part.is_empty()) {
        match part.split_once('-') {
            Some((min, max)) => {
                let min: u16 = min.parse().map_err(|_| invalid())?;
                let max: u16 = max.parse().map_err(|_| invalid())?;
                if min > max {
                    return Err(invalid());
                }
                values.extend(min..=max);
            }
            None => values.push(part.parse().map_err(|_| invalid())?),
        }
    }
    Ok(values)
}
