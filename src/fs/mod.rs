// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Safe access to the cgroup filesystem.

pub mod error;
mod file;
pub mod hugetlb;
pub mod mountinfo;
pub(crate) mod root;
pub mod utils;

pub use file::{open_file, read_file, write_file, write_file_by_line};
pub use root::CGROUPFS_ROOT;
