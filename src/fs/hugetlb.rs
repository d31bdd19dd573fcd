// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Huge page sizes supported by the kernel, named the way the `hugetlb`
//! controller names its files, e.g. `hugetlb.2MB.limit_in_bytes`.

use std::fs;

use log::warn;

use crate::fs::error::{Error, ErrorKind, Result};

const HUGEPAGE_DIR: &str = "/sys/kernel/mm/hugepages";
const HUGEPAGE_PREFIX: &str = "hugepages-";
const HUGEPAGE_SUFFIX: &str = "kB";

fn binary_units() -> Vec<String> {
    vec![
        "B".to_string(),
        "KB".to_string(),
        "MB".to_string(),
        "GB".to_string(),
        "TB".to_string(),
        "PB".to_string(),
        "EB".to_string(),
        "ZB".to_string(),
        "YB".to_string(),
    ]
}

fn custom_size(mut size: f64, base: f64, m: &[String]) -> String {
    let mut i = 0;
    while size >= base && i < m.len() - 1 {
        size /= base;
        i += 1;
    }

    format!("{}{}", size, m[i].as_str())
}

/// Turn `hugepages-<N>kB` directory names into page size names.
///
/// Names without the prefix are not huge page entries and are skipped.
/// Malformed sizes are reported through the returned error while the
/// well-formed ones are still returned.
pub fn sizes_from_filenames<I, S>(names: I) -> (Vec<String>, Option<Error>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let units = binary_units();
    let mut sizes = vec![];
    let mut bad = vec![];

    for name in names {
        let name = name.as_ref();
        let value = match name.strip_prefix(HUGEPAGE_PREFIX) {
            Some(value) => value,
            None => continue,
        };
        let kb = value
            .strip_suffix(HUGEPAGE_SUFFIX)
            .and_then(|num| num.parse::<u64>().ok());
        match kb {
            Some(kb) => sizes.push(custom_size((kb * 1024) as f64, 1024.0, &units)),
            None => bad.push(name.to_string()),
        }
    }

    let err = if bad.is_empty() {
        None
    } else {
        Some(
            Error::new(ErrorKind::InvalidBytesSize)
                .context(format!("invalid huge page entries: {}", bad.join(", "))),
        )
    };
    (sizes, err)
}

/// The huge page sizes of the host, e.g. `["2MB", "1GB"]`.
pub fn hugepage_sizes() -> Result<Vec<String>> {
    let entries =
        fs::read_dir(HUGEPAGE_DIR).map_err(|err| Error::from(err).context(HUGEPAGE_DIR))?;
    let names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    let (sizes, err) = sizes_from_filenames(names);
    if let Some(err) = err {
        warn!("{}", err);
    }
    Ok(sizes)
}
