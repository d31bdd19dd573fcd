// Copyright (c) 2025 Ant Group
//
// SPDX-License-Identifier: Apache-2.0 or MIT
//

//! Pressure stall information, see
//! https://docs.kernel.org/accounting/psi.html

use crate::fs::error::{Error, ErrorKind, Result};
use crate::fs::read_file;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PsiData {
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
    /// Total stall time, in microseconds.
    pub total: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PsiStats {
    /// Some tasks stalled.
    pub some: PsiData,
    /// All non-idle tasks stalled at once.
    pub full: PsiData,
}

/// Read a `*.pressure` file. A kernel without PSI, or with PSI disabled,
/// yields `None`.
pub fn read_psi(dir: &str, file: &str) -> Result<Option<PsiStats>> {
    let content = match read_file(dir, file) {
        Ok(content) => content,
        Err(err) if psi_unavailable(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    parse_psi(&content).map(Some)
}

fn psi_unavailable(err: &Error) -> bool {
    err.is_not_exist()
        || err.kind() == ErrorKind::Unsupported
        || err.raw_os_error() == Some(libc::ENOTSUP)
        || err.raw_os_error() == Some(libc::EINVAL)
}

pub fn parse_psi(content: &str) -> Result<PsiStats> {
    let mut stats = PsiStats::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let data = match fields.next() {
            Some("some") => &mut stats.some,
            Some("full") => &mut stats.full,
            // Newer kernels may add rows.
            _ => continue,
        };
        for field in fields {
            let invalid = || Error::parse(format!("invalid PSI data {:?}", field));
            let (key, value) = field.split_once('=').ok_or_else(invalid)?;
            match key {
                "avg10" => data.avg10 = value.parse().map_err(|_| invalid())?,
                "avg60" => data.avg60 = value.parse().map_err(|_| invalid())?,
                "avg300" => data.avg300 = value.parse().map_err(|_| invalid())?,
                "total" => data.total = value.parse().map_err(|_| invalid())?,
                _ => {}
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_psi() {
        let content = "some avg10=1.50 avg60=0.25 avg300=0.00 total=1234\n\
                       full avg10=0.00 avg60=0.10 avg300=0.00 total=567\n";
        let stats = parse_psi(content).unwrap();
        assert_eq!(
            stats.some,
            PsiData {
                avg10: 1.5,
                avg60: 0.25,
                avg300: 0.0,
                total: 1234
            }
        );
        assert_eq!(stats.full.total, 567);

        assert!(parse_psi("some avg10=x").is_err());
        assert!(parse_psi("some avg10").is_err());
    }

    #[test]
    fn test_read_psi_absent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();
        assert_eq!(read_psi(dir, "cpu.pressure").unwrap(), None);

        fs::write(
            format!("{}/cpu.pressure", dir),
            "some avg10=0.00 avg60=0.00 avg300=0.00 total=10\n",
        )
        .unwrap();
        let stats = read_psi(dir, "cpu.pressure").unwrap().unwrap();
        assert_eq!(stats.some.total, 10);
        assert_eq!(stats.full, PsiData::default());
    }
}
