//! Slice timing and eddy slice-group (`slspec`) files.

use crate::error::{DwiError, Result};
use std::path::Path;

/// Slices acquired together, one row per readout, in acquisition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceGroups {
    pub groups: Vec<Vec<usize>>,
}

impl SliceGroups {
    /// Group slices by acquisition time; identical times share a row.
    pub fn from_timing(timing: &[f64]) -> Result<Self> {
        if timing.is_empty() {
            return Err(DwiError::metadata("Slice timing vector is empty"));
        }
        if let Some(bad) = timing.iter().find(|t| !t.is_finite()) {
            return Err(DwiError::metadata(format!("Invalid slice time {}", bad)));
        }
        let mut order: Vec<usize> = (0..timing.len()).collect();
        order.sort_by(|&a, &b| timing[a].total_cmp(&timing[b]).then(a.cmp(&b)));

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut last: Option<f64> = None;
        for slice in order {
            match (last, groups.last_mut()) {
                (Some(t), Some(group)) if t == timing[slice] => group.push(slice),
                _ => groups.push(vec![slice]),
            }
            last = Some(timing[slice]);
        }
        Ok(Self { groups })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let groups = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                line.split_whitespace()
                    .map(|v| {
                        v.parse::<usize>().map_err(|_| {
                            DwiError::metadata(format!("Invalid slice index '{}' in slspec", v))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        if groups.is_empty() {
            return Err(DwiError::metadata("Slice specification file is empty"));
        }
        Ok(Self { groups })
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DwiError::FileNotFound(path.to_path_buf()));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn to_text(&self) -> String {
        self.groups
            .iter()
            .map(|g| {
                let row: Vec<String> = g.iter().map(|s| s.to_string()).collect();
                format!("{}\n", row.join(" "))
            })
            .collect()
    }

    pub fn num_slices(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Every slice in `0..num_slices` must appear exactly once.
    pub fn validate(&self, num_slices: usize) -> Result<()> {
        let mut seen = vec![false; num_slices];
        for &slice in self.groups.iter().flatten() {
            match seen.get_mut(slice) {
                Some(flag) if !*flag => *flag = true,
                Some(_) => {
                    return Err(DwiError::metadata(format!(
                        "Slice {} listed more than once in slice specification",
                        slice
                    )))
                }
                None => {
                    return Err(DwiError::metadata(format!(
                        "Slice {} out of range for {} slices",
                        slice, num_slices
                    )))
                }
            }
        }
        if let Some(missing) = seen.iter().position(|&f| !f) {
            return Err(DwiError::metadata(format!(
                "Slice {} missing from slice specification",
                missing
            )));
        }
        Ok(())
    }

    /// Add one extra slice, acquired with the first readout.
    pub fn with_padded_slice(&self) -> Self {
        let mut groups = self.groups.clone();
        let extra = self.num_slices();
        if let Some(first) = groups.first_mut() {
            first.push(extra);
        }
        Self { groups }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_from_interleaved_timing() {
        let groups = SliceGroups::from_timing(&[0.0, 0.5, 0.1, 0.6]).unwrap();
        assert_eq!(groups.groups, vec![vec![0], vec![2], vec![1], vec![3]]);
    }

    #[test]
    fn test_multiband_groups() {
        let groups = SliceGroups::from_timing(&[0.0, 0.4, 0.0, 0.4]).unwrap();
        assert_eq!(groups.groups, vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(groups.to_text(), "0 2\n1 3\n");
    }

    #[test]
    fn test_parse_and_validate() {
        let groups = SliceGroups::parse("0 2\n1 3\n\n").unwrap();
        assert_eq!(groups.num_slices(), 4);
        assert!(groups.validate(4).is_ok());
        assert!(groups.validate(5).is_err());
        assert!(SliceGroups::parse("0 1\n1 2\n").unwrap().validate(3).is_err());
        assert!(SliceGroups::parse("a b\n").is_err());
    }

    #[test]
    fn test_padded_slice_joins_first_group() {
        let groups = SliceGroups::parse("0 2\n1\n").unwrap().with_padded_slice();
        assert_eq!(groups.groups, vec![vec![0, 2, 3], vec![1]]);
        assert!(groups.validate(4).is_ok());
    }

    #[test]
    fn test_padded_timing_groups_with_first_readout() {
        // Padding appends a synthetic time of zero for the duplicated slice.
        let groups = SliceGroups::from_timing(&[0.0, 0.5, 0.25, 0.0]).unwrap();
        assert_eq!(groups.groups[0], vec![0, 3]);
    }
}
