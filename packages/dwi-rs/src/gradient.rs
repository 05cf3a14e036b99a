//! Gradient-table text formats and b-value shell clustering.
//!
//! Two on-disk conventions are supported: FSL (`bvecs` as 3 rows by N
//! columns, `bvals` as a single row) and MRtrix `grad.b` (N rows of
//! `gx gy gz b`). Both are plain whitespace-separated text.

use crate::error::{DwiError, Result};
use crate::types::{GradientRow, GradientTable};
use nalgebra::Vector3;
use serde::Serialize;
use std::path::Path;

/// Default b-value at or below which a volume counts as b=0.
pub const DEFAULT_BZERO_THRESHOLD: f64 = 10.0;

/// Default maximum gap between neighbouring b-values within one shell.
pub const DEFAULT_SHELL_TOLERANCE: f64 = 80.0;

/// Shell asymmetry above which eddy is advised to use `--slm=linear`.
pub const ASYMMETRY_THRESHOLD: f64 = 0.1;

fn parse_matrix(content: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>().map_err(|_| {
                    DwiError::metadata(format!(
                        "Invalid number '{}' on line {}",
                        s,
                        line_no + 1
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Parse FSL-format `bvecs` and `bvals` contents into a gradient table.
pub fn parse_fsl(bvecs: &str, bvals: &str) -> Result<GradientTable> {
    let vec_rows = parse_matrix(bvecs)?;
    let bvalues: Vec<f64> = parse_matrix(bvals)?.into_iter().flatten().collect();
    let n = bvalues.len();

    // Either 3 rows of N, or N rows of 3.
    let directions: Vec<[f64; 3]> = if vec_rows.len() == 3 && vec_rows.iter().all(|r| r.len() == n) {
        (0..n)
            .map(|i| [vec_rows[0][i], vec_rows[1][i], vec_rows[2][i]])
            .collect()
    } else if vec_rows.len() == n && vec_rows.iter().all(|r| r.len() == 3) {
        vec_rows.iter().map(|r| [r[0], r[1], r[2]]).collect()
    } else {
        return Err(DwiError::metadata(format!(
            "bvecs ({} rows) do not match bvals ({} values)",
            vec_rows.len(),
            n
        )));
    };

    Ok(GradientTable::new(
        directions
            .into_iter()
            .zip(bvalues)
            .map(|(d, b)| GradientRow::new(d[0], d[1], d[2], b))
            .collect(),
    ))
}

/// Parse MRtrix `grad.b` contents (N rows of 4 columns).
pub fn parse_grad_b(content: &str) -> Result<GradientTable> {
    rows_to_table(&parse_matrix(content)?)
}

/// Convert a list of 4-element rows into a gradient table.
pub fn rows_to_table(rows: &[Vec<f64>]) -> Result<GradientTable> {
    rows.iter()
        .enumerate()
        .map(|(i, r)| {
            if r.len() != 4 {
                return Err(DwiError::metadata(format!(
                    "Gradient row {} has {} columns, expected 4",
                    i,
                    r.len()
                )));
            }
            Ok(GradientRow::new(r[0], r[1], r[2], r[3]))
        })
        .collect::<Result<Vec<_>>>()
        .map(GradientTable::new)
}

pub fn format_bvecs(table: &GradientTable) -> String {
    (0..3)
        .map(|axis| {
            table
                .rows
                .iter()
                .map(|r| format_number(r.direction[axis]))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

pub fn format_bvals(table: &GradientTable) -> String {
    table
        .rows
        .iter()
        .map(|r| format_number(r.bvalue))
        .collect::<Vec<_>>()
        .join(" ")
        + "\n"
}

pub fn format_grad_b(table: &GradientTable) -> String {
    table
        .rows
        .iter()
        .map(|r| {
            format!(
                "{} {} {} {}\n",
                format_number(r.direction[0]),
                format_number(r.direction[1]),
                format_number(r.direction[2]),
                format_number(r.bvalue)
            )
        })
        .collect()
}

fn format_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

pub fn read_fsl(bvecs: &Path, bvals: &Path) -> Result<GradientTable> {
    let vecs = std::fs::read_to_string(bvecs)?;
    let vals = std::fs::read_to_string(bvals)?;
    parse_fsl(&vecs, &vals)
}

pub fn write_fsl(table: &GradientTable, bvecs: &Path, bvals: &Path) -> Result<()> {
    std::fs::write(bvecs, format_bvecs(table))?;
    std::fs::write(bvals, format_bvals(table))?;
    Ok(())
}

/// Volume-to-shell mapping with per-shell b-values in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellAssignment {
    pub volume_shell: Vec<usize>,
    pub shell_bvalues: Vec<f64>,
    pub bzero_threshold: f64,
}

impl ShellAssignment {
    /// Cluster b-values into shells.
    ///
    /// All volumes at or below `bzero_threshold` form shell 0 (when any
    /// exist). The remaining b-values are sorted and a new shell starts
    /// wherever consecutive values differ by more than `tolerance`.
    pub fn from_table(table: &GradientTable, bzero_threshold: f64, tolerance: f64) -> Self {
        let mut order: Vec<usize> = (0..table.len()).collect();
        order.sort_by(|&a, &b| {
            table.rows[a]
                .bvalue
                .partial_cmp(&table.rows[b].bvalue)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut volume_shell = vec![0usize; table.len()];
        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut bzero_members = Vec::new();
        let mut previous: Option<f64> = None;

        for idx in order {
            let b = table.rows[idx].bvalue;
            if b <= bzero_threshold {
                bzero_members.push(idx);
                continue;
            }
            match previous {
                Some(p) if b - p <= tolerance => {
                    if let Some(last) = members.last_mut() {
                        last.push(idx);
                    }
                }
                _ => members.push(vec![idx]),
            }
            previous = Some(b);
        }

        if !bzero_members.is_empty() {
            members.insert(0, bzero_members);
        }

        let mut shell_bvalues = Vec::with_capacity(members.len());
        for (shell, vols) in members.iter().enumerate() {
            let mean = vols.iter().map(|&v| table.rows[v].bvalue).sum::<f64>() / vols.len() as f64;
            shell_bvalues.push(mean);
            for &v in vols {
                volume_shell[v] = shell;
            }
        }

        Self {
            volume_shell,
            shell_bvalues,
            bzero_threshold,
        }
    }

    pub fn num_shells(&self) -> usize {
        self.shell_bvalues.len()
    }

    pub fn shell_of(&self, volume: usize) -> usize {
        self.volume_shell[volume]
    }

    pub fn is_bzero_shell(&self, shell: usize) -> bool {
        self.shell_bvalues[shell] <= self.bzero_threshold
    }

    pub fn volumes_in_shell(&self, shell: usize) -> Vec<usize> {
        self.volume_shell
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == shell)
            .map(|(v, _)| v)
            .collect()
    }
}

/// Norm of the mean unit direction of each non-b=0 shell.
///
/// Zero for perfectly balanced sampling over the full sphere; approaches
/// one when all directions lie in one hemisphere.
pub fn shell_asymmetries(table: &GradientTable, shells: &ShellAssignment) -> Vec<(f64, f64)> {
    (0..shells.num_shells())
        .filter(|&s| !shells.is_bzero_shell(s))
        .map(|s| {
            let mut sum = Vector3::zeros();
            let mut count = 0usize;
            for v in shells.volumes_in_shell(s) {
                let dir = table.rows[v].vector();
                let norm = dir.norm();
                if norm > 0.0 {
                    sum += dir / norm;
                    count += 1;
                }
            }
            let asym = if count > 0 {
                (sum / count as f64).norm()
            } else {
                0.0
            };
            (shells.shell_bvalues[s], asym)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(bvals: &[f64]) -> GradientTable {
        GradientTable::new(
            bvals
                .iter()
                .map(|&b| {
                    if b <= 10.0 {
                        GradientRow::new(0.0, 0.0, 0.0, b)
                    } else {
                        GradientRow::new(1.0, 0.0, 0.0, b)
                    }
                })
                .collect(),
        )
    }

    #[test]
    fn test_parse_fsl_row_major() {
        let bvecs = "0 1 0\n0 0 1\n0 0 0\n";
        let bvals = "0 1000 1000\n";
        let t = parse_fsl(bvecs, bvals).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.rows[1].direction, [1.0, 0.0, 0.0]);
        assert_eq!(t.rows[2].direction, [0.0, 1.0, 0.0]);
        assert_eq!(t.rows[2].bvalue, 1000.0);
    }

    #[test]
    fn test_parse_fsl_column_major() {
        let bvecs = "0 0 0\n1 0 0\n0 1 0\n0 0 1\n";
        let bvals = "0\n1000\n1000\n1000\n";
        let t = parse_fsl(bvecs, bvals).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t.rows[3].direction, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_parse_fsl_length_mismatch() {
        assert!(parse_fsl("0 1\n0 0\n0 0\n", "0 1000 1000\n").is_err());
    }

    #[test]
    fn test_grad_b_rejects_wrong_columns() {
        assert!(parse_grad_b("0 0 0\n").is_err());
        let t = parse_grad_b("0 0 0 0\n0.5 0.5 0.7071 3000\n").unwrap();
        assert_eq!(t.rows[1].bvalue, 3000.0);
    }

    #[test]
    fn test_format_matches_parse() {
        let t = parse_grad_b("0 0 0 0\n1 0 0 1000\n0 0.5 0.5 2000\n").unwrap();
        let back = parse_grad_b(&format_grad_b(&t)).unwrap();
        assert_eq!(t, back);
        assert_eq!(format_bvals(&t), "0 1000 2000\n");
    }

    #[test]
    fn test_shell_assignment_two_shells() {
        let t = table(&[0.0, 995.0, 1005.0, 5.0, 2990.0, 3000.0]);
        let shells = ShellAssignment::from_table(&t, 10.0, 80.0);
        assert_eq!(shells.num_shells(), 3);
        assert_eq!(shells.volume_shell, vec![0, 1, 1, 0, 2, 2]);
        assert!(shells.is_bzero_shell(0));
        assert!((shells.shell_bvalues[1] - 1000.0).abs() < 1e-9);
        assert!((shells.shell_bvalues[2] - 2995.0).abs() < 1e-9);
    }

    #[test]
    fn test_shell_assignment_without_bzero() {
        let t = table(&[1000.0, 1000.0, 2000.0]);
        let shells = ShellAssignment::from_table(&t, 10.0, 80.0);
        assert_eq!(shells.volume_shell, vec![0, 0, 1]);
        assert!(!shells.is_bzero_shell(0));
    }

    #[test]
    fn test_shell_bvalues_within_tolerance_of_members() {
        let t = table(&[0.0, 990.0, 1010.0, 1000.0, 2000.0, 2040.0]);
        let shells = ShellAssignment::from_table(&t, 10.0, 80.0);
        for (v, row) in t.rows.iter().enumerate() {
            let s = shells.shell_of(v);
            if !shells.is_bzero_shell(s) {
                assert!((shells.shell_bvalues[s] - row.bvalue).abs() <= 80.0);
            }
        }
    }

    #[test]
    fn test_shell_asymmetry() {
        let half = GradientTable::new(vec![
            GradientRow::new(1.0, 0.0, 0.0, 1000.0),
            GradientRow::new(0.0, 1.0, 0.0, 1000.0),
        ]);
        let shells = ShellAssignment::from_table(&half, 10.0, 80.0);
        let asym = shell_asymmetries(&half, &shells);
        assert!(asym[0].1 > ASYMMETRY_THRESHOLD);

        let full = GradientTable::new(vec![
            GradientRow::new(1.0, 0.0, 0.0, 1000.0),
            GradientRow::new(-1.0, 0.0, 0.0, 1000.0),
        ]);
        let shells = ShellAssignment::from_table(&full, 10.0, 80.0);
        assert!(shell_asymmetries(&full, &shells)[0].1 < 1e-12);
    }
}
