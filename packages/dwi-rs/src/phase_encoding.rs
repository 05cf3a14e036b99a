//! Phase-encoding rows, schemes and their text formats.
//!
//! Directions are always relative to the image axes (i, j, k) and carry a
//! sign on exactly one axis. Total readout time is in seconds.

use crate::error::{DwiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Readout times closer than this are treated as identical.
pub const READOUT_TIME_TOLERANCE: f64 = 5e-3;

/// Readout time used when neither header nor user provide one.
pub const DEFAULT_READOUT_TIME: f64 = 0.1;

/// Parse a phase-encoding direction.
///
/// Accepts BIDS axis codes (`i`, `j-`, ...), anatomical shorthands
/// (`AP`, `PA`, `LR`, `RL`, `IS`, `SI`) and comma-separated triplets.
pub fn parse_direction(text: &str) -> Result<[i8; 3]> {
    let s = text.trim();
    let lower = s.to_ascii_lowercase();
    let dir = match lower.as_str() {
        "i" | "i+" | "lr" => [1, 0, 0],
        "i-" | "rl" => [-1, 0, 0],
        "j" | "j+" | "pa" => [0, 1, 0],
        "j-" | "ap" => [0, -1, 0],
        "k" | "k+" | "is" => [0, 0, 1],
        "k-" | "si" => [0, 0, -1],
        _ => {
            let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
            if parts.len() != 3 {
                return Err(DwiError::config(format!(
                    "Unrecognised phase-encoding direction '{}'",
                    text
                )));
            }
            let mut dir = [0i8; 3];
            for (axis, part) in parts.iter().enumerate() {
                let value: f64 = part.parse().map_err(|_| {
                    DwiError::config(format!("Unrecognised phase-encoding direction '{}'", text))
                })?;
                dir[axis] = value.round() as i8;
            }
            dir
        }
    };
    validate_direction(dir).map_err(|_| {
        DwiError::config(format!(
            "Phase-encoding direction '{}' must lie along exactly one image axis",
            text
        ))
    })?;
    Ok(dir)
}

fn validate_direction(dir: [i8; 3]) -> Result<()> {
    let nonzero = dir.iter().filter(|&&v| v != 0).count();
    if nonzero != 1 || dir.iter().any(|&v| v.abs() > 1) {
        return Err(DwiError::metadata(format!(
            "Invalid phase-encoding direction {:?}",
            dir
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeRow {
    pub direction: [i8; 3],
    pub readout_time: f64,
}

impl PeRow {
    pub fn new(direction: [i8; 3], readout_time: f64) -> Self {
        Self {
            direction,
            readout_time,
        }
    }

    pub fn axis(&self) -> usize {
        self.direction.iter().position(|&v| v != 0).unwrap_or(1)
    }

    pub fn sign(&self) -> i8 {
        self.direction[self.axis()]
    }

    pub fn negated(&self) -> Self {
        Self {
            direction: [-self.direction[0], -self.direction[1], -self.direction[2]],
            readout_time: self.readout_time,
        }
    }

    /// Same direction and readout time within tolerance.
    pub fn same_encoding(&self, other: &PeRow) -> bool {
        self.direction == other.direction
            && (self.readout_time - other.readout_time).abs() <= READOUT_TIME_TOLERANCE
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.direction[0], self.direction[1], self.direction[2], self.readout_time
        )
    }
}

/// One phase-encoding row per volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeScheme {
    pub rows: Vec<PeRow>,
}

impl PeScheme {
    pub fn new(rows: Vec<PeRow>) -> Self {
        Self { rows }
    }

    pub fn uniform(row: PeRow, volumes: usize) -> Self {
        Self {
            rows: vec![row; volumes],
        }
    }

    /// First half of the volumes with `row`, second half reversed.
    pub fn reversed_halves(row: PeRow, volumes: usize) -> Result<Self> {
        if volumes % 2 != 0 {
            return Err(DwiError::OddVolumeCount(volumes));
        }
        let half = volumes / 2;
        let mut rows = vec![row; half];
        rows.extend(std::iter::repeat(row.negated()).take(half));
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when at least two rows differ in direction or readout time.
    pub fn has_contrast(&self) -> bool {
        match self.rows.first() {
            Some(first) => self.rows.iter().any(|r| !r.same_encoding(first)),
            None => false,
        }
    }

    /// True when the phase-encoding directions sum to the zero vector.
    pub fn is_balanced(&self) -> bool {
        let mut sum = [0i64; 3];
        for row in &self.rows {
            for (axis, value) in row.direction.iter().enumerate() {
                sum[axis] += *value as i64;
            }
        }
        sum == [0, 0, 0]
    }

    pub fn concat(&self, other: &PeScheme) -> Self {
        let mut rows = self.rows.clone();
        rows.extend_from_slice(&other.rows);
        Self { rows }
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            rows: indices.iter().map(|&i| self.rows[i]).collect(),
        }
    }

    /// Read from image header key/values.
    ///
    /// `pe_scheme` takes precedence; otherwise a uniform scheme is built
    /// from `PhaseEncodingDirection` and `TotalReadoutTime`. Returns
    /// `Ok(None)` when the header carries no phase-encoding information.
    pub fn from_keyval(keyval: &BTreeMap<String, Value>, volumes: usize) -> Result<Option<Self>> {
        if let Some(value) = keyval.get("pe_scheme") {
            let rows = value_to_rows(value)?;
            let scheme = rows
                .iter()
                .map(|r| {
                    if r.len() != 4 {
                        return Err(DwiError::metadata(format!(
                            "pe_scheme row has {} columns, expected 4",
                            r.len()
                        )));
                    }
                    let dir = [r[0].round() as i8, r[1].round() as i8, r[2].round() as i8];
                    validate_direction(dir)?;
                    Ok(PeRow::new(dir, r[3]))
                })
                .collect::<Result<Vec<_>>>()?;
            if scheme.len() != volumes {
                return Err(DwiError::metadata(format!(
                    "pe_scheme has {} rows but image has {} volumes",
                    scheme.len(),
                    volumes
                )));
            }
            return Ok(Some(Self::new(scheme)));
        }

        let Some(direction) = keyval.get("PhaseEncodingDirection").and_then(Value::as_str) else {
            return Ok(None);
        };
        let dir = parse_direction(direction).map_err(|_| {
            DwiError::metadata(format!(
                "Invalid PhaseEncodingDirection '{}' in header",
                direction
            ))
        })?;
        let trt = header_readout_time(keyval)?.unwrap_or(DEFAULT_READOUT_TIME);
        Ok(Some(Self::uniform(PeRow::new(dir, trt), volumes)))
    }

    /// topup `--datain` contents: one row per volume.
    pub fn to_topup_datain(&self) -> String {
        self.rows.iter().map(|r| r.to_line() + "\n").collect()
    }

    /// Collapse into eddy's `--acqp` config rows plus 1-based `--index`.
    pub fn to_eddy_config(&self) -> EddyConfig {
        let mut config: Vec<PeRow> = Vec::new();
        let mut indices = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let position = match config.iter().position(|c| c.same_encoding(row)) {
                Some(p) => p,
                None => {
                    config.push(*row);
                    config.len() - 1
                }
            };
            indices.push(position + 1);
        }
        EddyConfig { config, indices }
    }
}

/// `TotalReadoutTime` from a header, accepting number or string form.
pub fn header_readout_time(keyval: &BTreeMap<String, Value>) -> Result<Option<f64>> {
    match keyval.get("TotalReadoutTime") {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| {
            DwiError::metadata(format!("Invalid TotalReadoutTime '{}' in header", s))
        }),
        Some(other) => Err(DwiError::metadata(format!(
            "Invalid TotalReadoutTime {} in header",
            other
        ))),
    }
}

/// Numeric rows from either a JSON array of arrays or newline-separated text.
pub fn value_to_rows(value: &Value) -> Result<Vec<Vec<f64>>> {
    match value {
        Value::Array(rows) => rows
            .iter()
            .map(|row| match row {
                Value::Array(cols) => cols
                    .iter()
                    .map(|c| match c {
                        Value::Number(n) => n
                            .as_f64()
                            .ok_or_else(|| DwiError::metadata("Non-finite number in table")),
                        Value::String(s) => s
                            .trim()
                            .parse::<f64>()
                            .map_err(|_| DwiError::metadata(format!("Invalid number '{}'", s))),
                        other => Err(DwiError::metadata(format!("Invalid table entry {}", other))),
                    })
                    .collect(),
                Value::String(s) => parse_numbers(s),
                other => Err(DwiError::metadata(format!("Invalid table row {}", other))),
            })
            .collect(),
        Value::String(s) => s
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_numbers)
            .collect(),
        other => Err(DwiError::metadata(format!("Invalid table {}", other))),
    }
}

fn parse_numbers(line: &str) -> Result<Vec<f64>> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| DwiError::metadata(format!("Invalid number '{}'", s)))
        })
        .collect()
}

/// eddy acquisition parameters: unique encodings and per-volume indices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EddyConfig {
    pub config: Vec<PeRow>,
    /// 1-based row of `config` for each volume.
    pub indices: Vec<usize>,
}

impl EddyConfig {
    pub fn config_text(&self) -> String {
        self.config.iter().map(|r| r.to_line() + "\n").collect()
    }

    pub fn indices_text(&self) -> String {
        self.indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ")
            + "\n"
    }

    /// 0-based config group of a volume.
    pub fn group_of(&self, volume: usize) -> usize {
        self.indices[volume] - 1
    }
}
