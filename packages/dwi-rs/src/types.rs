use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of a diffusion gradient table: direction and b-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientRow {
    pub direction: [f64; 3],
    pub bvalue: f64,
}

impl GradientRow {
    pub fn new(x: f64, y: f64, z: f64, bvalue: f64) -> Self {
        Self {
            direction: [x, y, z],
            bvalue,
        }
    }

    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.direction[0], self.direction[1], self.direction[2])
    }

    pub fn is_zero_direction(&self) -> bool {
        self.direction.iter().all(|&v| v == 0.0)
    }
}

/// Ordered gradient rows, one per DWI volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientTable {
    pub rows: Vec<GradientRow>,
}

impl GradientTable {
    pub fn new(rows: Vec<GradientRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bvalues(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.bvalue).collect()
    }

    /// Indices of volumes whose b-value does not exceed `threshold`.
    pub fn bzero_indices(&self, threshold: f64) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.bvalue <= threshold)
            .map(|(i, _)| i)
            .collect()
    }

    /// Reorder rows so that output row `k` is input row `order[k]`.
    pub fn reordered(&self, order: &[usize]) -> Self {
        Self {
            rows: order.iter().map(|&i| self.rows[i]).collect(),
        }
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        self.reordered(indices)
    }
}

/// Acquisition design requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionDesign {
    None,
    Pair,
    All,
    Header,
}

impl AcquisitionDesign {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "pair" => Some(Self::Pair),
            "all" => Some(Self::All),
            "header" => Some(Self::Header),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pair => "pair",
            Self::All => "all",
            Self::Header => "header",
        }
    }
}

impl fmt::Display for AcquisitionDesign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-estimation strategy, chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionStrategy {
    None,
    SeEpiStandalone,
    SeEpiConcatFirstBzero,
    SeEpiConcatAllBzeros,
    Bzeros,
}

impl AcquisitionStrategy {
    pub fn estimates_field(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn uses_field_map_image(&self) -> bool {
        matches!(
            self,
            Self::SeEpiStandalone | Self::SeEpiConcatFirstBzero | Self::SeEpiConcatAllBzeros
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SeEpiStandalone => "se_epi_standalone",
            Self::SeEpiConcatFirstBzero => "se_epi_concat_first_bzero",
            Self::SeEpiConcatAllBzeros => "se_epi_concat_all_bzeros",
            Self::Bzeros => "bzeros",
        }
    }
}

impl fmt::Display for AcquisitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two DWI volumes acquired with reversed phase encoding along the same
/// gradient direction. `first < second` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumePair {
    pub first: usize,
    pub second: usize,
}

impl VolumePair {
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }
}

/// Non-fatal conditions reported alongside a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreprocWarning {
    PeDirectionMismatch {
        volume: usize,
        header: [i8; 3],
        manual: [i8; 3],
    },
    ReadoutTimeMismatch {
        volume: usize,
        header: f64,
        manual: f64,
    },
    DefaultReadoutTime {
        seconds: f64,
    },
    DefaultPhaseEncoding,
    AsymmetricShells {
        bvalues: Vec<f64>,
    },
    MissingRotatedBvecs,
    RecombinationSkipped {
        reason: String,
    },
    AlignSeepiIgnored,
    FieldMapFirstVolumeOnly {
        volumes: usize,
    },
}

impl fmt::Display for PreprocWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeDirectionMismatch {
                volume,
                header,
                manual,
            } => write!(
                f,
                "Phase-encoding direction of volume {} in header ({:?}) differs from manual ({:?}); using manual",
                volume, header, manual
            ),
            Self::ReadoutTimeMismatch {
                volume,
                header,
                manual,
            } => write!(
                f,
                "Total readout time of volume {} in header ({}) differs from manual ({}); using manual",
                volume, header, manual
            ),
            Self::DefaultReadoutTime { seconds } => write!(
                f,
                "Total readout time not provided; assuming {} s",
                seconds
            ),
            Self::DefaultPhaseEncoding => write!(
                f,
                "No phase-encoding information available; assuming direction j with 0.1 s readout"
            ),
            Self::AsymmetricShells { bvalues } => write!(
                f,
                "Diffusion directions are asymmetric on shell(s) b={:?}; consider --slm=linear in eddy options",
                bvalues
            ),
            Self::MissingRotatedBvecs => write!(
                f,
                "eddy did not produce rotated b-vectors; using pre-correction gradient directions"
            ),
            Self::RecombinationSkipped { reason } => {
                write!(f, "Volume recombination skipped: {}", reason)
            }
            Self::AlignSeepiIgnored => write!(
                f,
                "align_seepi has no effect for the selected acquisition design"
            ),
            Self::FieldMapFirstVolumeOnly { volumes } => write!(
                f,
                "Estimated field map has {} volumes; using the first",
                volumes
            ),
        }
    }
}

/// Collector that both logs and records warnings.
#[derive(Debug, Clone, Default)]
pub struct Warnings {
    items: Vec<PreprocWarning>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: PreprocWarning) {
        log::warn!("{}", warning);
        self.items.push(warning);
    }

    pub fn extend(&mut self, other: Warnings) {
        self.items.extend(other.items);
    }

    /// Record warnings that were already logged where they arose.
    pub fn absorb(&mut self, items: &[PreprocWarning]) {
        self.items.extend_from_slice(items);
    }

    pub fn items(&self) -> &[PreprocWarning] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<PreprocWarning> {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bzero_indices() {
        let table = GradientTable::new(vec![
            GradientRow::new(0.0, 0.0, 0.0, 5.0),
            GradientRow::new(1.0, 0.0, 0.0, 1000.0),
            GradientRow::new(0.0, 0.0, 0.0, 0.0),
        ]);
        assert_eq!(table.bzero_indices(10.0), vec![0, 2]);
    }

    #[test]
    fn test_volume_pair_is_ordered() {
        let pair = VolumePair::new(5, 1);
        assert_eq!(pair.first, 1);
        assert_eq!(pair.second, 5);
    }

    #[test]
    fn test_design_parsing() {
        assert_eq!(AcquisitionDesign::from_str("PAIR"), Some(AcquisitionDesign::Pair));
        assert_eq!(AcquisitionDesign::from_str("rpe_all"), None);
    }

    #[test]
    fn test_strategy_flags() {
        assert!(!AcquisitionStrategy::None.estimates_field());
        assert!(AcquisitionStrategy::Bzeros.estimates_field());
        assert!(!AcquisitionStrategy::Bzeros.uses_field_map_image());
        assert_eq!(
            AcquisitionStrategy::SeEpiConcatAllBzeros.to_string(),
            "se_epi_concat_all_bzeros"
        );
    }
}
