//! Read-only view of image dimensions, voxel sizes, gradient table and
//! free-form header key/values.

use crate::error::{DwiError, Result};
use crate::gradient;
use crate::image::{self, GRID_TOLERANCE};
use crate::phase_encoding::{self, PeScheme};
use crate::types::GradientTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub path: PathBuf,
    /// Spatial and volume dimensions; a 3-D image reports 1 volume.
    pub dims: [usize; 4],
    pub ndim: usize,
    pub voxel_size: [f64; 3],
    pub gradients: Option<GradientTable>,
    pub keyval: BTreeMap<String, Value>,
}

/// Subset of `mrinfo -json_all` output used here.
#[derive(Debug, Deserialize)]
struct MrinfoJson {
    size: Vec<usize>,
    spacing: Vec<f64>,
    #[serde(default)]
    keyval: BTreeMap<String, Value>,
}

impl ImageMetadata {
    /// Parse the JSON written by `mrinfo -json_all`.
    pub fn from_mrinfo_json(path: &Path, json: &str) -> Result<Self> {
        let info: MrinfoJson = serde_json::from_str(json).map_err(|e| DwiError::ToolOutput {
            tool: "mrinfo".to_string(),
            message: e.to_string(),
        })?;
        if info.size.len() < 3 || info.spacing.len() < 3 {
            return Err(DwiError::metadata(format!(
                "Image {} has fewer than 3 dimensions",
                path.display()
            )));
        }
        let ndim = info.size.len();
        let dims = [
            info.size[0],
            info.size[1],
            info.size[2],
            info.size.get(3).copied().unwrap_or(1),
        ];
        let gradients = match info.keyval.get("dw_scheme") {
            Some(value) => Some(gradient::rows_to_table(&phase_encoding::value_to_rows(value)?)?),
            None => None,
        };
        Ok(Self {
            path: path.to_path_buf(),
            dims,
            ndim,
            voxel_size: [info.spacing[0], info.spacing[1], info.spacing[2]],
            gradients,
            keyval: info.keyval,
        })
    }

    /// Build from a NIfTI header plus optional BIDS sidecar and FSL
    /// gradient files. Missing sidecars are looked up next to the image.
    pub fn from_nifti(
        path: &Path,
        sidecar: Option<&Path>,
        fsl_grad: Option<(&Path, &Path)>,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(DwiError::FileNotFound(path.to_path_buf()));
        }
        let (dims, voxel_size) = image::read_header(path)?;
        let ndim = if dims[3] > 1 { 4 } else { 3 };

        let sidecar = sidecar
            .map(Path::to_path_buf)
            .or_else(|| sibling(path, "json").filter(|p| p.exists()));
        let keyval = match sidecar {
            Some(p) => read_sidecar(&p)?,
            None => BTreeMap::new(),
        };

        let gradients = match fsl_grad {
            Some((bvecs, bvals)) => Some(gradient::read_fsl(bvecs, bvals)?),
            None => match (sibling(path, "bvec"), sibling(path, "bval")) {
                (Some(bvecs), Some(bvals)) if bvecs.exists() && bvals.exists() => {
                    Some(gradient::read_fsl(&bvecs, &bvals)?)
                }
                _ => None,
            },
        };

        Ok(Self {
            path: path.to_path_buf(),
            dims,
            ndim,
            voxel_size,
            gradients,
            keyval,
        })
    }

    pub fn num_volumes(&self) -> usize {
        self.dims[3]
    }

    /// Structural preconditions for a DWI series.
    pub fn validate_dwi(&self) -> Result<()> {
        if self.ndim != 4 {
            return Err(DwiError::metadata(format!(
                "DWI {} must be a 4-D image (found {} dimensions)",
                self.path.display(),
                self.ndim
            )));
        }
        self.validate_spatial()?;
        let grad = self.gradients.as_ref().ok_or_else(|| {
            DwiError::metadata(format!(
                "No diffusion gradient table found for {}",
                self.path.display()
            ))
        })?;
        if grad.len() != self.num_volumes() {
            return Err(DwiError::metadata(format!(
                "Gradient table has {} rows but {} has {} volumes",
                grad.len(),
                self.path.display(),
                self.num_volumes()
            )));
        }
        Ok(())
    }

    /// Every spatial axis must have more than one voxel.
    pub fn validate_spatial(&self) -> Result<()> {
        if let Some(axis) = (0..3).find(|&a| self.dims[a] < 2) {
            return Err(DwiError::metadata(format!(
                "Image {} has degenerate spatial axis {} (size {})",
                self.path.display(),
                axis,
                self.dims[axis]
            )));
        }
        Ok(())
    }

    pub fn gradient_table(&self) -> Result<&GradientTable> {
        self.gradients.as_ref().ok_or_else(|| {
            DwiError::metadata(format!("No gradient table for {}", self.path.display()))
        })
    }

    pub fn pe_scheme(&self) -> Result<Option<PeScheme>> {
        PeScheme::from_keyval(&self.keyval, self.num_volumes())
    }

    pub fn readout_time(&self) -> Result<Option<f64>> {
        phase_encoding::header_readout_time(&self.keyval)
    }

    /// True when the header gives a direction but no readout time, so
    /// [`PeScheme::from_keyval`] falls back to the default.
    pub fn readout_time_defaulted(&self) -> Result<bool> {
        Ok(!self.keyval.contains_key("pe_scheme")
            && self.keyval.contains_key("PhaseEncodingDirection")
            && self.readout_time()?.is_none())
    }

    pub fn slice_timing(&self) -> Result<Option<Vec<f64>>> {
        let Some(value) = self.keyval.get("SliceTiming") else {
            return Ok(None);
        };
        let rows = match value {
            Value::Array(items) if items.iter().all(Value::is_number) => {
                return Ok(Some(items.iter().filter_map(Value::as_f64).collect()));
            }
            other => phase_encoding::value_to_rows(other)?,
        };
        Ok(Some(rows.into_iter().flatten().collect()))
    }

    /// Slice encoding axis from `SliceEncodingDirection`, defaulting to k.
    pub fn slice_encoding_axis(&self) -> Result<usize> {
        match self.keyval.get("SliceEncodingDirection").and_then(Value::as_str) {
            None => Ok(2),
            Some(s) => {
                let dir = phase_encoding::parse_direction(s).map_err(|_| {
                    DwiError::metadata(format!("Invalid SliceEncodingDirection '{}'", s))
                })?;
                Ok(dir.iter().position(|&v| v != 0).unwrap_or(2))
            }
        }
    }

    /// True when `other` lies on a different voxel grid than `self`.
    pub fn requires_regrid(&self, other: &ImageMetadata) -> bool {
        requires_regrid(self.dims, self.voxel_size, other.dims, other.voxel_size)
    }
}

/// Dimension or voxel-size mismatch between two grids.
pub fn requires_regrid(
    dims_a: [usize; 4],
    voxel_a: [f64; 3],
    dims_b: [usize; 4],
    voxel_b: [f64; 3],
) -> bool {
    dims_a[..3] != dims_b[..3]
        || voxel_a
            .iter()
            .zip(voxel_b.iter())
            .any(|(a, b)| (a - b).abs() > GRID_TOLERANCE)
}

/// Sidecar path sharing the image's stem, e.g. `sub-01_dwi.json`.
pub fn sibling(path: &Path, ext: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .or_else(|| name.strip_suffix(".mif"))
        .unwrap_or(name);
    Some(path.with_file_name(format!("{}.{}", stem, ext)))
}

fn read_sidecar(path: &Path) -> Result<BTreeMap<String, Value>> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(DwiError::metadata(format!(
            "Sidecar {} is not a JSON object",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MRINFO: &str = r#"{
        "name": "dwi.mif",
        "size": [96, 96, 60, 4],
        "spacing": [2.0, 2.0, 2.0, 1.0],
        "keyval": {
            "dw_scheme": [[0,0,0,0],[1,0,0,1000],[0,1,0,1000],[0,0,1,1000]],
            "PhaseEncodingDirection": "j-",
            "TotalReadoutTime": "0.05",
            "SliceTiming": [0.0, 0.5, 0.25]
        }
    }"#;

    #[test]
    fn test_from_mrinfo_json() {
        let meta = ImageMetadata::from_mrinfo_json(Path::new("dwi.mif"), MRINFO).unwrap();
        assert_eq!(meta.dims, [96, 96, 60, 4]);
        assert_eq!(meta.ndim, 4);
        assert_eq!(meta.gradient_table().unwrap().len(), 4);
        assert!(meta.validate_dwi().is_ok());
        assert_eq!(meta.readout_time().unwrap(), Some(0.05));
        assert_eq!(meta.slice_timing().unwrap(), Some(vec![0.0, 0.5, 0.25]));
        assert_eq!(meta.slice_encoding_axis().unwrap(), 2);
        let scheme = meta.pe_scheme().unwrap().unwrap();
        assert_eq!(scheme.len(), 4);
    }

    #[test]
    fn test_invalid_mrinfo_json() {
        let err = ImageMetadata::from_mrinfo_json(Path::new("x.mif"), "not json").unwrap_err();
        assert!(matches!(err, DwiError::ToolOutput { .. }));
    }

    #[test]
    fn test_validate_rejects_3d_and_degenerate() {
        let mut meta = ImageMetadata::from_mrinfo_json(Path::new("dwi.mif"), MRINFO).unwrap();
        meta.dims[2] = 1;
        assert!(meta.validate_dwi().is_err());

        let mut meta = ImageMetadata::from_mrinfo_json(Path::new("dwi.mif"), MRINFO).unwrap();
        meta.ndim = 3;
        assert!(meta.validate_dwi().is_err());
    }

    #[test]
    fn test_validate_rejects_gradient_mismatch() {
        let mut meta = ImageMetadata::from_mrinfo_json(Path::new("dwi.mif"), MRINFO).unwrap();
        meta.dims[3] = 5;
        let err = meta.validate_dwi().unwrap_err();
        assert!(err.to_string().contains("4 rows"));
    }

    #[test]
    fn test_requires_regrid() {
        assert!(!requires_regrid([4, 4, 4, 1], [2.0; 3], [4, 4, 4, 9], [2.0; 3]));
        assert!(requires_regrid([4, 4, 4, 1], [2.0; 3], [4, 4, 5, 1], [2.0; 3]));
        assert!(requires_regrid(
            [4, 4, 4, 1],
            [2.0; 3],
            [4, 4, 4, 1],
            [2.0, 2.0, 2.001]
        ));
    }

    #[test]
    fn test_sibling_paths() {
        assert_eq!(
            sibling(Path::new("/d/sub-01_dwi.nii.gz"), "bvec").unwrap(),
            PathBuf::from("/d/sub-01_dwi.bvec")
        );
        assert_eq!(
            sibling(Path::new("/d/dwi.nii"), "json").unwrap(),
            PathBuf::from("/d/dwi.json")
        );
    }

    #[test]
    fn test_from_nifti_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let img = crate::image::Image::zeros([4, 4, 2, 3], [2.0, 2.0, 2.0]);
        let path = dir.path().join("dwi.nii");
        crate::image::write_nifti(&path, &img).unwrap();
        std::fs::write(dir.path().join("dwi.bvec"), "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        std::fs::write(dir.path().join("dwi.bval"), "0 1000 1000\n").unwrap();
        std::fs::write(
            dir.path().join("dwi.json"),
            r#"{"PhaseEncodingDirection": "j", "TotalReadoutTime": 0.04}"#,
        )
        .unwrap();

        let meta = ImageMetadata::from_nifti(&path, None, None).unwrap();
        assert_eq!(meta.dims, [4, 4, 2, 3]);
        assert!(meta.validate_dwi().is_ok());
        assert_eq!(meta.pe_scheme().unwrap().unwrap().rows[0].readout_time, 0.04);
    }
}
