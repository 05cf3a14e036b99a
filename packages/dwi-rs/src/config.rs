//! Run configuration: every decision the pipeline needs, fixed before the
//! first subprocess starts.

use crate::error::{DwiError, Result};
use crate::gradient::{DEFAULT_BZERO_THRESHOLD, DEFAULT_SHELL_TOLERANCE};
use crate::phase_encoding;
use crate::resolver::ManualPhaseEncoding;
use crate::types::AcquisitionDesign;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Eddy options the pipeline computes and injects itself.
pub const EDDY_RESERVED_OPTIONS: &[&str] = &[
    "--imain", "--mask", "--acqp", "--index", "--bvecs", "--bvals", "--topup", "--out",
    "--slspec",
];

/// Topup options the pipeline computes and injects itself.
pub const TOPUP_RESERVED_OPTIONS: &[&str] = &["--imain", "--datain", "--out", "--fout", "--iout"];

/// Amount of eddy quality-control output to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QcMode {
    #[default]
    None,
    Text,
    All,
}

impl QcMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "text" => Some(Self::Text),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// Which eddy build to look for first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EddyVariant {
    /// CUDA build if present, then OpenMP, then CPU.
    #[default]
    Auto,
    Cuda,
    Openmp,
    Cpu,
}

impl EddyVariant {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cuda" => Some(Self::Cuda),
            "openmp" => Some(Self::Openmp),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }

    /// Executable names in search order.
    pub fn binary_names(&self) -> &'static [&'static str] {
        match self {
            Self::Auto => &["eddy_cuda", "eddy_openmp", "eddy_cpu", "eddy"],
            Self::Cuda => &["eddy_cuda"],
            Self::Openmp => &["eddy_openmp"],
            Self::Cpu => &["eddy_cpu", "eddy"],
        }
    }
}

/// Raw option string passed through to a wrapped binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolOptions(pub String);

impl ToolOptions {
    pub fn tokens(&self) -> Vec<String> {
        self.0.split_whitespace().map(str::to_string).collect()
    }

    /// Option name of a token: `--slm=linear` -> `--slm`.
    fn name_of(token: &str) -> &str {
        token.split('=').next().unwrap_or(token)
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.split_whitespace().any(|t| Self::name_of(t) == name)
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.0
            .split_whitespace()
            .find(|t| Self::name_of(t) == name)
            .and_then(|t| t.split_once('=').map(|(_, v)| v))
    }

    fn reject(&self, tool: &str, reserved: &[&str]) -> Result<()> {
        for token in self.0.split_whitespace() {
            let name = Self::name_of(token);
            if reserved.contains(&name) {
                return Err(DwiError::config(format!(
                    "Option '{}' may not be passed through the {} options; it is set internally",
                    name, tool
                )));
            }
            if !token.starts_with('-') {
                return Err(DwiError::config(format!(
                    "Unexpected token '{}' in {} options",
                    token, tool
                )));
            }
        }
        Ok(())
    }

    pub fn validate_eddy(&self) -> Result<()> {
        self.reject("eddy", EDDY_RESERVED_OPTIONS)?;
        if self.value_of("--resamp") == Some("lsr") {
            return Err(DwiError::config(
                "eddy least-squares resampling (--resamp=lsr) is not supported",
            ));
        }
        Ok(())
    }

    pub fn validate_topup(&self) -> Result<()> {
        self.reject("topup", TOPUP_RESERVED_OPTIONS)
    }

    /// Slice-to-volume correction requested.
    pub fn slice_to_volume(&self) -> bool {
        self.has("--mporder")
    }
}

fn default_bzero_threshold() -> f64 {
    DEFAULT_BZERO_THRESHOLD
}

fn default_shell_tolerance() -> f64 {
    DEFAULT_SHELL_TOLERANCE
}

fn default_eddy_options() -> ToolOptions {
    ToolOptions("--repol".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocConfig {
    /// DWI input: `.nii`, `.nii.gz` or `.mif`.
    pub input: PathBuf,
    /// Corrected output, same formats as the input.
    pub output: PathBuf,
    pub design: AcquisitionDesign,
    /// Manual direction, e.g. `AP`, `j-` or `0,-1,0`.
    #[serde(default)]
    pub pe_dir: Option<String>,
    #[serde(default)]
    pub readout_time: Option<f64>,
    /// Spin-echo EPI field-map series.
    #[serde(default)]
    pub se_epi: Option<PathBuf>,
    #[serde(default)]
    pub align_seepi: bool,
    /// FSL gradient files for NIfTI input (bvecs, bvals).
    #[serde(default)]
    pub fslgrad: Option<(PathBuf, PathBuf)>,
    /// FSL gradient files written next to the output.
    #[serde(default)]
    pub export_fslgrad: Option<(PathBuf, PathBuf)>,
    #[serde(default)]
    pub json_import: Option<PathBuf>,
    #[serde(default = "default_eddy_options")]
    pub eddy_options: ToolOptions,
    #[serde(default)]
    pub topup_options: ToolOptions,
    #[serde(default)]
    pub eddy_mask: Option<PathBuf>,
    /// Prefix of a precomputed topup result (`<prefix>_fieldcoef.nii`).
    #[serde(default)]
    pub topup_files: Option<PathBuf>,
    #[serde(default)]
    pub eddy_slspec: Option<PathBuf>,
    #[serde(default)]
    pub eddyqc: QcMode,
    #[serde(default)]
    pub eddyqc_dir: Option<PathBuf>,
    #[serde(default = "default_bzero_threshold")]
    pub bzero_threshold: f64,
    #[serde(default = "default_shell_tolerance")]
    pub shell_tolerance: f64,
    #[serde(default)]
    pub eddy_variant: EddyVariant,
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    #[serde(default)]
    pub keep_scratch: bool,
    #[serde(default)]
    pub force: bool,
    /// Explicit executable paths keyed by tool name.
    #[serde(default)]
    pub tool_paths: BTreeMap<String, PathBuf>,
}

impl PreprocConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, design: AcquisitionDesign) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            design,
            pe_dir: None,
            readout_time: None,
            se_epi: None,
            align_seepi: false,
            fslgrad: None,
            export_fslgrad: None,
            json_import: None,
            eddy_options: default_eddy_options(),
            topup_options: ToolOptions::default(),
            eddy_mask: None,
            topup_files: None,
            eddy_slspec: None,
            eddyqc: QcMode::None,
            eddyqc_dir: None,
            bzero_threshold: DEFAULT_BZERO_THRESHOLD,
            shell_tolerance: DEFAULT_SHELL_TOLERANCE,
            eddy_variant: EddyVariant::Auto,
            scratch_root: None,
            keep_scratch: false,
            force: false,
            tool_paths: BTreeMap::new(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DwiError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| DwiError::config(format!("Invalid configuration {}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn manual_phase_encoding(&self) -> Result<ManualPhaseEncoding> {
        let direction = self
            .pe_dir
            .as_deref()
            .map(phase_encoding::parse_direction)
            .transpose()?;
        Ok(ManualPhaseEncoding {
            direction,
            readout_time: self.readout_time,
        })
    }

    /// QC directory, if any QC output was requested.
    pub fn qc_dir(&self) -> Option<&Path> {
        match self.eddyqc {
            QcMode::None => None,
            _ => self.eddyqc_dir.as_deref(),
        }
    }

    /// Reject contradictory or malformed configuration. Nothing here
    /// touches an external tool.
    pub fn validate(&self) -> Result<()> {
        for path in self.required_inputs() {
            if !path.exists() {
                return Err(DwiError::FileNotFound(path.to_path_buf()));
            }
        }
        if self.output.exists() && !self.force {
            return Err(DwiError::config(format!(
                "Output {} already exists (use force to overwrite)",
                self.output.display()
            )));
        }
        if !is_supported_image(&self.output) {
            return Err(DwiError::config(format!(
                "Unsupported output format: {}",
                self.output.display()
            )));
        }

        self.manual_phase_encoding()?;
        if let Some(t) = self.readout_time {
            if !(t > 0.0 && t.is_finite()) {
                return Err(DwiError::config(format!(
                    "Total readout time must be positive (got {})",
                    t
                )));
            }
            if self.pe_dir.is_none() {
                return Err(DwiError::config(
                    "A readout time was given without a phase-encoding direction",
                ));
            }
        }
        if self.bzero_threshold < 0.0 || self.shell_tolerance <= 0.0 {
            return Err(DwiError::config(
                "b=0 threshold must be non-negative and shell tolerance positive",
            ));
        }

        self.eddy_options.validate_eddy()?;
        self.topup_options.validate_topup()?;

        if self.topup_files.is_some() && !self.topup_options.0.trim().is_empty() {
            return Err(DwiError::config(
                "topup options have no effect when precomputed topup files are supplied",
            ));
        }
        if self.topup_files.is_some() && self.design == AcquisitionDesign::None {
            return Err(DwiError::config(
                "Precomputed topup files cannot be used with design 'none'",
            ));
        }
        if self.eddy_slspec.is_some() && !self.eddy_options.slice_to_volume() {
            return Err(DwiError::config(
                "A slice specification is only used with slice-to-volume correction (--mporder)",
            ));
        }
        if self.eddyqc != QcMode::None && self.eddyqc_dir.is_none() {
            return Err(DwiError::config("An eddy QC mode requires an eddy QC directory"));
        }
        Ok(())
    }

    fn required_inputs(&self) -> Vec<&Path> {
        let mut paths = vec![self.input.as_path()];
        paths.extend(self.se_epi.as_deref());
        paths.extend(self.json_import.as_deref());
        paths.extend(self.eddy_mask.as_deref());
        paths.extend(self.eddy_slspec.as_deref());
        if let Some((bvecs, bvals)) = &self.fslgrad {
            paths.push(bvecs);
            paths.push(bvals);
        }
        paths
    }
}

/// Image formats the pipeline reads and writes.
pub fn is_supported_image(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".nii") || name.ends_with(".nii.gz") || name.ends_with(".mif")
}

pub fn is_mif(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("mif")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_eddy_options_rejected() {
        for opt in ["--mask=brain.nii", "--slspec=s.txt", "--imain=x", "--out=y"] {
            let err = ToolOptions(format!("--repol {}", opt)).validate_eddy().unwrap_err();
            assert!(matches!(err, DwiError::Configuration(_)), "{}", opt);
        }
        assert!(ToolOptions("--resamp=lsr".into()).validate_eddy().is_err());
        assert!(ToolOptions("--resamp=jac --repol --slm=linear".into())
            .validate_eddy()
            .is_ok());
    }

    #[test]
    fn test_reserved_topup_options_rejected() {
        assert!(ToolOptions("--fout=f".into()).validate_topup().is_err());
        assert!(ToolOptions("--iout=f".into()).validate_topup().is_err());
        assert!(ToolOptions("--subsamp=1 --scale=1".into()).validate_topup().is_ok());
        assert!(ToolOptions("stray".into()).validate_topup().is_err());
    }

    #[test]
    fn test_option_queries() {
        let opts = ToolOptions("--repol --mporder=8 --slm=linear".into());
        assert!(opts.slice_to_volume());
        assert!(opts.has("--slm"));
        assert_eq!(opts.value_of("--mporder"), Some("8"));
        assert!(!ToolOptions::default().slice_to_volume());
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{"input": "dwi.nii", "output": "out.nii", "design": "pair"}"#;
        let config: PreprocConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.design, AcquisitionDesign::Pair);
        assert_eq!(config.bzero_threshold, DEFAULT_BZERO_THRESHOLD);
        assert_eq!(config.eddy_options, ToolOptions("--repol".into()));
        assert_eq!(config.eddyqc, QcMode::None);
        assert_eq!(config.eddy_variant, EddyVariant::Auto);
    }

    #[test]
    fn test_validate_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dwi.nii");
        std::fs::write(&input, b"").unwrap();
        let mut config = PreprocConfig::new(&input, dir.path().join("out.nii"), AcquisitionDesign::All);
        config.pe_dir = Some("AP".into());
        assert!(config.validate().is_ok());

        config.pe_dir = Some("XY".into());
        assert!(config.validate().is_err());

        config.pe_dir = None;
        config.readout_time = Some(0.05);
        assert!(config.validate().is_err());

        config.readout_time = None;
        config.eddyqc = QcMode::Text;
        assert!(config.validate().is_err());

        config.eddyqc = QcMode::None;
        config.output = dir.path().join("out.txt");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_input_is_reported() {
        let config = PreprocConfig::new("/nonexistent/dwi.nii", "/tmp/out.nii", AcquisitionDesign::None);
        assert!(matches!(config.validate(), Err(DwiError::FileNotFound(_))));
    }

    #[test]
    fn test_eddy_variant_names() {
        assert_eq!(EddyVariant::Auto.binary_names()[0], "eddy_cuda");
        assert_eq!(EddyVariant::from_str("OpenMP"), Some(EddyVariant::Openmp));
        assert_eq!(QcMode::from_str("all"), Some(QcMode::All));
    }
}
