use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of failures, mirroring the order in which a run
/// can abort: configuration before any subprocess, metadata before any
/// image is written, matching only on the recombination sub-path, and
/// external tools at any point after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Metadata,
    Matching,
    ExternalTool,
}

#[derive(Error, Debug)]
pub enum DwiError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Phase-encoding information missing: {0}")]
    MissingPhaseEncoding(String),

    #[error(
        "Unsupported acquisition design: design={design}, field map present={has_field_map}, \
         phase-encoding contrast={has_contrast}"
    )]
    UnsupportedAcquisitionDesign {
        design: String,
        has_field_map: bool,
        has_contrast: bool,
    },

    #[error("Image metadata error: {0}")]
    Metadata(String),

    #[error("Input file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Volume count {0} is odd; reversed phase-encoding pairs cannot be formed")]
    OddVolumeCount(usize),

    #[error("Incomplete volume pairing: {unmatched} of {total} volumes have no reversed partner")]
    IncompletePairing { unmatched: usize, total: usize },

    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("{tool} failed with status {status}. stderr: {stderr}")]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to parse output of {tool}: {message}")]
    ToolOutput { tool: String, message: String },

    #[error("Failed to read NIfTI image {path}: {message}")]
    Nifti { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DwiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DwiError::Configuration(_)
            | DwiError::MissingPhaseEncoding(_)
            | DwiError::UnsupportedAcquisitionDesign { .. }
            | DwiError::FileNotFound(_) => ErrorKind::Configuration,
            DwiError::Metadata(_) | DwiError::Nifti { .. } | DwiError::Json(_) => {
                ErrorKind::Metadata
            }
            DwiError::OddVolumeCount(_) | DwiError::IncompletePairing { .. } => {
                ErrorKind::Matching
            }
            DwiError::ToolNotFound(_)
            | DwiError::ExternalTool { .. }
            | DwiError::ToolOutput { .. }
            | DwiError::IoError(_) => ErrorKind::ExternalTool,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        DwiError::Configuration(message.into())
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        DwiError::Metadata(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DwiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(DwiError::config("x").kind(), ErrorKind::Configuration);
        assert_eq!(
            DwiError::MissingPhaseEncoding("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(DwiError::metadata("x").kind(), ErrorKind::Metadata);
        assert_eq!(DwiError::OddVolumeCount(7).kind(), ErrorKind::Matching);
        assert_eq!(
            DwiError::ExternalTool {
                tool: "eddy".into(),
                status: "1".into(),
                stderr: String::new()
            }
            .kind(),
            ErrorKind::ExternalTool
        );
    }

    #[test]
    fn test_incomplete_pairing_message() {
        let err = DwiError::IncompletePairing {
            unmatched: 2,
            total: 8,
        };
        assert!(err.to_string().contains("2 of 8"));
    }
}
