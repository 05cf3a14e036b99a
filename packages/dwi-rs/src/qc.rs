//! Export of eddy quality-control output.

use crate::config::QcMode;
use crate::error::{DwiError, Result};
use std::path::{Path, PathBuf};

/// Per-volume text statistics written by eddy, as `<out>.<suffix>`.
pub const EDDY_QC_TEXT_SUFFIXES: &[&str] = &[
    "eddy_parameters",
    "eddy_movement_rms",
    "eddy_restricted_movement_rms",
    "eddy_post_eddy_shell_alignment_parameters",
    "eddy_post_eddy_shell_PE_translation_parameters",
    "eddy_outlier_report",
    "eddy_outlier_map",
    "eddy_outlier_n_stdev_map",
    "eddy_outlier_n_sqr_stdev_map",
    "eddy_movement_over_time",
];

/// Collect eddy QC files from `eddy_prefix` into `dest`.
///
/// Text statistics are copied when present; `All` additionally copies
/// every other `eddy_*` output and the extra images given. Returns the
/// copied destination paths.
pub fn export_eddy_qc(
    mode: QcMode,
    eddy_prefix: &Path,
    extra_images: &[&Path],
    dest: &Path,
) -> Result<Vec<PathBuf>> {
    if mode == QcMode::None {
        return Ok(Vec::new());
    }
    std::fs::create_dir_all(dest)?;

    let mut sources: Vec<PathBuf> = EDDY_QC_TEXT_SUFFIXES
        .iter()
        .map(|suffix| with_suffix(eddy_prefix, suffix))
        .filter(|p| p.is_file())
        .collect();

    if mode == QcMode::All {
        let pattern = format!("{}.eddy_*", eddy_prefix.display());
        let entries = glob::glob(&pattern)
            .map_err(|e| DwiError::config(format!("Invalid QC pattern '{}': {}", pattern, e)))?;
        for path in entries.flatten() {
            if path.is_file() && !sources.contains(&path) {
                sources.push(path);
            }
        }
        sources.extend(extra_images.iter().filter(|p| p.is_file()).map(|p| p.to_path_buf()));
    }

    let mut copied = Vec::with_capacity(sources.len());
    for source in sources {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = dest.join(name);
        std::fs::copy(&source, &target)?;
        copied.push(target);
    }
    log::info!("Exported {} eddy QC file(s) to {}", copied.len(), dest.display());
    Ok(copied)
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eddy_outputs(dir: &Path) -> PathBuf {
        let prefix = dir.join("dwi_post_eddy");
        for suffix in ["eddy_parameters", "eddy_movement_rms", "eddy_cnr_maps.nii", "eddy_rotated_bvecs"] {
            std::fs::write(with_suffix(&prefix, suffix), b"0").unwrap();
        }
        prefix
    }

    #[test]
    fn test_text_mode_copies_statistics_only() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let prefix = eddy_outputs(scratch.path());

        let copied = export_eddy_qc(QcMode::Text, &prefix, &[], dest.path()).unwrap();
        assert_eq!(copied.len(), 2);
        assert!(dest.path().join("dwi_post_eddy.eddy_parameters").exists());
        assert!(!dest.path().join("dwi_post_eddy.eddy_cnr_maps.nii").exists());
    }

    #[test]
    fn test_all_mode_includes_images_and_extras() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let prefix = eddy_outputs(scratch.path());
        let mask = scratch.path().join("eddy_mask.nii");
        std::fs::write(&mask, b"m").unwrap();

        let copied = export_eddy_qc(QcMode::All, &prefix, &[&mask], dest.path()).unwrap();
        assert_eq!(copied.len(), 5);
        assert!(dest.path().join("eddy_mask.nii").exists());
        assert!(dest.path().join("dwi_post_eddy.eddy_cnr_maps.nii").exists());
    }

    #[test]
    fn test_none_mode_is_noop() {
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("qc");
        assert!(export_eddy_qc(QcMode::None, Path::new("x"), &[], &target)
            .unwrap()
            .is_empty());
        assert!(!target.exists());
    }
}
