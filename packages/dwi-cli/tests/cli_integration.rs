use assert_cmd::Command;
use dwi_rs::gradient;
use dwi_rs::image::{self, Image};
use dwi_rs::{GradientRow, GradientTable};
use predicates::prelude::*;
use std::path::Path;

fn dwipreproc() -> Command {
    Command::cargo_bin("dwipreproc").unwrap()
}

/// Command with no external tools reachable.
fn isolated(dir: &Path) -> Command {
    let mut cmd = dwipreproc();
    cmd.env("PATH", dir)
        .env_remove("FSLDIR")
        .env_remove("MRTRIX_BIN");
    cmd
}

/// 8-volume series, b=0 then three directions, acquired twice.
fn write_dwi(dir: &Path) {
    let image = Image::from_fn([4, 4, 3, 8], [2.0; 3], |x, _, _, t| (x + t) as f64);
    image::write_nifti(&dir.join("dwi.nii"), &image).unwrap();
    let half = vec![
        GradientRow::new(0.0, 0.0, 0.0, 0.0),
        GradientRow::new(1.0, 0.0, 0.0, 1000.0),
        GradientRow::new(0.0, 1.0, 0.0, 1000.0),
        GradientRow::new(0.0, 0.0, 1.0, 1000.0),
    ];
    gradient::write_fsl(
        &GradientTable::new([half.clone(), half].concat()),
        &dir.join("dwi.bvec"),
        &dir.join("dwi.bval"),
    )
    .unwrap();
}

// =============================================================================
// GENERAL
// =============================================================================

#[test]
fn test_no_args_shows_help() {
    dwipreproc()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_version_flag() {
    dwipreproc()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dwipreproc"));
}

#[test]
fn test_help_flag() {
    dwipreproc()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("topup and eddy"));
}

// =============================================================================
// INFO SUBCOMMAND
// =============================================================================

#[test]
fn test_info_json_lists_every_tool() {
    let output = dwipreproc().arg("info").arg("--json").assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let names: Vec<&str> = parsed["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    for tool in ["mrinfo", "mrconvert", "mrtransform", "dwi2mask", "topup", "eddy"] {
        assert!(names.contains(&tool), "missing {}", tool);
    }
}

#[test]
fn test_info_rejects_unknown_variant() {
    dwipreproc()
        .args(["info", "--eddy-variant", "quantum"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown eddy variant"));
}

// =============================================================================
// INSPECT SUBCOMMAND
// =============================================================================

#[test]
fn test_inspect_all_design() {
    let dir = tempfile::tempdir().unwrap();
    write_dwi(dir.path());

    let output = isolated(dir.path())
        .arg("inspect")
        .arg(dir.path().join("dwi.nii"))
        .args(["--design", "all", "--pe-dir", "AP", "--readout-time", "0.05", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["strategy"], "bzeros");
    assert_eq!(parsed["pairs"].as_array().unwrap().len(), 4);
    assert_eq!(parsed["recombine"], true);
    assert_eq!(parsed["padded_axes"], serde_json::json!([2]));
}

#[test]
fn test_inspect_text_output() {
    let dir = tempfile::tempdir().unwrap();
    write_dwi(dir.path());

    isolated(dir.path())
        .arg("inspect")
        .arg(dir.path().join("dwi.nii"))
        .args(["--design", "none", "--pe-dir", "j"])
        .assert()
        .success()
        .stdout(predicate::str::contains("strategy: none"))
        .stdout(predicate::str::contains("Volume pairs: none"));
}

#[test]
fn test_inspect_requires_design() {
    let dir = tempfile::tempdir().unwrap();
    write_dwi(dir.path());

    isolated(dir.path())
        .arg("inspect")
        .arg(dir.path().join("dwi.nii"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--design"));
}

#[test]
fn test_inspect_odd_all_design_fails() {
    let dir = tempfile::tempdir().unwrap();
    let image = Image::zeros([2, 2, 2, 3], [2.0; 3]);
    image::write_nifti(&dir.path().join("dwi.nii"), &image).unwrap();
    std::fs::write(dir.path().join("dwi.bval"), "0 1000 1000\n").unwrap();
    std::fs::write(dir.path().join("dwi.bvec"), "0 1 0\n0 0 1\n0 0 0\n").unwrap();

    isolated(dir.path())
        .arg("inspect")
        .arg(dir.path().join("dwi.nii"))
        .args(["--design", "all", "--pe-dir", "AP"])
        .assert()
        .code(2);
}

// =============================================================================
// RUN SUBCOMMAND
// =============================================================================

#[test]
fn test_run_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    isolated(dir.path())
        .arg("run")
        .arg(dir.path().join("missing.nii"))
        .arg(dir.path().join("out.nii"))
        .args(["--design", "none"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing.nii"));
}

#[test]
fn test_run_rejects_reserved_eddy_option() {
    let dir = tempfile::tempdir().unwrap();
    write_dwi(dir.path());
    isolated(dir.path())
        .arg("run")
        .arg(dir.path().join("dwi.nii"))
        .arg(dir.path().join("out.nii"))
        .args(["--design", "none", "--eddy-options", "--imain=other.nii"])
        .assert()
        .code(2);
}

#[test]
fn test_run_reports_missing_tools() {
    let dir = tempfile::tempdir().unwrap();
    write_dwi(dir.path());
    isolated(dir.path())
        .arg("run")
        .arg(dir.path().join("dwi.nii"))
        .arg(dir.path().join("out.nii"))
        .args(["--design", "none", "--tool", "eddy=/nonexistent/eddy"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));
    assert!(!dir.path().join("out.nii").exists());
}

#[test]
fn test_run_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    write_dwi(dir.path());
    std::fs::write(dir.path().join("out.nii"), b"").unwrap();
    isolated(dir.path())
        .arg("run")
        .arg(dir.path().join("dwi.nii"))
        .arg(dir.path().join("out.nii"))
        .args(["--design", "none"])
        .assert()
        .code(2);
}
