use crate::cli::{AcquisitionArgs, RunArgs};
use dwi_rs::config::{self, EddyVariant};
use dwi_rs::tools::Tool;
use dwi_rs::{AcquisitionDesign, PreprocConfig, QcMode, ToolOptions};
use std::path::PathBuf;

pub fn parse_design(s: &str) -> Result<AcquisitionDesign, String> {
    AcquisitionDesign::from_str(s).ok_or_else(|| {
        format!(
            "Unknown acquisition design '{}'. Valid designs: none, pair, all, header",
            s
        )
    })
}

pub fn parse_eddy_variant(s: &str) -> Result<EddyVariant, String> {
    EddyVariant::from_str(s).ok_or_else(|| {
        format!(
            "Unknown eddy variant '{}'. Valid variants: auto, cuda, openmp, cpu",
            s
        )
    })
}

/// Parse "NAME=PATH" into a tool name and its executable path.
pub fn parse_tool_path(s: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid tool location '{}': expected NAME=PATH", s))?;
    let name = name.trim();
    if !Tool::ALL.iter().any(|t| t.name() == name) {
        let known: Vec<&str> = Tool::ALL.iter().map(|t| t.name()).collect();
        return Err(format!(
            "Unknown tool '{}'. Known tools: {}",
            name,
            known.join(", ")
        ));
    }
    if path.trim().is_empty() {
        return Err(format!("Invalid tool location '{}': empty path", s));
    }
    Ok((name.to_string(), PathBuf::from(path.trim())))
}

fn file_pair(files: &Option<Vec<PathBuf>>) -> Option<(PathBuf, PathBuf)> {
    match files.as_deref() {
        Some([bvecs, bvals]) => Some((bvecs.clone(), bvals.clone())),
        _ => None,
    }
}

/// Overlay acquisition options onto `config`.
pub fn apply_acquisition(config: &mut PreprocConfig, args: &AcquisitionArgs) -> Result<(), String> {
    if let Some(design) = &args.design {
        config.design = parse_design(design)?;
    }
    if args.pe_dir.is_some() {
        config.pe_dir = args.pe_dir.clone();
    }
    if args.readout_time.is_some() {
        config.readout_time = args.readout_time;
    }
    if args.se_epi.is_some() {
        config.se_epi = args.se_epi.clone();
    }
    config.align_seepi |= args.align_seepi;
    if let Some(pair) = file_pair(&args.fslgrad) {
        config.fslgrad = Some(pair);
    }
    if args.json_import.is_some() {
        config.json_import = args.json_import.clone();
    }
    if let Some(t) = args.bzero_threshold {
        config.bzero_threshold = t;
    }
    if let Some(t) = args.shell_tolerance {
        config.shell_tolerance = t;
    }
    Ok(())
}

/// Assemble the run configuration from an optional JSON file and the
/// command line, the latter taking precedence.
pub fn build_config(args: &RunArgs) -> Result<PreprocConfig, String> {
    let mut config = match &args.config {
        Some(path) => PreprocConfig::from_json_file(path).map_err(|e| e.to_string())?,
        None => {
            let design = args
                .acquisition
                .design
                .as_deref()
                .ok_or("--design is required unless --config is given")?;
            PreprocConfig::new(&args.input, &args.output, parse_design(design)?)
        }
    };
    config.input = args.input.clone();
    config.output = args.output.clone();
    apply_acquisition(&mut config, &args.acquisition)?;

    if let Some(pair) = file_pair(&args.export_fslgrad) {
        config.export_fslgrad = Some(pair);
    }
    if let Some(options) = &args.eddy_options {
        config.eddy_options = ToolOptions(options.clone());
    }
    if let Some(options) = &args.topup_options {
        config.topup_options = ToolOptions(options.clone());
    }
    if args.eddy_mask.is_some() {
        config.eddy_mask = args.eddy_mask.clone();
    }
    if args.topup_files.is_some() {
        config.topup_files = args.topup_files.clone();
    }
    if args.eddy_slspec.is_some() {
        config.eddy_slspec = args.eddy_slspec.clone();
    }
    if let Some(dir) = &args.eddyqc_text {
        config.eddyqc = QcMode::Text;
        config.eddyqc_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.eddyqc_all {
        config.eddyqc = QcMode::All;
        config.eddyqc_dir = Some(dir.clone());
    }
    if args.eddy_variant != "auto" || args.config.is_none() {
        config.eddy_variant = parse_eddy_variant(&args.eddy_variant)?;
    }
    for spec in &args.tools {
        let (name, path) = parse_tool_path(spec)?;
        config.tool_paths.insert(name, path);
    }
    if args.scratch.is_some() {
        config.scratch_root = args.scratch.clone();
    }
    config.keep_scratch |= args.nocleanup;
    config.force |= args.force;
    Ok(config)
}

/// Tools the run needs in every case, checked before any work starts.
/// Resampling of the field-map series is decided later and not included.
pub fn required_tools(config: &PreprocConfig) -> Vec<Tool> {
    let mut tools = Vec::new();
    if config::is_mif(&config.input) || config::is_mif(&config.output) {
        tools.push(Tool::Mrconvert);
    }
    if config.design != AcquisitionDesign::None && config.topup_files.is_none() {
        tools.push(Tool::Topup);
    }
    if config.eddy_mask.is_none() {
        tools.push(Tool::Dwi2mask);
    }
    tools.push(Tool::Eddy);
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["dwipreproc", "run", "dwi.nii", "out.nii"];
        argv.extend_from_slice(extra);
        match crate::cli::Cli::try_parse_from(argv).unwrap().command {
            crate::cli::Command::Run(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_tool_path() {
        assert_eq!(
            parse_tool_path("eddy=/opt/fsl/bin/eddy_cuda").unwrap(),
            ("eddy".to_string(), PathBuf::from("/opt/fsl/bin/eddy_cuda"))
        );
        assert!(parse_tool_path("eddy").is_err());
        assert!(parse_tool_path("bet=/usr/bin/bet").is_err());
        assert!(parse_tool_path("topup=").is_err());
    }

    #[test]
    fn test_build_config_requires_design() {
        assert!(build_config(&run_args(&[])).is_err());
        assert!(build_config(&run_args(&["--design", "sideways"])).is_err());
    }

    #[test]
    fn test_build_config_overrides() {
        let config = build_config(&run_args(&[
            "--design",
            "pair",
            "--se-epi",
            "se.nii",
            "--align-seepi",
            "--eddyqc-all",
            "qc",
            "--eddy-variant",
            "openmp",
            "--nocleanup",
        ]))
        .unwrap();
        assert_eq!(config.design, AcquisitionDesign::Pair);
        assert_eq!(config.se_epi, Some(PathBuf::from("se.nii")));
        assert!(config.align_seepi);
        assert_eq!(config.eddyqc, QcMode::All);
        assert_eq!(config.eddy_variant, EddyVariant::Openmp);
        assert!(config.keep_scratch);
        assert_eq!(config.eddy_options, ToolOptions("--repol".to_string()));
    }

    #[test]
    fn test_build_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"input": "a.nii", "output": "b.nii", "design": "all", "pe_dir": "AP"}"#,
        )
        .unwrap();
        let config = build_config(&run_args(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.design, AcquisitionDesign::All);
        assert_eq!(config.pe_dir.as_deref(), Some("AP"));
        assert_eq!(config.input, PathBuf::from("dwi.nii"));
    }

    #[test]
    fn test_required_tools() {
        let mut config = PreprocConfig::new("dwi.mif", "out.nii", AcquisitionDesign::All);
        assert_eq!(
            required_tools(&config),
            vec![Tool::Mrconvert, Tool::Topup, Tool::Dwi2mask, Tool::Eddy]
        );
        config.input = PathBuf::from("dwi.nii");
        config.design = AcquisitionDesign::None;
        config.eddy_mask = Some(PathBuf::from("mask.nii"));
        assert_eq!(required_tools(&config), vec![Tool::Eddy]);
    }
}
