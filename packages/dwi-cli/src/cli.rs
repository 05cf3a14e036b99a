use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dwipreproc",
    version,
    about = "Susceptibility, eddy-current and motion correction for diffusion MRI",
    long_about = "Correct diffusion-weighted images with FSL topup and eddy.\n\
                  Requires FSL (topup, eddy) and MRtrix3 (mrconvert, mrinfo, mrtransform, dwi2mask).\n\
                  Set $FSLDIR and $MRTRIX_BIN or put the tools on $PATH."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the full correction pipeline
    Run(RunArgs),
    /// Resolve phase encoding, strategy and volume pairs without running any correction
    Inspect(InspectArgs),
    /// Show external tool locations
    Info(InfoArgs),
}

/// Options describing how the series was acquired.
#[derive(Args, Clone, Default)]
pub struct AcquisitionArgs {
    /// Acquisition design: none, pair, all or header
    #[arg(long)]
    pub design: Option<String>,

    /// Manual phase-encoding direction (e.g. AP, j-, 0,-1,0)
    #[arg(long)]
    pub pe_dir: Option<String>,

    /// Total readout time in seconds
    #[arg(long)]
    pub readout_time: Option<f64>,

    /// Spin-echo EPI series for field estimation
    #[arg(long)]
    pub se_epi: Option<PathBuf>,

    /// Align the field estimate with the first DWI b=0 volume
    #[arg(long, default_value_t = false)]
    pub align_seepi: bool,

    /// FSL gradient files for NIfTI input
    #[arg(long, num_args = 2, value_names = ["BVECS", "BVALS"])]
    pub fslgrad: Option<Vec<PathBuf>>,

    /// BIDS JSON sidecar for the DWI
    #[arg(long)]
    pub json_import: Option<PathBuf>,

    /// b-value at or below which a volume counts as b=0
    #[arg(long)]
    pub bzero_threshold: Option<f64>,

    /// Largest b-value gap (s/mm²) within one shell
    #[arg(long)]
    pub shell_tolerance: Option<f64>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Input DWI (.nii, .nii.gz or .mif)
    pub input: PathBuf,

    /// Corrected output (.nii, .nii.gz or .mif)
    pub output: PathBuf,

    #[command(flatten)]
    pub acquisition: AcquisitionArgs,

    /// JSON configuration file; command-line options override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the corrected gradient table in FSL format
    #[arg(long, num_args = 2, value_names = ["BVECS", "BVALS"])]
    pub export_fslgrad: Option<Vec<PathBuf>>,

    /// Extra options passed to eddy
    #[arg(long, allow_hyphen_values = true)]
    pub eddy_options: Option<String>,

    /// Extra options passed to topup
    #[arg(long, allow_hyphen_values = true)]
    pub topup_options: Option<String>,

    /// Brain mask for eddy instead of dwi2mask
    #[arg(long)]
    pub eddy_mask: Option<PathBuf>,

    /// Prefix of a precomputed topup result
    #[arg(long)]
    pub topup_files: Option<PathBuf>,

    /// Slice groups for slice-to-volume correction
    #[arg(long)]
    pub eddy_slspec: Option<PathBuf>,

    /// Copy eddy's text QC statistics into this directory
    #[arg(long, conflicts_with = "eddyqc_all")]
    pub eddyqc_text: Option<PathBuf>,

    /// Copy all eddy QC output and field images into this directory
    #[arg(long)]
    pub eddyqc_all: Option<PathBuf>,

    /// eddy build to use: auto, cuda, openmp or cpu
    #[arg(long, default_value = "auto")]
    pub eddy_variant: String,

    /// Explicit tool location as NAME=PATH (e.g. eddy=/opt/fsl/bin/eddy_cuda)
    #[arg(long = "tool", num_args = 1..)]
    pub tools: Vec<String>,

    /// Parent directory of the scratch directory
    #[arg(long, env = "DWIPREPROC_SCRATCH")]
    pub scratch: Option<PathBuf>,

    /// Keep the scratch directory after a successful run
    #[arg(long, default_value_t = false)]
    pub nocleanup: bool,

    /// Overwrite existing output files
    #[arg(short, long, default_value_t = false)]
    pub force: bool,

    /// Write the run report to this file (default: stdout)
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Input DWI (.nii, .nii.gz or .mif)
    pub input: PathBuf,

    #[command(flatten)]
    pub acquisition: AcquisitionArgs,

    /// Extra eddy options, used for shell and slice-to-volume checks
    #[arg(long, allow_hyphen_values = true)]
    pub eddy_options: Option<String>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    /// eddy build to look for: auto, cuda, openmp or cpu
    #[arg(long, default_value = "auto")]
    pub eddy_variant: String,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "dwipreproc",
            "run",
            "dwi.nii",
            "out.mif",
            "--design",
            "all",
            "--pe-dir",
            "AP",
            "--fslgrad",
            "dwi.bvec",
            "dwi.bval",
            "--eddy-options",
            "--slm=linear --repol",
            "--tool",
            "eddy=/opt/eddy",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.acquisition.design.as_deref(), Some("all"));
        assert_eq!(args.acquisition.fslgrad.map(|v| v.len()), Some(2));
        assert_eq!(args.eddy_options.as_deref(), Some("--slm=linear --repol"));
        assert_eq!(args.tools, vec!["eddy=/opt/eddy".to_string()]);
    }

    #[test]
    fn test_qc_modes_conflict() {
        let result = Cli::try_parse_from([
            "dwipreproc",
            "run",
            "dwi.nii",
            "out.nii",
            "--eddyqc-text",
            "qc",
            "--eddyqc-all",
            "qc",
        ]);
        assert!(result.is_err());
    }
}
