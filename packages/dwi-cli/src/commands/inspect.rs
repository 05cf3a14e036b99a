use crate::cli::InspectArgs;
use crate::exit_codes;
use crate::output;
use crate::params;
use dwi_rs::phase_encoding::EddyConfig;
use dwi_rs::plan::Step;
use dwi_rs::resolver::ContrastRescue;
use dwi_rs::{
    read_metadata, resolve_run, AcquisitionDesign, AcquisitionStrategy, DwiError, PreprocConfig,
    PreprocWarning, SubprocessRunner, ToolOptions, ToolPaths, VolumePair,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InspectOutput {
    input: PathBuf,
    dims: [usize; 4],
    voxel_size: [f64; 3],
    design: AcquisitionDesign,
    strategy: AcquisitionStrategy,
    manual_phase_encoding: bool,
    eddy_config: EddyConfig,
    field_map_contrast: bool,
    contrast_rescue: Option<ContrastRescue>,
    shell_bvalues: Vec<f64>,
    first_bzero: usize,
    volume_order: Vec<usize>,
    pairs: Vec<VolumePair>,
    recombine: bool,
    regrid_field_map: bool,
    padded_axes: Vec<usize>,
    steps: Vec<Step>,
    warnings: Vec<PreprocWarning>,
}

pub async fn execute(args: InspectArgs) -> i32 {
    let design = match args.acquisition.design.as_deref().map(params::parse_design) {
        Some(Ok(d)) => d,
        Some(Err(msg)) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
        None => {
            eprintln!("Error: --design is required");
            return exit_codes::INPUT_ERROR;
        }
    };

    let mut config = PreprocConfig::new(&args.input, PathBuf::new(), design);
    if let Err(msg) = params::apply_acquisition(&mut config, &args.acquisition) {
        eprintln!("Error: {}", msg);
        return exit_codes::INPUT_ERROR;
    }
    if let Some(options) = &args.eddy_options {
        config.eddy_options = ToolOptions(options.clone());
    }

    let workdir = std::env::temp_dir().join(format!("dwipreproc-inspect-{}", std::process::id()));
    let result = match std::fs::create_dir_all(&workdir) {
        Ok(()) => inspect(&config, &workdir).await,
        Err(e) => Err(DwiError::from(e)),
    };
    let _ = std::fs::remove_dir_all(&workdir);

    let summary = match result {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    if args.json {
        if !output::emit(&summary, false, None) {
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        print_summary(&summary);
    }
    exit_codes::SUCCESS
}

async fn inspect(config: &PreprocConfig, workdir: &Path) -> dwi_rs::Result<InspectOutput> {
    let runner = SubprocessRunner::new(ToolPaths::from_env(BTreeMap::new(), config.eddy_variant));
    let fslgrad = config
        .fslgrad
        .as_ref()
        .map(|(bvecs, bvals)| (bvecs.as_path(), bvals.as_path()));

    let dwi = read_metadata(
        &runner,
        &config.input,
        config.json_import.as_deref(),
        fslgrad,
        workdir,
    )
    .await?;
    dwi.validate_dwi()?;
    let field_map = match &config.se_epi {
        Some(path) => {
            let meta = read_metadata(&runner, path, None, None, workdir).await?;
            meta.validate_spatial()?;
            Some(meta)
        }
        None => None,
    };

    let (run, warnings) = resolve_run(config, dwi, field_map)?;
    let plan = run.plan();
    let steps = plan
        .topological_order()?
        .into_iter()
        .map(|i| plan.nodes[i].step)
        .collect();

    Ok(InspectOutput {
        input: config.input.clone(),
        dims: run.dwi.dims,
        voxel_size: run.dwi.voxel_size,
        design: run.design,
        strategy: run.strategy,
        manual_phase_encoding: run.phase_encoding.manual,
        eddy_config: run.phase_encoding.dwi_scheme.to_eddy_config(),
        field_map_contrast: run.phase_encoding.field_map_contrast,
        contrast_rescue: run.phase_encoding.rescue,
        shell_bvalues: run.shells.shell_bvalues.clone(),
        first_bzero: run.first_bzero,
        volume_order: run.permutation.forward.clone(),
        pairs: run.pairs.clone().unwrap_or_default(),
        recombine: run.recombine,
        regrid_field_map: run.regrid_field_map,
        padded_axes: run.padding.axes.clone(),
        steps,
        warnings: warnings.into_vec(),
    })
}

fn print_summary(summary: &InspectOutput) {
    println!("Input: {}", summary.input.display());
    println!(
        "Dimensions: {:?} (voxel size {:?})",
        summary.dims, summary.voxel_size
    );
    println!("Design: {} -> strategy: {}", summary.design, summary.strategy);
    println!(
        "Phase encoding ({}):",
        if summary.manual_phase_encoding {
            "manual"
        } else {
            "header"
        }
    );
    for (i, row) in summary.eddy_config.config.iter().enumerate() {
        println!("  {}: {}", i + 1, row.to_line());
    }
    if let Some(rescue) = summary.contrast_rescue {
        println!("Field-map contrast rescued with DWI b=0 volumes ({:?})", rescue);
    }
    println!("Shells: {:?}", summary.shell_bvalues);
    println!("First b=0 volume: {}", summary.first_bzero);
    if summary.pairs.is_empty() {
        println!("Volume pairs: none");
    } else {
        let pairs: Vec<String> = summary
            .pairs
            .iter()
            .map(|p| format!("{}+{}", p.first, p.second))
            .collect();
        println!("Volume pairs: {}", pairs.join(" "));
    }
    println!("Recombination: {}", if summary.recombine { "yes" } else { "no" });
    if !summary.padded_axes.is_empty() {
        println!("Padded axes: {:?}", summary.padded_axes);
    }
    let steps: Vec<String> = summary.steps.iter().map(|s| format!("{:?}", s)).collect();
    println!("Steps: {}", steps.join(" -> "));
    for line in output::warning_lines(&summary.warnings) {
        println!("{}", line);
    }
}
