//! One correction run from input image to exported output.
//!
//! The run is resolved first (metadata, phase encoding, strategy,
//! pairing), using nothing but image headers. The resolved run then
//! fixes a [`PipelinePlan`], which is executed node by node.

use crate::config::{self, PreprocConfig, QcMode};
use crate::error::{DwiError, Result};
use crate::field_input::{FieldEstimationInputBuilder, SpatialPadding};
use crate::gradient::{self, ShellAssignment, ASYMMETRY_THRESHOLD};
use crate::image;
use crate::matcher;
use crate::metadata::{self, ImageMetadata};
use crate::permutation::{self, VolumePermutation};
use crate::phase_encoding::PeScheme;
use crate::plan::{Artifact, PipelinePlan, PlanNode, PlanShape, Step, EDDY_PREFIX, FIELD_PREFIX};
use crate::qc;
use crate::recombine::{self, VolumeRecombiner};
use crate::resolver::{PhaseEncodingResolver, ResolvedPhaseEncoding};
use crate::slice_timing::SliceGroups;
use crate::strategy::{self, StrategyInputs};
use crate::timing::StageTimer;
use crate::tools::{self, EddyFiles, Tool, ToolRunner, TopupFiles};
use crate::types::{
    AcquisitionDesign, AcquisitionStrategy, GradientTable, PreprocWarning, VolumePair, Warnings,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Progress of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    MetadataExamined,
    StrategySelected,
    FieldEstimationInputBuilt,
    FieldEstimated,
    EddyMaskBuilt,
    EddyCorrected,
    Recombined,
    Exported,
}

/// Output of an earlier topup run, given as its `--out` prefix.
#[derive(Debug, Clone, Serialize)]
pub struct PrecomputedField {
    pub fieldcoef: PathBuf,
    pub movpar: PathBuf,
    /// `<prefix>_field.nii[.gz]`, needed for volume recombination.
    pub field_map: Option<PathBuf>,
}

impl PrecomputedField {
    pub fn locate(prefix: &Path) -> Result<Self> {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        let fieldcoef = image::find_nifti(&with_suffix("_fieldcoef"))
            .ok_or_else(|| DwiError::FileNotFound(with_suffix("_fieldcoef.nii")))?;
        let movpar = with_suffix("_movpar.txt");
        if !movpar.exists() {
            return Err(DwiError::FileNotFound(movpar));
        }
        Ok(Self {
            fieldcoef,
            movpar,
            field_map: image::find_nifti(&with_suffix("_field")),
        })
    }
}

/// Every decision of a run, made before any heavy processing starts.
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub design: AcquisitionDesign,
    pub strategy: AcquisitionStrategy,
    pub dwi: ImageMetadata,
    pub field_map: Option<ImageMetadata>,
    pub gradients: GradientTable,
    pub shells: ShellAssignment,
    pub phase_encoding: ResolvedPhaseEncoding,
    pub first_bzero: usize,
    pub permutation: VolumePermutation,
    pub pairs: Option<Vec<VolumePair>>,
    pub recombine: bool,
    pub regrid_field_map: bool,
    pub precomputed: Option<PrecomputedField>,
    pub padding: SpatialPadding,
    pub slice_groups: Option<SliceGroups>,
    pub qc: QcMode,
}

impl ResolvedRun {
    pub fn shape(&self) -> PlanShape {
        PlanShape {
            strategy: self.strategy,
            regrid_field_map: self.regrid_field_map,
            precomputed_field: self.precomputed.is_some(),
            precomputed_field_map: self
                .precomputed
                .as_ref()
                .map_or(false, |p| p.field_map.is_some()),
            slice_to_volume: self.slice_groups.is_some(),
            recombine: self.recombine,
            qc: self.qc,
        }
    }

    pub fn plan(&self) -> PipelinePlan {
        PipelinePlan::from_shape(&self.shape())
    }
}

/// Resolve phase encoding, strategy, permutation and pairing from image
/// metadata alone. No external tool runs here.
pub fn resolve_run(
    config: &PreprocConfig,
    dwi: ImageMetadata,
    field_map: Option<ImageMetadata>,
) -> Result<(ResolvedRun, Warnings)> {
    let mut warnings = Warnings::new();
    let threshold = config.bzero_threshold;
    let gradients = dwi.gradient_table()?.clone();
    let num_volumes = dwi.num_volumes();

    let resolver = PhaseEncodingResolver::new(config.design, config.align_seepi, threshold);
    let phase_encoding =
        resolver.resolve(&dwi, field_map.as_ref(), config.manual_phase_encoding()?)?;
    warnings.absorb(&phase_encoding.warnings);

    let strategy = strategy::select(StrategyInputs {
        design: config.design,
        has_field_map: field_map.is_some(),
        field_map_contrast: phase_encoding.field_map_contrast,
        align_seepi: config.align_seepi,
    })?;
    if config.align_seepi && !strategy::alignment_applies(config.design) {
        warnings.push(PreprocWarning::AlignSeepiIgnored);
    }

    let leads_with_dwi_bzero = matches!(
        strategy,
        AcquisitionStrategy::SeEpiConcatFirstBzero
            | AcquisitionStrategy::SeEpiConcatAllBzeros
            | AcquisitionStrategy::Bzeros
    );
    let (first_bzero, permutation) = if leads_with_dwi_bzero {
        let first = permutation::locate_first_bzero(&gradients, threshold)?;
        (first, VolumePermutation::bring_to_front(num_volumes, first)?)
    } else {
        (
            permutation::locate_first_bzero(&gradients, threshold).unwrap_or(0),
            VolumePermutation::from_forward((0..num_volumes).collect()),
        )
    };
    if !permutation.is_identity() {
        log::info!(
            "First b=0 volume is {}; moving it to the front for eddy",
            first_bzero
        );
    }

    let shells = ShellAssignment::from_table(&gradients, threshold, config.shell_tolerance);
    let asymmetric: Vec<f64> = gradient::shell_asymmetries(&gradients, &shells)
        .into_iter()
        .filter(|&(_, asym)| asym > ASYMMETRY_THRESHOLD)
        .map(|(b, _)| b)
        .collect();
    if !asymmetric.is_empty() && !config.eddy_options.has("--slm") {
        warnings.push(PreprocWarning::AsymmetricShells { bvalues: asymmetric });
    }

    let pairs = if phase_encoding.dwi_scheme.has_contrast() {
        match matcher::match_pairs(&gradients, &shells, &phase_encoding.dwi_scheme) {
            Ok(pairs) => {
                log::info!("Found {} reversed phase-encoding volume pairs", pairs.len());
                Some(pairs)
            }
            Err(e) if config.design == AcquisitionDesign::All => return Err(e),
            Err(e) => {
                warnings.push(PreprocWarning::RecombinationSkipped {
                    reason: e.to_string(),
                });
                None
            }
        }
    } else {
        None
    };

    let precomputed = config
        .topup_files
        .as_deref()
        .map(PrecomputedField::locate)
        .transpose()?;
    let field_map_available = match &precomputed {
        Some(p) => p.field_map.is_some(),
        None => strategy.estimates_field(),
    };
    let recombine = pairs.is_some() && field_map_available;
    if pairs.is_some() && !field_map_available {
        warnings.push(PreprocWarning::RecombinationSkipped {
            reason: "no off-resonance field map is available".to_string(),
        });
    }

    let padding = if strategy.estimates_field() || precomputed.is_some() {
        SpatialPadding::for_dims(dwi.dims)
    } else {
        SpatialPadding::none(dwi.dims)
    };
    if !padding.is_empty() {
        log::info!("Padding odd spatial axes {:?} by one slice", padding.axes);
    }

    let regrid_field_map = field_map
        .as_ref()
        .map_or(false, |f| f.requires_regrid(&dwi));

    let slice_groups = if config.eddy_options.slice_to_volume() {
        Some(slice_groups(config, &dwi, &padding)?)
    } else {
        None
    };

    Ok((
        ResolvedRun {
            design: config.design,
            strategy,
            dwi,
            field_map,
            gradients,
            shells,
            phase_encoding,
            first_bzero,
            permutation,
            pairs,
            recombine,
            regrid_field_map,
            precomputed,
            padding,
            slice_groups,
            qc: config.eddyqc,
        },
        warnings,
    ))
}

fn slice_groups(
    config: &PreprocConfig,
    dwi: &ImageMetadata,
    padding: &SpatialPadding,
) -> Result<SliceGroups> {
    let axis = dwi.slice_encoding_axis()?;
    let num_slices = dwi.dims[axis];
    let groups = match &config.eddy_slspec {
        Some(path) => {
            let groups = SliceGroups::read(path)?;
            groups.validate(num_slices)?;
            if padding.axes.contains(&axis) {
                groups.with_padded_slice()
            } else {
                groups
            }
        }
        None => {
            let timing = dwi.slice_timing()?.ok_or_else(|| {
                DwiError::metadata(
                    "Slice-to-volume correction (--mporder) requires SliceTiming in the DWI header or a slice specification file",
                )
            })?;
            if timing.len() != num_slices {
                return Err(DwiError::metadata(format!(
                    "SliceTiming has {} entries but the slice axis has {} slices",
                    timing.len(),
                    num_slices
                )));
            }
            SliceGroups::from_timing(&padding.pad_slice_timing(&timing, axis))?
        }
    };
    Ok(groups)
}

/// Header metadata of an image without importing it; `.mif` headers are
/// read through mrinfo with its JSON written under `workdir`.
pub async fn read_metadata<R: ToolRunner>(
    runner: &R,
    path: &Path,
    sidecar: Option<&Path>,
    fslgrad: Option<(&Path, &Path)>,
    workdir: &Path,
) -> Result<ImageMetadata> {
    if !config::is_mif(path) {
        return ImageMetadata::from_nifti(path, sidecar, fslgrad);
    }
    if !path.exists() {
        return Err(DwiError::FileNotFound(path.to_path_buf()));
    }
    let json_path = workdir.join("mrinfo.json");
    runner
        .run(&tools::mrinfo_json(workdir, path, &json_path))
        .await?;
    require_output(&json_path, Tool::Mrinfo)?;
    let mut meta = ImageMetadata::from_mrinfo_json(path, &std::fs::read_to_string(&json_path)?)?;
    if let Some((bvecs, bvals)) = fslgrad {
        meta.gradients = Some(gradient::read_fsl(bvecs, bvals)?);
    }
    if let Some(sidecar) = sidecar {
        let content = std::fs::read_to_string(sidecar)?;
        if let serde_json::Value::Object(map) = serde_json::from_str(&content)? {
            meta.keyval.extend(map);
        }
    }
    Ok(meta)
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub design: AcquisitionDesign,
    pub strategy: AcquisitionStrategy,
    pub input: PathBuf,
    pub output: PathBuf,
    pub input_volumes: usize,
    pub output_volumes: usize,
    pub first_bzero: usize,
    pub pairs: Vec<VolumePair>,
    pub recombined: bool,
    pub padded_axes: Vec<usize>,
    pub states: Vec<RunState>,
    pub steps: Vec<Step>,
    pub warnings: Vec<PreprocWarning>,
    pub gradient_files: Option<(PathBuf, PathBuf)>,
    pub qc_files: Vec<PathBuf>,
    /// Set when the scratch directory was kept.
    pub scratch_dir: Option<PathBuf>,
}

/// Mutable results carried between plan nodes.
#[derive(Default)]
struct Execution {
    corrected_gradients: Option<GradientTable>,
    result_gradients: Option<GradientTable>,
    recombined: bool,
    qc_files: Vec<PathBuf>,
    gradient_files: Option<(PathBuf, PathBuf)>,
    steps: Vec<Step>,
}

pub struct CorrectionOrchestrator<R: ToolRunner> {
    config: PreprocConfig,
    runner: R,
    states: Vec<RunState>,
    warnings: Warnings,
}

impl<R: ToolRunner> CorrectionOrchestrator<R> {
    pub fn new(config: PreprocConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            states: vec![RunState::Init],
            warnings: Warnings::new(),
        }
    }

    /// Execute the whole run. The scratch directory is removed on success
    /// unless `keep_scratch` is set, and kept for inspection on failure.
    pub async fn run(mut self) -> Result<RunReport> {
        self.config.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let scratch_root = self
            .config
            .scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let scratch = scratch_root.join(format!("dwipreproc-{}", run_id));
        std::fs::create_dir_all(&scratch)?;
        log::info!("Scratch directory: {}", scratch.display());

        match self.run_in(&scratch, run_id, started_at).await {
            Ok(mut report) => {
                if self.config.keep_scratch {
                    report.scratch_dir = Some(scratch);
                } else if let Err(e) = std::fs::remove_dir_all(&scratch) {
                    log::warn!("Failed to remove scratch directory {}: {}", scratch.display(), e);
                }
                Ok(report)
            }
            Err(e) => {
                log::error!("Run failed: {}", e);
                log::warn!("Scratch directory retained: {}", scratch.display());
                Err(e)
            }
        }
    }

    async fn run_in(
        &mut self,
        scratch: &Path,
        run_id: String,
        started_at: DateTime<Utc>,
    ) -> Result<RunReport> {
        let (dwi, field_map) = {
            let _timer = StageTimer::new("examine metadata", Some(scratch));
            self.examine(scratch).await?
        };
        self.enter(RunState::MetadataExamined);

        let (run, warnings) = resolve_run(&self.config, dwi, field_map)?;
        self.warnings.absorb(warnings.items());
        self.enter(RunState::StrategySelected);

        let plan = run.plan();
        let order = plan.topological_order()?;
        let releases = plan.release_schedule(&order);

        let mut exec = Execution::default();
        for (position, &index) in order.iter().enumerate() {
            let node = &plan.nodes[index];
            {
                let _timer = StageTimer::new(format!("{:?}", node.step), Some(scratch));
                self.execute(node, &run, scratch, &mut exec).await?;
            }
            exec.steps.push(node.step);
            if !self.config.keep_scratch {
                release(scratch, &releases[position]);
            }
        }

        let output_volumes = exec
            .result_gradients
            .as_ref()
            .or(exec.corrected_gradients.as_ref())
            .map_or(0, GradientTable::len);

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            design: run.design,
            strategy: run.strategy,
            input: self.config.input.clone(),
            output: self.config.output.clone(),
            input_volumes: run.dwi.num_volumes(),
            output_volumes,
            first_bzero: run.first_bzero,
            pairs: run.pairs.clone().unwrap_or_default(),
            recombined: exec.recombined,
            padded_axes: run.padding.axes.clone(),
            states: self.states.clone(),
            steps: exec.steps,
            warnings: self.warnings.items().to_vec(),
            gradient_files: exec.gradient_files,
            qc_files: exec.qc_files,
            scratch_dir: None,
        })
    }

    fn enter(&mut self, state: RunState) {
        log::info!("State: {:?}", state);
        self.states.push(state);
    }

    /// Import the DWI and the field-map series into the scratch directory
    /// as NIfTI and read their metadata.
    async fn examine(&self, scratch: &Path) -> Result<(ImageMetadata, Option<ImageMetadata>)> {
        let fslgrad = self
            .config
            .fslgrad
            .as_ref()
            .map(|(bvecs, bvals)| (bvecs.as_path(), bvals.as_path()));
        let dwi = self
            .import_image(
                &self.config.input,
                Artifact::Dwi,
                true,
                self.config.json_import.as_deref(),
                fslgrad,
                scratch,
            )
            .await?;
        dwi.validate_dwi()?;
        log::info!(
            "DWI {}: dims {:?}, voxel size {:?}",
            self.config.input.display(),
            dwi.dims,
            dwi.voxel_size
        );

        let field_map = match &self.config.se_epi {
            Some(path) => {
                let meta = self
                    .import_image(path, Artifact::FieldMapRaw, false, None, None, scratch)
                    .await?;
                meta.validate_spatial()?;
                Some(meta)
            }
            None => None,
        };
        Ok((dwi, field_map))
    }

    async fn import_image(
        &self,
        source: &Path,
        artifact: Artifact,
        with_gradients: bool,
        sidecar: Option<&Path>,
        fslgrad: Option<(&Path, &Path)>,
        scratch: &Path,
    ) -> Result<ImageMetadata> {
        let dest = scratch_path(scratch, artifact);
        if config::is_mif(source) {
            let json = dest.with_extension("json");
            let grad = with_gradients.then(|| (dest.with_extension("bvec"), dest.with_extension("bval")));
            let grad_refs = grad.as_ref().map(|(v, b)| (v.as_path(), b.as_path()));
            let inv = tools::mrconvert_import(scratch, source, &dest, grad_refs, &json);
            self.runner.run(&inv).await?;
            require_output(&dest, Tool::Mrconvert)?;
            let sidecar = sidecar.or_else(|| json.exists().then_some(json.as_path()));
            let fslgrad = fslgrad.or(grad_refs);
            ImageMetadata::from_nifti(&dest, sidecar, fslgrad)
        } else {
            let mut meta = ImageMetadata::from_nifti(source, sidecar, fslgrad)?;
            image::write_nifti(&dest, &image::read_nifti(source)?)?;
            meta.path = dest;
            Ok(meta)
        }
    }

    async fn execute(
        &mut self,
        node: &PlanNode,
        run: &ResolvedRun,
        scratch: &Path,
        exec: &mut Execution,
    ) -> Result<()> {
        let path = |artifact: Artifact| scratch_path(scratch, artifact);
        log::info!("Step: {:?}", node.step);

        match node.step {
            Step::RegridFieldMap => {
                let output = path(Artifact::FieldMapOnGrid);
                let inv = tools::mrtransform_regrid(
                    scratch,
                    &path(Artifact::FieldMapRaw),
                    &path(Artifact::Dwi),
                    &output,
                );
                self.runner.run(&inv).await?;
                require_output(&output, Tool::Mrtransform)?;
            }

            Step::PadDwi => {
                let dwi = image::read_nifti(&path(Artifact::Dwi))?;
                image::write_nifti(&path(Artifact::PaddedDwi), &run.padding.pad(&dwi)?)?;
            }

            Step::BuildFieldInput => {
                let dwi = image::read_nifti(&path(Artifact::Dwi))?;
                let series = node
                    .inputs
                    .iter()
                    .find(|a| matches!(a, Artifact::FieldMapRaw | Artifact::FieldMapOnGrid));
                let fmap = series.map(|&a| image::read_nifti(&path(a))).transpose()?;
                let field_map = match (&fmap, &run.phase_encoding.field_map_scheme) {
                    (Some(img), Some(scheme)) => Some((img, scheme)),
                    (Some(_), None) => {
                        return Err(DwiError::MissingPhaseEncoding(
                            "Field-map series has no phase-encoding scheme".to_string(),
                        ))
                    }
                    (None, _) => None,
                };
                let input = FieldEstimationInputBuilder::new(run.strategy, self.config.bzero_threshold)
                    .build(
                        &dwi,
                        &run.phase_encoding.dwi_scheme,
                        &run.gradients,
                        field_map,
                        run.first_bzero,
                    )?;
                image::write_nifti(&path(Artifact::FieldInput), &run.padding.pad(&input.image)?)?;
                std::fs::write(path(Artifact::TopupDatain), input.scheme.to_topup_datain())?;
                self.enter(RunState::FieldEstimationInputBuilt);
            }

            Step::EstimateField => {
                let out_prefix = scratch.join(FIELD_PREFIX);
                let imain = path(Artifact::FieldInput);
                let datain = path(Artifact::TopupDatain);
                let fout = path(Artifact::FieldMap);
                let iout = path(Artifact::FieldCorrected);
                let files = TopupFiles {
                    imain: &imain,
                    datain: &datain,
                    out_prefix: &out_prefix,
                    fout: &fout,
                    iout: &iout,
                };
                self.runner
                    .run(&tools::topup(scratch, &files, &self.config.topup_options))
                    .await?;
                require_output(&path(Artifact::FieldCoefficients), Tool::Topup)?;
                require_output(&fout, Tool::Topup)?;
                self.enter(RunState::FieldEstimated);
            }

            Step::ImportPrecomputedField => {
                let pre = run.precomputed.as_ref().ok_or_else(|| {
                    DwiError::config("No precomputed topup files were supplied")
                })?;
                let coef_name = if pre.fieldcoef.to_string_lossy().ends_with(".gz") {
                    format!("{}_fieldcoef.nii.gz", FIELD_PREFIX)
                } else {
                    format!("{}_fieldcoef.nii", FIELD_PREFIX)
                };
                std::fs::copy(&pre.fieldcoef, scratch.join(coef_name))?;
                std::fs::copy(&pre.movpar, scratch.join(format!("{}_movpar.txt", FIELD_PREFIX)))?;
                if let Some(field_path) = &pre.field_map {
                    let field = image::read_nifti(field_path)?;
                    let expected = run.padding.padded_dims();
                    if field.dims[..3] != expected[..] {
                        return Err(DwiError::metadata(format!(
                            "Precomputed field map {} has dims {:?}; expected {:?}",
                            field_path.display(),
                            &field.dims[..3],
                            expected
                        )));
                    }
                    image::write_nifti(&path(Artifact::FieldMap), &field)?;
                }
                self.enter(RunState::FieldEstimated);
            }

            Step::BuildMask => {
                self.build_mask(run, scratch).await?;
                self.enter(RunState::EddyMaskBuilt);
            }

            Step::PrepareEddy => {
                let dwi = image::read_nifti(&path(Artifact::PaddedDwi))?;
                let forward = &run.permutation.forward;
                image::write_nifti(&path(Artifact::EddyInput), &dwi.select_volumes(forward)?)?;

                let scheme = PeScheme::new(run.permutation.apply(&run.phase_encoding.dwi_scheme.rows));
                let eddy_config = scheme.to_eddy_config();
                std::fs::write(path(Artifact::EddyConfig), eddy_config.config_text())?;
                std::fs::write(path(Artifact::EddyIndices), eddy_config.indices_text())?;

                let (bvecs, bvals) = eddy_gradient_paths(scratch);
                gradient::write_fsl(&run.gradients.reordered(forward), &bvecs, &bvals)?;

                if let Some(groups) = &run.slice_groups {
                    std::fs::write(path(Artifact::SliceSpec), groups.to_text())?;
                }
            }

            Step::RunEddy => {
                let imain = path(Artifact::EddyInput);
                let mask = path(Artifact::Mask);
                let acqp = path(Artifact::EddyConfig);
                let index = path(Artifact::EddyIndices);
                let (bvecs, bvals) = eddy_gradient_paths(scratch);
                let topup = scratch.join(FIELD_PREFIX);
                let slspec = path(Artifact::SliceSpec);
                let out = scratch.join(EDDY_PREFIX);
                let files = EddyFiles {
                    imain: &imain,
                    mask: &mask,
                    acqp: &acqp,
                    index: &index,
                    bvecs: &bvecs,
                    bvals: &bvals,
                    topup: node
                        .inputs
                        .contains(&Artifact::FieldCoefficients)
                        .then_some(topup.as_path()),
                    slspec: node
                        .inputs
                        .contains(&Artifact::SliceSpec)
                        .then_some(slspec.as_path()),
                    out: &out,
                };
                self.runner
                    .run(&tools::eddy(scratch, &files, &self.config.eddy_options))
                    .await?;
                require_output(&path(Artifact::EddyOutput), Tool::Eddy)?;
                self.enter(RunState::EddyCorrected);
            }

            Step::RestoreOrder => {
                let corrected = image::read_nifti(&path(Artifact::EddyOutput))?;
                let n = run.dwi.num_volumes();
                if corrected.num_volumes() != n {
                    return Err(DwiError::ToolOutput {
                        tool: Tool::Eddy.name().to_string(),
                        message: format!(
                            "output has {} volumes; input had {}",
                            corrected.num_volumes(),
                            n
                        ),
                    });
                }
                let restored = run
                    .padding
                    .crop(&corrected.select_volumes(&run.permutation.inverse)?)?;
                image::write_nifti(&path(Artifact::Corrected), &restored)?;

                let permuted = run.gradients.reordered(&run.permutation.forward);
                let rotated_path = scratch.join(Artifact::EddyOutput.files()[1]);
                let rotated = if rotated_path.exists() {
                    let bvecs = std::fs::read_to_string(&rotated_path)?;
                    gradient::parse_fsl(&bvecs, &gradient::format_bvals(&permuted))?
                } else {
                    self.warnings.push(PreprocWarning::MissingRotatedBvecs);
                    permuted
                };
                exec.corrected_gradients =
                    Some(GradientTable::new(run.permutation.apply_inverse(&rotated.rows)));
            }

            Step::Recombine => {
                let corrected = image::read_nifti(&path(Artifact::Corrected))?;
                let (field, warning) =
                    recombine::prepare_field_map(image::read_nifti(&path(Artifact::FieldMap))?)?;
                if let Some(w) = warning {
                    self.warnings.push(w);
                }
                let field = run.padding.crop(&field)?;
                let gradients = exec.corrected_gradients.as_ref().ok_or_else(|| {
                    DwiError::config("Recombination scheduled before eddy output was restored")
                })?;
                let pairs = run.pairs.as_deref().unwrap_or_default();
                let eddy_config = run.phase_encoding.dwi_scheme.to_eddy_config();

                match VolumeRecombiner::recombine(&corrected, pairs, &field, &eddy_config, gradients)? {
                    Some(result) => {
                        image::write_nifti(&path(Artifact::Recombined), &result.image)?;
                        exec.result_gradients = Some(result.gradients);
                        exec.recombined = true;
                        self.enter(RunState::Recombined);
                    }
                    None => {
                        self.warnings.push(PreprocWarning::RecombinationSkipped {
                            reason: "volume pairs do not cover the corrected series".to_string(),
                        });
                        std::fs::copy(path(Artifact::Corrected), path(Artifact::Recombined))?;
                    }
                }
            }

            Step::ExportQc => {
                let dest = self.config.qc_dir().ok_or_else(|| {
                    DwiError::config("An eddy QC mode requires an eddy QC directory")
                })?;
                let extras: Vec<PathBuf> = node
                    .inputs
                    .iter()
                    .filter(|a| {
                        matches!(a, Artifact::Mask | Artifact::FieldMap | Artifact::FieldCorrected)
                    })
                    .map(|&a| path(a))
                    .collect();
                let extra_refs: Vec<&Path> = extras.iter().map(PathBuf::as_path).collect();
                exec.qc_files = qc::export_eddy_qc(
                    self.config.eddyqc,
                    &scratch.join(EDDY_PREFIX),
                    &extra_refs,
                    dest,
                )?;
            }

            Step::Export => {
                let source = node
                    .inputs
                    .first()
                    .map(|&a| path(a))
                    .ok_or_else(|| DwiError::config("Export step has no input"))?;
                let gradients = exec
                    .result_gradients
                    .as_ref()
                    .or(exec.corrected_gradients.as_ref())
                    .ok_or_else(|| DwiError::config("Export scheduled before eddy correction"))?
                    .clone();
                exec.gradient_files = self.export(&source, &gradients, scratch).await?;
                self.enter(RunState::Exported);
            }
        }
        Ok(())
    }

    async fn build_mask(&self, run: &ResolvedRun, scratch: &Path) -> Result<()> {
        let output = scratch_path(scratch, Artifact::Mask);
        if let Some(mask_path) = &self.config.eddy_mask {
            let mask = image::read_nifti(mask_path)?;
            if mask.dims[..3] != run.dwi.dims[..3] {
                return Err(DwiError::metadata(format!(
                    "Mask {} has dims {:?}; DWI has {:?}",
                    mask_path.display(),
                    &mask.dims[..3],
                    &run.dwi.dims[..3]
                )));
            }
            let mask = mask.select_volumes(&[0])?;
            return image::write_nifti(&output, &run.padding.pad(&mask)?);
        }

        let bvecs = scratch.join("mask_in.bvec");
        let bvals = scratch.join("mask_in.bval");
        gradient::write_fsl(&run.gradients, &bvecs, &bvals)?;
        let inv = tools::dwi2mask(
            scratch,
            &scratch_path(scratch, Artifact::PaddedDwi),
            &bvecs,
            &bvals,
            &output,
        );
        self.runner.run(&inv).await?;
        let _ = std::fs::remove_file(&bvecs);
        let _ = std::fs::remove_file(&bvals);
        require_output(&output, Tool::Dwi2mask)
    }

    /// Write the final image and its gradient table. Returns the FSL
    /// gradient files written, if any.
    async fn export(
        &self,
        source: &Path,
        gradients: &GradientTable,
        scratch: &Path,
    ) -> Result<Option<(PathBuf, PathBuf)>> {
        let output = &self.config.output;
        if config::is_mif(output) {
            let bvecs = scratch.join("export.bvec");
            let bvals = scratch.join("export.bval");
            gradient::write_fsl(gradients, &bvecs, &bvals)?;
            self.runner
                .run(&tools::mrconvert_export(scratch, source, output, &bvecs, &bvals))
                .await?;
            require_output(output, Tool::Mrconvert)?;
        } else if output.to_string_lossy().ends_with(".nii.gz") {
            image::write_nifti(output, &image::read_nifti(source)?)?;
        } else {
            std::fs::copy(source, output)?;
        }

        let grad_files = match &self.config.export_fslgrad {
            Some(files) => Some(files.clone()),
            None if !config::is_mif(output) => {
                match (metadata::sibling(output, "bvec"), metadata::sibling(output, "bval")) {
                    (Some(bvecs), Some(bvals)) => Some((bvecs, bvals)),
                    _ => None,
                }
            }
            None => None,
        };
        if let Some((bvecs, bvals)) = &grad_files {
            gradient::write_fsl(gradients, bvecs, bvals)?;
        }
        log::info!(
            "Wrote {} ({} volumes)",
            output.display(),
            gradients.len()
        );
        Ok(grad_files)
    }
}

fn scratch_path(scratch: &Path, artifact: Artifact) -> PathBuf {
    match artifact.files().first() {
        Some(name) => scratch.join(name),
        None => scratch.to_path_buf(),
    }
}

fn eddy_gradient_paths(scratch: &Path) -> (PathBuf, PathBuf) {
    let files = Artifact::EddyGradients.files();
    (scratch.join(files[0]), scratch.join(files[1]))
}

fn require_output(path: &Path, tool: Tool) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(DwiError::ToolOutput {
            tool: tool.name().to_string(),
            message: format!("expected output {} was not created", path.display()),
        })
    }
}

/// Delete the files of artifacts no later step reads.
fn release(scratch: &Path, artifacts: &[Artifact]) {
    for artifact in artifacts {
        for name in artifact.files() {
            for candidate in [scratch.join(name), scratch.join(format!("{}.gz", name))] {
                if candidate.exists() {
                    if let Err(e) = std::fs::remove_file(&candidate) {
                        log::warn!("Failed to remove {}: {}", candidate.display(), e);
                    }
                }
            }
        }
        log::debug!("Released {:?}", artifact);
    }
}
