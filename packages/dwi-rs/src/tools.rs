//! External image-processing binaries (FSL, MRtrix3) and how they are run.
//!
//! Every subprocess goes through a [`ToolRunner`]; the pipeline only builds
//! [`ToolInvocation`]s and reads the files the tools leave behind.

use crate::config::{EddyVariant, ToolOptions};
use crate::error::{DwiError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Environment variable pointing at the FSL installation.
pub const FSL_ENV_VAR: &str = "FSLDIR";

/// Environment variable pointing at the MRtrix3 `bin` directory.
pub const MRTRIX_ENV_VAR: &str = "MRTRIX_BIN";

/// Default search paths (in priority order), after `$PATH`.
pub const DEFAULT_TOOL_PATHS: &[&str] = &[
    "/usr/local/fsl/bin",
    "/opt/fsl/bin",
    "/usr/local/mrtrix3/bin",
    "/opt/mrtrix3/bin",
    "~/.local/bin",
    "/usr/local/bin",
    "/usr/bin",
];

/// topup configuration used unless `--config=` is passed through.
pub const TOPUP_DEFAULT_CONFIG: &str = "b02b0.cnf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Mrinfo,
    Mrconvert,
    Mrtransform,
    Dwi2mask,
    Topup,
    Eddy,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::Mrinfo,
        Tool::Mrconvert,
        Tool::Mrtransform,
        Tool::Dwi2mask,
        Tool::Topup,
        Tool::Eddy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Mrinfo => "mrinfo",
            Tool::Mrconvert => "mrconvert",
            Tool::Mrtransform => "mrtransform",
            Tool::Dwi2mask => "dwi2mask",
            Tool::Topup => "topup",
            Tool::Eddy => "eddy",
        }
    }

    pub fn is_fsl(&self) -> bool {
        matches!(self, Tool::Topup | Tool::Eddy)
    }
}

/// One external command: tool, arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ToolInvocation {
    pub fn new(tool: Tool, cwd: &Path) -> Self {
        Self {
            tool,
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    /// `--name=value` style flag.
    pub fn flag(self, name: &str, value: impl AsRef<Path>) -> Self {
        let value = value.as_ref().display().to_string();
        self.arg(format!("{}={}", name, value))
    }

    pub fn options(mut self, options: &ToolOptions) -> Self {
        self.args.extend(options.tokens());
        self
    }

    /// Value of a `--name=value` argument.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.args.iter().find_map(|a| {
            a.split_once('=')
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| v)
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.tool.name().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes external tools; a run never spawns a process any other way.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Resolved locations of the external executables.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    overrides: BTreeMap<String, PathBuf>,
    search_dirs: Vec<PathBuf>,
    eddy_variant: EddyVariant,
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl ToolPaths {
    /// Search order:
    /// 1. Explicit per-tool paths
    /// 2. `$FSLDIR/bin` and `$MRTRIX_BIN`
    /// 3. `$PATH`
    /// 4. Default search paths
    pub fn from_env(overrides: BTreeMap<String, PathBuf>, eddy_variant: EddyVariant) -> Self {
        let mut search_dirs = Vec::new();
        if let Ok(fsldir) = std::env::var(FSL_ENV_VAR) {
            search_dirs.push(expand_path(&fsldir).join("bin"));
        }
        if let Ok(mrtrix) = std::env::var(MRTRIX_ENV_VAR) {
            search_dirs.push(expand_path(&mrtrix));
        }
        if let Some(path) = std::env::var_os("PATH") {
            search_dirs.extend(std::env::split_paths(&path));
        }
        search_dirs.extend(DEFAULT_TOOL_PATHS.iter().map(|p| expand_path(p)));
        Self {
            overrides,
            search_dirs,
            eddy_variant,
        }
    }

    pub fn with_search_dirs(search_dirs: Vec<PathBuf>, eddy_variant: EddyVariant) -> Self {
        Self {
            overrides: BTreeMap::new(),
            search_dirs,
            eddy_variant,
        }
    }

    fn candidates(&self, tool: Tool) -> Vec<&'static str> {
        match tool {
            Tool::Eddy => self.eddy_variant.binary_names().to_vec(),
            other => vec![other.name()],
        }
    }

    pub fn find(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(path) = self.overrides.get(tool.name()) {
            return path.exists().then(|| path.clone());
        }
        self.candidates(tool).into_iter().find_map(|name| {
            self.search_dirs
                .iter()
                .map(|dir| dir.join(name))
                .find(|p| p.is_file())
        })
    }

    pub fn require(&self, tool: Tool) -> Result<PathBuf> {
        self.find(tool).ok_or_else(|| {
            DwiError::ToolNotFound(format!(
                "'{}' not found (searched ${}, ${}, $PATH and {:?})",
                self.candidates(tool).join("' / '"),
                FSL_ENV_VAR,
                MRTRIX_ENV_VAR,
                DEFAULT_TOOL_PATHS
            ))
        })
    }

    /// Resolution of every known tool, for reporting.
    pub fn report(&self) -> Vec<(Tool, Option<PathBuf>)> {
        Tool::ALL.iter().map(|&t| (t, self.find(t))).collect()
    }
}

/// Runs tools as child processes with tokio.
pub struct SubprocessRunner {
    paths: ToolPaths,
}

impl SubprocessRunner {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    /// Fail early if any tool this run will need is missing.
    pub fn check_available(&self, tools: &[Tool]) -> Result<()> {
        for &tool in tools {
            self.paths.require(tool)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ToolRunner for SubprocessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let binary = self.paths.require(invocation.tool)?;
        let mut command = Command::new(&binary);
        command.args(&invocation.args).current_dir(&invocation.cwd);
        if invocation.tool.is_fsl() {
            command.env("FSLOUTPUTTYPE", "NIFTI");
        }

        log::debug!("Executing: {}", invocation.command_line());
        let start_time = std::time::Instant::now();
        let output = command.output().await.map_err(|e| DwiError::ExternalTool {
            tool: invocation.tool.name().to_string(),
            status: "not started".to_string(),
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            log::error!("{} failed with status: {}", invocation.tool.name(), output.status);
            log::error!("stdout: {}", stdout);
            log::error!("stderr: {}", stderr);
            return Err(DwiError::ExternalTool {
                tool: invocation.tool.name().to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }

        log::info!(
            "{} completed in {:.2}s",
            invocation.tool.name(),
            start_time.elapsed().as_secs_f64()
        );
        Ok(ToolOutput { stdout, stderr })
    }
}

// =============================================================================
// COMMAND BUILDERS
// =============================================================================

pub fn mrinfo_json(cwd: &Path, image: &Path, json_out: &Path) -> ToolInvocation {
    ToolInvocation::new(Tool::Mrinfo, cwd)
        .arg(image)
        .arg("-json_all")
        .arg(json_out)
}

/// `.mif` to NIfTI, exporting the gradient table and header key/values.
pub fn mrconvert_import(
    cwd: &Path,
    input: &Path,
    output: &Path,
    grad: Option<(&Path, &Path)>,
    json_out: &Path,
) -> ToolInvocation {
    let mut inv = ToolInvocation::new(Tool::Mrconvert, cwd).arg(input).arg(output);
    if let Some((bvecs, bvals)) = grad {
        inv = inv.arg("-export_grad_fsl").arg(bvecs).arg(bvals);
    }
    inv.arg("-json_export").arg(json_out).arg("-force")
}

/// NIfTI plus FSL gradients to `.mif`.
pub fn mrconvert_export(
    cwd: &Path,
    input: &Path,
    output: &Path,
    bvecs: &Path,
    bvals: &Path,
) -> ToolInvocation {
    ToolInvocation::new(Tool::Mrconvert, cwd)
        .arg(input)
        .arg(output)
        .arg("-fslgrad")
        .arg(bvecs)
        .arg(bvals)
        .arg("-force")
}

/// Resample onto the grid of `template` with sinc interpolation.
pub fn mrtransform_regrid(cwd: &Path, input: &Path, template: &Path, output: &Path) -> ToolInvocation {
    ToolInvocation::new(Tool::Mrtransform, cwd)
        .arg(input)
        .arg(output)
        .arg("-template")
        .arg(template)
        .arg("-interp")
        .arg("sinc")
        .arg("-force")
}

pub fn dwi2mask(cwd: &Path, input: &Path, bvecs: &Path, bvals: &Path, output: &Path) -> ToolInvocation {
    ToolInvocation::new(Tool::Dwi2mask, cwd)
        .arg(input)
        .arg(output)
        .arg("-fslgrad")
        .arg(bvecs)
        .arg(bvals)
        .arg("-force")
}

pub struct TopupFiles<'a> {
    pub imain: &'a Path,
    pub datain: &'a Path,
    pub out_prefix: &'a Path,
    pub fout: &'a Path,
    pub iout: &'a Path,
}

pub fn topup(cwd: &Path, files: &TopupFiles<'_>, options: &ToolOptions) -> ToolInvocation {
    let mut inv = ToolInvocation::new(Tool::Topup, cwd)
        .flag("--imain", files.imain)
        .flag("--datain", files.datain)
        .flag("--out", files.out_prefix)
        .flag("--fout", files.fout)
        .flag("--iout", files.iout);
    if !options.has("--config") {
        inv = inv.arg(format!("--config={}", TOPUP_DEFAULT_CONFIG));
    }
    inv.arg("--verbose").options(options)
}

pub struct EddyFiles<'a> {
    pub imain: &'a Path,
    pub mask: &'a Path,
    pub acqp: &'a Path,
    pub index: &'a Path,
    pub bvecs: &'a Path,
    pub bvals: &'a Path,
    pub topup: Option<&'a Path>,
    pub slspec: Option<&'a Path>,
    pub out: &'a Path,
}

pub fn eddy(cwd: &Path, files: &EddyFiles<'_>, options: &ToolOptions) -> ToolInvocation {
    let mut inv = ToolInvocation::new(Tool::Eddy, cwd)
        .flag("--imain", files.imain)
        .flag("--mask", files.mask)
        .flag("--acqp", files.acqp)
        .flag("--index", files.index)
        .flag("--bvecs", files.bvecs)
        .flag("--bvals", files.bvals);
    if let Some(prefix) = files.topup {
        inv = inv.flag("--topup", prefix);
    }
    if let Some(slspec) = files.slspec {
        inv = inv.flag("--slspec", slspec);
    }
    inv.flag("--out", files.out).arg("--verbose").options(options)
}
