use crate::cli::InfoArgs;
use crate::exit_codes;
use crate::output;
use crate::params;
use dwi_rs::tools::{DEFAULT_TOOL_PATHS, FSL_ENV_VAR, MRTRIX_ENV_VAR};
use dwi_rs::ToolPaths;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct ToolEntry {
    name: &'static str,
    path: Option<String>,
    found: bool,
}

#[derive(Serialize)]
struct InfoOutput {
    cli_version: String,
    platform: String,
    arch: String,
    fsldir: Option<String>,
    mrtrix_bin: Option<String>,
    tools: Vec<ToolEntry>,
    search_paths: Vec<&'static str>,
}

pub fn execute(args: InfoArgs) -> i32 {
    let variant = match params::parse_eddy_variant(&args.eddy_variant) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    let paths = ToolPaths::from_env(BTreeMap::new(), variant);

    let info = InfoOutput {
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        fsldir: std::env::var(FSL_ENV_VAR).ok(),
        mrtrix_bin: std::env::var(MRTRIX_ENV_VAR).ok(),
        tools: paths
            .report()
            .into_iter()
            .map(|(tool, path)| ToolEntry {
                name: tool.name(),
                found: path.is_some(),
                path: path.map(|p| p.display().to_string()),
            })
            .collect(),
        search_paths: DEFAULT_TOOL_PATHS.to_vec(),
    };

    if args.json {
        if !output::emit(&info, false, None) {
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        println!("dwipreproc CLI v{}", info.cli_version);
        println!("Platform: {} ({})", info.platform, info.arch);
        println!();
        for tool in &info.tools {
            match &tool.path {
                Some(path) => println!("{:<12} {}", tool.name, path),
                None => println!("{:<12} not found", tool.name),
            }
        }
        println!();
        println!(
            "Search paths: ${}/bin, ${}, $PATH, {}",
            FSL_ENV_VAR,
            MRTRIX_ENV_VAR,
            info.search_paths.join(", ")
        );
    }

    exit_codes::SUCCESS
}
