use crate::cli::RunArgs;
use crate::exit_codes;
use crate::output;
use crate::params;
use dwi_rs::{CorrectionOrchestrator, SubprocessRunner, ToolPaths};

pub async fn execute(args: RunArgs) -> i32 {
    let config = match params::build_config(&args) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    // Configuration errors take precedence over missing tools.
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return exit_codes::for_error(&e);
    }

    let paths = ToolPaths::from_env(config.tool_paths.clone(), config.eddy_variant);
    let runner = SubprocessRunner::new(paths);
    if let Err(e) = runner.check_available(&params::required_tools(&config)) {
        eprintln!("Error: {}", e);
        return exit_codes::TOOL_NOT_FOUND;
    }

    if !args.quiet {
        eprintln!(
            "Correcting {} (design: {})...",
            config.input.display(),
            config.design
        );
    }

    match CorrectionOrchestrator::new(config, runner).run().await {
        Ok(report) => {
            if !args.quiet {
                for line in output::warning_lines(&report.warnings) {
                    eprintln!("{}", line);
                }
                eprintln!("{}", output::run_summary(&report));
            }
            if !output::emit(&report, args.compact, args.report.as_deref()) {
                return exit_codes::EXECUTION_ERROR;
            }
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("Correction failed: {}", e);
            exit_codes::for_error(&e)
        }
    }
}
