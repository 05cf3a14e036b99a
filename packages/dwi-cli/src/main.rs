use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;
mod params;

use cli::Cli;

/// Level for the pipeline's own log records; dependencies stay at warn.
fn pipeline_log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn init_logging(verbose: u8) {
    let level = pipeline_log_level(verbose);
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("dwi_rs", level)
        .filter_module("dwipreproc", level)
        .parse_default_env()
        .format_timestamp(None)
        .format_target(verbose >= 2)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match cli.command {
        cli::Command::Run(args) => commands::run::execute(args).await,
        cli::Command::Inspect(args) => commands::inspect::execute(args).await,
        cli::Command::Info(args) => commands::info::execute(args),
    };

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(pipeline_log_level(0), log::LevelFilter::Warn);
        assert_eq!(pipeline_log_level(1), log::LevelFilter::Info);
        assert_eq!(pipeline_log_level(2), log::LevelFilter::Debug);
        assert_eq!(pipeline_log_level(7), log::LevelFilter::Trace);
    }
}
