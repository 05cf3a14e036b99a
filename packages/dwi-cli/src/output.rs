use dwi_rs::{PreprocWarning, RunReport};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Serialize a value to JSON, indented unless `compact`.
fn render<T: Serialize>(value: &T, compact: bool) -> Result<String, String> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    json.map_err(|e| format!("JSON serialization failed: {}", e))
}

/// Write JSON to a report file, creating its directory, or to stdout.
fn write_json(json: &str, report_path: Option<&Path>) -> Result<(), String> {
    match report_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    format!("Failed to create report directory '{}': {}", parent.display(), e)
                })?;
            }
            std::fs::write(path, format!("{}\n", json))
                .map_err(|e| format!("Failed to write report '{}': {}", path.display(), e))
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            writeln!(handle, "{}", json).map_err(|e| format!("Failed to write to stdout: {}", e))
        }
    }
}

/// Serialize and write in one go, reporting failures on stderr.
pub fn emit<T: Serialize>(value: &T, compact: bool, report_path: Option<&Path>) -> bool {
    match render(value, compact).and_then(|json| write_json(&json, report_path)) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Error: {}", e);
            false
        }
    }
}

pub fn warning_lines(warnings: &[PreprocWarning]) -> Vec<String> {
    warnings.iter().map(|w| format!("Warning: {}", w)).collect()
}

/// One-line outcome of a finished run.
pub fn run_summary(report: &RunReport) -> String {
    let mut line = format!(
        "Strategy '{}': {} -> {} volumes written to {}",
        report.strategy,
        report.input_volumes,
        report.output_volumes,
        report.output.display()
    );
    if report.recombined {
        line.push_str(&format!(" ({} pairs recombined)", report.pairs.len()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_creates_report_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        assert!(emit(&serde_json::json!({"strategy": "bzeros"}), true, Some(&path)));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\"strategy\":\"bzeros\"}\n");
    }

    #[test]
    fn test_warning_lines() {
        let lines = warning_lines(&[PreprocWarning::DefaultPhaseEncoding]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Warning: "));
    }
}
