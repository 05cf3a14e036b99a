use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// File, relative to the scratch directory, collecting stage timings.
pub const TIMING_LOG: &str = "timings.log";

/// Logs the duration of a pipeline stage when dropped
pub struct StageTimer {
    label: String,
    log_path: Option<PathBuf>,
    start: Instant,
}

impl StageTimer {
    pub fn new(label: impl Into<String>, scratch: Option<&Path>) -> Self {
        Self {
            label: label.into(),
            log_path: scratch.map(|dir| dir.join(TIMING_LOG)),
            start: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        log::info!("[TIMING] {} - {:.3}ms", self.label, elapsed_ms);

        if let Some(path) = &self.log_path {
            if let Err(e) = append_timing(path, &self.label, elapsed_ms) {
                log::warn!("Failed to write timing log: {}", e);
            }
        }
    }
}

fn append_timing(path: &Path, label: &str, duration_ms: f64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let timestamp = chrono::Utc::now().to_rfc3339();
    writeln!(file, "{} | {} | {:.3}ms", timestamp, label, duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_appends_line_per_stage() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _a = StageTimer::new("eddy", Some(dir.path()));
            let _b = StageTimer::new("topup", Some(dir.path()));
        }
        let content = std::fs::read_to_string(dir.path().join(TIMING_LOG)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l.contains("| eddy |")));
    }

    #[test]
    fn test_timer_without_scratch_only_logs() {
        let _timer = StageTimer::new("metadata", None);
    }
}
