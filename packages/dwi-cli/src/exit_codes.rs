//! Process exit codes shared by all subcommands.

use dwi_rs::{DwiError, ErrorKind};

pub const SUCCESS: i32 = 0;
/// An external tool failed or produced unusable output.
pub const EXECUTION_ERROR: i32 = 1;
/// Invalid arguments, configuration or image metadata.
pub const INPUT_ERROR: i32 = 2;
pub const TOOL_NOT_FOUND: i32 = 3;

pub fn for_error(error: &DwiError) -> i32 {
    if matches!(error, DwiError::ToolNotFound(_)) {
        return TOOL_NOT_FOUND;
    }
    match error.kind() {
        ErrorKind::Configuration | ErrorKind::Metadata | ErrorKind::Matching => INPUT_ERROR,
        ErrorKind::ExternalTool => EXECUTION_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(for_error(&DwiError::config("bad")), INPUT_ERROR);
        assert_eq!(for_error(&DwiError::OddVolumeCount(3)), INPUT_ERROR);
        assert_eq!(for_error(&DwiError::ToolNotFound("eddy".into())), TOOL_NOT_FOUND);
        assert_eq!(
            for_error(&DwiError::ExternalTool {
                tool: "topup".into(),
                status: "exit status: 1".into(),
                stderr: String::new(),
            }),
            EXECUTION_ERROR
        );
    }
}
