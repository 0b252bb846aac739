//! CLI error handling and exit codes.
//!
//! Exit codes: 0 success, 1 argument error, 2 missing input, 3 runtime
//! failure.

use std::fmt;
use std::process;

use tileforge::error::PipelineError;

#[derive(Debug)]
pub enum CliError {
    /// Bad command line or configuration value.
    Argument(String),
    /// A required input file does not exist.
    MissingInput(String),
    /// Failed to initialize logging.
    LoggingInit(std::io::Error),
    /// The pipeline failed at runtime.
    Runtime(PipelineError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Argument(_) => 1,
            CliError::MissingInput(_) => 2,
            CliError::LoggingInit(_) | CliError::Runtime(_) => 3,
        }
    }

    /// Prints the error and exits with the matching code.
    pub fn exit(self) -> ! {
        eprintln!("Error: {}", self);
        if let CliError::Argument(_) = self {
            eprintln!();
            eprintln!("Usage: tileforge <profile> key=value ...");
            eprintln!("Run 'tileforge --help' for the recognized keys.");
        }
        process::exit(self.exit_code())
    }
}

impl From<PipelineError> for CliError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::BadArgument { .. } => CliError::Argument(error.to_string()),
            PipelineError::MissingInput(path) => {
                CliError::MissingInput(path.display().to_string())
            }
            other => CliError::Runtime(other),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Argument(message) => write!(f, "{}", message),
            CliError::MissingInput(path) => write!(f, "input not found: {}", path),
            CliError::LoggingInit(e) => write!(f, "failed to initialize logging: {}", e),
            CliError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::LoggingInit(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_error_kinds() {
        assert_eq!(CliError::Argument("x".into()).exit_code(), 1);
        assert_eq!(CliError::MissingInput("y".into()).exit_code(), 2);
        assert_eq!(
            CliError::Runtime(PipelineError::Cancelled).exit_code(),
            3
        );
    }

    #[test]
    fn test_pipeline_errors_map_onto_cli_kinds() {
        let bad = PipelineError::BadArgument {
            key: "maxzoom".into(),
            reason: "too deep".into(),
        };
        assert!(matches!(CliError::from(bad), CliError::Argument(_)));
        let missing = PipelineError::MissingInput("a.pbf".into());
        assert!(matches!(CliError::from(missing), CliError::MissingInput(_)));
        let runtime = PipelineError::Internal("boom".into());
        assert!(matches!(CliError::from(runtime), CliError::Runtime(_)));
    }
}
