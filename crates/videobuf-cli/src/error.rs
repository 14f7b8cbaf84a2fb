// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Queue or device busy
    Busy(String),
    /// Memory backend or queue policy refused an operation
    Backend(String),
    /// No frame arrived in time
    Timeout(String),
    /// Interrupted by a signal
    Interrupted,
    /// General error from the videobuf library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::Busy(msg) => write!(f, "Device busy: {}", msg),
            CliError::Backend(msg) => write!(f, "Backend failure: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::Interrupted => write!(f, "Interrupted"),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::InvalidArgs(_) => ExitCode::from(2),
            CliError::Busy(_) => ExitCode::from(3),
            CliError::Backend(_) => ExitCode::from(4),
            CliError::Timeout(_) => ExitCode::from(6),
            CliError::Interrupted => ExitCode::from(130),
            CliError::General(_) => ExitCode::from(1),
        }
    }
}

/// Map videobuf::Error to CliError with appropriate exit codes
impl From<videobuf::Error> for CliError {
    fn from(err: videobuf::Error) -> Self {
        use videobuf::Error;

        match err {
            Error::Busy => CliError::Busy("queue is in use".to_string()),
            Error::BackendFailure(io_err) => CliError::Backend(format!("memory: {}", io_err)),
            Error::PolicyRejected(io_err) => CliError::Backend(format!("device: {}", io_err)),
            Error::WouldBlock => CliError::Timeout("no frame ready".to_string()),
            Error::Interrupted => CliError::Interrupted,
            Error::Cancelled => CliError::General("capture cancelled".to_string()),
            Error::InvalidIndex(index) => {
                CliError::General(format!("invalid buffer index {}", index))
            }
            Error::InvalidState(msg) => CliError::General(format!("invalid state: {}", msg)),
            Error::FrameFailed(index) => {
                CliError::General(format!("frame in buffer {} failed", index))
            }
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
