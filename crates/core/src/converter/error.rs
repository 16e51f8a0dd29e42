//! Error types for the converter module.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving or running a converter.
#[derive(Debug, Error)]
pub enum ConverterError {
    /// No family handles this format pair.
    #[error("no converter for {input} -> {output}")]
    NoConverter { input: String, output: String },

    /// A family handles the input but cannot produce the output.
    #[error("unsupported conversion {input} -> {output} for {family}")]
    UnsupportedFormatPair {
        input: String,
        output: String,
        family: String,
    },

    /// External tool binary not found.
    #[error("{tool} not found at path: {path}")]
    ToolNotFound { tool: String, path: PathBuf },

    /// Input file not found.
    #[error("input file not found: {path}")]
    InputNotFound { path: PathBuf },

    /// The tool ran and exited unsuccessfully.
    #[error("tool exited with error")]
    ExecutionFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The tool exceeded its time budget and was killed.
    #[error("timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The tool exited cleanly but left no usable output.
    #[error("{tool} produced no output")]
    MissingOutput { tool: String },

    /// Cancelled while running; the tool was killed.
    #[error("conversion cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConverterError {
    pub fn no_converter(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self::NoConverter {
            input: input.into(),
            output: output.into(),
        }
    }

    pub fn execution_failed(tool: impl Into<String>, code: Option<i32>, stderr: String) -> Self {
        Self::ExecutionFailed {
            tool: tool.into(),
            code,
            stderr,
        }
    }

    /// Whether the error is about the request itself rather than a run.
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            Self::NoConverter { .. } | Self::UnsupportedFormatPair { .. }
        )
    }

    /// Whether running the same request again cannot succeed.
    pub fn is_permanent(&self) -> bool {
        self.is_routing_error() || matches!(self, Self::InputNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ConverterError::Timeout { timeout_secs: 300 }.to_string(),
            "timed out after 300s"
        );
        assert_eq!(
            ConverterError::execution_failed("ffmpeg", Some(1), "boom".into()).to_string(),
            "tool exited with error"
        );
        assert_eq!(
            ConverterError::no_converter("xyz", "pdf").to_string(),
            "no converter for xyz -> pdf"
        );
    }

    #[test]
    fn test_routing_errors() {
        assert!(ConverterError::no_converter("a", "b").is_routing_error());
        assert!(!ConverterError::Cancelled.is_routing_error());
        assert!(ConverterError::InputNotFound { path: "/x".into() }.is_permanent());
        assert!(!ConverterError::Timeout { timeout_secs: 1 }.is_permanent());
    }
}
