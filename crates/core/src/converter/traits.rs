//! Trait definitions for the converter module.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ConverterError;
use super::family::AdapterFamily;
use super::types::{ConversionProgress, ConversionRequest, ConversionResult};

/// Executes conversions for one adapter family.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Family this converter serves.
    fn family(&self) -> AdapterFamily;

    /// Tool name recorded on the job as `tool_used`.
    fn tool(&self) -> &str;

    /// Runs the conversion. On success the output exists at
    /// `request.output_path`; on failure nothing is left there.
    async fn execute(&self, request: &ConversionRequest) -> Result<ConversionResult, ConverterError>;

    /// Runs the conversion with progress reporting.
    ///
    /// If the receiver is dropped, conversion continues without reporting.
    async fn execute_with_progress(
        &self,
        request: &ConversionRequest,
        progress_tx: mpsc::Sender<ConversionProgress>,
    ) -> Result<ConversionResult, ConverterError>;

    /// Checks that the tool is installed.
    async fn validate(&self) -> Result<(), ConverterError>;
}
