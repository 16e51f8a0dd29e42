//! Converter module: format routing and external tool execution.
//!
//! A conversion is routed in two steps. [`ConverterRegistry::resolve`] maps
//! the (input, output) format pair to an [`AdapterFamily`]; the registry
//! then hands out the [`Converter`] bound to that family. The production
//! binding is [`ToolConverter`], which runs ffmpeg, ImageMagick, pandoc,
//! calibre, zip/7z/tar or tesseract under a timeout and a cancellation
//! token, writing to a partial file that is only moved into place on
//! success.
//!
//! # Example
//!
//! ```ignore
//! use convertd_core::converter::{ConverterRegistry, ConversionRequest};
//!
//! let registry = ConverterRegistry::from_tools(&config.tools);
//! let converter = registry.converter_for_pair("png", "pdf")?; // tesseract
//!
//! let request = ConversionRequest {
//!     job_id: job.id.clone(),
//!     input_path: layout.input_path(&job),
//!     output_path: layout.output_path(&job),
//!     input_format: "png".into(),
//!     output_format: "pdf".into(),
//!     timeout: Duration::from_secs(300),
//!     cancel: CancellationToken::new(),
//! };
//! let result = converter.execute(&request).await?;
//! println!("{} bytes via {}", result.output_size_bytes, result.tool);
//! ```

mod error;
mod family;
mod registry;
mod tool;
mod traits;
mod types;

pub use error::ConverterError;
pub use family::{format_from_filename, normalize_format, AdapterFamily};
pub use registry::{ConverterRegistry, FormatSupport};
pub use tool::ToolConverter;
pub use traits::Converter;
pub use types::{ConversionProgress, ConversionRequest, ConversionResult};
