//! Maps format pairs to adapter families and families to converters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::error::ConverterError;
use super::family::{normalize_format, AdapterFamily};
use super::tool::ToolConverter;
use super::traits::Converter;
use crate::config::ToolsConfig;

/// One row of the supported-format table.
#[derive(Debug, Clone, Serialize)]
pub struct FormatSupport {
    pub family: AdapterFamily,
    pub tool: String,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
}

/// Converter bindings, one per adapter family.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: BTreeMap<AdapterFamily, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an external-tool converter bound to every family.
    pub fn from_tools(tools: &ToolsConfig) -> Self {
        AdapterFamily::ALL
            .into_iter()
            .fold(Self::new(), |registry, family| {
                registry.with_converter(Arc::new(ToolConverter::new(family, tools.clone())))
            })
    }

    /// Bind a converter to the family it reports, replacing any previous one.
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.register(converter);
        self
    }

    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        self.converters.insert(converter.family(), converter);
    }

    /// Family that handles `input -> output`, without checking whether that
    /// family can produce `output`.
    pub fn resolve(&self, input: &str, output: &str) -> Result<AdapterFamily, ConverterError> {
        let input = normalize_format(input);
        let output = normalize_format(output);
        AdapterFamily::resolve(&input, &output)
            .ok_or_else(|| ConverterError::no_converter(input, output))
    }

    /// Resolve and also require that the family can produce `output`.
    pub fn validate_pair(&self, input: &str, output: &str) -> Result<AdapterFamily, ConverterError> {
        let family = self.resolve(input, output)?;
        let output = normalize_format(output);
        if !family.produces(&output) {
            return Err(ConverterError::UnsupportedFormatPair {
                input: normalize_format(input),
                output,
                family: family.to_string(),
            });
        }
        Ok(family)
    }

    pub fn converter_for(&self, family: AdapterFamily) -> Result<Arc<dyn Converter>, ConverterError> {
        self.converters.get(&family).cloned().ok_or_else(|| {
            ConverterError::NoConverter {
                input: family.to_string(),
                output: "*".to_string(),
            }
        })
    }

    /// Converter to run for a validated format pair.
    pub fn converter_for_pair(
        &self,
        input: &str,
        output: &str,
    ) -> Result<Arc<dyn Converter>, ConverterError> {
        let family = self.validate_pair(input, output)?;
        self.converter_for(family)
    }

    pub fn supported_formats(&self) -> Vec<FormatSupport> {
        AdapterFamily::ALL
            .into_iter()
            .map(|family| FormatSupport {
                family,
                tool: self
                    .converters
                    .get(&family)
                    .map(|c| c.tool().to_string())
                    .unwrap_or_else(|| "-".to_string()),
                inputs: family.input_formats(),
                outputs: family.output_formats(),
            })
            .collect()
    }

    /// Run `validate` on every bound converter.
    pub async fn validate_all(&self) -> Vec<(AdapterFamily, Result<(), ConverterError>)> {
        let mut results = Vec::with_capacity(self.converters.len());
        for (family, converter) in &self.converters {
            results.push((*family, converter.validate().await));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = ConverterRegistry::new();
        assert_eq!(registry.resolve("PNG", "PDF").unwrap(), AdapterFamily::Ocr);
        assert_eq!(registry.resolve(".Wav", "mp3").unwrap(), AdapterFamily::Audio);
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = ConverterRegistry::new();
        let err = registry.resolve("xyz", "pdf").unwrap_err();
        assert!(matches!(err, ConverterError::NoConverter { .. }));
    }

    #[test]
    fn test_validate_pair_rejects_unproducible_output() {
        let registry = ConverterRegistry::new();
        assert!(registry.validate_pair("mp3", "flac").is_ok());
        let err = registry.validate_pair("mp3", "mp4").unwrap_err();
        assert!(matches!(err, ConverterError::UnsupportedFormatPair { .. }));
        // svg is an image input but not an OCR input
        assert!(registry.validate_pair("svg", "pdf").is_err());
    }

    #[test]
    fn test_from_tools_binds_every_family() {
        let registry = ConverterRegistry::from_tools(&ToolsConfig::default());
        for family in AdapterFamily::ALL {
            let converter = registry.converter_for(family).unwrap();
            assert_eq!(converter.family(), family);
        }
        assert_eq!(
            registry.converter_for_pair("jpg", "txt").unwrap().tool(),
            "tesseract"
        );
        assert_eq!(
            registry.converter_for_pair("jpg", "png").unwrap().tool(),
            "imagemagick"
        );
    }

    #[test]
    fn test_missing_binding() {
        let registry = ConverterRegistry::new();
        assert!(registry.converter_for(AdapterFamily::Audio).is_err());
    }

    #[test]
    fn test_supported_formats_table() {
        let registry = ConverterRegistry::from_tools(&ToolsConfig::default());
        let table = registry.supported_formats();
        assert_eq!(table.len(), 7);
        let ocr = table.iter().find(|row| row.family == AdapterFamily::Ocr).unwrap();
        assert_eq!(ocr.outputs, &["pdf", "txt"]);
        assert_eq!(ocr.tool, "tesseract");
    }
}
