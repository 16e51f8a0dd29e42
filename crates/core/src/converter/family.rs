//! Adapter families and the format tables they claim.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A group of conversions handled by one external tool (or tool set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFamily {
    Audio,
    Video,
    Image,
    Document,
    Ebook,
    Archive,
    Ocr,
}

const AUDIO_INPUTS: &[&str] = &["mp3", "wav", "flac", "aac", "ogg", "m4a", "wma", "opus"];
const AUDIO_OUTPUTS: &[&str] = &["mp3", "wav", "flac", "aac", "ogg", "m4a", "opus"];

const VIDEO_INPUTS: &[&str] = &["mp4", "mkv", "avi", "mov", "flv", "wmv", "webm", "ts", "mts"];
const VIDEO_OUTPUTS: &[&str] = &["mp4", "mkv", "avi", "webm", "mov"];

const IMAGE_INPUTS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "ico", "svg",
];
const IMAGE_OUTPUTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff"];

const DOCUMENT_INPUTS: &[&str] = &[
    "pdf", "docx", "doc", "xlsx", "xls", "pptx", "ppt", "odt", "ods", "odp", "rtf", "txt", "md",
];
const DOCUMENT_OUTPUTS: &[&str] = &[
    "pdf", "docx", "xlsx", "pptx", "odt", "ods", "odp", "txt", "md",
];

// pdf and txt are listed but always claimed by Document first.
const EBOOK_INPUTS: &[&str] = &["epub", "mobi", "azw", "azw3", "pdf", "txt"];
const EBOOK_OUTPUTS: &[&str] = &["epub", "mobi", "azw3", "pdf"];

const ARCHIVE_INPUTS: &[&str] = &[
    "zip", "7z", "rar", "tar", "gz", "tar.gz", "bz2", "tar.bz2", "xz", "tar.xz",
];
const ARCHIVE_OUTPUTS: &[&str] = &["zip", "7z", "tar", "tar.gz", "tar.bz2", "tar.xz"];

const OCR_INPUTS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff"];
const OCR_OUTPUTS: &[&str] = &["pdf", "txt"];

/// Compound extensions recognised before falling back to the last suffix.
const COMPOUND_EXTENSIONS: &[&str] = &["tar.gz", "tar.bz2", "tar.xz"];

impl AdapterFamily {
    pub const ALL: [AdapterFamily; 7] = [
        AdapterFamily::Audio,
        AdapterFamily::Video,
        AdapterFamily::Image,
        AdapterFamily::Document,
        AdapterFamily::Ebook,
        AdapterFamily::Archive,
        AdapterFamily::Ocr,
    ];

    /// Families consulted by input format, in priority order. OCR is not
    /// part of this list; it is selected by the output-format rule.
    const BY_INPUT: [AdapterFamily; 6] = [
        AdapterFamily::Audio,
        AdapterFamily::Video,
        AdapterFamily::Image,
        AdapterFamily::Document,
        AdapterFamily::Ebook,
        AdapterFamily::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterFamily::Audio => "audio",
            AdapterFamily::Video => "video",
            AdapterFamily::Image => "image",
            AdapterFamily::Document => "document",
            AdapterFamily::Ebook => "ebook",
            AdapterFamily::Archive => "archive",
            AdapterFamily::Ocr => "ocr",
        }
    }

    pub fn input_formats(&self) -> &'static [&'static str] {
        match self {
            AdapterFamily::Audio => AUDIO_INPUTS,
            AdapterFamily::Video => VIDEO_INPUTS,
            AdapterFamily::Image => IMAGE_INPUTS,
            AdapterFamily::Document => DOCUMENT_INPUTS,
            AdapterFamily::Ebook => EBOOK_INPUTS,
            AdapterFamily::Archive => ARCHIVE_INPUTS,
            AdapterFamily::Ocr => OCR_INPUTS,
        }
    }

    pub fn output_formats(&self) -> &'static [&'static str] {
        match self {
            AdapterFamily::Audio => AUDIO_OUTPUTS,
            AdapterFamily::Video => VIDEO_OUTPUTS,
            AdapterFamily::Image => IMAGE_OUTPUTS,
            AdapterFamily::Document => DOCUMENT_OUTPUTS,
            AdapterFamily::Ebook => EBOOK_OUTPUTS,
            AdapterFamily::Archive => ARCHIVE_OUTPUTS,
            AdapterFamily::Ocr => OCR_OUTPUTS,
        }
    }

    pub fn accepts_input(&self, format: &str) -> bool {
        self.input_formats().contains(&format)
    }

    pub fn produces(&self, format: &str) -> bool {
        self.output_formats().contains(&format)
    }

    /// Pick the family for a format pair. Both formats must already be
    /// normalised with [`normalize_format`].
    ///
    /// An image going to `pdf` or `txt` is text recognition, not an image
    /// conversion; that rule wins over the input-format lookup.
    pub fn resolve(input: &str, output: &str) -> Option<AdapterFamily> {
        if AdapterFamily::Ocr.produces(output) && AdapterFamily::Ocr.accepts_input(input) {
            return Some(AdapterFamily::Ocr);
        }

        AdapterFamily::BY_INPUT
            .into_iter()
            .find(|family| family.accepts_input(input))
    }
}

impl fmt::Display for AdapterFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AdapterFamily::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown adapter family: {}", s))
    }
}

/// Lower-case a format and strip a leading dot.
pub fn normalize_format(format: &str) -> String {
    format.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Derive a format from a file name, recognising compound archive
/// extensions such as `tar.gz`.
pub fn format_from_filename(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    if let Some(ext) = COMPOUND_EXTENSIONS
        .iter()
        .find(|ext| lower.len() > ext.len() + 1 && lower.ends_with(&format!(".{}", ext)))
    {
        return Some((*ext).to_string());
    }

    match lower.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ocr_wins_for_images_to_text() {
        assert_eq!(AdapterFamily::resolve("png", "pdf"), Some(AdapterFamily::Ocr));
        assert_eq!(AdapterFamily::resolve("jpg", "txt"), Some(AdapterFamily::Ocr));
        assert_eq!(AdapterFamily::resolve("tiff", "pdf"), Some(AdapterFamily::Ocr));
    }

    #[test]
    fn test_image_to_image_is_not_ocr() {
        assert_eq!(AdapterFamily::resolve("png", "jpg"), Some(AdapterFamily::Image));
        // webp is not an OCR input
        assert_eq!(AdapterFamily::resolve("webp", "pdf"), Some(AdapterFamily::Image));
    }

    #[test]
    fn test_input_priority_order() {
        assert_eq!(AdapterFamily::resolve("wav", "mp3"), Some(AdapterFamily::Audio));
        assert_eq!(AdapterFamily::resolve("mkv", "mp4"), Some(AdapterFamily::Video));
        assert_eq!(AdapterFamily::resolve("pdf", "epub"), Some(AdapterFamily::Document));
        assert_eq!(AdapterFamily::resolve("txt", "pdf"), Some(AdapterFamily::Document));
        assert_eq!(AdapterFamily::resolve("epub", "mobi"), Some(AdapterFamily::Ebook));
        assert_eq!(AdapterFamily::resolve("tar.gz", "zip"), Some(AdapterFamily::Archive));
    }

    #[test]
    fn test_unknown_input() {
        assert_eq!(AdapterFamily::resolve("xyz", "pdf"), None);
    }

    #[test]
    fn test_format_from_filename() {
        assert_eq!(format_from_filename("a.PNG").as_deref(), Some("png"));
        assert_eq!(format_from_filename("backup.tar.gz").as_deref(), Some("tar.gz"));
        assert_eq!(format_from_filename("archive.gz").as_deref(), Some("gz"));
        assert_eq!(format_from_filename("README"), None);
        assert_eq!(format_from_filename(".bashrc"), None);
    }

    #[test]
    fn test_normalize_format() {
        assert_eq!(normalize_format(".JPG"), "jpg");
        assert_eq!(normalize_format(" Tar.GZ "), "tar.gz");
    }

    #[test]
    fn test_family_roundtrip() {
        for family in AdapterFamily::ALL {
            assert_eq!(family.as_str().parse::<AdapterFamily>().unwrap(), family);
        }
    }
}
