//! File formats, conversion pairs and the extension → MIME table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Media type served when an extension is not in the table.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A file format the pipeline knows how to accept or produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Pdf,
    Docx,
    Doc,
    Xlsx,
    Xls,
    Jpg,
    Jpeg,
    Png,
}

/// Conversion family of a format, used for queue routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Pdf,
    Document,
    Spreadsheet,
    Image,
}

impl Format {
    pub const ALL: [Format; 8] = [
        Format::Pdf,
        Format::Docx,
        Format::Doc,
        Format::Xlsx,
        Format::Xls,
        Format::Jpg,
        Format::Jpeg,
        Format::Png,
    ];

    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Docx => "docx",
            Format::Doc => "doc",
            Format::Xlsx => "xlsx",
            Format::Xls => "xls",
            Format::Jpg => "jpg",
            Format::Jpeg => "jpeg",
            Format::Png => "png",
        }
    }

    pub fn family(self) -> Family {
        match self {
            Format::Pdf => Family::Pdf,
            Format::Docx | Format::Doc => Family::Document,
            Format::Xlsx | Format::Xls => Family::Spreadsheet,
            Format::Jpg | Format::Jpeg | Format::Png => Family::Image,
        }
    }

    pub fn media_type(self) -> &'static str {
        media_type_for_extension(self.extension())
    }

    /// Whether a file named with `extension` may be declared as this format.
    ///
    /// `jpg` and `jpeg` are interchangeable.
    pub fn matches_extension(self, extension: &str) -> bool {
        match extension.parse::<Format>() {
            Ok(other) => other == self || (self.is_jpeg() && other.is_jpeg()),
            Err(_) => false,
        }
    }

    fn is_jpeg(self) -> bool {
        matches!(self, Format::Jpg | Format::Jpeg)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Error returned when a format string is not one of [`Format::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown file format '{0}'")]
pub struct UnknownFormat(pub String);

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().trim_start_matches('.').to_ascii_lowercase();
        Format::ALL
            .into_iter()
            .find(|format| format.extension() == normalized)
            .ok_or_else(|| UnknownFormat(s.trim().to_string()))
    }
}

/// Ordered (from, to) pair of formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversionPair {
    pub from: Format,
    pub to: Format,
}

impl ConversionPair {
    pub const fn new(from: Format, to: Format) -> Self {
        Self { from, to }
    }

    /// Parses both sides of a pair from user supplied strings.
    pub fn parse(from: &str, to: &str) -> Result<Self, UnknownFormat> {
        Ok(Self::new(from.parse()?, to.parse()?))
    }
}

impl fmt::Display for ConversionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Lowercased extension of `path`, without the dot.
pub fn extension_of(path: impl AsRef<Path>) -> Option<String> {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Fixed extension → MIME table. Unknown extensions map to
/// `application/octet-stream`.
pub fn media_type_for_extension(extension: &str) -> &'static str {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => OCTET_STREAM,
    }
}

/// MIME type for a file path, derived from its extension.
pub fn media_type_for_path(path: impl AsRef<Path>) -> &'static str {
    extension_of(path)
        .map(|ext| media_type_for_extension(&ext))
        .unwrap_or(OCTET_STREAM)
}
