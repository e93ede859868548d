//! The converter contract and its concrete capabilities.
//!
//! A converter is synchronous from the worker's point of view: the worker
//! runs it on a blocking thread and hands it a [`CancellationToken`] that
//! fires when the soft time limit expires. Converters must check the token
//! between steps and while waiting for external tools.
//!
//! Every converter enforces its own input precondition (the input exists, is
//! a regular file and is non-empty) and must not leave partial output behind
//! when it fails.

mod image_pdf;
mod office;
mod pdf_image;
mod process;

pub use image_pdf::ImageToPdfConverter;
pub use office::OfficeConverter;
pub use pdf_image::PdfToImageConverter;

use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::error::ConvertError;

/// What a converter wrote to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced {
    /// A single output file. Its name may differ from the requested output
    /// path (external tools pick their own names); the artifact resolver
    /// moves it into place.
    File(PathBuf),
    /// One file per page, in page order, inside a directory owned by the job.
    Pages { dir: PathBuf, pages: Vec<PathBuf> },
}

/// Successful conversion result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub message: String,
    pub produced: Produced,
}

impl ConversionReport {
    pub fn file(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            produced: Produced::File(path),
        }
    }
}

/// A capability that transforms one file into another format.
///
/// Implementations must be safe to invoke again on the same input and output
/// pair, since retries re-run the whole job.
pub trait Converter: Send + Sync {
    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport, ConvertError>;
}

/// Checks the shared input precondition: exists, regular file, non-empty.
pub fn validate_input(input: &Path) -> Result<(), ConvertError> {
    let metadata = fs::metadata(input).map_err(|_| {
        ConvertError::InvalidInput(format!("input file not found: {}", input.display()))
    })?;

    if !metadata.is_file() {
        return Err(ConvertError::InvalidInput(format!(
            "input is not a regular file: {}",
            input.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(ConvertError::InvalidInput(format!(
            "input file is empty: {}",
            input.display()
        )));
    }
    Ok(())
}

/// Returns `Err(Cancelled)` once the token has fired.
pub(crate) fn checkpoint(cancel: &CancellationToken) -> Result<(), ConvertError> {
    if cancel.is_cancelled() {
        Err(ConvertError::Cancelled)
    } else {
        Ok(())
    }
}

/// Removes a file, ignoring "not found".
pub(crate) fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "Failed to remove partial output");
        }
    }
}
