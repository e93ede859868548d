//! PDF pages to raster images via poppler's `pdftoppm`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::process::{locate_tool, run_tool};
use super::{checkpoint, validate_input, ConversionReport, Converter, Produced};
use crate::artifact::remove_dir_quietly;
use crate::error::ConvertError;
use crate::format::extension_of;

const TOOL: &str = "pdftoppm";

/// pdftoppm exit code for "error opening a PDF file".
const EXIT_OPEN_FAILED: i32 = 1;

/// Renders every page of a PDF to PNG or JPEG.
///
/// Pages land in `<output stem>_pages/` next to the requested output; the
/// artifact resolver decides whether they become a single image or a bundle.
pub struct PdfToImageConverter {
    pdftoppm: Option<PathBuf>,
    dpi: u32,
}

impl PdfToImageConverter {
    pub fn new(pdftoppm: Option<PathBuf>, dpi: u32) -> Self {
        Self { pdftoppm, dpi }
    }

    /// Directory the pages for `output` are rendered into.
    pub fn pages_dir(output: &Path) -> PathBuf {
        let stem = output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        output.with_file_name(format!("{stem}_pages"))
    }
}

/// Lists rendered pages in page order.
///
/// pdftoppm names pages `<prefix>-<n>.<ext>` and pads `n` to the width of the
/// page count, so the number is parsed rather than sorted lexically.
fn collect_pages(dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let mut numbered = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|stem| stem.rsplit('-').next())
            .and_then(|n| n.parse::<u32>().ok());
        match number {
            Some(n) if path.is_file() => numbered.push((n, path)),
            _ => warn!(path = %path.display(), "Ignoring unexpected file in pages directory"),
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

impl Converter for PdfToImageConverter {
    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport, ConvertError> {
        validate_input(input)?;
        checkpoint(cancel)?;

        let pdftoppm = locate_tool(TOOL, self.pdftoppm.as_deref())?;
        let target = extension_of(output).unwrap_or_else(|| "png".to_string());

        let dir = Self::pages_dir(output);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let mut command = Command::new(&pdftoppm);
        command.arg("-r").arg(self.dpi.to_string());
        match target.as_str() {
            "jpg" | "jpeg" => {
                command.args(["-jpeg", "-jpegopt", "quality=95"]);
            }
            _ => {
                command.arg("-png");
            }
        }
        command.arg(input).arg(dir.join("page"));

        info!(input = %input.display(), target = %target, dpi = self.dpi, "Rendering PDF pages");

        let result = run_tool(TOOL, command, cancel).and_then(|run| {
            if run.status.success() {
                collect_pages(&dir)
            } else if run.status.code() == Some(EXIT_OPEN_FAILED) {
                Err(ConvertError::CorruptInput(format!(
                    "cannot open PDF: {}",
                    run.stderr.trim()
                )))
            } else {
                Err(run.into_failure(TOOL))
            }
        });

        let pages = match result {
            Ok(pages) if !pages.is_empty() => pages,
            Ok(_) => {
                remove_dir_quietly(&dir);
                return Err(ConvertError::CorruptInput("no pages found in PDF".to_string()));
            }
            Err(err) => {
                remove_dir_quietly(&dir);
                return Err(err);
            }
        };

        let count = pages.len();
        Ok(ConversionReport {
            message: format!(
                "PDF converted to image{} successfully ({count} page{})",
                if count == 1 { "" } else { "s" },
                if count == 1 { "" } else { "s" },
            ),
            produced: Produced::Pages { dir, pages },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pages_dir_is_derived_from_output() {
        let dir = PdfToImageConverter::pages_dir(Path::new("/data/outputs/abc_output.png"));
        assert_eq!(dir, PathBuf::from("/data/outputs/abc_output_pages"));
    }

    #[test]
    fn test_collect_pages_orders_numerically() {
        let dir = TempDir::new().unwrap();
        for name in ["page-10.png", "page-2.png", "page-1.png", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let pages = collect_pages(dir.path()).unwrap();
        let names: Vec<_> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["page-1.png", "page-2.png", "page-10.png"]);
    }

    #[test]
    fn test_invalid_input_leaves_no_pages_dir() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("x_output.png");

        let result = PdfToImageConverter::new(None, 144).convert(
            &dir.path().join("missing.pdf"),
            &output,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ConvertError::InvalidInput(_))));
        assert!(!PdfToImageConverter::pages_dir(&output).exists());
    }
}
