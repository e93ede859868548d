//! Raster image to PDF with vector page geometry via svg2pdf.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{checkpoint, remove_quietly, validate_input, ConversionReport, Converter};
use crate::error::ConvertError;

/// Image to PDF converter.
///
/// The raster is decoded once to validate it and read its dimensions, then
/// embedded in an SVG page of exactly that size. usvg parses the page and
/// svg2pdf writes it out, so the image is placed without resampling.
pub struct ImageToPdfConverter;

impl ImageToPdfConverter {
    /// Creates a new converter with default options.
    pub fn new() -> Self {
        Self
    }

    /// Wraps an encoded raster in a single-page SVG document.
    fn page_svg(mime: &str, encoded: &[u8], width: u32, height: u32) -> String {
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{width}" height="{height}" viewBox="0 0 {width} {height}"><image x="0" y="0" width="{width}" height="{height}" xlink:href="data:{mime};base64,{data}"/></svg>"#,
            data = STANDARD.encode(encoded),
        )
    }

    fn render(&self, input: &Path, cancel: &CancellationToken) -> Result<Vec<u8>, ConvertError> {
        let encoded = fs::read(input)?;

        let mime = match image::guess_format(&encoded) {
            Ok(image::ImageFormat::Png) => "image/png",
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            Ok(other) => {
                return Err(ConvertError::CorruptInput(format!(
                    "unsupported raster format {other:?}"
                )))
            }
            Err(err) => return Err(ConvertError::CorruptInput(format!("unrecognised image data: {err}"))),
        };

        let decoded = image::load_from_memory(&encoded)
            .map_err(|err| ConvertError::CorruptInput(format!("failed to decode image: {err}")))?;
        let (width, height) = (decoded.width(), decoded.height());
        drop(decoded);
        checkpoint(cancel)?;

        let svg = Self::page_svg(mime, &encoded, width, height);
        let tree = usvg::Tree::from_str(&svg, &usvg::Options::default())
            .map_err(|err| ConvertError::CorruptInput(format!("failed to build PDF page: {err}")))?;

        // Validate tree has valid dimensions
        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(ConvertError::CorruptInput(format!(
                "invalid image dimensions: {}x{}",
                size.width(),
                size.height()
            )));
        }

        info!("Image parsed successfully: {}x{} px", width, height);
        checkpoint(cancel)?;

        Ok(svg2pdf::to_pdf(
            &tree,
            svg2pdf::ConversionOptions::default(),
            svg2pdf::PageOptions::default(),
        ))
    }
}

impl Default for ImageToPdfConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Converter for ImageToPdfConverter {
    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport, ConvertError> {
        info!("Converting image to PDF: output={}", output.display());
        validate_input(input)?;
        checkpoint(cancel)?;

        let pdf_data = self.render(input, cancel)?;

        // Write beside the target and rename, so a failure never leaves a
        // truncated PDF at the output path.
        let partial = output.with_extension("pdf.part");
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let written = fs::write(&partial, &pdf_data).and_then(|_| fs::rename(&partial, output));
        if let Err(err) = written {
            remove_quietly(&partial);
            return Err(ConvertError::Io(err));
        }

        info!("PDF export complete: {} bytes", pdf_data.len());
        Ok(ConversionReport::file(
            output.to_path_buf(),
            "Image converted to PDF successfully",
        ))
    }
}
