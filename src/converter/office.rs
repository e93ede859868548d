//! Office documents via LibreOffice in headless mode.

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::process::{locate_tool, run_tool};
use super::{checkpoint, remove_quietly, validate_input, ConversionReport, Converter};
use crate::error::ConvertError;
use crate::format::{extension_of, Format};

const TOOL: &str = "soffice";

/// Converts word-processing and spreadsheet documents to PDF, and PDF to
/// DOCX, by shelling out to `soffice`.
pub struct OfficeConverter {
    soffice: Option<PathBuf>,
}

impl OfficeConverter {
    /// `soffice` overrides the PATH lookup when set.
    pub fn new(soffice: Option<PathBuf>) -> Self {
        Self { soffice }
    }

    fn convert_to_arg(target: &str) -> &'static str {
        match target {
            "docx" => "docx:MS Word 2007 XML",
            _ => "pdf",
        }
    }
}

impl Converter for OfficeConverter {
    fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport, ConvertError> {
        validate_input(input)?;
        checkpoint(cancel)?;

        let soffice = locate_tool(TOOL, self.soffice.as_deref())?;
        let target = extension_of(output).unwrap_or_else(|| Format::Pdf.extension().to_string());
        let outdir = output
            .parent()
            .ok_or_else(|| ConvertError::InvalidInput(format!("output path has no parent: {}", output.display())))?;
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConvertError::InvalidInput(format!("input has no file name: {}", input.display())))?;
        std::fs::create_dir_all(outdir)?;

        // soffice refuses to run twice against one user profile, so every
        // invocation gets its own.
        let profile = TempDir::new()?;

        let mut command = Command::new(&soffice);
        command
            .arg(format!("-env:UserInstallation=file://{}", profile.path().display()))
            .arg("--headless")
            .arg("--norestore");
        if extension_of(input).as_deref() == Some("pdf") {
            command.arg("--infilter=writer_pdf_import");
        }
        command
            .arg("--convert-to")
            .arg(Self::convert_to_arg(&target))
            .arg("--outdir")
            .arg(outdir)
            .arg(input);

        info!(input = %input.display(), target = %target, "Converting with LibreOffice");

        // soffice names the result after the input stem.
        let produced = outdir.join(format!("{stem}.{target}"));

        let run = match run_tool(TOOL, command, cancel) {
            Ok(run) => run,
            Err(err) => {
                remove_quietly(&produced);
                return Err(err);
            }
        };

        if !run.status.success() {
            remove_quietly(&produced);
            return Err(run.into_failure(TOOL));
        }

        if !produced.is_file() {
            let detail = run.stderr.trim();
            return Err(ConvertError::OutputMissing(if detail.is_empty() {
                format!("{TOOL} did not write {}", produced.display())
            } else {
                detail.to_string()
            }));
        }

        let from = extension_of(input).unwrap_or_default();
        Ok(ConversionReport::file(
            produced,
            format!("{from} converted to {target} successfully"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_input_fails_before_tool_lookup() {
        let dir = TempDir::new().unwrap();
        let converter = OfficeConverter::new(Some(PathBuf::from("/nonexistent/soffice")));

        let result = converter.convert(
            &dir.path().join("missing.docx"),
            &dir.path().join("out.pdf"),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ConvertError::InvalidInput(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("report_input.xlsx");
        fs::write(&input, b"PK\x03\x04").unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let converter = OfficeConverter::new(None);
        let result = converter.convert(&input, &dir.path().join("report_output.pdf"), &token);
        assert!(matches!(result, Err(ConvertError::Cancelled)));
        assert!(!dir.path().join("report_input.pdf").exists());
    }

    #[test]
    fn test_convert_to_arguments() {
        assert_eq!(OfficeConverter::convert_to_arg("pdf"), "pdf");
        assert_eq!(OfficeConverter::convert_to_arg("docx"), "docx:MS Word 2007 XML");
    }
}
