//! Artifact resolution: where a job's output lives and what shape it takes.
//!
//! Single-output conversions end up at the job's canonical output key,
//! `outputs/<id>_output.<ext>`. Multi-page conversions are bundled into
//! `outputs/<id>_output.zip` with entries `page_001.<ext>`, `page_002.<ext>`
//! and so on, after which the per-page files are removed.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::converter::Produced;
use crate::error::ArtifactError;
use crate::format::{media_type_for_path, Format};

pub const UPLOADS_DIR: &str = "uploads";
pub const OUTPUTS_DIR: &str = "outputs";
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Key of the uploaded input for a job.
pub fn input_key(job_id: &str, from: Format) -> String {
    format!("{UPLOADS_DIR}/{job_id}_input.{}", from.extension())
}

/// Canonical key of a single-file artifact.
pub fn output_key(job_id: &str, to: Format) -> String {
    format!("{OUTPUTS_DIR}/{job_id}_output.{}", to.extension())
}

/// Key of a bundled multi-page artifact.
pub fn archive_key(job_id: &str) -> String {
    format!("{OUTPUTS_DIR}/{job_id}_output.{ARCHIVE_EXTENSION}")
}

/// Archive entry name for the page at 1-based `ordinal`.
pub fn page_entry_name(ordinal: usize, extension: &str) -> String {
    format!("page_{ordinal:03}.{extension}")
}

/// The materialised output of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Backend-relative key.
    pub key: String,
    /// Location in the local scratch area.
    pub path: PathBuf,
    pub media_type: &'static str,
    /// Number of pages bundled, or 1 for a single file.
    pub entries: usize,
}

impl ResolvedArtifact {
    pub fn is_bundle(&self) -> bool {
        self.key.ends_with(ARCHIVE_EXTENSION) && self.entries > 1
    }
}

/// Decides the final shape of converter output under a local root.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    root: PathBuf,
}

impl ArtifactResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Path a converter is asked to write to.
    pub fn output_path(&self, job_id: &str, to: Format) -> PathBuf {
        self.local_path(&output_key(job_id, to))
    }

    pub fn resolve(
        &self,
        job_id: &str,
        target: Format,
        produced: Produced,
    ) -> Result<ResolvedArtifact, ArtifactError> {
        let key = output_key(job_id, target);
        let canonical = self.local_path(&key);

        match produced {
            Produced::File(path) => {
                if !path.is_file() {
                    return Err(ArtifactError::MissingOutput(path.display().to_string()));
                }
                if path != canonical {
                    debug!(from = %path.display(), to = %canonical.display(), "Moving artifact to canonical path");
                    move_file(&path, &canonical)?;
                }
                Ok(self.single(key, canonical))
            }
            Produced::Pages { dir, pages } => match pages.len() {
                0 => {
                    remove_dir_quietly(&dir);
                    Err(ArtifactError::NoPages)
                }
                1 => {
                    let moved = move_file(&pages[0], &canonical);
                    remove_dir_quietly(&dir);
                    moved?;
                    Ok(self.single(key, canonical))
                }
                count => {
                    let key = archive_key(job_id);
                    let archive = self.local_path(&key);
                    bundle_pages(&pages, &dir, &archive, target.extension())?;
                    info!(job_id, pages = count, archive = %archive.display(), "Bundled pages into archive");
                    Ok(ResolvedArtifact {
                        media_type: media_type_for_path(&archive),
                        key,
                        path: archive,
                        entries: count,
                    })
                }
            },
        }
    }

    fn single(&self, key: String, path: PathBuf) -> ResolvedArtifact {
        ResolvedArtifact {
            media_type: media_type_for_path(&path),
            key,
            path,
            entries: 1,
        }
    }
}

/// Writes `pages` into a deflated archive at `archive`.
///
/// Intermediate files and their directory are removed only once the archive
/// exists. On any failure the pages, the directory and the partial archive
/// are all removed before the error is returned.
fn bundle_pages(pages: &[PathBuf], dir: &Path, archive: &Path, extension: &str) -> Result<(), ArtifactError> {
    let written = write_archive(pages, archive, extension);

    let verified = match written {
        Ok(()) if archive.is_file() => Ok(()),
        Ok(()) => Err(ArtifactError::MissingOutput(archive.display().to_string())),
        Err(err) => Err(ArtifactError::Bundle {
            archive: archive.display().to_string(),
            message: err.to_string(),
        }),
    };

    for page in pages {
        if let Err(err) = fs::remove_file(page) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(page = %page.display(), error = %err, "Failed to remove page image");
            }
        }
    }
    remove_dir_quietly(dir);

    if verified.is_err() {
        if let Err(err) = fs::remove_file(archive) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(archive = %archive.display(), error = %err, "Failed to remove partial archive");
            }
        }
    }
    verified
}

fn write_archive(pages: &[PathBuf], archive: &Path, extension: &str) -> zip::result::ZipResult<()> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (index, page) in pages.iter().enumerate() {
        writer.start_file(page_entry_name(index + 1, extension), options)?;
        let mut source = File::open(page)?;
        io::copy(&mut source, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

/// Renames `from` to `to`, copying when a rename is not possible.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Removes a pages directory, logging anything but its absence.
pub(crate) fn remove_dir_quietly(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %err, "Failed to remove pages directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn pages(root: &Path, count: usize) -> (PathBuf, Vec<PathBuf>) {
        let dir = root.join("outputs/job_output_pages");
        fs::create_dir_all(&dir).unwrap();
        let pages = (1..=count)
            .map(|n| {
                let page = dir.join(format!("page-{n}.png"));
                fs::write(&page, format!("page {n}")).unwrap();
                page
            })
            .collect();
        (dir, pages)
    }

    #[test]
    fn test_keys() {
        assert_eq!(input_key("abc", Format::Docx), "uploads/abc_input.docx");
        assert_eq!(output_key("abc", Format::Pdf), "outputs/abc_output.pdf");
        assert_eq!(archive_key("abc"), "outputs/abc_output.zip");
        assert_eq!(page_entry_name(7, "png"), "page_007.png");
    }

    #[test]
    fn test_single_file_is_moved_to_canonical_path() {
        let root = TempDir::new().unwrap();
        let resolver = ArtifactResolver::new(root.path());
        fs::create_dir_all(root.path().join("outputs")).unwrap();
        let produced = root.path().join("outputs/job_input.pdf");
        fs::write(&produced, b"%PDF").unwrap();

        let artifact = resolver
            .resolve("job", Format::Pdf, Produced::File(produced.clone()))
            .unwrap();

        assert_eq!(artifact.key, "outputs/job_output.pdf");
        assert_eq!(artifact.media_type, "application/pdf");
        assert!(artifact.path.is_file());
        assert!(!produced.exists());
        assert!(!artifact.is_bundle());
    }

    #[test]
    fn test_missing_single_file_is_an_error() {
        let root = TempDir::new().unwrap();
        let resolver = ArtifactResolver::new(root.path());
        let result = resolver.resolve("job", Format::Pdf, Produced::File(root.path().join("nope.pdf")));
        assert!(matches!(result, Err(ArtifactError::MissingOutput(_))));
    }

    #[test]
    fn test_single_page_yields_single_image() {
        let root = TempDir::new().unwrap();
        let resolver = ArtifactResolver::new(root.path());
        let (dir, pages) = pages(root.path(), 1);

        let artifact = resolver
            .resolve("job", Format::Png, Produced::Pages { dir: dir.clone(), pages })
            .unwrap();

        assert_eq!(artifact.key, "outputs/job_output.png");
        assert_eq!(artifact.media_type, "image/png");
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "page 1");
        assert!(!dir.exists());
    }

    #[test]
    fn test_multiple_pages_are_bundled_in_order() {
        let root = TempDir::new().unwrap();
        let resolver = ArtifactResolver::new(root.path());
        let (dir, pages) = pages(root.path(), 3);

        let artifact = resolver
            .resolve("job", Format::Png, Produced::Pages { dir: dir.clone(), pages: pages.clone() })
            .unwrap();

        assert_eq!(artifact.key, "outputs/job_output.zip");
        assert_eq!(artifact.media_type, "application/zip");
        assert_eq!(artifact.entries, 3);
        assert!(artifact.is_bundle());

        let mut zip = zip::ZipArchive::new(File::open(&artifact.path).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["page_001.png", "page_002.png", "page_003.png"]);

        let mut second = String::new();
        io::Read::read_to_string(&mut zip.by_name("page_002.png").unwrap(), &mut second).unwrap();
        assert_eq!(second, "page 2");

        assert!(!dir.exists());
        assert!(pages.iter().all(|p| !p.exists()));
        let leftovers: Vec<_> = fs::read_dir(root.path().join("outputs"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("job_output.zip")]);
    }

    #[test]
    fn test_failed_bundle_cleans_everything() {
        let root = TempDir::new().unwrap();
        let resolver = ArtifactResolver::new(root.path());
        let (dir, mut pages) = pages(root.path(), 2);
        pages.push(dir.join("page-3.png")); // never written

        let result = resolver.resolve("job", Format::Png, Produced::Pages { dir: dir.clone(), pages: pages.clone() });

        assert!(matches!(result, Err(ArtifactError::Bundle { .. })));
        assert!(!dir.exists());
        assert!(pages.iter().all(|p| !p.exists()));
        assert!(!root.path().join(archive_key("job")).exists());
    }

    #[test]
    fn test_remove_dir_quietly() {
        let root = TempDir::new().unwrap();
        let (dir, _) = pages(root.path(), 2);

        remove_dir_quietly(&dir);
        assert!(!dir.exists());
        // Already gone: nothing to report.
        remove_dir_quietly(&dir);
    }

    #[test]
    fn test_no_pages() {
        let root = TempDir::new().unwrap();
        let resolver = ArtifactResolver::new(root.path());
        let (dir, _) = pages(root.path(), 0);
        let result = resolver.resolve("job", Format::Png, Produced::Pages { dir: dir.clone(), pages: vec![] });
        assert!(matches!(result, Err(ArtifactError::NoPages)));
        assert!(!dir.exists());
    }
}
