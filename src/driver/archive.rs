//! Archive capability.
//!
//! [`Archiver`] creates archives from a set of entries, lists them and
//! extracts them. [`ZipArchiver`] implements it with the `zip` crate; all
//! work runs on the blocking pool and checks the cancellation token between
//! entries.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{ConnectorError, Result};

/// MIME type of ZIP archives.
pub const ZIP_MIME: &str = "application/zip";

/// One entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the extraction directory.
    pub path: PathBuf,
    pub is_dir: bool,
    /// Uncompressed size in bytes.
    pub size: u64,
}

/// Archive container support.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// MIME types this archiver can create.
    fn create_mimes(&self) -> Vec<String>;

    /// MIME types this archiver can extract.
    fn extract_mimes(&self) -> Vec<String>;

    /// Extension for archives of `mime`, without the dot.
    fn extension(&self, mime: &str) -> Option<&'static str>;

    /// Pack `sources` into `dest`. Entry names are relative to `base`;
    /// anything under `skip` is left out.
    async fn create(
        &self,
        base: &Path,
        sources: &[PathBuf],
        dest: &Path,
        skip: Option<&Path>,
        token: &CancellationToken,
    ) -> Result<()>;

    /// List the entries that would be extracted.
    async fn entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>>;

    /// Unpack `archive` into `dest`. Returns the top-level paths created.
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<PathBuf>>;
}

/// ZIP implementation of [`Archiver`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

impl ZipArchiver {
    pub fn new() -> Self {
        Self
    }
}

fn zip_error(e: zip::result::ZipError) -> ConnectorError {
    match e {
        zip::result::ZipError::Io(e) => ConnectorError::Io(e),
        zip::result::ZipError::InvalidArchive(_) | zip::result::ZipError::UnsupportedArchive(_) => {
            ConnectorError::ArchiveType
        }
        other => ConnectorError::Archive(other.to_string()),
    }
}

/// Archive entry name of `path` relative to `base`, using `/` separators.
fn entry_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn create_zip(
    base: &Path,
    sources: &[PathBuf],
    dest: &Path,
    skip: Option<&Path>,
    token: &CancellationToken,
) -> Result<()> {
    let mut writer = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for source in sources {
        let walker = WalkDir::new(source)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| skip.map_or(true, |s| !e.path().starts_with(s)) && e.path() != dest);
        for entry in walker {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            let entry = entry?;
            let Some(name) = entry_name(base, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                writer
                    .add_directory(format!("{name}/"), options)
                    .map_err(zip_error)?;
            } else if entry.file_type().is_file() {
                writer.start_file(name, options).map_err(zip_error)?;
                let mut file = BufReader::new(File::open(entry.path())?);
                io::copy(&mut file, &mut writer)?;
            }
        }
    }

    writer.finish().map_err(zip_error)?;
    Ok(())
}

fn list_zip(archive: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?)).map_err(zip_error)?;
    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let file = zip.by_index(index).map_err(zip_error)?;
        match file.enclosed_name() {
            Some(path) => entries.push(ArchiveEntry {
                path,
                is_dir: file.is_dir(),
                size: file.size(),
            }),
            None => warn!(name = file.name(), "Skipping archive entry outside the target"),
        }
    }
    Ok(entries)
}

fn extract_zip(archive: &Path, dest: &Path, token: &CancellationToken) -> Result<Vec<PathBuf>> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?)).map_err(zip_error)?;
    let mut top_level: Vec<PathBuf> = Vec::new();

    for index in 0..zip.len() {
        if token.is_cancelled() {
            return Err(ConnectorError::ConnectionAborted);
        }
        let mut file = zip.by_index(index).map_err(zip_error)?;
        let Some(relative) = file.enclosed_name() else {
            warn!(name = file.name(), "Skipping archive entry outside the target");
            continue;
        };
        let out = dest.join(&relative);

        if file.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut target = BufWriter::new(File::create(&out)?);
            io::copy(&mut file, &mut target)?;
        }

        if let Some(Component::Normal(first)) = relative.components().next() {
            let first = dest.join(first);
            if !top_level.contains(&first) {
                top_level.push(first);
            }
        }
    }
    Ok(top_level)
}

#[async_trait]
impl Archiver for ZipArchiver {
    fn create_mimes(&self) -> Vec<String> {
        vec![ZIP_MIME.to_string()]
    }

    fn extract_mimes(&self) -> Vec<String> {
        vec![ZIP_MIME.to_string(), "application/x-zip-compressed".to_string()]
    }

    fn extension(&self, mime: &str) -> Option<&'static str> {
        self.create_mimes().iter().any(|m| m == mime).then_some("zip")
    }

    async fn create(
        &self,
        base: &Path,
        sources: &[PathBuf],
        dest: &Path,
        skip: Option<&Path>,
        token: &CancellationToken,
    ) -> Result<()> {
        let base = base.to_path_buf();
        let sources = sources.to_vec();
        let dest = dest.to_path_buf();
        let skip = skip.map(Path::to_path_buf);
        let token = token.clone();
        let result = tokio::task::spawn_blocking({
            let dest = dest.clone();
            move || create_zip(&base, &sources, &dest, skip.as_deref(), &token)
        })
        .await?;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dest.display(), error = %e, "Failed to remove partial archive");
                }
            }
        }
        result
    }

    async fn entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || list_zip(&archive)).await?
    }

    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        let token = token.clone();
        tokio::task::spawn_blocking(move || extract_zip(&archive, &dest, &token)).await?
    }
}
