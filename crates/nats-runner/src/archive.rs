use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Container format of a release archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        }
    }
}

/// Unpacks a downloaded archive into a directory
///
/// Runs on a blocking thread.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, kind: ArchiveKind, destination: &Path) -> Result<()>;
}

/// Extracts every file entry directly into the destination, dropping the
/// directories it was stored under. Directory entries are ignored and a
/// later entry with the same file name overwrites an earlier one.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatteningExtractor;

impl ArchiveExtractor for FlatteningExtractor {
    fn extract(&self, archive: &Path, kind: ArchiveKind, destination: &Path) -> Result<()> {
        std::fs::create_dir_all(destination)
            .with_context(|| format!("Failed to create {}", destination.display()))?;

        let file = File::open(archive)
            .with_context(|| format!("Failed to open archive {}", archive.display()))?;

        let count = match kind {
            ArchiveKind::TarGz => extract_tar_gz(file, destination)?,
            ArchiveKind::Zip => extract_zip(file, destination)?,
        };
        debug!(archive = %archive.display(), files = count, "Extracted archive");
        Ok(())
    }
}

/// Last component of an entry name, whatever separator the archive used
fn flat_name(entry_name: &str) -> Option<&str> {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

fn write_entry(mut reader: impl Read, destination: &Path, name: &str) -> Result<()> {
    let target = destination.join(name);
    let mut out =
        File::create(&target).with_context(|| format!("Failed to create {}", target.display()))?;
    std::io::copy(&mut reader, &mut out)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(())
}

fn extract_tar_gz(file: File, destination: &Path) -> Result<usize> {
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut count = 0;

    for entry in archive.entries().context("Failed to read tar archive")? {
        let entry = entry.context("Corrupt tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = {
            let path = entry.path().context("Invalid tar entry path")?;
            path.to_str().and_then(flat_name).map(str::to_owned)
        };
        let Some(name) = name else {
            continue;
        };
        write_entry(entry, destination, &name)?;
        count += 1;
    }

    Ok(count)
}

fn extract_zip(file: File, destination: &Path) -> Result<usize> {
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).context("Failed to read zip archive")?;
    let mut count = 0;

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("Corrupt zip entry #{index}"))?;
        if entry.is_dir() {
            continue;
        }

        let Some(name) = flat_name(entry.name()).map(str::to_owned) else {
            continue;
        };
        write_entry(entry, destination, &name)?;
        count += 1;
    }

    Ok(count)
}
