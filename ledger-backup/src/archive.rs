//! Archive packager: zips a staging tree into `backup_<owner>.zip` and back.

use crate::snapshot::DATA_DIR_NAME;
use crate::utils::errors::ArchiveError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Remote and local name of an owner's archive.
pub fn archive_name(owner_id: &str) -> String {
    format!("backup_{owner_id}.zip")
}

fn partial_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Compress `staging_root` recursively into `archive_path`.
///
/// Any file already at `archive_path` is removed first. The archive is
/// written under a `.partial` name and renamed into place once complete, so
/// a half-written archive never carries the final name.
pub fn package(staging_root: &Path, archive_path: &Path) -> ArchiveResult<PathBuf> {
    if !staging_root.is_dir() {
        return Err(ArchiveError::StagingNotFound(
            staging_root.display().to_string(),
        ));
    }

    if archive_path.exists() {
        std::fs::remove_file(archive_path)?;
    }
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let partial = partial_path(archive_path);
    match write_zip(staging_root, &partial) {
        Ok(entries) => {
            std::fs::rename(&partial, archive_path)?;
            let size = std::fs::metadata(archive_path)?.len();
            info!(
                "Archive written: {} ({} entries, {} bytes)",
                archive_path.display(),
                entries,
                size
            );
            Ok(archive_path.to_path_buf())
        }
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(&partial) {
                warn!("Failed to remove partial archive {}: {}", partial.display(), rm);
            }
            Err(e)
        }
    }
}

fn write_zip(staging_root: &Path, out: &Path) -> ArchiveResult<usize> {
    let file = File::create(out)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = 0usize;

    for entry in WalkDir::new(staging_root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            ArchiveError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
            }))
        })?;
        let path = entry.path();
        let relative = match path.strip_prefix(staging_root) {
            Ok(r) if !r.as_os_str().is_empty() => r,
            _ => continue,
        };
        let name = relative.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            debug!("Adding directory: {}", name);
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            debug!("Adding file: {}", name);
            zip.start_file(name, options)?;
            let mut src = File::open(path)?;
            std::io::copy(&mut src, &mut zip)?;
            entries += 1;
        }
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(entries)
}

/// Extract `archive_path` into `dest_dir`, returning the number of files written.
///
/// Entries whose names would land outside `dest_dir` are rejected.
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> ArchiveResult<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    std::fs::create_dir_all(dest_dir)?;

    let mut count = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| ArchiveError::UnsafeEntry(entry.name().to_string()))?;
        let out = dest_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut dst = File::create(&out)?;
            std::io::copy(&mut entry, &mut dst)?;
            count += 1;
        }
    }

    info!("Archive extracted: {} files into {}", count, dest_dir.display());
    Ok(count)
}

/// Directory holding the captured files inside an unpacked archive.
///
/// Archives normally nest everything under `data/`; older layouts put the
/// files at the root.
pub fn data_dir_of(unpacked_root: &Path) -> PathBuf {
    let nested = unpacked_root.join(DATA_DIR_NAME);
    if nested.is_dir() {
        nested
    } else {
        unpacked_root.to_path_buf()
    }
}
