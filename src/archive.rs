//! Tar extraction into a staging directory.
//!
//! Entries are unpacked one at a time. An entry whose path climbs out of
//! the staging directory, or whose parent inside it is a symlink created by
//! an earlier entry, fails the whole extraction with a sandbox escape.
//! Device nodes and fifos are skipped.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path};

use tar::EntryType;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl ArchiveFormat {
    /// Detects the format from a file name suffix.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(ArchiveFormat::TarBz2)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// Parses an explicit `archive=` value. `Ok(None)` disables extraction.
    pub fn from_param(value: &str) -> Result<Option<Self>> {
        match value.to_lowercase().as_str() {
            "false" | "none" => Ok(None),
            "tar" => Ok(Some(ArchiveFormat::Tar)),
            "tar.gz" | "tgz" => Ok(Some(ArchiveFormat::TarGz)),
            "tar.bz2" | "tbz2" => Ok(Some(ArchiveFormat::TarBz2)),
            "tar.xz" | "txz" => Ok(Some(ArchiveFormat::TarXz)),
            other => Err(SandboxError::Archive(format!("unsupported archive format '{other}'"))),
        }
    }

    fn decoder(&self, file: File) -> Box<dyn Read> {
        match self {
            ArchiveFormat::Tar => Box::new(file),
            ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
            ArchiveFormat::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
            ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
        }
    }
}

/// Unpacks `archive` into `dest`, which is created if missing.
pub fn extract(archive: &Path, dest: &Path, format: ArchiveFormat) -> Result<()> {
    let file = File::open(archive).map_err(|e| SandboxError::fs(archive, e))?;
    fs::create_dir_all(dest).map_err(|e| SandboxError::fs(dest, e))?;

    let mut tar = tar::Archive::new(format.decoder(file));
    tar.set_overwrite(true);
    tar.set_preserve_permissions(false);
    tar.set_unpack_xattrs(false);

    let entries = tar
        .entries()
        .map_err(|e| SandboxError::Archive(e.to_string()))?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| SandboxError::Archive(e.to_string()))?;
        let kind = entry.header().entry_type();
        let path = entry
            .path()
            .map_err(|e| SandboxError::Archive(e.to_string()))?
            .into_owned();

        if !matches!(
            kind,
            EntryType::Regular
                | EntryType::Continuous
                | EntryType::Directory
                | EntryType::Symlink
                | EntryType::Link
        ) {
            if !matches!(kind, EntryType::XGlobalHeader) {
                warn!("Skipping archive entry {} of type {:?}", path.display(), kind);
            }
            continue;
        }

        check_entry_path(dest, &path)?;
        if kind == EntryType::Link {
            if let Some(link) = entry
                .link_name()
                .map_err(|e| SandboxError::Archive(e.to_string()))?
            {
                check_entry_path(dest, &link)?;
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|e| SandboxError::Archive(format!("{}: {e}", path.display())))?;
        count += 1;
    }

    debug!("Extracted {count} entries from {} into {}", archive.display(), dest.display());
    Ok(())
}

/// Rejects entry paths with `..` and paths whose existing parents inside
/// `dest` are symlinks.
fn check_entry_path(dest: &Path, path: &Path) -> Result<()> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(SandboxError::escape(dest.join(path)));
    }

    let mut current = dest.to_path_buf();
    let mut components = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .peekable();
    while let Some(component) = components.next() {
        // The entry itself may replace an existing symlink
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SandboxError::escape(current));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}
