//! Fetches an artifact into a private staging area.
//!
//! Each call gets a uniquely named temporary directory. Nothing fetched
//! here touches the real destination; the directory is removed when the
//! [`StagedArtifact`] is dropped, whatever the outcome.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::archive::{self, ArchiveFormat};
use crate::artifact::GetterMode;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::resolve::ResolvedArtifact;
use crate::transport::{FetchRequest, Source};

/// Variable holding a bearer token for GCS downloads.
pub const GCS_TOKEN_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// How the staged content maps onto the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `path` is a directory whose children become children of the destination.
    Tree,
    /// `path` is a single file that becomes the destination itself.
    File,
}

#[derive(Debug)]
pub struct StagedArtifact {
    area: TempDir,
    pub path: PathBuf,
    pub layout: Layout,
}

impl StagedArtifact {
    pub fn area(&self) -> &Path {
        self.area.path()
    }
}

fn new_area(config: &SandboxConfig) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("artifact-");
    let area = match config.staging_dir {
        Some(ref parent) => {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::fs(parent, e))?;
            builder.tempdir_in(parent)
        }
        None => builder.tempdir(),
    };
    area.map_err(|e| SandboxError::fs(config.staging_dir.clone().unwrap_or_else(std::env::temp_dir), e))
}

/// Retrieves the artifact into a fresh staging area, extracting archives.
pub async fn fetch(
    artifact: &ResolvedArtifact,
    config: &SandboxConfig,
    bearer_token: Option<String>,
) -> Result<StagedArtifact> {
    let source = Source::parse(&artifact.source)?;
    let transport = source.transport;
    let timeout = transport.timeout(config);

    if transport.produces_tree() && artifact.mode == GetterMode::File {
        return Err(SandboxError::transport(
            &artifact.source,
            format!("{} sources cannot be fetched in file mode", transport.name()),
        ));
    }

    let area = new_area(config)?;
    let download_dir = area.path().join("download");
    let dest = if transport.produces_tree() {
        area.path().join("tree")
    } else {
        tokio::fs::create_dir(&download_dir)
            .await
            .map_err(|e| SandboxError::fs(&download_dir, e))?;
        download_dir.join(source.file_name())
    };

    let req = FetchRequest {
        url: source.url.clone(),
        dest: dest.clone(),
        timeout,
        max_bytes: config.http_max_bytes,
        insecure: artifact.insecure,
        headers: artifact.headers.clone(),
        options: source.options.clone(),
    };

    info!(
        "Fetching {} via {} into staging area {}",
        source.url,
        transport.name(),
        area.path().display()
    );

    // Dropping the future on expiry kills clones and aborts transfers; the
    // staging area goes with `area`.
    tokio::time::timeout(timeout, transport.fetch(&req, bearer_token))
        .await
        .map_err(|_| SandboxError::Timeout {
            transport: transport.name(),
            after: timeout,
        })??;

    if transport.produces_tree() {
        return Ok(StagedArtifact {
            area,
            path: dest,
            layout: Layout::Tree,
        });
    }

    if artifact.mode == GetterMode::File {
        return Ok(StagedArtifact {
            area,
            path: dest,
            layout: Layout::File,
        });
    }

    let format = match source.options.archive {
        Some(ref param) => ArchiveFormat::from_param(param)?,
        None => ArchiveFormat::from_file_name(&source.file_name()),
    };

    match format {
        Some(format) => {
            let tree = area.path().join("tree");
            let archive_path = dest.clone();
            let out = tree.clone();
            tokio::task::spawn_blocking(move || archive::extract(&archive_path, &out, format))
                .await
                .map_err(|e| SandboxError::Archive(e.to_string()))??;
            debug!("Extracted {:?} archive into {}", format, tree.display());
            Ok(StagedArtifact {
                area,
                path: tree,
                layout: Layout::Tree,
            })
        }
        None if artifact.mode == GetterMode::Dir => Err(SandboxError::transport(
            &artifact.source,
            "dir mode requires an archive or repository source",
        )),
        None => Ok(StagedArtifact {
            area,
            path: download_dir,
            layout: Layout::Tree,
        }),
    }
}
