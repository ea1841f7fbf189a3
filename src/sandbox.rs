/// Orchestrates one artifact fetch:
///
///   resolve → fetch into staging → inspect → place → chown
///
/// Each step runs at most once. The first failure is returned wrapped in
/// [`SandboxError::Stage`] and nothing after it runs, so content rejected by
/// inspection never reaches the destination.
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::artifact::ArtifactSpec;
use crate::config::SandboxConfig;
use crate::env::EnvReplacer;
use crate::error::{Result, SandboxError, Stage};
use crate::inspect::inspect;
use crate::owner::{chown_placement, resolve_owner};
use crate::place::place;
use crate::resolve::resolve;
use crate::staging::{self, GCS_TOKEN_VAR};

/// Artifact fetcher for tasks. Cheap to clone; every clone shares one
/// read-only configuration.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
}

impl Sandbox {
    pub fn new(config: Arc<SandboxConfig>) -> Self {
        Self { config }
    }

    /// Fetches `artifact` into the task directory of `env`. When the artifact
    /// asks for it, placed files are handed to `username`.
    pub async fn get(&self, env: &dyn EnvReplacer, artifact: &ArtifactSpec, username: &str) -> Result<()> {
        let strict = !self.config.disable_filesystem_isolation;
        let resolved = resolve(env, artifact, strict).map_err(|e| e.at(Stage::Resolving))?;

        info!(
            "Getting artifact {} → {} (mode: {})",
            resolved.source,
            resolved.destination.display(),
            resolved.mode
        );

        let staged = staging::fetch(&resolved, &self.config, env.get(GCS_TOKEN_VAR))
            .await
            .map_err(|e| e.at(Stage::Fetching))?;

        if self.config.inspection_enabled() {
            let staged_path = staged.path.clone();
            let destination = resolved.destination.clone();
            let root = resolved.sandbox_root.clone();
            blocking(destination.clone(), move || inspect(&staged_path, &destination, &root))
                .await
                .map_err(|e| e.at(Stage::Inspecting))?;
        } else {
            debug!("Artifact inspection disabled for {}", resolved.source);
        }

        let staged_path = staged.path.clone();
        let layout = staged.layout;
        let destination = resolved.destination.clone();
        let placement = blocking(destination.clone(), move || place(&staged_path, layout, &destination))
            .await
            .map_err(|e| e.at(Stage::Placing))?;
        drop(staged);

        if artifact.chown {
            let owner = resolve_owner(username).map_err(|e| e.at(Stage::Owning))?;
            blocking(placement.destination.clone(), move || chown_placement(&placement, owner))
                .await
                .map_err(|e| e.at(Stage::Owning))?;
        }

        info!("Artifact {} ready at {}", resolved.source, resolved.destination.display());
        Ok(())
    }
}

/// Runs a filesystem walk on the blocking pool.
async fn blocking<T, F>(path: PathBuf, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SandboxError::fs(path, std::io::Error::other(e)))?
}
