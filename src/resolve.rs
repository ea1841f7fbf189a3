//! Destination resolution and lexical path containment.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::artifact::{ArtifactSpec, GetterMode};
use crate::env::EnvReplacer;
use crate::error::{Result, SandboxError};

/// An artifact with every string interpolated and the destination made absolute.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub source: String,
    pub destination: PathBuf,
    pub sandbox_root: PathBuf,
    pub headers: BTreeMap<String, String>,
    pub insecure: bool,
    pub mode: GetterMode,
}

/// Lexically normalizes a path: drops `.`, applies `..` against preceding
/// components and never climbs above the root of an absolute path.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Whether `path` is `root` or lies below it. Both must already be clean.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}

/// Joins `destination` onto `root` and rejects results outside `root`.
/// Absolute destinations are interpreted relative to `root`.
pub fn join_within(root: &Path, destination: &str) -> Result<PathBuf> {
    let root = clean_path(root);
    let relative = Path::new(destination);
    // Keep `..` in play so traversal past the root is detected rather than clamped.
    let relative: PathBuf = relative
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    let joined = clean_path(&root.join(relative));
    if !is_within(&root, &joined) {
        return Err(SandboxError::escape(joined));
    }
    Ok(joined)
}

/// Interpolates the artifact and computes its absolute destination.
///
/// With `strict` set, the deepest existing ancestor of the destination is
/// also canonicalized so a pre-existing symlinked directory cannot carry
/// the destination outside the root.
pub fn resolve(env: &dyn EnvReplacer, spec: &ArtifactSpec, strict: bool) -> Result<ResolvedArtifact> {
    let source = env.replace_env(&spec.source);
    let destination = env.replace_env(&spec.destination);
    let sandbox_root = clean_path(env.task_dir());

    let absolute = join_within(&sandbox_root, &destination)?;
    if strict {
        check_canonical(&sandbox_root, &absolute)?;
    }

    let headers = spec
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), env.replace_env(value)))
        .collect();

    debug!("Resolved artifact {source} -> {}", absolute.display());

    Ok(ResolvedArtifact {
        source,
        destination: absolute,
        sandbox_root,
        headers,
        insecure: spec.insecure,
        mode: spec.mode,
    })
}

fn check_canonical(root: &Path, destination: &Path) -> Result<()> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| SandboxError::fs(root, e))?;

    let mut existing = destination;
    loop {
        match existing.symlink_metadata() {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => match existing.parent() {
                Some(parent) => existing = parent,
                None => return Ok(()),
            },
            Err(e) => return Err(SandboxError::fs(existing, e)),
        }
    }

    // The destination itself may be a symlink; placement replaces it, so
    // only its parent has to resolve inside the root.
    let probe = if existing == destination {
        match destination.parent() {
            Some(parent) if is_within(root, parent) => parent,
            _ => return Ok(()),
        }
    } else {
        existing
    };

    let canonical = match probe.canonicalize() {
        Ok(path) => path,
        // Dangling symlink in the ancestry
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SandboxError::escape(probe));
        }
        Err(e) => return Err(SandboxError::fs(probe, e)),
    };
    if !canonical.starts_with(&canonical_root) {
        return Err(SandboxError::escape(canonical));
    }
    Ok(())
}
