//! Post-fetch scan for symlinks that would escape the sandbox.
//!
//! The staged tree is walked with an explicit stack and symlinks are never
//! followed during the walk. Each link target is resolved the way the
//! kernel would once the tree sits at its destination: component by
//! component, expanding any symlink met on the way. Staged entries shadow
//! whatever they will replace; everything else is looked up on disk, so
//! symlinks already present above or beside the destination count too.
//! Expansion is capped at [`MAX_SYMLINK_HOPS`], so cyclic links terminate.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::resolve::clean_path;

/// Same bound Linux applies before failing with ELOOP.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Staged content viewed at its future location.
struct PlacedTree<'a> {
    staged: &'a Path,
    destination: &'a Path,
}

impl PlacedTree<'_> {
    /// Maps a path in destination space back onto the staged copy.
    fn staged_path(&self, placed: &Path) -> Option<PathBuf> {
        placed
            .strip_prefix(self.destination)
            .ok()
            .map(|rel| self.staged.join(rel))
    }

    /// Target of the symlink at `placed` once the tree is in place, if any.
    ///
    /// `parent` is the physical directory holding `placed`. The disk is only
    /// consulted when that directory exists as-is, i.e. no staged entry
    /// shadows part of it.
    fn link_at(&self, parent: &Path, placed: &Path) -> Result<Option<PathBuf>> {
        if let Some(staged) = self.staged_path(placed) {
            match fs::symlink_metadata(&staged) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return fs::read_link(&staged)
                        .map(Some)
                        .map_err(|e| SandboxError::fs(&staged, e));
                }
                Ok(_) => return Ok(None),
                Err(_) => {}
            }
        }

        if parent.canonicalize().ok().as_deref() != Some(parent) {
            return Ok(None);
        }
        match fs::symlink_metadata(placed) {
            Ok(meta) if meta.file_type().is_symlink() => fs::read_link(placed)
                .map(Some)
                .map_err(|e| SandboxError::fs(placed, e)),
            _ => Ok(None),
        }
    }

    /// Resolves `target` relative to `base`. `None` when the hop limit is hit.
    fn resolve(&self, base: &Path, target: &Path) -> Result<Option<PathBuf>> {
        let mut resolved = if target.is_absolute() {
            PathBuf::from("/")
        } else {
            base.to_path_buf()
        };
        let mut pending: VecDeque<Segment> = segments(target).collect();
        let mut hops = 0usize;

        while let Some(segment) = pending.pop_front() {
            match segment {
                Segment::Root => resolved = PathBuf::from("/"),
                Segment::Parent => {
                    resolved.pop();
                }
                Segment::Name(name) => {
                    let candidate = resolved.join(&name);
                    match self.link_at(&resolved, &candidate)? {
                        Some(link) => {
                            hops += 1;
                            if hops > MAX_SYMLINK_HOPS {
                                return Ok(None);
                            }
                            // Splice the link's components in front of what is left;
                            // `resolved` stays at the directory holding the link.
                            for seg in segments(&link).collect::<Vec<_>>().into_iter().rev() {
                                pending.push_front(seg);
                            }
                        }
                        None => resolved = candidate,
                    }
                }
            }
        }
        Ok(Some(resolved))
    }
}

enum Segment {
    Root,
    Parent,
    Name(OsString),
}

fn segments(path: &Path) -> impl Iterator<Item = Segment> + '_ {
    path.components().filter_map(|c| match c {
        Component::RootDir | Component::Prefix(_) => Some(Segment::Root),
        Component::ParentDir => Some(Segment::Parent),
        Component::Normal(name) => Some(Segment::Name(name.to_os_string())),
        Component::CurDir => None,
    })
}

/// Returns `path` with every existing ancestor resolved on disk. Components
/// that do not exist yet are appended as written.
fn physical_path(path: &Path) -> Result<PathBuf> {
    let path = clean_path(path);
    let mut existing = path.as_path();
    while fs::symlink_metadata(existing).is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return Ok(path),
        }
    }
    let canonical = existing
        .canonicalize()
        .map_err(|_| SandboxError::escape(existing))?;
    let rest = path.strip_prefix(existing).unwrap_or(Path::new(""));
    Ok(canonical.join(rest))
}

/// Fails with a sandbox escape if any symlink in `staged` would resolve
/// outside `sandbox_root` once `staged` is placed at `destination`.
pub fn inspect(staged: &Path, destination: &Path, sandbox_root: &Path) -> Result<()> {
    let sandbox_root = physical_path(sandbox_root)?;
    // A symlink at the destination itself is replaced, never followed.
    let destination = match (destination.parent(), destination.file_name()) {
        (Some(parent), Some(name)) => physical_path(parent)?.join(name),
        _ => physical_path(destination)?,
    };
    let tree = PlacedTree {
        staged,
        destination: &destination,
    };

    let inside = |path: &Path| path.starts_with(&sandbox_root);

    let mut stack = vec![(staged.to_path_buf(), destination.to_path_buf())];
    let mut checked = 0usize;

    while let Some((staged_path, placed_path)) = stack.pop() {
        let meta = fs::symlink_metadata(&staged_path).map_err(|e| SandboxError::fs(&staged_path, e))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            checked += 1;
            let target = fs::read_link(&staged_path).map_err(|e| SandboxError::fs(&staged_path, e))?;
            let base = placed_path.parent().unwrap_or(Path::new("/"));
            match tree.resolve(base, &target)? {
                Some(resolved) if inside(&resolved) => {}
                Some(resolved) => {
                    warn!(
                        "Symlink {} -> {} resolves outside the sandbox ({})",
                        placed_path.display(),
                        target.display(),
                        resolved.display()
                    );
                    return Err(SandboxError::escape(resolved));
                }
                None => {
                    warn!("Symlink {} does not resolve (loop)", placed_path.display());
                    return Err(SandboxError::escape(placed_path));
                }
            }
        } else if file_type.is_dir() {
            let entries = fs::read_dir(&staged_path).map_err(|e| SandboxError::fs(&staged_path, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| SandboxError::fs(&staged_path, e))?;
                let name = entry.file_name();
                stack.push((entry.path(), placed_path.join(&name)));
            }
        }
    }

    debug!("Inspected {} ({checked} symlinks)", staged.display());
    Ok(())
}
