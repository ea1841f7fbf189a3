//! Hands placed files to the task's unprivileged runtime user.

use std::fs;
use std::os::unix::fs::lchown;
use std::path::Path;

use nix::unistd::User;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::place::Placement;

/// Numeric owner applied to placed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Looks `username` up in the system user database.
pub fn resolve_owner(username: &str) -> Result<OwnerIdentity> {
    let user = User::from_name(username)
        .map_err(|e| SandboxError::Identity {
            user: username.to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| SandboxError::UnknownUser(username.to_string()))?;

    Ok(OwnerIdentity {
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    })
}

/// Re-owns the destination, each merged-into directory and every entry of
/// each newly placed subtree. Symlinks are re-owned themselves, never their
/// targets.
pub fn chown_placement(placement: &Placement, owner: OwnerIdentity) -> Result<()> {
    let mut count = 0usize;

    set_owner(&placement.destination, owner)?;
    count += 1;

    for dir in &placement.merged {
        set_owner(dir, owner)?;
        count += 1;
    }

    let mut stack: Vec<_> = placement.created.clone();
    while let Some(path) = stack.pop() {
        let meta = fs::symlink_metadata(&path).map_err(|e| SandboxError::fs(&path, e))?;
        set_owner(&path, owner)?;
        count += 1;
        if meta.is_dir() {
            for entry in fs::read_dir(&path).map_err(|e| SandboxError::fs(&path, e))? {
                let entry = entry.map_err(|e| SandboxError::fs(&path, e))?;
                stack.push(entry.path());
            }
        }
    }

    info!(
        "Changed ownership of {count} entries under {} to {}:{}",
        placement.destination.display(),
        owner.uid,
        owner.gid
    );
    Ok(())
}

fn set_owner(path: &Path, owner: OwnerIdentity) -> Result<()> {
    debug!("chown {}:{} {}", owner.uid, owner.gid, path.display());
    lchown(path, Some(owner.uid), Some(owner.gid)).map_err(|e| SandboxError::fs(path, e))
}
