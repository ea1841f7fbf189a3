//! Moves staged content into the real destination.
//!
//! Every entry is placed by `rename`, so a replaced file is a new inode and
//! readers holding the old one never see a half-written file. Existing
//! symlinks at a target path are replaced as links and never followed.
//! Entries already in the destination but absent from the staged tree are
//! left alone. When staging and destination sit on different filesystems,
//! content is copied to a sibling temporary name first and then renamed.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::staging::Layout;

/// Mode for directories created on the way to the destination.
const DIR_MODE: u32 = 0o755;

/// What a placement touched. Drives the ownership pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub destination: PathBuf,
    /// Entries created or replaced by this call; directories include their
    /// whole subtree.
    pub created: Vec<PathBuf>,
    /// Pre-existing directories that staged entries were merged into.
    pub merged: Vec<PathBuf>,
}

/// Places `staged` at `destination` according to `layout`.
pub fn place(staged: &Path, layout: Layout, destination: &Path) -> Result<Placement> {
    let mut placement = Placement {
        destination: destination.to_path_buf(),
        ..Placement::default()
    };

    if let Some(parent) = destination.parent() {
        create_dirs(parent)?;
    }

    let existing = symlink_metadata_opt(destination)?;
    match layout {
        Layout::File => {
            if let Some(meta) = existing {
                if meta.is_dir() {
                    return Err(SandboxError::Collision {
                        path: destination.to_path_buf(),
                        reason: "destination is a directory",
                    });
                }
            }
            replace_entry(staged, destination)?;
            placement.created.push(destination.to_path_buf());
        }
        Layout::Tree => match existing {
            None => {
                move_tree(staged, destination)?;
                set_mode(destination, DIR_MODE)?;
                placement.created.push(destination.to_path_buf());
            }
            Some(meta) if meta.file_type().is_symlink() => {
                debug!("Replacing symlink at {}", destination.display());
                fs::remove_file(destination).map_err(|e| SandboxError::fs(destination, e))?;
                move_tree(staged, destination)?;
                set_mode(destination, DIR_MODE)?;
                placement.created.push(destination.to_path_buf());
            }
            Some(meta) if meta.is_dir() => {
                placement.merged.push(destination.to_path_buf());
                merge(staged, destination, &mut placement)?;
            }
            Some(_) => {
                return Err(SandboxError::Collision {
                    path: destination.to_path_buf(),
                    reason: "destination is a file but the artifact is a directory",
                });
            }
        },
    }

    info!(
        "Placed artifact at {} ({} new, {} merged)",
        destination.display(),
        placement.created.len(),
        placement.merged.len()
    );
    Ok(placement)
}

/// Merges the children of `staged` into the existing directory `destination`.
fn merge(staged: &Path, destination: &Path, placement: &mut Placement) -> Result<()> {
    let mut stack = vec![(staged.to_path_buf(), destination.to_path_buf())];

    while let Some((src_dir, dst_dir)) = stack.pop() {
        let entries = fs::read_dir(&src_dir).map_err(|e| SandboxError::fs(&src_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| SandboxError::fs(&src_dir, e))?;
            let src = entry.path();
            let dst = dst_dir.join(entry.file_name());
            let src_type = entry
                .file_type()
                .map_err(|e| SandboxError::fs(&src, e))?;
            let existing = symlink_metadata_opt(&dst)?;
            let dst_is_dir = existing
                .as_ref()
                .is_some_and(|m| m.is_dir() && !m.file_type().is_symlink());

            if src_type.is_dir() {
                match existing {
                    None => {
                        move_tree(&src, &dst)?;
                        placement.created.push(dst);
                    }
                    Some(_) if dst_is_dir => {
                        placement.merged.push(dst.clone());
                        stack.push((src, dst));
                    }
                    Some(meta) if meta.file_type().is_symlink() => {
                        fs::remove_file(&dst).map_err(|e| SandboxError::fs(&dst, e))?;
                        move_tree(&src, &dst)?;
                        placement.created.push(dst);
                    }
                    Some(_) => {
                        return Err(SandboxError::Collision {
                            path: dst,
                            reason: "a file exists where the artifact has a directory",
                        });
                    }
                }
            } else {
                if dst_is_dir {
                    return Err(SandboxError::Collision {
                        path: dst,
                        reason: "a directory exists where the artifact has a file",
                    });
                }
                replace_entry(&src, &dst)?;
                placement.created.push(dst);
            }
        }
    }
    Ok(())
}

/// Renames a file or symlink over `dst`, replacing whatever non-directory is there.
fn replace_entry(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            let tmp = sibling_temp(dst);
            let copied = copy_entry(src, &tmp).and_then(|()| fs::rename(&tmp, dst));
            if let Err(e) = copied {
                let _ = fs::remove_file(&tmp);
                return Err(SandboxError::fs(dst, e));
            }
            Ok(())
        }
        Err(e) => Err(SandboxError::fs(dst, e)),
    }
}

/// Moves a directory tree to a path that does not exist yet.
fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            let tmp = sibling_temp(dst);
            if let Err(e) = copy_tree(src, &tmp).and_then(|()| fs::rename(&tmp, dst)) {
                let _ = fs::remove_dir_all(&tmp);
                return Err(SandboxError::fs(dst, e));
            }
            Ok(())
        }
        Err(e) => Err(SandboxError::fs(dst, e)),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        let meta = fs::symlink_metadata(&from)?;
        if meta.is_dir() {
            fs::create_dir(&to)?;
            fs::set_permissions(&to, meta.permissions())?;
            for entry in fs::read_dir(&from)? {
                let entry = entry?;
                stack.push((entry.path(), to.join(entry.file_name())));
            }
        } else {
            copy_entry(&from, &to)?;
        }
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

fn sibling_temp(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EXDEV as i32)
}

fn symlink_metadata_opt(path: &Path) -> Result<Option<fs::Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SandboxError::fs(path, e)),
    }
}

fn create_dirs(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|e| SandboxError::fs(path, e))
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| SandboxError::fs(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, MetadataExt};

    struct Fixture {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        staged: PathBuf,
        dest: PathBuf,
    }

    fn fixture() -> Fixture {
        let staging = tempfile::tempdir().unwrap();
        let task = tempfile::tempdir().unwrap();
        let staged = staging.path().join("tree");
        fs::create_dir(&staged).unwrap();
        let dest = task.path().join("local/downloads");
        Fixture {
            staged,
            dest,
            _dirs: (staging, task),
        }
    }

    #[test]
    fn test_creates_missing_destination() {
        let f = fixture();
        fs::write(f.staged.join("test-file"), "content").unwrap();

        let placement = place(&f.staged, Layout::Tree, &f.dest).unwrap();
        assert_eq!(fs::read_to_string(f.dest.join("test-file")).unwrap(), "content");
        assert_eq!(placement.created, vec![f.dest.clone()]);
        assert!(placement.merged.is_empty());
        let mode = fs::metadata(&f.dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, DIR_MODE);
    }

    #[test]
    fn test_replaces_existing_file_with_new_inode() {
        let f = fixture();
        fs::create_dir_all(&f.dest).unwrap();
        fs::write(f.dest.join("test-file"), "testing").unwrap();
        fs::write(f.dest.join("sibling"), "keep").unwrap();
        let before = fs::metadata(f.dest.join("test-file")).unwrap().ino();

        fs::write(f.staged.join("test-file"), "new").unwrap();
        let placement = place(&f.staged, Layout::Tree, &f.dest).unwrap();

        let after = fs::metadata(f.dest.join("test-file")).unwrap().ino();
        assert_ne!(before, after);
        assert_eq!(fs::read_to_string(f.dest.join("test-file")).unwrap(), "new");
        assert_eq!(fs::read_to_string(f.dest.join("sibling")).unwrap(), "keep");
        assert_eq!(placement.merged, vec![f.dest.clone()]);
        assert_eq!(placement.created, vec![f.dest.join("test-file")]);
    }

    #[test]
    fn test_merges_nested_directories() {
        let f = fixture();
        fs::create_dir_all(f.dest.join("other")).unwrap();
        fs::write(f.dest.join("other/testfile.txt"), "testing").unwrap();

        for name in ["test.file", "nested/test.file", "other/test.file"] {
            let path = f.staged.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }

        let placement = place(&f.staged, Layout::Tree, &f.dest).unwrap();
        for name in ["test.file", "nested/test.file", "other/test.file", "other/testfile.txt"] {
            assert!(f.dest.join(name).is_file(), "{name}");
        }
        assert!(placement.merged.contains(&f.dest.join("other")));
        assert!(placement.created.contains(&f.dest.join("nested")));
        assert!(!placement.created.contains(&f.dest.join("other/testfile.txt")));
    }

    #[test]
    fn test_existing_symlink_replaced_not_followed() {
        let f = fixture();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("test-file"), "outside").unwrap();
        fs::create_dir_all(&f.dest).unwrap();
        symlink(outside.path().join("test-file"), f.dest.join("test-file")).unwrap();
        symlink(outside.path(), f.dest.join("dir")).unwrap();

        fs::write(f.staged.join("test-file"), "inside").unwrap();
        fs::create_dir(f.staged.join("dir")).unwrap();
        fs::write(f.staged.join("dir/planted"), "x").unwrap();

        place(&f.staged, Layout::Tree, &f.dest).unwrap();

        let meta = fs::symlink_metadata(f.dest.join("test-file")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read_to_string(outside.path().join("test-file")).unwrap(), "outside");
        assert!(!fs::symlink_metadata(f.dest.join("dir")).unwrap().file_type().is_symlink());
        assert!(!outside.path().join("planted").exists());
    }

    #[test]
    fn test_destination_symlink_replaced() {
        let f = fixture();
        let outside = tempfile::tempdir().unwrap();
        fs::create_dir_all(f.dest.parent().unwrap()).unwrap();
        symlink(outside.path(), &f.dest).unwrap();
        fs::write(f.staged.join("a"), "x").unwrap();

        place(&f.staged, Layout::Tree, &f.dest).unwrap();
        assert!(!fs::symlink_metadata(&f.dest).unwrap().file_type().is_symlink());
        assert!(!outside.path().join("a").exists());
    }

    #[test]
    fn test_file_layout() {
        let f = fixture();
        let file = f.staged.join("app.tar");
        fs::write(&file, "packed").unwrap();
        let target = f.dest.join("bundle.tar");

        let placement = place(&file, Layout::File, &target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "packed");
        assert_eq!(placement.created, vec![target]);
    }

    #[test]
    fn test_collisions_reported() {
        let f = fixture();
        fs::create_dir_all(f.dest.parent().unwrap()).unwrap();
        fs::write(&f.dest, "plain file").unwrap();
        fs::write(f.staged.join("a"), "x").unwrap();
        let err = place(&f.staged, Layout::Tree, &f.dest).unwrap_err();
        assert!(matches!(err, SandboxError::Collision { .. }));
        assert_eq!(fs::read_to_string(&f.dest).unwrap(), "plain file");

        let g = fixture();
        fs::create_dir_all(g.dest.join("a")).unwrap();
        fs::write(g.staged.join("a"), "x").unwrap();
        let err = place(&g.staged, Layout::Tree, &g.dest).unwrap_err();
        assert!(matches!(err, SandboxError::Collision { .. }));
    }

    #[test]
    fn test_copy_tree_preserves_links() {
        let f = fixture();
        fs::create_dir(f.staged.join("sub")).unwrap();
        fs::write(f.staged.join("sub/file"), "x").unwrap();
        symlink("sub/file", f.staged.join("link")).unwrap();

        let copy = f.staged.parent().unwrap().join("copy");
        copy_tree(&f.staged, &copy).unwrap();
        assert_eq!(fs::read_to_string(copy.join("sub/file")).unwrap(), "x");
        assert_eq!(fs::read_link(copy.join("link")).unwrap(), PathBuf::from("sub/file"));
    }

    #[test]
    fn test_sibling_temp_is_hidden_neighbour() {
        let tmp = sibling_temp(Path::new("/task/local/app.bin"));
        assert_eq!(tmp.parent(), Some(Path::new("/task/local")));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".app.bin."));
        assert!(name.ends_with(".tmp"));
    }
}
