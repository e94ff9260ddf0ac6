// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way. Everything in here is a pure
//! helper with no hidden state. Callers pass resolved roots through
//! constructors instead of relying on ambient process state.

use std::{
    ffi::OsStr,
    fs,
    path::{Component, Path, PathBuf},
};

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`PathError::NoHomeDirectory`] if home directory path cannot be
///   determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(PathError::NoHomeDirectory)
}

/// Expand leading tilde or `$HOME` in a path string.
///
/// A bare `~` or `$HOME` becomes the home directory itself. A path starting
/// with `~/` or `$HOME/` gets the home directory substituted for the prefix.
/// Anything else passes through unchanged, so absolute and plain relative
/// paths never trigger a home lookup.
///
/// # Errors
///
/// - Return [`PathError::NoHomeDirectory`] if expansion was required and the
///   home directory cannot be determined.
pub fn expand(path: impl AsRef<str>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path == "~" || path == "$HOME" {
        return home_dir();
    }

    for prefix in ["~/", "$HOME/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            return Ok(home_dir()?.join(rest));
        }
    }

    Ok(PathBuf::from(path))
}

/// Resolve a path to absolute, canonical form.
///
/// Follows intermediate symlinks. Relative paths resolve against the process
/// working directory.
///
/// # Errors
///
/// - Return [`PathError::Canonicalize`] if the path does not exist or a
///   component cannot be resolved.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    fs::canonicalize(path.as_ref()).map_err(|err| PathError::Canonicalize {
        source: err,
        path: path.as_ref().into(),
    })
}

/// Check if path is itself a symlink without following it.
pub fn is_symlink(path: impl AsRef<Path>) -> bool {
    fs::symlink_metadata(path.as_ref())
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Read the literal target of a symlink.
///
/// The returned path is whatever text the link stores, relative or absolute,
/// with no resolution applied.
///
/// # Errors
///
/// - Return [`PathError::ReadLink`] if the path is not a symlink or cannot
///   be read.
pub fn read_link(path: impl AsRef<Path>) -> Result<PathBuf> {
    fs::read_link(path.as_ref()).map_err(|err| PathError::ReadLink {
        source: err,
        path: path.as_ref().into(),
    })
}

/// Probe the kind of filesystem object at a path.
///
/// Uses lstat semantics. A dangling symlink is still [`PathKind::Symlink`],
/// not [`PathKind::Missing`].
pub fn classify(path: impl AsRef<Path>) -> PathKind {
    match fs::symlink_metadata(path.as_ref()) {
        Err(_) => PathKind::Missing,
        Ok(meta) => {
            let kind = meta.file_type();
            if kind.is_symlink() {
                PathKind::Symlink
            } else if kind.is_dir() {
                PathKind::Dir
            } else if kind.is_file() {
                PathKind::File
            } else {
                PathKind::Other
            }
        }
    }
}

/// Compute the relative path to place in a symlink at `target` pointing to
/// `source`.
///
/// The result is relative to the directory _containing_ `target`. Both
/// arguments must be absolute. Splits both paths into components, drops the
/// longest common prefix, emits one `..` per remaining target-side component,
/// then appends the remaining source-side components. An empty result
/// becomes `.`.
pub fn make_relative(source: impl AsRef<Path>, target: impl AsRef<Path>) -> PathBuf {
    let base = target
        .as_ref()
        .parent()
        .map(normal_components)
        .unwrap_or_default();
    let source = normal_components(source.as_ref());

    let common = base
        .iter()
        .zip(source.iter())
        .take_while(|(lhs, rhs)| lhs == rhs)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &source[common..] {
        relative.push(component);
    }

    if relative.as_os_str().is_empty() {
        relative.push(".");
    }

    relative
}

/// Create a directory and all missing ancestors.
///
/// A directory that already exists is not an error.
///
/// # Errors
///
/// - Return [`PathError::CreateDirTree`] if any component cannot be created.
pub fn ensure_dir_tree(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref()).map_err(|err| PathError::CreateDirTree {
        source: err,
        path: path.as_ref().into(),
    })
}

// INVARIANT: Inputs are absolute, so skipping root and prefix components
// never loses information.
fn normal_components(path: &Path) -> Vec<&OsStr> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect()
}

/// Kind of filesystem object found at a path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Nothing there, not even a dangling symlink.
    #[default]
    Missing,

    /// Regular file.
    File,

    /// Real directory.
    Dir,

    /// Symlink, possibly dangling.
    Symlink,

    /// Device, socket, fifo, or other exotic object.
    Other,
}

/// Path resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Cannot determine user's home directory.
    #[error("cannot determine absolute path to user's home directory")]
    NoHomeDirectory,

    /// Path cannot be canonicalized.
    #[error("failed to canonicalize {:?}", path.display())]
    Canonicalize {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Symlink target cannot be read.
    #[error("failed to read symlink at {:?}", path.display())]
    ReadLink {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory tree cannot be created.
    #[error("failed to create directory tree at {:?}", path.display())]
    CreateDirTree {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[test]
    fn make_relative_sibling_trees() {
        let result = make_relative("/x/src/vim/.vimrc", "/x/tgt/.vimrc");
        assert_eq!(result, PathBuf::from("../src/vim/.vimrc"));
    }

    #[test]
    fn make_relative_shared_parent() {
        let result = make_relative("/home/user/dotfiles/vim", "/home/user/vim");
        assert_eq!(result, PathBuf::from("dotfiles/vim"));
    }

    #[test]
    fn make_relative_deep_target() {
        let result = make_relative("/a/src/f", "/a/b/c/d/f");
        assert_eq!(result, PathBuf::from("../../../src/f"));
    }

    #[test]
    fn make_relative_identical_parent_yields_name() {
        let result = make_relative("/a/b/file", "/a/b/other");
        assert_eq!(result, PathBuf::from("file"));
    }

    #[test]
    fn make_relative_empty_becomes_dot() {
        let result = make_relative("/a/b", "/a/b/c");
        assert_eq!(result, PathBuf::from("."));
    }

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn expand_tilde_prefix() -> anyhow::Result<()> {
        assert_eq!(expand("~/config")?, PathBuf::from("/home/blah/config"));
        assert_eq!(expand("$HOME/config")?, PathBuf::from("/home/blah/config"));
        assert_eq!(expand("~")?, PathBuf::from("/home/blah"));
        assert_eq!(expand("$HOME")?, PathBuf::from("/home/blah"));

        Ok(())
    }

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn expand_passes_plain_paths_through() -> anyhow::Result<()> {
        assert_eq!(expand("/etc/passwd")?, PathBuf::from("/etc/passwd"));
        assert_eq!(expand("relative/file")?, PathBuf::from("relative/file"));

        Ok(())
    }

    #[test]
    fn classify_reports_dangling_symlink() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let link = temp.path().join("dangling");
        std::os::unix::fs::symlink("nowhere", &link)?;

        assert_eq!(classify(&link), PathKind::Symlink);
        assert!(is_symlink(&link));
        assert_eq!(read_link(&link)?, PathBuf::from("nowhere"));

        Ok(())
    }

    #[test]
    fn classify_distinguishes_file_dir_missing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let file = temp.path().join("file");
        std::fs::write(&file, "data")?;

        assert_eq!(classify(&file), PathKind::File);
        assert_eq!(classify(temp.path()), PathKind::Dir);
        assert_eq!(classify(temp.path().join("missing")), PathKind::Missing);

        Ok(())
    }

    #[test]
    fn ensure_dir_tree_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let nested = temp.path().join("a/b/c");

        ensure_dir_tree(&nested)?;
        ensure_dir_tree(&nested)?;
        assert_eq!(classify(&nested), PathKind::Dir);

        Ok(())
    }
}
