//! Workspace boundary: resolve untrusted paths and reject anything outside the root.
//!
//! Resolution is lexical normalization followed by canonicalization of the
//! longest existing ancestor, so symlinks inside the workspace cannot point a
//! not-yet-existing path outside of it. The returned path is the one callers
//! must operate on.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// Rejection produced by [`Workspace::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryError {
    pub input: String,
}

impl fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Access denied: path outside workspace boundary ({})",
            self.input
        )
    }
}

impl std::error::Error for BoundaryError {}

/// Canonical sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Canonicalize `root`. The directory must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = fs::canonicalize(root)
            .with_context(|| format!("resolve workspace {}", root.display()))?;
        if !canonical.is_dir() {
            return Err(anyhow!("workspace is not a directory: {}", canonical.display()));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `input` (absolute, or relative to the root) to a canonical path inside the workspace.
    pub fn resolve(&self, input: impl AsRef<Path>) -> Result<PathBuf, BoundaryError> {
        let input = input.as_ref();
        let reject = || BoundaryError {
            input: input.display().to_string(),
        };

        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };
        let normalized = normalize_lexically(&joined);
        let resolved = canonicalize_existing_prefix(&normalized).ok_or_else(reject)?;

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(reject())
        }
    }

    /// Like [`resolve`](Self::resolve), but a symlink in the final component is
    /// returned as the link itself. Its target must still lie inside the workspace.
    pub fn resolve_entry(&self, input: impl AsRef<Path>) -> Result<PathBuf, BoundaryError> {
        let input = input.as_ref();
        let resolved = self.resolve(input)?;
        if self.is_root(&resolved) {
            return Ok(resolved);
        }
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };
        let normalized = normalize_lexically(&joined);
        match (normalized.parent(), normalized.file_name()) {
            (Some(parent), Some(name)) => Ok(self.resolve(parent)?.join(name)),
            _ => Ok(resolved),
        }
    }

    /// Workspace-relative form of a resolved path (`"."` for the root itself).
    pub fn relative(&self, resolved: &Path) -> String {
        match resolved.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => resolved.to_string_lossy().into_owned(),
        }
    }

    pub fn is_root(&self, resolved: &Path) -> bool {
        resolved == self.root
    }
}

/// Collapse `.` and `..` without touching the filesystem. `..` never climbs above the root component.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor and re-append the missing tail.
///
/// Returns `None` when a dangling symlink sits on the path: its target cannot be checked.
fn canonicalize_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    let mut current = path;
    loop {
        match fs::canonicalize(current) {
            Ok(canonical) => {
                let mut resolved = canonical;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Some(resolved);
            }
            Err(_) if current.symlink_metadata().is_ok() => return None,
            Err(_) => {
                tail.push(current.file_name()?);
                current = current.parent()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(temp.path()).expect("workspace");
        (temp, ws)
    }

    #[test]
    fn relative_and_absolute_inside_paths_resolve() {
        let (_temp, ws) = workspace();
        fs::create_dir(ws.root().join("src")).expect("mkdir");

        let rel = ws.resolve("src/main.py").expect("relative");
        assert_eq!(rel, ws.root().join("src/main.py"));

        let abs = ws.resolve(ws.root().join("src")).expect("absolute");
        assert_eq!(abs, ws.root().join("src"));

        assert_eq!(ws.resolve(".").expect("root"), ws.root());
        assert_eq!(ws.resolve("a/../b").expect("dotdot inside"), ws.root().join("b"));
    }

    #[test]
    fn traversal_outside_is_rejected() {
        let (_temp, ws) = workspace();
        for input in ["..", "../escape.txt", "a/../../b", "/etc/passwd"] {
            let err = ws.resolve(input).expect_err(input);
            assert!(err.to_string().contains("outside workspace boundary"), "{input}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let (_temp, ws) = workspace();
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), ws.root().join("link")).expect("symlink");

        assert!(ws.resolve("link/new.txt").is_err());
        assert!(ws.resolve("link").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_rejected() {
        let (_temp, ws) = workspace();
        std::os::unix::fs::symlink("/nonexistent-target-xyz", ws.root().join("dangling"))
            .expect("symlink");
        assert!(ws.resolve("dangling").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn entry_resolution_keeps_final_symlink() {
        let (_temp, ws) = workspace();
        fs::write(ws.root().join("real.txt"), "x").expect("write");
        std::os::unix::fs::symlink(ws.root().join("real.txt"), ws.root().join("alias"))
            .expect("symlink");

        assert_eq!(ws.resolve("alias").expect("target"), ws.root().join("real.txt"));
        assert_eq!(ws.resolve_entry("alias").expect("link"), ws.root().join("alias"));
        assert_eq!(ws.resolve_entry(".").expect("root"), ws.root());

        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), ws.root().join("escape")).expect("symlink");
        assert!(ws.resolve_entry("escape").is_err());
    }

    #[test]
    fn relative_display() {
        let (_temp, ws) = workspace();
        assert_eq!(ws.relative(ws.root()), ".");
        assert_eq!(ws.relative(&ws.root().join("a/b.txt")), "a/b.txt");
    }
}
