//! Workspace-bounded file operations for model-issued `navigate` tool calls.
//!
//! Every operation returns `Result<Success, OperationError>`; IO faults are
//! converted into the uniform error shape and never escape as `anyhow` errors.

use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::tool_calls::{NavigateOp, NavigateParams};
use crate::io::path_guard::{BoundaryError, Workspace};

/// Default ceiling for `read` (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Uniform failure shape for every navigator operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub operation: NavigateOp,
    pub error: String,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.error)
    }
}

impl std::error::Error for OperationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One file or directory as seen by `list` and `stat`.
///
/// Optional fields are `None` when the entry could not be inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemEntry {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub path: String,
    pub entries: Vec<FileSystemEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReport {
    pub path: String,
    pub bytes_written: u64,
    pub created: bool,
    pub appended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MkdirReport {
    pub path: String,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub path: String,
    pub kind: EntryKind,
    pub deleted_at: DateTime<Utc>,
}

/// Success payload of [`Navigator::run`], one variant per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum NavigateSuccess {
    List(Listing),
    Read(FileContent),
    Write(WriteReport),
    Mkdir(MkdirReport),
    Delete(DeleteReport),
    Stat(FileSystemEntry),
}

/// File operations confined to one workspace.
#[derive(Debug, Clone)]
pub struct Navigator {
    workspace: Workspace,
    max_file_size: u64,
}

impl Navigator {
    pub fn new(workspace: Workspace, max_file_size: u64) -> Self {
        Self {
            workspace,
            max_file_size,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Dispatch a parsed `navigate` call to the matching operation.
    pub fn run(&self, params: &NavigateParams) -> Result<NavigateSuccess, OperationError> {
        let path = params.path.as_deref();
        let require_path = || {
            path.ok_or_else(|| OperationError {
                operation: params.op,
                error: format!("navigate.op={} requires params.path", params.op),
            })
        };
        match params.op {
            NavigateOp::List => self.list_directory(path.unwrap_or(".")).map(NavigateSuccess::List),
            NavigateOp::Read => self.read_file(require_path()?).map(NavigateSuccess::Read),
            NavigateOp::Write => {
                let options = params.write_options.clone().unwrap_or_default();
                let content = params.content.as_deref().ok_or_else(|| OperationError {
                    operation: NavigateOp::Write,
                    error: "navigate.op=write requires params.content".to_string(),
                })?;
                self.write_file(
                    require_path()?,
                    content,
                    options.append.unwrap_or(false),
                    options.create_dirs.unwrap_or(false),
                )
                .map(NavigateSuccess::Write)
            }
            NavigateOp::Mkdir => {
                let recursive = params
                    .mkdir_options
                    .as_ref()
                    .and_then(|options| options.recursive)
                    .unwrap_or(true);
                self.create_directory(require_path()?, recursive)
                    .map(NavigateSuccess::Mkdir)
            }
            NavigateOp::Delete => {
                let recursive = params
                    .delete_options
                    .as_ref()
                    .and_then(|options| options.recursive)
                    .unwrap_or(false);
                self.delete(require_path()?, recursive)
                    .map(NavigateSuccess::Delete)
            }
            NavigateOp::Stat => self.get_metadata(require_path()?).map(NavigateSuccess::Stat),
        }
    }

    /// List a directory: directories first, then by name (case-insensitive).
    #[instrument(skip(self))]
    pub fn list_directory(&self, path: &str) -> Result<Listing, OperationError> {
        self.guarded(NavigateOp::List, path, |dir| {
            let meta = fs::metadata(dir).map_err(|err| describe_missing(&err, "read directory"))?;
            if !meta.is_dir() {
                return Err("Path is not a directory".to_string());
            }
            let reader = fs::read_dir(dir).map_err(|err| io_message("read directory", &err))?;
            let mut entries = Vec::new();
            for item in reader {
                let item = match item {
                    Ok(item) => item,
                    Err(err) => {
                        warn!(err = %err, "skipping unreadable directory entry");
                        continue;
                    }
                };
                entries.push(self.describe_entry(&item.path(), item.file_type().ok()));
            }
            entries.sort_by(compare_entries);
            Ok(Listing {
                path: self.workspace.relative(dir),
                entries,
            })
        })
    }

    /// Read a UTF-8 file no larger than the configured ceiling.
    #[instrument(skip(self))]
    pub fn read_file(&self, path: &str) -> Result<FileContent, OperationError> {
        let max = self.max_file_size;
        self.guarded(NavigateOp::Read, path, |file| {
            let meta = fs::metadata(file).map_err(|err| describe_missing(&err, "stat file"))?;
            if meta.is_dir() {
                return Err("Path is a directory, not a file".to_string());
            }
            if meta.len() > max {
                return Err(format!(
                    "File size exceeds limit: {} bytes > {max} bytes",
                    meta.len()
                ));
            }
            let bytes = fs::read(file).map_err(|err| match err.kind() {
                ErrorKind::PermissionDenied => "File is not readable (permission denied)".to_string(),
                _ => io_message("read file", &err),
            })?;
            let size = bytes.len() as u64;
            let content =
                String::from_utf8(bytes).map_err(|_| "File is not valid UTF-8 text".to_string())?;
            Ok(FileContent {
                path: self.workspace.relative(file),
                content,
                size,
            })
        })
    }

    /// Write or append `content`. Parents are created only with `create_dirs`.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub fn write_file(
        &self,
        path: &str,
        content: &str,
        append: bool,
        create_dirs: bool,
    ) -> Result<WriteReport, OperationError> {
        let max = self.max_file_size;
        self.guarded(NavigateOp::Write, path, |file| {
            if content.len() as u64 > max {
                return Err(format!(
                    "Content size exceeds limit: {} bytes > {max} bytes",
                    content.len()
                ));
            }
            let existed = match fs::metadata(file) {
                Ok(meta) if meta.is_dir() => {
                    return Err("Path is a directory, not a file".to_string());
                }
                Ok(_) => {
                    if !is_file_writable(file) {
                        return Err("File is not writable (permission denied)".to_string());
                    }
                    true
                }
                Err(err) if err.kind() == ErrorKind::NotFound => false,
                Err(err) => return Err(io_message("stat file", &err)),
            };

            if !existed {
                if append {
                    return Err("Cannot append: file does not exist".to_string());
                }
                self.ensure_parent(file, create_dirs)?;
            }

            if append {
                let mut handle = OpenOptions::new()
                    .append(true)
                    .open(file)
                    .map_err(|err| io_message("open file for append", &err))?;
                handle
                    .write_all(content.as_bytes())
                    .map_err(|err| io_message("append file", &err))?;
            } else {
                fs::write(file, content).map_err(|err| io_message("write file", &err))?;
            }

            Ok(WriteReport {
                path: self.workspace.relative(file),
                bytes_written: content.len() as u64,
                created: !existed,
                appended: append,
            })
        })
    }

    /// Create a directory. Idempotent: an existing directory reports `created = false`.
    #[instrument(skip(self))]
    pub fn create_directory(&self, path: &str, recursive: bool) -> Result<MkdirReport, OperationError> {
        self.guarded(NavigateOp::Mkdir, path, |dir| {
            match fs::metadata(dir) {
                Ok(meta) if meta.is_dir() => {
                    return Ok(MkdirReport {
                        path: self.workspace.relative(dir),
                        created: false,
                    });
                }
                Ok(_) => return Err("Path exists but is not a directory".to_string()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(io_message("stat directory", &err)),
            }
            let result = if recursive {
                fs::create_dir_all(dir)
            } else {
                fs::create_dir(dir)
            };
            result.map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    "Parent directory does not exist (use recursive: true option)".to_string()
                }
                _ => io_message("create directory", &err),
            })?;
            Ok(MkdirReport {
                path: self.workspace.relative(dir),
                created: true,
            })
        })
    }

    /// Delete a file, or a directory (non-empty only with `recursive`).
    ///
    /// A symlink is removed as a link; its target is left alone.
    #[instrument(skip(self))]
    pub fn delete(&self, path: &str, recursive: bool) -> Result<DeleteReport, OperationError> {
        let resolved = self.workspace.resolve_entry(path);
        self.finish(NavigateOp::Delete, path, resolved, |target| {
            if self.workspace.is_root(target) {
                return Err("Refusing to delete the workspace root".to_string());
            }
            let meta = fs::symlink_metadata(target)
                .map_err(|err| describe_missing(&err, "stat path"))?;
            let kind = if meta.is_dir() {
                if recursive {
                    fs::remove_dir_all(target)
                        .map_err(|err| io_message("delete directory", &err))?;
                } else {
                    let non_empty = fs::read_dir(target)
                        .map_err(|err| io_message("read directory", &err))?
                        .next()
                        .is_some();
                    if non_empty {
                        return Err(
                            "Directory is not empty (use recursive: true option)".to_string()
                        );
                    }
                    fs::remove_dir(target).map_err(|err| io_message("delete directory", &err))?;
                }
                EntryKind::Directory
            } else {
                fs::remove_file(target).map_err(|err| io_message("delete file", &err))?;
                EntryKind::File
            };
            Ok(DeleteReport {
                path: self.workspace.relative(target),
                kind,
                deleted_at: Utc::now(),
            })
        })
    }

    /// Kind, size, mtime and independently checked permissions of one path.
    #[instrument(skip(self))]
    pub fn get_metadata(&self, path: &str) -> Result<FileSystemEntry, OperationError> {
        self.guarded(NavigateOp::Stat, path, |target| {
            let meta = fs::metadata(target).map_err(|err| describe_missing(&err, "stat path"))?;
            Ok(entry_from_metadata(&self.workspace, target, &meta))
        })
    }

    /// Resolve `path` against the workspace, run `op`, and log failures.
    fn guarded<T>(
        &self,
        operation: NavigateOp,
        path: &str,
        op: impl FnOnce(&Path) -> Result<T, String>,
    ) -> Result<T, OperationError> {
        self.finish(operation, path, self.workspace.resolve(path), op)
    }

    fn finish<T>(
        &self,
        operation: NavigateOp,
        path: &str,
        resolved: Result<PathBuf, BoundaryError>,
        op: impl FnOnce(&Path) -> Result<T, String>,
    ) -> Result<T, OperationError> {
        let result = match resolved {
            Ok(resolved) => op(&resolved),
            Err(boundary) => Err(boundary.to_string()),
        };
        result.map_err(|error| {
            debug!(%operation, path, %error, "navigator operation failed");
            OperationError { operation, error }
        })
    }

    fn ensure_parent(&self, file: &Path, create_dirs: bool) -> Result<(), String> {
        let Some(parent) = file.parent() else {
            return Err("Path has no parent directory".to_string());
        };
        match fs::metadata(parent) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err("Parent path is not a directory".to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound && create_dirs => {
                fs::create_dir_all(parent).map_err(|err| io_message("create parent directories", &err))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err("Parent directory does not exist (use createDirs: true option)".to_string())
            }
            Err(err) => Err(io_message("stat parent directory", &err)),
        }
    }

    fn describe_entry(&self, path: &Path, file_type: Option<fs::FileType>) -> FileSystemEntry {
        match fs::metadata(path) {
            Ok(meta) => entry_from_metadata(&self.workspace, path, &meta),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "failed to stat directory entry");
                let kind = match file_type {
                    Some(ft) if ft.is_dir() => EntryKind::Directory,
                    _ => EntryKind::File,
                };
                FileSystemEntry {
                    path: self.workspace.relative(path),
                    name: file_name(path),
                    kind,
                    size: None,
                    modified: None,
                    readable: None,
                    writable: None,
                }
            }
        }
    }
}

fn entry_from_metadata(workspace: &Workspace, path: &Path, meta: &Metadata) -> FileSystemEntry {
    let is_dir = meta.is_dir();
    FileSystemEntry {
        path: workspace.relative(path),
        name: file_name(path),
        kind: if is_dir {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: (!is_dir).then(|| meta.len()),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        readable: Some(if is_dir {
            fs::read_dir(path).is_ok()
        } else {
            File::open(path).is_ok()
        }),
        writable: Some(if is_dir {
            !meta.permissions().readonly()
        } else {
            is_file_writable(path)
        }),
    }
}

/// Directories first, then case-insensitive name, then bytewise name.
fn compare_entries(a: &FileSystemEntry, b: &FileSystemEntry) -> Ordering {
    let rank = |entry: &FileSystemEntry| match entry.kind {
        EntryKind::Directory => 0,
        EntryKind::File => 1,
    };
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

fn is_file_writable(path: &Path) -> bool {
    OpenOptions::new().write(true).open(path).is_ok()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

fn describe_missing(err: &std::io::Error, action: &str) -> String {
    match err.kind() {
        ErrorKind::NotFound => "Path does not exist".to_string(),
        _ => io_message(action, err),
    }
}

fn io_message(action: &str, err: &std::io::Error) -> String {
    match err.kind() {
        ErrorKind::PermissionDenied => format!("{action}: permission denied"),
        _ => format!("{action}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn navigator() -> (tempfile::TempDir, Navigator) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(temp.path()).expect("workspace");
        (temp, Navigator::new(ws, DEFAULT_MAX_FILE_SIZE))
    }

    #[test]
    fn write_then_read_round_trips_exact_content() {
        let (_temp, nav) = navigator();
        let content = "héllo\n\twörld ✓\n";
        let report = nav.write_file("notes.txt", content, false, false).expect("write");
        assert!(report.created);
        assert_eq!(report.bytes_written, content.len() as u64);

        let read = nav.read_file("notes.txt").expect("read");
        assert_eq!(read.content, content);
        assert_eq!(read.size, content.len() as u64);

        let rewrite = nav.write_file("notes.txt", "x", false, false).expect("rewrite");
        assert!(!rewrite.created);
    }

    #[test]
    fn write_requires_parent_unless_create_dirs() {
        let (_temp, nav) = navigator();
        let err = nav.write_file("a/b/c.txt", "x", false, false).expect_err("no parent");
        assert_eq!(err.operation, NavigateOp::Write);
        assert!(err.error.contains("createDirs"));

        nav.write_file("a/b/c.txt", "x", false, true).expect("create dirs");
        assert_eq!(nav.read_file("a/b/c.txt").expect("read").content, "x");
    }

    #[test]
    fn append_requires_existing_file() {
        let (_temp, nav) = navigator();
        assert!(nav.write_file("log.txt", "a", true, false).is_err());
        nav.write_file("log.txt", "a", false, false).expect("create");
        let report = nav.write_file("log.txt", "b", true, false).expect("append");
        assert!(report.appended);
        assert_eq!(nav.read_file("log.txt").expect("read").content, "ab");
    }

    #[test]
    fn read_rejects_directories_and_oversized_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nav = Navigator::new(Workspace::new(temp.path()).expect("workspace"), 4);
        fs::create_dir(temp.path().join("dir")).expect("mkdir");
        fs::write(temp.path().join("big.txt"), "12345").expect("write");

        let err = nav.read_file("dir").expect_err("dir");
        assert_eq!(err.error, "Path is a directory, not a file");

        let err = nav.read_file("big.txt").expect_err("too big");
        assert_eq!(err.error, "File size exceeds limit: 5 bytes > 4 bytes");

        let err = nav.read_file("missing.txt").expect_err("missing");
        assert_eq!(err.error, "Path does not exist");
    }

    #[test]
    fn mkdir_is_idempotent() {
        let (_temp, nav) = navigator();
        assert!(nav.create_directory("x/y", true).expect("first").created);
        assert!(!nav.create_directory("x/y", true).expect("second").created);

        nav.write_file("file.txt", "", false, false).expect("write");
        let err = nav.create_directory("file.txt", true).expect_err("not a dir");
        assert_eq!(err.error, "Path exists but is not a directory");
    }

    #[test]
    fn delete_directory_needs_recursive_when_non_empty() {
        let (temp, nav) = navigator();
        nav.write_file("d/f.txt", "x", false, true).expect("write");

        let err = nav.delete("d", false).expect_err("non-empty");
        assert!(err.error.contains("not empty"));

        let report = nav.delete("d", true).expect("recursive delete");
        assert_eq!(report.kind, EntryKind::Directory);
        assert!(!temp.path().join("d").exists());

        assert_eq!(nav.delete("d", false).expect_err("gone").error, "Path does not exist");
        assert!(nav.delete(".", true).is_err());
    }

    #[test]
    fn listing_sorts_directories_first_then_name() {
        let (_temp, nav) = navigator();
        nav.write_file("b.txt", "bb", false, false).expect("write");
        nav.write_file("A.txt", "a", false, false).expect("write");
        nav.create_directory("zdir", true).expect("mkdir");
        nav.create_directory("Adir", true).expect("mkdir");

        let listing = nav.list_directory(".").expect("list");
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Adir", "zdir", "A.txt", "b.txt"]);
        assert_eq!(listing.entries[0].size, None);
        assert_eq!(listing.entries[3].size, Some(2));
    }

    #[test]
    fn stat_reports_kind_and_permissions() {
        let (_temp, nav) = navigator();
        nav.write_file("f.txt", "abc", false, false).expect("write");
        let entry = nav.get_metadata("f.txt").expect("stat");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, Some(3));
        assert_eq!(entry.readable, Some(true));
        assert!(entry.modified.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn stat_reports_denied_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, nav) = navigator();
        let locked = temp.path().join("locked.txt");
        let frozen = temp.path().join("frozen.txt");
        fs::write(&locked, "x").expect("write");
        fs::write(&frozen, "x").expect("write");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        fs::set_permissions(&frozen, fs::Permissions::from_mode(0o444)).expect("chmod");
        // Permission bits do not bind a privileged user.
        if OpenOptions::new().write(true).open(&frozen).is_ok() {
            return;
        }

        let entry = nav.get_metadata("locked.txt").expect("stat locked");
        assert_eq!(entry.readable, Some(false));
        assert_eq!(entry.writable, Some(false));

        let entry = nav.get_metadata("frozen.txt").expect("stat frozen");
        assert_eq!(entry.readable, Some(true));
        assert_eq!(entry.writable, Some(false));
    }

    #[cfg(unix)]
    #[test]
    fn listing_keeps_entries_that_fail_to_stat() {
        let (temp, nav) = navigator();
        nav.write_file("a.txt", "a", false, false).expect("write");
        std::os::unix::fs::symlink(temp.path().join("gone.txt"), temp.path().join("broken"))
            .expect("symlink");

        let listing = nav.list_directory(".").expect("list");
        let broken = listing
            .entries
            .iter()
            .find(|entry| entry.name == "broken")
            .expect("broken entry listed");
        assert_eq!(broken.kind, EntryKind::File);
        assert_eq!(broken.size, None);
        assert_eq!(broken.modified, None);
        assert_eq!(broken.readable, None);
        assert_eq!(broken.writable, None);
        assert_eq!(listing.entries.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn delete_removes_symlink_not_target() {
        let (temp, nav) = navigator();
        nav.write_file("real.txt", "keep", false, false).expect("write");
        std::os::unix::fs::symlink(temp.path().join("real.txt"), temp.path().join("alias"))
            .expect("symlink");

        let report = nav.delete("alias", false).expect("delete link");
        assert_eq!(report.path, "alias");
        assert_eq!(report.kind, EntryKind::File);
        assert!(fs::symlink_metadata(temp.path().join("alias")).is_err());
        assert_eq!(nav.read_file("real.txt").expect("target kept").content, "keep");
    }

    #[test]
    fn escaping_paths_fail_with_boundary_error() {
        let (_temp, nav) = navigator();
        let err = nav.write_file("../escape.txt", "x", false, false).expect_err("escape");
        assert!(err.error.contains("outside workspace boundary"));
        assert!(nav.list_directory("/").is_err());
    }

    #[test]
    fn run_dispatches_by_op() {
        let (_temp, nav) = navigator();
        let params = NavigateParams {
            op: NavigateOp::Write,
            path: Some("out.txt".to_string()),
            content: Some(String::new()),
            write_options: None,
            mkdir_options: None,
            delete_options: None,
        };
        let success = nav.run(&params).expect("write");
        assert!(matches!(success, NavigateSuccess::Write(ref report) if report.created));

        let stat = NavigateParams {
            op: NavigateOp::Stat,
            content: None,
            ..params
        };
        assert!(matches!(nav.run(&stat).expect("stat"), NavigateSuccess::Stat(_)));
    }
}
