//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating a tree as root-relative file paths (the path enumerator)
//! - Copying files with modification time preservation
//! - Creating parent directories

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{EngineError, HashError, HashErrorKind};
use crate::model::HashJob;

/// Names skipped during enumeration.
///
/// Defaults to the macOS metadata files (`.DS_Store`, `._*` resource forks)
/// that never belong in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludeRules {
    names: Vec<String>,
    prefixes: Vec<String>,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        ExcludeRules::none().with_name(".DS_Store").with_prefix("._")
    }
}

impl ExcludeRules {
    /// Rules that exclude nothing.
    pub fn none() -> Self {
        ExcludeRules {
            names: Vec::new(),
            prefixes: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Whether the file at a root-relative path is excluded by name.
    pub fn excludes_path(&self, relative_path: &str) -> bool {
        relative_path
            .rsplit('/')
            .next()
            .is_some_and(|name| self.excludes(name))
    }

    fn excludes(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name) || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// Deterministic lister of the regular files under a root.
///
/// Symbolic links are never followed. Files whose root-relative path was
/// registered with [`PathEnumerator::exclude_file`] (the manifest itself) are
/// skipped. The walk order is unspecified; callers sort afterwards.
#[derive(Debug, Clone)]
pub struct PathEnumerator {
    root: PathBuf,
    rules: ExcludeRules,
    excluded_files: HashSet<String>,
}

impl PathEnumerator {
    /// Create an enumerator for `root`.
    ///
    /// # Errors
    /// Returns an error if the root does not exist, is not a directory,
    /// or cannot be listed.
    pub fn new(root: &Path, rules: ExcludeRules) -> Result<Self, EngineError> {
        match fs::metadata(root) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(EngineError::NotADirectory {
                    path: root.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::RootNotFound {
                    path: root.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(EngineError::RootAccessDenied {
                    path: root.to_path_buf(),
                    source: e,
                })
            }
        }

        fs::read_dir(root).map_err(|e| EngineError::RootAccessDenied {
            path: root.to_path_buf(),
            source: e,
        })?;

        Ok(PathEnumerator {
            root: root.to_path_buf(),
            rules,
            excluded_files: HashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclude a specific file from the listing if it lies under the root.
    ///
    /// The file does not need to exist yet; its parent directory does.
    /// Paths outside the root are ignored.
    pub fn exclude_file(&mut self, path: &Path) {
        if let Some(relative) = self.relative_to_root(path) {
            debug!(path = %relative, "excluding file from enumeration");
            self.excluded_files.insert(relative);
        }
    }

    fn relative_to_root(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let parent = fs::canonicalize(parent).ok()?;
        let root = fs::canonicalize(&self.root).ok()?;
        let relative = parent.join(name);
        let relative = relative.strip_prefix(&root).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }

    /// Start a fresh walk over the tree. Each call restarts from the root.
    pub fn iter(&self) -> TreeWalk<'_> {
        TreeWalk {
            enumerator: self,
            pending: vec![(self.root.clone(), String::new())],
            current: None,
        }
    }
}

/// A lazy walk over a tree, yielding one [`HashJob`] per regular file.
///
/// Entries that cannot be listed or named are yielded as per-file errors
/// and the walk continues.
pub struct TreeWalk<'a> {
    enumerator: &'a PathEnumerator,
    pending: Vec<(PathBuf, String)>,
    current: Option<(fs::ReadDir, String)>,
}

impl Iterator for TreeWalk<'_> {
    type Item = Result<HashJob, HashError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let (dir, prefix) = self.pending.pop()?;
                match fs::read_dir(&dir) {
                    Ok(entries) => self.current = Some((entries, prefix)),
                    Err(e) => return Some(Err(HashError::unreadable_directory(prefix, &e))),
                }
            }
            let (entries, prefix) = self.current.as_mut()?;

            let entry = match entries.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Some(Err(HashError::unreadable_directory(prefix.clone(), &e))),
                None => {
                    self.current = None;
                    continue;
                }
            };

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                let lossy = join_relative(prefix, &file_name.to_string_lossy());
                return Some(Err(HashError::new(
                    lossy,
                    HashErrorKind::UnrepresentablePath,
                    "file name is not valid UTF-8",
                )));
            };
            let relative_path = join_relative(prefix, name);
            if name.contains(['\n', '\r']) {
                return Some(Err(HashError::new(
                    relative_path,
                    HashErrorKind::UnrepresentablePath,
                    "file name contains a line break",
                )));
            }

            // DirEntry::file_type does not traverse symlinks
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => return Some(Err(HashError::from_io(relative_path, &e))),
            };

            if file_type.is_symlink() {
                debug!(path = %relative_path, "skipping symbolic link");
            } else if file_type.is_dir() {
                self.pending.push((entry.path(), relative_path));
            } else if file_type.is_file() {
                // junk rules match file names only; directories are always walked
                if self.enumerator.rules.excludes(name) || self.enumerator.excluded_files.contains(&relative_path) {
                    continue;
                }
                return Some(Ok(HashJob {
                    relative_path,
                    absolute_path: entry.path(),
                }));
            }
        }
    }
}

fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Copy a file from source to destination, preserving its modification time.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> io::Result<u64> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src)?;
    let src_mtime = src_file.metadata()?.modified().ok();

    let mut dst_file = fs::File::create(dst)?;
    let bytes_copied = io::copy(&mut src_file, &mut dst_file)?;
    dst_file.sync_all()?;
    drop(dst_file);

    if let Some(mtime) = src_mtime {
        filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime))?;
    }

    Ok(bytes_copied)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("parent path exists but is not a directory: {}", parent.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
        Err(e) => Err(e),
    }
}
