//! File-backed key-value store.
//!
//! Each key maps to one file below a root directory: every `/`-separated
//! segment but the last becomes a directory and the last segment becomes a
//! file with the `.entry` suffix. Writes go to a temporary sibling first and
//! are renamed into place, so a reader never observes a partial value.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::traits::Storage;

const ENTRY_SUFFIX: &str = ".entry";

/// Store that keeps one file per key under `root`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| StorageError::io(format!("create {}", root.display()), err))?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> StorageResult<PathBuf> {
        let segments = split_key(key)?;
        let mut path = self.root.clone();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| StorageError::Backend("empty storage key".to_string()))?;
        for segment in parents {
            path.push(segment);
        }
        path.push(format!("{last}{ENTRY_SUFFIX}"));
        Ok(path)
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root.as_path() {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn split_key(key: &str) -> StorageResult<Vec<&str>> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return Err(StorageError::Backend(format!("invalid storage key '{key}'")));
    }
    Ok(segments)
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(format!("read {key}"), err)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StorageError::io(format!("create parent of {key}"), err))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let mut file =
            File::create(&tmp).map_err(|err| StorageError::io(format!("create {key}"), err))?;
        file.write_all(value)
            .and_then(|()| file.sync_all())
            .map_err(|err| StorageError::io(format!("write {key}"), err))?;
        fs::rename(&tmp, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            StorageError::io(format!("rename {key}"), err)
        })
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                self.prune_empty_parents(&path);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(format!("delete {key}"), err)),
        }
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let (dir_part, partial) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let mut dir = self.root.clone();
        if !dir_part.is_empty() {
            for segment in split_key(dir_part)? {
                dir.push(segment);
            }
        }

        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(format!("list {prefix}"), err)),
        };

        let mut children = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|err| StorageError::io(format!("list {prefix}"), err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry
                .file_type()
                .map_err(|err| StorageError::io(format!("list {prefix}"), err))?;
            let child = if file_type.is_dir() {
                format!("{name}/")
            } else if let Some(stripped) = name.strip_suffix(ENTRY_SUFFIX) {
                stripped.to_string()
            } else {
                // temporary files from in-flight writes
                continue;
            };
            if let Some(rest) = child.strip_prefix(partial) {
                if !rest.is_empty() {
                    children.push(rest.to_string());
                }
            }
        }
        children.sort();
        Ok(children)
    }
}
