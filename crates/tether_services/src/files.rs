//! Filesystem helpers
//!
//! Create and delete operations are idempotent: creating something that
//! exists or deleting something missing succeeds without doing anything.

use md5::{Digest, Md5};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{action} {}: {source}", .path.display())]
pub struct FileError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

pub type FileResult<T> = Result<T, FileError>;

fn context<T>(action: &'static str, path: &Path, result: io::Result<T>) -> FileResult<T> {
    result.map_err(|source| FileError {
        action,
        path: path.to_path_buf(),
        source,
    })
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn delete_file(path: &Path) -> FileResult<()> {
    if !path.is_file() {
        return Ok(());
    }
    context("failed to delete", path, fs::remove_file(path))
}

/// Copy `src` to `dst`. An existing `dst` is an error unless `overwrite`.
pub fn copy_file(src: &Path, dst: &Path, overwrite: bool) -> FileResult<u64> {
    refuse_existing(dst, overwrite)?;
    context("failed to copy", src, fs::copy(src, dst))
}

/// Move `src` to `dst`. An existing `dst` is an error unless `overwrite`.
pub fn move_file(src: &Path, dst: &Path, overwrite: bool) -> FileResult<()> {
    refuse_existing(dst, overwrite)?;
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems.
    context("failed to move", src, fs::copy(src, dst))?;
    context("failed to move", src, fs::remove_file(src))
}

fn refuse_existing(dst: &Path, overwrite: bool) -> FileResult<()> {
    if !overwrite && dst.exists() {
        let source = io::Error::new(io::ErrorKind::AlreadyExists, "destination exists");
        return context("refusing to overwrite", dst, Err(source));
    }
    Ok(())
}

pub fn file_size(path: &Path) -> FileResult<u64> {
    context("failed to stat", path, fs::metadata(path)).map(|meta| meta.len())
}

pub fn read_text(path: &Path) -> FileResult<String> {
    context("failed to read", path, fs::read_to_string(path))
}

/// Lowercase hex MD5 digest of the file's contents.
pub fn md5_hex(path: &Path) -> FileResult<String> {
    let mut file = context("failed to open", path, fs::File::open(path))?;
    let mut hasher = Md5::new();
    context("failed to read", path, io::copy(&mut file, &mut hasher))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn write_text(path: &Path, text: &str, append: bool) -> FileResult<()> {
    if !append {
        return context("failed to write", path, fs::write(path, text));
    }
    use std::io::Write;
    let mut file = context(
        "failed to open",
        path,
        fs::OpenOptions::new().create(true).append(true).open(path),
    )?;
    context("failed to append to", path, file.write_all(text.as_bytes()))
}

pub fn create_dir(path: &Path) -> FileResult<()> {
    context("failed to create", path, fs::create_dir_all(path))
}

/// Remove a directory. Without `recursive` it must be empty.
pub fn delete_dir(path: &Path, recursive: bool) -> FileResult<()> {
    if !path.is_dir() {
        return Ok(());
    }
    let result = if recursive {
        fs::remove_dir_all(path)
    } else {
        fs::remove_dir(path)
    };
    context("failed to delete", path, result)
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

pub fn move_dir(src: &Path, dst: &Path) -> FileResult<()> {
    context("failed to move", src, fs::rename(src, dst))
}

/// Copy the directory `src` into `dst`, keeping its name: `a/b` copied to
/// `c` ends up as `c/b`. Existing files are overwritten.
pub fn copy_dir(src: &Path, dst: &Path) -> FileResult<()> {
    let Some(name) = src.file_name() else {
        let source = io::Error::new(io::ErrorKind::InvalidInput, "source has no name");
        return context("failed to copy", src, Err(source));
    };
    copy_tree(src, &dst.join(name))
}

fn copy_tree(src: &Path, dst: &Path) -> FileResult<()> {
    create_dir(dst)?;
    for entry in context("failed to list", src, fs::read_dir(src))? {
        let entry = context("failed to list", src, entry)?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            context("failed to copy", &from, fs::copy(&from, &to))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Paths of the entries of `kind` under `dir`, sorted.
pub fn list(dir: &Path, kind: EntryKind, recursive: bool) -> FileResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect(dir, kind, recursive, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect(dir: &Path, kind: EntryKind, recursive: bool, found: &mut Vec<PathBuf>) -> FileResult<()> {
    for entry in context("failed to list", dir, fs::read_dir(dir))? {
        let path = context("failed to list", dir, entry)?.path();
        let is_dir = path.is_dir();
        match (kind, is_dir) {
            (EntryKind::File, false) | (EntryKind::Dir, true) => found.push(path.clone()),
            _ => {}
        }
        if recursive && is_dir {
            collect(&path, kind, recursive, found)?;
        }
    }
    Ok(())
}
