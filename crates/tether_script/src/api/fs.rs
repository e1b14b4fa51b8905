//! File and directory entry points

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object};
use std::path::{Path, PathBuf};
use tether_services::files::{self, EntryKind, FileResult};

use super::optional;
use crate::ffi;

fn check<T>(ctx: &Ctx<'_>, result: FileResult<T>) -> rquickjs::Result<T> {
    result.map_err(|err| ffi::throw(ctx, err))
}

fn paths_to_strings(paths: Vec<PathBuf>) -> Vec<String> {
    paths
        .into_iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

pub(super) fn register<'js>(host: &Object<'js>) -> rquickjs::Result<()> {
    host.set("fileExists", Func::from(|path: String| files::file_exists(Path::new(&path))))?;
    host.set(
        "fileDelete",
        Func::from(|ctx: Ctx<'js>, path: String| check(&ctx, files::delete_file(Path::new(&path)))),
    )?;
    host.set(
        "fileCopy",
        Func::from(
            |ctx: Ctx<'js>, src: String, dst: String, overwrite: Opt<Option<bool>>| {
                let overwrite = optional(overwrite).unwrap_or(false);
                check(&ctx, files::copy_file(Path::new(&src), Path::new(&dst), overwrite)).map(|_| ())
            },
        ),
    )?;
    host.set(
        "fileMove",
        Func::from(
            |ctx: Ctx<'js>, src: String, dst: String, overwrite: Opt<Option<bool>>| {
                let overwrite = optional(overwrite).unwrap_or(false);
                check(&ctx, files::move_file(Path::new(&src), Path::new(&dst), overwrite))
            },
        ),
    )?;
    host.set(
        "fileSize",
        Func::from(|ctx: Ctx<'js>, path: String| {
            check(&ctx, files::file_size(Path::new(&path))).map(|size| size as f64)
        }),
    )?;
    host.set(
        "fileReadText",
        Func::from(|ctx: Ctx<'js>, path: String| check(&ctx, files::read_text(Path::new(&path)))),
    )?;
    host.set(
        "fileWriteText",
        Func::from(
            |ctx: Ctx<'js>, path: String, text: String, append: Opt<Option<bool>>| {
                let append = optional(append).unwrap_or(false);
                check(&ctx, files::write_text(Path::new(&path), &text, append))
            },
        ),
    )?;
    host.set(
        "fileMd5",
        Func::from(|ctx: Ctx<'js>, path: String| check(&ctx, files::md5_hex(Path::new(&path)))),
    )?;

    host.set(
        "dirCreate",
        Func::from(|ctx: Ctx<'js>, path: String| check(&ctx, files::create_dir(Path::new(&path)))),
    )?;
    host.set(
        "dirDelete",
        Func::from(|ctx: Ctx<'js>, path: String, recursive: Opt<Option<bool>>| {
            let recursive = optional(recursive).unwrap_or(false);
            check(&ctx, files::delete_dir(Path::new(&path), recursive))
        }),
    )?;
    host.set("dirExists", Func::from(|path: String| files::dir_exists(Path::new(&path))))?;
    host.set(
        "dirCopy",
        Func::from(|ctx: Ctx<'js>, src: String, dst: String| {
            check(&ctx, files::copy_dir(Path::new(&src), Path::new(&dst)))
        }),
    )?;
    host.set(
        "dirMove",
        Func::from(|ctx: Ctx<'js>, src: String, dst: String| {
            check(&ctx, files::move_dir(Path::new(&src), Path::new(&dst)))
        }),
    )?;
    host.set(
        "dirCurrent",
        Func::from(|ctx: Ctx<'js>| {
            std::env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .map_err(|err| ffi::throw(&ctx, err))
        }),
    )?;
    host.set(
        "dirSetCurrent",
        Func::from(|ctx: Ctx<'js>, path: String| {
            std::env::set_current_dir(&path).map_err(|err| ffi::throw(&ctx, format!("{path}: {err}")))
        }),
    )?;
    host.set(
        "dirFiles",
        Func::from(|ctx: Ctx<'js>, path: String, recursive: Opt<Option<bool>>| {
            let recursive = optional(recursive).unwrap_or(false);
            check(&ctx, files::list(Path::new(&path), EntryKind::File, recursive)).map(paths_to_strings)
        }),
    )?;
    host.set(
        "dirDirs",
        Func::from(|ctx: Ctx<'js>, path: String, recursive: Opt<Option<bool>>| {
            let recursive = optional(recursive).unwrap_or(false);
            check(&ctx, files::list(Path::new(&path), EntryKind::Dir, recursive)).map(paths_to_strings)
        }),
    )?;
    Ok(())
}
