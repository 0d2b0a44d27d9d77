//! Path parsing and `namex`-style walking, grounded on xv6/rv6's
//! `fs.c` (`skipelem`/`namex`).

use crate::hal::BlockDevice;
use crate::param::{FILE_NAME_MAX_LENGTH, MAXPATH};

use super::inode::T_DIR;
use super::{FileSystem, OpContext, RcInode};

/// Splits the first path component off `path`, returning it and the
/// remainder (with leading slashes stripped from both). `None` once
/// nothing but slashes remains.
fn skipelem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    match path.find('/') {
        Some(i) => Some((&path[..i], path[i..].trim_start_matches('/'))),
        None => Some((path, "")),
    }
}

/// Splits `path` into its parent directory path and final component,
/// e.g. `"/a/b/c"` -> `("/a/b", "c")`.
pub fn dirname_and_basename(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn lookup_name(fs: &FileSystem, dev: &dyn BlockDevice, dir: &RcInode, name: &str) -> Option<RcInode> {
    let mut guard = fs.lock(dev, dir);
    if guard.file_type() != T_DIR {
        return None;
    }
    let (inum, _off) = fs.dir_lookup(dev, &mut guard, name)?;
    Some(fs.itable().get(dir.dev(), inum))
}

/// Resolves `path` to its inode, starting from `cwd` for relative paths
/// or the filesystem root for absolute ones. The caller owns `cwd` and
/// must release the returned handle via `FileSystem::put`.
pub fn resolve(
    fs: &FileSystem,
    ctx: &OpContext,
    dev: &dyn BlockDevice,
    cwd: &RcInode,
    path: &str,
) -> Result<RcInode, ()> {
    assert!(path.len() < MAXPATH, "resolve: path too long");
    let mut cur = if path.starts_with('/') {
        fs.root_inode()
    } else {
        cwd.dup(fs.itable())
    };

    let mut rest = path;
    loop {
        let (name, next_rest) = match skipelem(rest) {
            Some(pair) => pair,
            None => return Ok(cur),
        };
        assert!(name.len() <= FILE_NAME_MAX_LENGTH, "resolve: name too long");

        let next = match lookup_name(fs, dev, &cur, name) {
            Some(next) => next,
            None => {
                fs.put(ctx, dev, cur);
                return Err(());
            }
        };
        fs.put(ctx, dev, cur);
        cur = next;
        rest = next_rest;
    }
}

/// Like `resolve`, but stops one component short: returns the parent
/// directory inode and the final component's name. Used by `create`,
/// `unlink`, and `mkdir`, which all need the parent locked to mutate it.
pub fn resolve_parent<'p>(
    fs: &FileSystem,
    ctx: &OpContext,
    dev: &dyn BlockDevice,
    cwd: &RcInode,
    path: &'p str,
) -> Result<(RcInode, &'p str), ()> {
    let (dirpath, name) = dirname_and_basename(path);
    if name.is_empty() {
        return Err(());
    }
    let parent = if dirpath.is_empty() {
        cwd.dup(fs.itable())
    } else {
        resolve(fs, ctx, dev, cwd, dirpath)?
    };
    let mut guard = fs.lock(dev, &parent);
    if guard.file_type() != T_DIR {
        drop(guard);
        fs.put(ctx, dev, parent);
        return Err(());
    }
    drop(guard);
    Ok((parent, name))
}
