//! tar.gz and directory-copy helpers used on the host side.
//!
//! Archives keep paths relative to the captured root. Writers go through a
//! `.partial` sibling that is renamed into place once the gzip stream is
//! finished, so a crashed run never leaves a truncated archive under the final name.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use walkdir::WalkDir;

/// `<path>.partial`
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Strip `./` prefixes so `./db/data` and `db/data` compare equal.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
fn is_excluded(rel: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|ex| rel.starts_with(normalize(ex)))
}

fn write_atomically<F>(dest: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut Builder<GzEncoder<File>>) -> io::Result<()>,
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(dest);
    let result = (|| {
        let file = File::create(&partial)?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        fill(&mut builder)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })();

    match result {
        Ok(()) => fs::rename(&partial, dest),
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

/// Archive the contents of `src_dir` into `dest`, paths relative to `src_dir`,
/// the way the helper container's `tar czf` lays them out.
#[cfg(test)]
pub(crate) fn pack_dir(src_dir: &Path, dest: &Path, excludes: &[PathBuf]) -> io::Result<()> {
    write_atomically(dest, |builder| {
        for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(src_dir)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            if is_excluded(rel, excludes) {
                continue;
            }
            builder.append_path_with_name(entry.path(), rel)?;
        }
        Ok(())
    })
}

/// Bundle several directories into one archive; each lands under its given name.
pub fn pack_bundle(dest: &Path, entries: &[(PathBuf, PathBuf)]) -> io::Result<()> {
    write_atomically(dest, |builder| {
        for (name, src_dir) in entries {
            builder.append_dir_all(name, src_dir)?;
        }
        Ok(())
    })
}

pub fn unpack(archive: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(File::open(archive)?));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.unpack(dest)
}

/// Read every entry header; returns the entry count.
pub fn verify(archive: &Path) -> io::Result<usize> {
    let mut archive = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut count = 0;
    for entry in archive.entries()? {
        let entry = entry?;
        entry.path()?;
        count += 1;
    }
    Ok(count)
}

/// Distinct `(first, second)` path component pairs in the archive, e.g.
/// `("n8n", "n8n_backup_2024-01-01_10-00")` for a bundle.
pub fn top_level_pairs(archive: &Path) -> io::Result<BTreeSet<(String, String)>> {
    let mut archive = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut pairs = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = normalize(&entry.path()?);
        let mut parts = path.components().filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        });
        if let (Some(first), Some(second)) = (parts.next(), parts.next()) {
            pairs.insert((first, second));
        }
    }
    Ok(pairs)
}

/// Recursive copy preserving structure. A file source copies a single file.
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(1);
    }

    let mut files = 0;
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Remove a file or directory tree if present.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
