//! Compressed snapshots of the application file tree.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Entries left out of snapshots and preserved by restores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exclusions {
    /// Matched against the entry name at any depth; `*.ext` matches a suffix.
    pub names: BTreeSet<String>,
    /// Matched against the path relative to the tree root.
    pub paths: BTreeSet<PathBuf>,
}

impl Exclusions {
    pub fn matches(&self, rel: &Path) -> bool {
        if self.paths.contains(rel) {
            return true;
        }
        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.names.iter().any(|pattern| match pattern.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix),
            None => name == pattern,
        })
    }
}

/// Write `tree` into a gzip tar at `dest`. Returns the number of files archived.
pub fn create(tree: &Path, dest: &Path, exclusions: &Exclusions) -> Result<u64> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut count = 0;
    append_dir(&mut builder, tree, Path::new(""), exclusions, &mut count)?;

    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(count)
}

fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    tree: &Path,
    rel: &Path,
    exclusions: &Exclusions,
    count: &mut u64,
) -> Result<()> {
    for (name, path) in sorted_entries(&tree.join(rel))? {
        let child_rel = rel.join(&name);
        if exclusions.matches(&child_rel) {
            continue;
        }
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            builder.append_dir(&child_rel, &path)?;
            append_dir(builder, tree, &child_rel, exclusions, count)?;
        } else {
            builder.append_path_with_name(&path, &child_rel)?;
            *count += 1;
        }
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<(std::ffi::OsString, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        entries.push((entry.file_name(), entry.path()));
    }
    entries.sort();
    Ok(entries)
}

/// Unpack the archive at `src` over `dest`, overwriting existing files.
pub fn extract(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

/// Remove everything under `tree` that is not excluded, so a following
/// [`extract`] leaves exactly the snapshot plus the excluded entries.
pub fn clear(tree: &Path, exclusions: &Exclusions) -> Result<()> {
    clear_dir(tree, Path::new(""), exclusions)
}

fn clear_dir(tree: &Path, rel: &Path, exclusions: &Exclusions) -> Result<()> {
    for (name, path) in sorted_entries(&tree.join(rel))? {
        let child_rel = rel.join(&name);
        if exclusions.matches(&child_rel) {
            continue;
        }
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            clear_dir(tree, &child_rel, exclusions)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
