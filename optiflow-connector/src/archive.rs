//! 7z container support: magic-number detection, archive creation through
//! the external `7zz` binary, and safe extraction.
//!
//! Extraction refuses symlink entries and any entry whose path would land
//! outside the destination, and flattens archives whose entries all share a
//! single top-level directory.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use optiflow_common::error::Error;
use sevenz_rust::{Password, SevenZArchiveEntry, SevenZReader};
use tracing::info;

/// First 6 bytes of every 7z container.
pub const SEVEN_Z_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// High bit of the windows-attributes word marking the unix-extension
/// layout, with the `st_mode` bits stored in the upper half.
const UNIX_EXTENSION_FLAG: u32 = 0x8000;

/// Whether the file at `path` appears to be a 7z archive, judged by its
/// magic number. Files shorter than the magic are simply not archives.
pub fn is_7z(path: &Path) -> Result<bool, Error> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::Artifact(format!("failed to open {}: {e}", path.display())))?;
    let mut magic = [0u8; 6];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == SEVEN_Z_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(Error::Artifact(format!(
            "failed to read magic of {}: {e}",
            path.display()
        ))),
    }
}

/// Archive a directory with the external `7zz` binary.
pub async fn create_7z(archive: &Path, directory: &Path) -> Result<(), Error> {
    let status = tokio::process::Command::new("7zz")
        .arg("a")
        .arg(archive)
        .arg(directory)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| Error::Artifact(format!("failed to run 7zz: {e}")))?;
    if !status.success() {
        return Err(Error::Artifact(format!(
            "failed to compress directory {}: 7zz exited with {status}",
            directory.display()
        )));
    }
    info!(archive = %archive.display(), "successfully created archive");
    Ok(())
}

/// Extract a 7z archive into `dest`.
///
/// The destination is created if missing and cleared of all current
/// contents first. If every entry lives under one shared top-level
/// directory, that prefix is stripped. Entry safety is validated for the
/// whole archive before anything is written.
pub fn extract_7z(src: &Path, dest: &Path) -> Result<(), Error> {
    let mut reader = SevenZReader::open(src, Password::empty())
        .map_err(|e| Error::Artifact(format!("failed to open 7z {}: {e}", src.display())))?;

    std::fs::create_dir_all(dest).map_err(|e| {
        Error::Artifact(format!(
            "couldn't create destination folder {}: {e}",
            dest.display()
        ))
    })?;
    remove_contents(dest)?;

    let entries = &reader.archive().files;
    let names: Vec<String> = entries.iter().map(|f| f.name().to_string()).collect();
    let common_prefix = detect_common_top_level(&names);

    // Validate the whole archive up front so an unsafe entry leaves the
    // destination with nothing but the initial clear.
    let mut targets = Vec::with_capacity(entries.len());
    for entry in entries {
        if is_symlink(entry) {
            return Err(Error::Safety(format!(
                "refusing to extract symlink entry: {}",
                entry.name()
            )));
        }
        targets.push(entry_target(dest, entry.name(), common_prefix.as_deref())?);
    }

    let mut targets = targets.into_iter();
    let mut failure: Option<Error> = None;
    reader
        .for_each_entries(|entry, content| {
            let target = targets.next().flatten();
            match write_entry(entry, content, target) {
                Ok(()) => Ok(true),
                Err(e) => {
                    failure = Some(e);
                    Ok(false)
                }
            }
        })
        .map_err(|e| Error::Artifact(format!("failed to read 7z {}: {e}", src.display())))?;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Resolve an entry name to its extraction target, with the single-root
/// prefix stripped. `Ok(None)` means the entry collapses to the destination
/// itself (the stripped root directory) and nothing is to be written.
fn entry_target(
    dest: &Path,
    name: &str,
    common_prefix: Option<&str>,
) -> Result<Option<PathBuf>, Error> {
    let name = name.trim_start_matches("./");
    let flattened = match common_prefix {
        Some(prefix) => name
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(name),
        None => name,
    };
    if flattened.is_empty() {
        return Ok(None);
    }
    let relative = sanitize_relative_path(flattened)
        .ok_or_else(|| Error::Safety(format!("entry escapes destination: {name}")))?;
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(dest.join(relative)))
}

/// Lexically normalize an archive entry path, refusing anything that would
/// climb out of the extraction root (`..` past the top, absolute paths).
fn sanitize_relative_path(name: &str) -> Option<PathBuf> {
    let mut parts = PathBuf::new();
    let mut depth = 0i32;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => {
                depth += 1;
                parts.push(c);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                parts.pop();
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts)
}

fn write_entry(
    entry: &SevenZArchiveEntry,
    content: &mut dyn Read,
    target: Option<PathBuf>,
) -> Result<(), Error> {
    let Some(target) = target else {
        return Ok(()); // stripped single root
    };

    if entry.is_directory() {
        std::fs::create_dir_all(&target)
            .map_err(|e| Error::Artifact(format!("mkdir {}: {e}", target.display())))?;
        let mode = dir_mode(unix_mode(entry).unwrap_or(0o755));
        let perms = std::os::unix::fs::PermissionsExt::from_mode(mode);
        std::fs::set_permissions(&target, perms)
            .map_err(|e| Error::Artifact(format!("chmod {}: {e}", target.display())))?;
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Artifact(format!("mkdir parent {}: {e}", parent.display())))?;
    }

    use std::os::unix::fs::OpenOptionsExt;
    let mode = unix_mode(entry).map(|m| m & 0o777).unwrap_or(0o644);
    let mut out = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&target)
        .map_err(|e| Error::Artifact(format!("create {}: {e}", target.display())))?;
    std::io::copy(content, &mut out)
        .map_err(|e| Error::Artifact(format!("copy into {}: {e}", target.display())))?;
    drop(out);

    if entry.has_last_modified_date {
        let mtime = SystemTime::from(entry.last_modified_date);
        let _ = filetime::set_file_mtime(&target, filetime::FileTime::from_system_time(mtime));
    }
    Ok(())
}

fn unix_mode(entry: &SevenZArchiveEntry) -> Option<u32> {
    if entry.has_windows_attributes && entry.windows_attributes & UNIX_EXTENSION_FLAG != 0 {
        Some((entry.windows_attributes >> 16) & 0o177777)
    } else {
        None
    }
}

fn is_symlink(entry: &SevenZArchiveEntry) -> bool {
    unix_mode(entry).is_some_and(|mode| mode & 0o170000 == 0o120000)
}

/// Mirror read bits into execute bits so extracted directories stay
/// traversable.
fn dir_mode(mode: u32) -> u32 {
    let mut p = mode & 0o777;
    if p & 0o400 != 0 {
        p |= 0o100;
    }
    if p & 0o040 != 0 {
        p |= 0o010;
    }
    if p & 0o004 != 0 {
        p |= 0o001;
    }
    p
}

/// The shared first path segment of all entries, if there is one.
///
/// Returns `None` as soon as any entry has no `/` in its name (a top-level
/// file) or the first segments diverge.
pub fn detect_common_top_level<S: AsRef<str>>(names: &[S]) -> Option<String> {
    let mut common: Option<&str> = None;
    for name in names {
        let name = name.as_ref().trim_start_matches("./");
        let (top, _) = name.split_once('/')?;
        match common {
            None => common = Some(top),
            Some(current) if current != top => return None,
            Some(_) => {}
        }
    }
    common.map(str::to_string)
}

fn remove_contents(dir: &Path) -> Result<(), Error> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Artifact(format!("couldn't list destination {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry
            .map_err(|e| Error::Artifact(format!("couldn't list destination {}: {e}", dir.display())))?;
        let path = entry.path();
        let result = if entry
            .file_type()
            .map_err(|e| Error::Artifact(format!("couldn't stat {}: {e}", path.display())))?
            .is_dir()
        {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| {
            Error::Artifact(format!(
                "couldn't clear destination entry {}: {e}",
                path.display()
            ))
        })?;
    }
    Ok(())
}
