//! Packager: deterministic `output.tar.gz` of the workspace plus a manifest.
//!
//! Entries are sorted by relative path and carry zeroed timestamps and
//! owners, so an unchanged tree always packs to the same bytes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::validator::CONTROL_FILES;
use crate::io::paths::{ARCHIVE_FILE, TEMP_PREFIX};

/// First entry of every archive.
pub const MANIFEST_NAME: &str = "MANIFEST.json";

const FILE_MODE: u32 = 0o644;
const EXECUTABLE_MODE: u32 = 0o755;

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("walk workspace {}: {source}", root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("path {} is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write archive {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One archived file as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Manifest<'a> {
    entries: &'a [ManifestEntry],
}

/// Where the archive landed and what went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub archive: PathBuf,
    pub entries: Vec<ManifestEntry>,
}

struct PendingEntry {
    meta: ManifestEntry,
    data: Vec<u8>,
}

/// Package every regular file under `root` into `root/output.tar.gz`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn package(root: &Path) -> Result<PackageReport, PackagingError> {
    let pending = collect_entries(root)?;
    let archive = root.join(ARCHIVE_FILE);
    let tmp = root.join(format!("{TEMP_PREFIX}{ARCHIVE_FILE}.{}", std::process::id()));

    let result = write_archive(&tmp, &pending).and_then(|()| {
        fs::rename(&tmp, &archive).map_err(|source| PackagingError::Write {
            path: archive.clone(),
            source,
        })
    });
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        warn!(err = %err, "packaging failed");
        return Err(err);
    }

    let entries: Vec<ManifestEntry> = pending.into_iter().map(|entry| entry.meta).collect();
    info!(archive = %archive.display(), entries = entries.len(), "workspace packaged");
    Ok(PackageReport { archive, entries })
}

fn collect_entries(root: &Path) -> Result<Vec<PendingEntry>, PackagingError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|source| PackagingError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel_str = rel
            .to_str()
            .ok_or_else(|| PackagingError::NonUtf8Path(rel.to_path_buf()))?
            .replace('\\', "/");

        if is_excluded(&rel_str, entry.depth()) {
            debug!(path = %rel_str, "excluded from archive");
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            warn!(path = %rel_str, "symlink not archived");
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let data = fs::read(entry.path()).map_err(|source| PackagingError::Read {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let mode = if is_executable(entry.path()) {
            EXECUTABLE_MODE
        } else {
            FILE_MODE
        };
        entries.push(PendingEntry {
            meta: ManifestEntry {
                path: rel_str,
                size: data.len() as u64,
                sha256: hex::encode(Sha256::digest(&data)),
                mode,
            },
            data,
        });
    }
    entries.sort_by(|a, b| a.meta.path.cmp(&b.meta.path));
    Ok(entries)
}

fn is_excluded(rel: &str, depth: usize) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    if name.starts_with(TEMP_PREFIX) {
        return true;
    }
    depth == 1 && (CONTROL_FILES.contains(&name) || name == MANIFEST_NAME)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn write_archive(path: &Path, entries: &[PendingEntry]) -> Result<(), PackagingError> {
    let write_err = |source: io::Error| PackagingError::Write {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(write_err)?;
    let encoder = GzBuilder::new().mtime(0).write(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let metas: Vec<ManifestEntry> = entries.iter().map(|entry| entry.meta.clone()).collect();
    let mut manifest = serde_json::to_vec_pretty(&Manifest { entries: &metas })
        .map_err(|err| write_err(io::Error::other(err)))?;
    manifest.push(b'\n');
    append(&mut builder, MANIFEST_NAME, FILE_MODE, &manifest).map_err(write_err)?;

    for entry in entries {
        append(&mut builder, &entry.meta.path, entry.meta.mode, &entry.data).map_err(write_err)?;
    }

    let encoder = builder.into_inner().map_err(write_err)?;
    let mut file = encoder.finish().map_err(write_err)?;
    file.flush().map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    Ok(())
}

fn append<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    mode: u32,
    data: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn archive_names(path: &Path) -> Vec<String> {
        let file = File::open(path).expect("open archive");
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .expect("entries")
            .map(|entry| {
                let entry = entry.expect("entry");
                entry.path().expect("path").to_string_lossy().into_owned()
            })
            .collect()
    }

    #[test]
    fn archive_lists_manifest_first_then_sorted_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("src/main.py"), "print('hi')\n").expect("write");
        fs::write(root.join("README.md"), "# hi\n").expect("write");
        fs::write(root.join("log.txt"), "{}\n").expect("write");
        fs::write(root.join("status.txt"), "status=Running\n").expect("write");

        let report = package(root).expect("package");
        assert_eq!(report.archive, root.join(ARCHIVE_FILE));
        assert_eq!(
            archive_names(&report.archive),
            vec!["MANIFEST.json", "README.md", "src/main.py"]
        );
        assert_eq!(report.entries[1].path, "src/main.py");
        assert_eq!(report.entries[1].size, 12);
    }

    #[test]
    fn manifest_records_checksums() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "abc").expect("write");
        let report = package(temp.path()).expect("package");

        let file = File::open(&report.archive).expect("open");
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut first = archive.entries().expect("entries").next().expect("manifest").expect("entry");
        let mut text = String::new();
        first.read_to_string(&mut text).expect("read manifest");
        let manifest: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(
            manifest["entries"][0]["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn packaging_twice_is_byte_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("one.txt"), "1").expect("write");
        fs::create_dir_all(temp.path().join("nested/deeper")).expect("mkdir");
        fs::write(temp.path().join("nested/deeper/two.txt"), "2").expect("write");

        let first = fs::read(package(temp.path()).expect("first").archive).expect("read first");
        let second = fs::read(package(temp.path()).expect("second").archive).expect("read second");
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("real.txt"), "x").expect("write");
        std::os::unix::fs::symlink("/etc/passwd", temp.path().join("link")).expect("symlink");
        let report = package(temp.path()).expect("package");
        let paths: Vec<&str> = report.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["real.txt"]);
    }
}
