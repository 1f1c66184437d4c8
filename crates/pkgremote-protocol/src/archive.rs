//! Archive codec for job payloads.
//!
//! Payloads travel as gzip-compressed tar streams. Each entry carries its
//! relative path, contents and permission bits; extraction reproduces the
//! permission bits exactly so an executable submitted as `0755` comes out
//! as `0755` on the worker.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

/// Errors from packing or unpacking an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("cannot read source file {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {target}: {source}")]
    DestinationUnwritable {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt or truncated archive: {0}")]
    Corrupt(String),

    #[error("unsafe entry path: {0}")]
    UnsafePath(PathBuf),

    #[error("unsupported entry {path}: {kind}")]
    UnsupportedEntry { path: PathBuf, kind: String },
}

impl ArchiveError {
    /// Whether repeating the same operation could succeed.
    ///
    /// Write failures and damaged streams are transient (disk pressure, a
    /// partial transfer). Bad inputs are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DestinationUnwritable { .. } | Self::Corrupt(_)
        )
    }

    fn corrupt(err: impl std::fmt::Display) -> Self {
        Self::Corrupt(err.to_string())
    }

    fn stream_write(source: io::Error) -> Self {
        Self::DestinationUnwritable {
            target: "archive stream".to_string(),
            source,
        }
    }

    fn unwritable(path: &Path, source: io::Error) -> Self {
        Self::DestinationUnwritable {
            target: path.display().to_string(),
            source,
        }
    }
}

/// One file to pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Where the contents are read from.
    pub source: PathBuf,
    /// Relative path inside the archive.
    pub target: PathBuf,
    /// Permission bits, e.g. `0o755`.
    pub mode: u32,
}

impl ArchiveEntry {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode,
        }
    }
}

/// Ordered set of files forming one job payload.
///
/// The format allows any number of entries; callers and workers currently
/// require exactly one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveBundle {
    entries: Vec<ArchiveEntry>,
}

impl ArchiveBundle {
    pub fn new(entries: Vec<ArchiveEntry>) -> Self {
        Self { entries }
    }

    /// Bundle holding a single file.
    pub fn single(entry: ArchiveEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The only entry, if the bundle holds exactly one.
    pub fn single_entry(&self) -> Option<&ArchiveEntry> {
        match self.entries.as_slice() {
            [entry] => Some(entry),
            _ => None,
        }
    }
}

/// A file written by [`unpack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedFile {
    /// Absolute location of the extracted file.
    pub path: PathBuf,
    /// Permission bits applied to it.
    pub mode: u32,
}

/// Pack `entries` into a gzip-compressed tar stream written to `into`.
///
/// Entries are written in the given order. Returns the writer once the
/// compressed stream has been finished and flushed.
pub fn pack<W: Write>(entries: &[ArchiveEntry], into: W) -> Result<W, ArchiveError> {
    let mut builder = Builder::new(GzEncoder::new(into, Compression::default()));

    for entry in entries {
        let target = sanitize(&entry.target)?;
        let contents = fs::read(&entry.source).map_err(|e| ArchiveError::SourceUnreadable {
            path: entry.source.clone(),
            source: e,
        })?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(entry.mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        // Long targets get a GNU long-name record.
        builder
            .append_data(&mut header, &target, contents.as_slice())
            .map_err(ArchiveError::stream_write)?;
    }

    let encoder = builder.into_inner().map_err(ArchiveError::stream_write)?;
    let mut inner = encoder.finish().map_err(ArchiveError::stream_write)?;
    inner.flush().map_err(ArchiveError::stream_write)?;
    Ok(inner)
}

/// Extract a stream produced by [`pack`] into `into_dir`.
///
/// Only regular files and directories are accepted. Paths that are absolute
/// or climb out of `into_dir` are rejected before anything is written for
/// them.
pub fn unpack<R: Read>(from: R, into_dir: &Path) -> Result<Vec<UnpackedFile>, ArchiveError> {
    let mut archive = Archive::new(GzDecoder::new(from));
    let mut unpacked = Vec::new();

    for entry in archive.entries().map_err(ArchiveError::corrupt)? {
        let mut entry = entry.map_err(ArchiveError::corrupt)?;
        let rel_path = entry.path().map_err(ArchiveError::corrupt)?.into_owned();
        let dest = into_dir.join(sanitize(&rel_path)?);
        let mode = entry.header().mode().map_err(ArchiveError::corrupt)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(|e| ArchiveError::unwritable(&dest, e))?;
                continue;
            }
            EntryType::Regular | EntryType::Continuous => {}
            other => {
                return Err(ArchiveError::UnsupportedEntry {
                    path: rel_path,
                    kind: format!("{:?}", other),
                });
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::unwritable(parent, e))?;
        }
        let mut file = File::create(&dest).map_err(|e| ArchiveError::unwritable(&dest, e))?;
        copy_entry(&mut entry, &mut file, &dest)?;
        drop(file);
        set_mode(&dest, mode)?;

        unpacked.push(UnpackedFile { path: dest, mode });
    }

    // Drain the rest so a damaged gzip trailer is noticed.
    io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(ArchiveError::corrupt)?;

    Ok(unpacked)
}

/// SHA-256 hex digest of a file's contents.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn copy_entry<R: Read>(entry: &mut R, file: &mut File, dest: &Path) -> Result<(), ArchiveError> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = entry.read(&mut buf).map_err(ArchiveError::corrupt)?;
        if n == 0 {
            return Ok(());
        }
        file.write_all(&buf[..n])
            .map_err(|e| ArchiveError::unwritable(dest, e))?;
    }
}

/// Normalize a target path to a non-empty relative path.
///
/// Absolute paths and `..` components are rejected as [`ArchiveError::UnsafePath`].
pub fn sanitize(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafePath(path.to_path_buf()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafePath(path.to_path_buf()));
    }
    Ok(clean)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| ArchiveError::unwritable(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ArchiveError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[cfg(unix)]
    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[cfg(unix)]
    #[test]
    fn test_round_trip_preserves_contents_and_mode() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        for (name, mode) in [("hugo", 0o755), ("notes.txt", 0o640), ("private", 0o600)] {
            let source = write_source(src.path(), name, b"binary contents");
            let blob = pack(&[ArchiveEntry::new(&source, name, mode)], Vec::new()).unwrap();

            let dest = out.path().join(name.replace('.', "_"));
            fs::create_dir(&dest).unwrap();
            let files = unpack(blob.as_slice(), &dest).unwrap();

            assert_eq!(files.len(), 1);
            assert_eq!(files[0].path, dest.join(name));
            assert_eq!(files[0].mode, mode);
            assert_eq!(fs::read(&files[0].path).unwrap(), b"binary contents");
            assert_eq!(mode_of(&files[0].path), mode);
        }
    }

    #[test]
    fn test_entries_keep_their_order() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let b = write_source(src.path(), "b", b"b");
        let a = write_source(src.path(), "a", b"a");

        let blob = pack(
            &[ArchiveEntry::new(&b, "b", 0o644), ArchiveEntry::new(&a, "a", 0o644)],
            Vec::new(),
        )
        .unwrap();
        let files = unpack(blob.as_slice(), out.path()).unwrap();

        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_output_is_compressed() {
        let src = TempDir::new().unwrap();
        let source = write_source(src.path(), "zeros", &vec![0u8; 256 * 1024]);

        let blob = pack(&[ArchiveEntry::new(&source, "zeros", 0o644)], Vec::new()).unwrap();

        assert!(blob.len() < 16 * 1024, "blob was {} bytes", blob.len());
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let src = TempDir::new().unwrap();
        let missing = src.path().join("missing");

        let err = pack(&[ArchiveEntry::new(&missing, "missing", 0o644)], Vec::new()).unwrap_err();

        assert!(matches!(err, ArchiveError::SourceUnreadable { ref path, .. } if *path == missing));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_absolute_target_rejected_on_pack() {
        let src = TempDir::new().unwrap();
        let source = write_source(src.path(), "hugo", b"x");

        let err = pack(&[ArchiveEntry::new(&source, "/usr/bin/hugo", 0o755)], Vec::new())
            .unwrap_err();

        assert!(matches!(err, ArchiveError::UnsafePath(_)));
    }

    #[test]
    fn test_parent_dir_target_rejected_on_pack() {
        let src = TempDir::new().unwrap();
        let source = write_source(src.path(), "hugo", b"x");

        let err = pack(&[ArchiveEntry::new(&source, "bin/../../hugo", 0o755)], Vec::new())
            .unwrap_err();

        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn test_long_target_round_trip() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let source = write_source(src.path(), "hugo", b"long path binary");
        let target = format!("{}/hugo", "a".repeat(120));

        let blob = pack(&[ArchiveEntry::new(&source, &target, 0o755)], Vec::new()).unwrap();
        let files = unpack(blob.as_slice(), out.path()).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, out.path().join(&target));
        assert_eq!(fs::read(&files[0].path).unwrap(), b"long path binary");
        assert_eq!(mode_of(&files[0].path), 0o755);
    }

    #[test]
    fn test_garbage_stream_is_corrupt() {
        let out = TempDir::new().unwrap();

        let err = unpack(&b"definitely not a gzip stream"[..], out.path()).unwrap_err();

        assert!(matches!(err, ArchiveError::Corrupt(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let contents: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let source = write_source(src.path(), "hugo", &contents);
        let blob = pack(&[ArchiveEntry::new(&source, "hugo", 0o755)], Vec::new()).unwrap();

        let truncated = &blob[..blob.len() / 2];
        let err = unpack(truncated, out.path()).unwrap_err();

        assert!(matches!(err, ArchiveError::Corrupt(_)));
    }

    #[test]
    fn test_parent_dir_entry_rejected() {
        let out = TempDir::new().unwrap();
        let target = out.path().join("inner");
        fs::create_dir(&target).unwrap();

        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = Header::new_gnu();
        let name = b"../escape";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(1);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let blob = builder.into_inner().unwrap().finish().unwrap();

        let err = unpack(blob.as_slice(), &target).unwrap_err();

        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(!out.path().join("escape").exists());
    }

    #[test]
    fn test_symlink_entry_rejected() {
        let out = TempDir::new().unwrap();

        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = Header::new_gnu();
        header.set_path("link").unwrap();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_entry_type(EntryType::Symlink);
        header.set_link_name("/etc/passwd").unwrap();
        header.set_cksum();
        builder.append(&header, &[] as &[u8]).unwrap();
        let blob = builder.into_inner().unwrap().finish().unwrap();

        let err = unpack(blob.as_slice(), out.path()).unwrap_err();

        assert!(matches!(err, ArchiveError::UnsupportedEntry { .. }));
    }

    #[test]
    fn test_single_entry() {
        let one = ArchiveBundle::single(ArchiveEntry::new("/tmp/a", "a", 0o644));
        let two = ArchiveBundle::new(vec![
            ArchiveEntry::new("/tmp/a", "a", 0o644),
            ArchiveEntry::new("/tmp/b", "b", 0o644),
        ]);

        assert!(one.single_entry().is_some());
        assert!(two.single_entry().is_none());
        assert!(ArchiveBundle::default().single_entry().is_none());
    }

    #[test]
    fn test_digest_file() {
        let dir = TempDir::new().unwrap();
        let path = write_source(dir.path(), "abc", b"abc");

        assert_eq!(
            digest_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
