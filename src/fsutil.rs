//! Tolerant filesystem primitives
//!
//! Every wrapper in this module distinguishes expected races from
//! unexpected failures. Expected races (`EEXIST` on create, `ENOENT`
//! on delete or stat, `ENOTEMPTY` on rename and rmdir) return a
//! sentinel so the caller can loop or move on; anything else becomes
//! an [`FsError`](crate::error::FsError) carrying the syscall, the
//! path and the OS error.
//!
//! Paths are only ever inspected with `lstat` so symbolic links are
//! never followed.

use crate::error::{FsError, FsResult};
use std::ffi::CString;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Chunk size for buffered file reads and writes
pub const IO_CHUNK: usize = 8192;

/// Outcome of a directory creation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirCreate {
    /// We created the directory
    Created,
    /// Someone else did; it exists and is a directory
    Exists,
    /// The parent is gone
    Missing,
}

/// Outcome of a directory removal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRemove {
    Removed,
    Missing,
    NotEmpty,
}

/// Outcome of an atomic rename or link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The entry landed at the target path
    Done,
    /// The target is occupied, retry with a fresh name
    Collision,
    /// Source or target parent vanished
    NoEntry,
}

fn io_fail(op: &'static str, path: &Path, source: io::Error) -> FsError {
    FsError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Fabricate a fatal error from a race outcome the caller cannot absorb
pub(crate) fn fatal(op: &'static str, path: &Path, errno: i32) -> FsError {
    io_fail(op, path, io::Error::from_raw_os_error(errno))
}

/// Fabricate a fatal error for a path that unexpectedly vanished
pub(crate) fn gone(op: &'static str, path: &Path) -> FsError {
    fatal(op, path, libc::ENOENT)
}

fn raw_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(0)
}

/// Scoped umask override, restored unconditionally on drop
pub struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    pub fn set(mask: u32) -> Self {
        let previous = unsafe { libc::umask(mask as libc::mode_t) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.previous);
        }
    }
}

fn with_umask<T>(umask: Option<u32>, f: impl FnOnce() -> T) -> T {
    let _guard = umask.map(UmaskGuard::set);
    f()
}

/// Seconds since the epoch, for mtime comparisons
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// `lstat` a path; a missing entry is not an error
pub fn lstat(path: &Path) -> FsResult<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_fail("lstat", path, e)),
    }
}

/// Create a directory, classifying `EEXIST` and `ENOENT` as benign
pub fn create_dir(path: &Path, umask: Option<u32>) -> FsResult<DirCreate> {
    match with_umask(umask, || fs::create_dir(path)) {
        Ok(()) => Ok(DirCreate::Created),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match lstat(path)? {
            Some(meta) if meta.is_dir() => Ok(DirCreate::Exists),
            Some(_) => Err(FsError::NotADirectory {
                path: path.to_path_buf(),
            }),
            // vanished again between mkdir and lstat
            None => Ok(DirCreate::Missing),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DirCreate::Missing),
        Err(e) => Err(io_fail("mkdir", path, e)),
    }
}

/// Create a directory and all of its ancestors
pub fn create_dir_path(path: &Path, umask: Option<u32>) -> FsResult<()> {
    let mut components: Vec<&Path> = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    while let Some(p) = components.pop() {
        match create_dir(p, umask)? {
            DirCreate::Created | DirCreate::Exists => {}
            DirCreate::Missing => return Err(gone("mkdir", p)),
        }
    }
    Ok(())
}

/// Remove a directory, reporting emptiness races to the caller
pub fn try_remove_dir(path: &Path) -> FsResult<DirRemove> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(DirRemove::Removed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DirRemove::Missing),
        Err(e) if matches!(raw_errno(&e), libc::ENOTEMPTY | libc::EEXIST) => {
            Ok(DirRemove::NotEmpty)
        }
        Err(e) => Err(io_fail("rmdir", path, e)),
    }
}

/// Remove a directory that must be empty; only `ENOENT` is benign
pub fn remove_dir(path: &Path) -> FsResult<bool> {
    match try_remove_dir(path)? {
        DirRemove::Removed => Ok(true),
        DirRemove::Missing => Ok(false),
        DirRemove::NotEmpty => Err(io_fail(
            "rmdir",
            path,
            io::Error::from_raw_os_error(libc::ENOTEMPTY),
        )),
    }
}

/// List a directory, minus `.` and `..`
///
/// With `strict` unset a missing directory yields an empty list, since
/// a concurrent purge may legitimately have removed it. Callers filter
/// the result through the name regexes.
pub fn read_dir(path: &Path, strict: bool) -> FsResult<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(it) => it,
        Err(e) if e.kind() == io::ErrorKind::NotFound && !strict => return Ok(Vec::new()),
        Err(e) => return Err(io_fail("readdir", path, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_fail("readdir", path, e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Exclusively create a file
///
/// `EEXIST` (lost race) and `ENOENT` (vanished parent) are benign and
/// yield `None` unless `strict`.
pub fn create_file_excl(path: &Path, umask: Option<u32>, strict: bool) -> FsResult<Option<File>> {
    let result = with_umask(umask, || {
        OpenOptions::new().write(true).create_new(true).open(path)
    });
    match result {
        Ok(file) => Ok(Some(file)),
        Err(e)
            if !strict
                && matches!(
                    e.kind(),
                    io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound
                ) =>
        {
            Ok(None)
        }
        Err(e) => Err(io_fail("open", path, e)),
    }
}

/// Exclusively create a file and write its whole contents
///
/// Returns false when the non-strict create lost a race.
pub fn write_file(path: &Path, data: &[u8], umask: Option<u32>, strict: bool) -> FsResult<bool> {
    let file = match create_file_excl(path, umask, strict)? {
        Some(f) => f,
        None => return Ok(false),
    };
    let mut writer = BufWriter::with_capacity(IO_CHUNK, file);
    writer
        .write_all(data)
        .and_then(|()| writer.flush())
        .map_err(|e| io_fail("write", path, e))?;
    Ok(true)
}

/// Read a whole file; a missing file yields `None`
pub fn read_file(path: &Path) -> FsResult<Option<Vec<u8>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_fail("open", path, e)),
    };
    let mut data = Vec::new();
    BufReader::with_capacity(IO_CHUNK, file)
        .read_to_end(&mut data)
        .map_err(|e| io_fail("read", path, e))?;
    Ok(Some(data))
}

/// Unlink a file; `ENOENT` yields false
pub fn unlink(path: &Path) -> FsResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_fail("unlink", path, e)),
    }
}

/// Atomically rename, classifying target collisions
pub fn rename(from: &Path, to: &Path) -> FsResult<TransferOutcome> {
    match fs::rename(from, to) {
        Ok(()) => Ok(TransferOutcome::Done),
        Err(e) if matches!(raw_errno(&e), libc::ENOTEMPTY | libc::EEXIST) => {
            Ok(TransferOutcome::Collision)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TransferOutcome::NoEntry),
        Err(e) => Err(io_fail("rename", from, e)),
    }
}

/// Hard-link a file into place, classifying target collisions
///
/// Unlike rename onto a file, `link` fails with `EEXIST` when the
/// target exists, which makes it usable as an atomic claim.
pub fn hard_link(from: &Path, to: &Path) -> FsResult<TransferOutcome> {
    match fs::hard_link(from, to) {
        Ok(()) => Ok(TransferOutcome::Done),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(TransferOutcome::Collision),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TransferOutcome::NoEntry),
        Err(e) => Err(io_fail("link", from, e)),
    }
}

/// Count the sub-directories of a directory
///
/// When `trust_nlink` is set the directory link count gives the answer
/// without listing. Filesystems without POSIX directory link counts
/// fall back to an actual listing. Returns `None` when the directory
/// vanished.
pub fn subdir_count(path: &Path, trust_nlink: bool) -> FsResult<Option<u64>> {
    let meta = match lstat(path)? {
        Some(m) if m.is_dir() => m,
        _ => return Ok(None),
    };
    if trust_nlink && meta.nlink() >= 2 {
        return Ok(Some(meta.nlink() - 2));
    }
    let mut count = 0;
    for entry in read_dir(path, false)? {
        if let Some(m) = lstat(&path.join(&entry))? {
            if m.is_dir() {
                count += 1;
            }
        }
    }
    Ok(Some(count))
}

/// Set both timestamps of a path to now
pub fn touch(path: &Path) -> FsResult<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io_fail("utimensat", path, io::Error::from_raw_os_error(libc::EINVAL)))?;
    let times = [libc::timespec {
        tv_sec: 0,
        tv_nsec: libc::UTIME_NOW,
    }; 2];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io_fail("utimensat", path, io::Error::last_os_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_dir_outcomes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a");
        assert_eq!(create_dir(&path, None).unwrap(), DirCreate::Created);
        assert_eq!(create_dir(&path, None).unwrap(), DirCreate::Exists);
        let nested = dir.path().join("missing/child");
        assert_eq!(create_dir(&nested, None).unwrap(), DirCreate::Missing);
    }

    #[test]
    fn test_create_dir_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c");
        create_dir_path(&path, None).unwrap();
        assert!(path.is_dir());
        // idempotent
        create_dir_path(&path, None).unwrap();
    }

    #[test]
    fn test_create_dir_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        write_file(&path, b"x", None, true).unwrap();
        assert!(matches!(
            create_dir(&path, None),
            Err(FsError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_remove_dir_outcomes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a");
        create_dir(&path, None).unwrap();
        create_dir(&path.join("b"), None).unwrap();
        assert_eq!(try_remove_dir(&path).unwrap(), DirRemove::NotEmpty);
        assert_eq!(try_remove_dir(&path.join("b")).unwrap(), DirRemove::Removed);
        assert_eq!(try_remove_dir(&path).unwrap(), DirRemove::Removed);
        assert_eq!(try_remove_dir(&path).unwrap(), DirRemove::Missing);
        assert!(!remove_dir(&path).unwrap());
    }

    #[test]
    fn test_read_dir_strictness() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(read_dir(&missing, false).unwrap().is_empty());
        assert!(read_dir(&missing, true).is_err());

        create_dir(&dir.path().join("x"), None).unwrap();
        write_file(&dir.path().join("y"), b"", None, true).unwrap();
        let mut names = read_dir(dir.path(), true).unwrap();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        assert!(write_file(&path, b"payload", None, true).unwrap());
        assert!(!write_file(&path, b"again", None, false).unwrap());
        assert!(write_file(&path, b"again", None, true).is_err());
        assert_eq!(read_file(&path).unwrap().unwrap(), b"payload");
        assert!(read_file(&dir.path().join("nope")).unwrap().is_none());
        assert!(unlink(&path).unwrap());
        assert!(!unlink(&path).unwrap());
    }

    #[test]
    fn test_create_file_excl_strictness() {
        let dir = tempdir().unwrap();
        let orphan = dir.path().join("missing/f");
        assert!(create_file_excl(&orphan, None, false).unwrap().is_none());
        assert!(create_file_excl(&orphan, None, true).is_err());
    }

    #[test]
    fn test_rename_collision() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        create_dir(&a, None).unwrap();
        create_dir(&b, None).unwrap();
        write_file(&b.join("f"), b"", None, true).unwrap();
        assert_eq!(rename(&a, &b).unwrap(), TransferOutcome::Collision);
        assert_eq!(
            rename(&dir.path().join("nope"), &a).unwrap(),
            TransferOutcome::NoEntry
        );
        let c = dir.path().join("c");
        assert_eq!(rename(&a, &c).unwrap(), TransferOutcome::Done);
    }

    #[test]
    fn test_hard_link_claim() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        write_file(&src, b"x", None, true).unwrap();
        let dst = dir.path().join("dst");
        assert_eq!(hard_link(&src, &dst).unwrap(), TransferOutcome::Done);
        assert_eq!(hard_link(&src, &dst).unwrap(), TransferOutcome::Collision);
        assert_eq!(
            hard_link(&dir.path().join("nope"), &dir.path().join("d2")).unwrap(),
            TransferOutcome::NoEntry
        );
    }

    #[test]
    fn test_subdir_count_both_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bucket");
        create_dir(&path, None).unwrap();
        for i in 0..3 {
            create_dir(&path.join(format!("d{i}")), None).unwrap();
        }
        write_file(&path.join("file"), b"", None, true).unwrap();

        assert_eq!(subdir_count(&path, false).unwrap(), Some(3));
        let meta = lstat(&path).unwrap().unwrap();
        if meta.nlink() == 5 {
            assert_eq!(subdir_count(&path, true).unwrap(), Some(3));
        }
        assert_eq!(subdir_count(&dir.path().join("nope"), true).unwrap(), None);
    }

    #[test]
    fn test_touch_missing_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        write_file(&path, b"", None, true).unwrap();
        touch(&path).unwrap();
        assert!(touch(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_umask_guard_restores() {
        let original = unsafe { libc::umask(0o022) };
        {
            let _guard = UmaskGuard::set(0o077);
            let current = unsafe { libc::umask(0o077) };
            assert_eq!(current, 0o077);
        }
        let after = unsafe { libc::umask(original) };
        assert_eq!(after, 0o022);
    }
}
