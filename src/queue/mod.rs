//! Queue core: identity, iteration and the shared operation surface
//!
//! A queue is a rooted directory tree:
//!
//! ```text
//! root/
//! ├── temporary/          elements being populated, hidden from iteration
//! ├── obsolete/           elements being torn down, hidden from iteration
//! ├── 00000000/           intermediate buckets, 8 hex digits,
//! │   ├── 688a01f2015e03  up to maxelts elements each
//! │   │   ├── <field>     one file per schema field
//! │   │   └── locked/     present iff the element is locked
//! │   └── ...
//! └── 00000001/
//! ```
//!
//! Producers stage under `temporary/` and rename atomically into a
//! bucket; consumers iterate buckets in lexical order, lock, read and
//! tear elements down through `obsolete/`. The only cross-process
//! mutex is directory creation.
//!
//! Iteration state (the pending bucket and element lists) is cached on
//! the handle, so a single handle supports a single cursor. Use
//! [`NormalQueue::copy`](normal::NormalQueue::copy) or
//! [`SimpleQueue::copy`](simple::SimpleQueue::copy) for independent
//! iterators.

pub mod normal;
pub mod set;
pub mod simple;

use crate::error::{FsResult, Result};
use crate::fsutil::{self, DirCreate};
use crate::name::{BUCKET_RE, ELEMENT_RE, LOCKED_DIR, OBSOLETE_DIR, TEMPORARY_DIR};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Default cap on elements per intermediate bucket
pub const DEFAULT_MAXELTS: usize = 16_000;

/// The operation surface shared by both queue flavors
///
/// Payload-specific operations (`add`, `lock`, `unlock`, `get`,
/// `remove`) live on the concrete types; this trait is what
/// [`QueueSet`](set::QueueSet) requires of its members.
pub trait Queue {
    /// Root path the queue was opened with
    fn path(&self) -> &Path;

    /// Stable identity of the queue
    fn id(&self) -> &QueueId;

    /// Number of elements currently visible; transient, not a snapshot
    fn count(&self) -> Result<usize>;

    /// Reset the cursor and return the first element, if any
    fn first(&mut self) -> Result<Option<String>>;

    /// Advance the cursor and return the next element, if any
    fn next(&mut self) -> Result<Option<String>>;

    /// Freshen an element's mtime so purge does not reap it
    fn touch(&self, name: &str) -> Result<()>;

    /// Garbage-collect with the given age cutoffs
    fn purge_with(&mut self, opts: PurgeOptions) -> Result<()>;

    /// Garbage-collect with the default age cutoffs
    fn purge(&mut self) -> Result<()> {
        self.purge_with(PurgeOptions::default())
    }

    /// Independent handle over the same queue, cursor reset
    fn boxed_copy(&self) -> Box<dyn Queue>;
}

/// Stable identity of a queue root
///
/// On POSIX filesystems this is the device and inode pair of the root
/// directory, so two handles on the same queue compare equal however
/// the root was spelled. Where inode numbers cannot be trusted the
/// canonicalized path stands in, with correspondingly weaker
/// uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    DevIno(u64, u64),
    Path(PathBuf),
}

impl QueueId {
    pub(crate) fn from_root(root: &Path) -> Result<QueueId> {
        let meta = fsutil::lstat(root)?.ok_or_else(|| fsutil::gone("lstat", root))?;
        if meta.dev() == 0 && meta.ino() == 0 {
            let canonical = fs::canonicalize(root).map_err(|e| crate::error::FsError::Io {
                op: "realpath",
                path: root.to_path_buf(),
                source: e,
            })?;
            Ok(QueueId::Path(canonical))
        } else {
            Ok(QueueId::DevIno(meta.dev(), meta.ino()))
        }
    }

    /// Opaque byte form, usable as a map key by embedders
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            QueueId::DevIno(dev, ino) => {
                let mut bytes = Vec::with_capacity(16);
                bytes.extend_from_slice(&dev.to_le_bytes());
                bytes.extend_from_slice(&ino.to_le_bytes());
                bytes
            }
            QueueId::Path(path) => {
                use std::os::unix::ffi::OsStrExt;
                path.as_os_str().as_bytes().to_vec()
            }
        }
    }
}

/// Age cutoffs for [`Queue::purge_with`], in seconds; zero disables
/// the corresponding sweep
#[derive(Debug, Clone, Copy)]
pub struct PurgeOptions {
    /// Maximum age of `temporary/` and `obsolete/` entries
    pub maxtemp: u64,

    /// Maximum age of a held lock
    pub maxlock: u64,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            maxtemp: 300,
            maxlock: 600,
        }
    }
}

/// Operational warning emitted during purge
#[derive(Debug, Clone)]
pub enum PurgeWarning {
    /// A staging entry outlived `maxtemp` and was reaped
    StaleElement { path: PathBuf },

    /// A lock outlived `maxlock` and was released
    StaleLock { name: String },
}

/// Pluggable destination for purge warnings
pub type WarningSink = Arc<dyn Fn(&PurgeWarning) + Send + Sync>;

pub(crate) fn default_sink() -> WarningSink {
    Arc::new(|warning| match warning {
        PurgeWarning::StaleElement { path } => {
            warn!("removing stale element: {}", path.display());
        }
        PurgeWarning::StaleLock { name } => {
            warn!("releasing stale lock: {}", name);
        }
    })
}

/// Create the root tree and probe its capabilities
///
/// Returns the queue identity and whether directory link counts can be
/// trusted for sub-directory counting on this filesystem.
pub(crate) fn init_root(path: &Path, umask: Option<u32>) -> Result<(QueueId, bool)> {
    fsutil::create_dir_path(path, umask)?;
    for staging in [TEMPORARY_DIR, OBSOLETE_DIR] {
        match fsutil::create_dir(&path.join(staging), umask)? {
            DirCreate::Created | DirCreate::Exists => {}
            DirCreate::Missing => return Err(fsutil::gone("mkdir", &path.join(staging)).into()),
        }
    }
    let id = QueueId::from_root(path)?;
    // with two staging sub-directories in place, a POSIX-style link
    // count must be at least 4; filesystems like btrfs report 1
    let trust_nlink = fsutil::lstat(path)?
        .map(|meta| meta.nlink() > 2)
        .unwrap_or(false);
    Ok((id, trust_nlink))
}

/// Cached iteration state: pending buckets and pending element paths
///
/// Both lists are kept sorted in descending order so `pop` walks the
/// queue in ascending lexical order.
#[derive(Debug, Default, Clone)]
pub(crate) struct Cursor {
    pending_buckets: Vec<String>,
    pending_elements: Vec<String>,
}

impl Cursor {
    /// Rebuild the pending bucket list; a missing root is fatal
    pub(crate) fn reset(&mut self, root: &Path) -> FsResult<()> {
        let mut buckets: Vec<String> = fsutil::read_dir(root, true)?
            .into_iter()
            .filter(|name| BUCKET_RE.is_match(name))
            .collect();
        buckets.sort_unstable_by(|a, b| b.cmp(a));
        self.pending_buckets = buckets;
        self.pending_elements.clear();
        Ok(())
    }

    /// Pop the next element path, refilling from buckets as needed
    ///
    /// Tolerates buckets removed by a concurrent purge.
    pub(crate) fn advance(&mut self, root: &Path) -> FsResult<Option<String>> {
        loop {
            if let Some(element) = self.pending_elements.pop() {
                return Ok(Some(element));
            }
            let bucket = match self.pending_buckets.pop() {
                Some(bucket) => bucket,
                None => return Ok(None),
            };
            let mut names: Vec<String> = fsutil::read_dir(&root.join(&bucket), false)?
                .into_iter()
                .filter(|name| ELEMENT_RE.is_match(name))
                .collect();
            names.sort_unstable_by(|a, b| b.cmp(a));
            self.pending_elements = names
                .into_iter()
                .map(|name| format!("{bucket}/{name}"))
                .collect();
        }
    }
}

/// Tear down one stale staging entry, directory or file
pub(crate) fn reap_stale_entry(path: &Path) -> Result<()> {
    match fsutil::lstat(path)? {
        None => Ok(()),
        Some(meta) if meta.is_dir() => {
            for entry in fsutil::read_dir(path, false)? {
                if entry == LOCKED_DIR {
                    continue;
                }
                fsutil::unlink(&path.join(&entry))?;
            }
            fsutil::remove_dir(&path.join(LOCKED_DIR))?;
            fsutil::try_remove_dir(path)?;
            Ok(())
        }
        Some(_) => {
            fsutil::unlink(path)?;
            Ok(())
        }
    }
}
