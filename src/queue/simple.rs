//! Single-payload queue
//!
//! Same bucket layout as the schema-bearing queue, but each element is
//! a regular file whose contents are the opaque payload. There is no
//! schema and no `locked/` marker; the advisory lock is an atomic
//! in-bucket rename to a `.lck` sibling, which makes a locked element
//! invisible to iteration until it is unlocked or reaped.
//!
//! Publication uses `link` plus `unlink` rather than `rename`, because
//! renaming onto an existing file silently replaces it while `link`
//! fails with `EEXIST` and so preserves the atomic-claim property.

use crate::error::{QueueError, Result};
use crate::fsutil::{self, TransferOutcome};
use crate::name::{
    bucket_name, bucket_seq, new_name, BUCKET_RE, ELEMENT_PATH_RE, ELEMENT_RE, LOCKED_ELEMENT_RE,
    LOCKED_SUFFIX, OBSOLETE_DIR, TEMPORARY_DIR,
};
use crate::queue::{
    default_sink, init_root, reap_stale_entry, Cursor, PurgeOptions, PurgeWarning, Queue, QueueId,
    WarningSink, DEFAULT_MAXELTS,
};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A queue of single-payload file elements
pub struct SimpleQueue {
    root: PathBuf,
    id: QueueId,
    maxelts: usize,
    umask: Option<u32>,
    cursor: Cursor,
    sink: WarningSink,
}

/// Builder for [`SimpleQueue`]
pub struct SimpleQueueBuilder {
    path: PathBuf,
    maxelts: usize,
    umask: Option<u32>,
    sink: WarningSink,
}

impl SimpleQueueBuilder {
    /// Cap the number of elements per intermediate bucket
    pub fn maxelts(mut self, maxelts: usize) -> Self {
        self.maxelts = maxelts;
        self
    }

    /// Umask applied around every create operation
    pub fn umask(mut self, umask: u32) -> Self {
        self.umask = Some(umask);
        self
    }

    /// Destination for purge warnings; defaults to the log
    pub fn warning_sink(
        mut self,
        sink: impl Fn(&PurgeWarning) + Send + Sync + 'static,
    ) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Create the on-disk structure and open the queue
    pub fn open(self) -> Result<SimpleQueue> {
        if self.maxelts == 0 {
            return Err(QueueError::InvalidOption(
                "maxelts must be at least 1".into(),
            ));
        }
        if let Some(mask) = self.umask {
            if mask > 0o777 {
                return Err(QueueError::InvalidOption(format!(
                    "umask {mask:#o} out of range"
                )));
            }
        }
        let (id, _) = init_root(&self.path, self.umask)?;
        Ok(SimpleQueue {
            root: self.path,
            id,
            maxelts: self.maxelts,
            umask: self.umask,
            cursor: Cursor::default(),
            sink: self.sink,
        })
    }
}

impl SimpleQueue {
    /// Start building a queue rooted at `path`
    pub fn builder(path: impl Into<PathBuf>) -> SimpleQueueBuilder {
        SimpleQueueBuilder {
            path: path.into(),
            maxelts: DEFAULT_MAXELTS,
            umask: None,
            sink: default_sink(),
        }
    }

    /// Open a queue with default options
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(path).open()
    }

    /// Independent handle over the same queue, cursor reset
    pub fn copy(&self) -> Self {
        Self {
            root: self.root.clone(),
            id: self.id.clone(),
            maxelts: self.maxelts,
            umask: self.umask,
            cursor: Cursor::default(),
            sink: Arc::clone(&self.sink),
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if ELEMENT_PATH_RE.is_match(name) {
            Ok(())
        } else {
            Err(QueueError::InvalidName { name: name.into() })
        }
    }

    fn locked_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}{LOCKED_SUFFIX}"))
    }

    /// Insert a new element; returns its `bucket/element` name
    pub fn add(&self, payload: &[u8]) -> Result<String> {
        let staging_area = self.root.join(TEMPORARY_DIR);
        let staged = loop {
            let candidate = staging_area.join(new_name());
            if fsutil::write_file(&candidate, payload, self.umask, false)? {
                break candidate;
            }
            // a name collision retries; a vanished staging area cannot
            if fsutil::lstat(&staging_area)?.is_none() {
                return Err(fsutil::gone("open", &candidate).into());
            }
        };

        loop {
            let bucket = self.insertion_bucket()?;
            let element = new_name();
            let target = self.root.join(&bucket).join(&element);
            match fsutil::hard_link(&staged, &target)? {
                TransferOutcome::Done => {
                    fsutil::unlink(&staged)?;
                    let name = format!("{bucket}/{element}");
                    debug!("added element {name}");
                    return Ok(name);
                }
                TransferOutcome::Collision => continue,
                TransferOutcome::NoEntry => {
                    if fsutil::lstat(&staged)?.is_none() {
                        return Err(fsutil::gone("link", &staged).into());
                    }
                    continue;
                }
            }
        }
    }

    fn insertion_bucket(&self) -> Result<String> {
        let mut buckets: Vec<String> = fsutil::read_dir(&self.root, true)?
            .into_iter()
            .filter(|name| BUCKET_RE.is_match(name))
            .collect();
        buckets.sort_unstable();
        let last = match buckets.pop() {
            Some(last) => last,
            None => return self.create_bucket(0),
        };
        match self.element_count(&last)? {
            Some(used) if used < self.maxelts => Ok(last),
            _ => {
                let seq = bucket_seq(&last).ok_or_else(|| QueueError::InvalidName {
                    name: last.clone(),
                })?;
                match seq.checked_add(1) {
                    Some(next) => self.create_bucket(next),
                    None => Ok(last),
                }
            }
        }
    }

    fn create_bucket(&self, seq: u32) -> Result<String> {
        let name = bucket_name(seq);
        let path = self.root.join(&name);
        match fsutil::create_dir(&path, self.umask)? {
            fsutil::DirCreate::Created => {
                debug!("created bucket {name}");
                Ok(name)
            }
            fsutil::DirCreate::Exists => Ok(name),
            fsutil::DirCreate::Missing => Err(fsutil::gone("mkdir", &path).into()),
        }
    }

    /// Elements in one bucket, locked ones included; `None` when the
    /// bucket vanished
    fn element_count(&self, bucket: &str) -> Result<Option<usize>> {
        let path = self.root.join(bucket);
        if fsutil::lstat(&path)?.is_none() {
            return Ok(None);
        }
        let count = fsutil::read_dir(&path, false)?
            .into_iter()
            .filter(|name| ELEMENT_RE.is_match(name) || LOCKED_ELEMENT_RE.is_match(name))
            .count();
        Ok(Some(count))
    }

    /// Try to take the advisory lock on an element
    ///
    /// Exactly one of any number of concurrent callers wins, because
    /// the rename source disappears for everyone else.
    pub fn lock(&self, name: &str) -> Result<bool> {
        self.lock_opt(name, true)
    }

    /// Lock with explicit strictness
    pub fn lock_opt(&self, name: &str, permissive: bool) -> Result<bool> {
        self.check_name(name)?;
        match fsutil::rename(&self.root.join(name), &self.locked_path(name))? {
            TransferOutcome::Done => {
                debug!("locked element {name}");
                Ok(true)
            }
            TransferOutcome::Collision => Ok(false),
            TransferOutcome::NoEntry => {
                if permissive {
                    Ok(false)
                } else {
                    Err(QueueError::NoSuchElement { name: name.into() })
                }
            }
        }
    }

    /// Release the advisory lock, making the element visible again
    pub fn unlock(&self, name: &str) -> Result<bool> {
        self.unlock_opt(name, false)
    }

    /// Unlock with explicit strictness
    pub fn unlock_opt(&self, name: &str, permissive: bool) -> Result<bool> {
        self.check_name(name)?;
        match fsutil::rename(&self.locked_path(name), &self.root.join(name))? {
            TransferOutcome::Done => {
                debug!("unlocked element {name}");
                Ok(true)
            }
            TransferOutcome::Collision => Ok(false),
            TransferOutcome::NoEntry => {
                if permissive {
                    Ok(false)
                } else {
                    Err(QueueError::NotLocked { name: name.into() })
                }
            }
        }
    }

    /// Read a locked element's payload
    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.check_name(name)?;
        match fsutil::read_file(&self.locked_path(name))? {
            Some(payload) => Ok(payload),
            None => Err(QueueError::NotLocked { name: name.into() }),
        }
    }

    /// Destroy a locked element
    pub fn remove(&self, name: &str) -> Result<()> {
        self.check_name(name)?;
        if !fsutil::unlink(&self.locked_path(name))? {
            return Err(QueueError::NotLocked { name: name.into() });
        }
        debug!("removed element {name}");
        Ok(())
    }

    fn count_elements(&self) -> Result<usize> {
        let mut total = 0usize;
        for bucket in fsutil::read_dir(&self.root, true)?
            .into_iter()
            .filter(|name| BUCKET_RE.is_match(name))
        {
            total += fsutil::read_dir(&self.root.join(&bucket), false)?
                .into_iter()
                .filter(|name| ELEMENT_RE.is_match(name))
                .count();
        }
        Ok(total)
    }

    fn purge_impl(&mut self, opts: PurgeOptions) -> Result<()> {
        let now = fsutil::now_secs();

        let mut buckets: Vec<String> = fsutil::read_dir(&self.root, true)?
            .into_iter()
            .filter(|name| BUCKET_RE.is_match(name))
            .collect();
        buckets.sort_unstable();
        if let Some((_, rest)) = buckets.split_last() {
            for bucket in rest {
                let path = self.root.join(bucket);
                if fsutil::read_dir(&path, false)?.is_empty() {
                    fsutil::try_remove_dir(&path)?;
                }
            }
        }

        if opts.maxtemp > 0 {
            let cutoff = now - opts.maxtemp as i64;
            for area in [TEMPORARY_DIR, OBSOLETE_DIR] {
                let dir = self.root.join(area);
                for entry in fsutil::read_dir(&dir, true)?
                    .into_iter()
                    .filter(|name| ELEMENT_RE.is_match(name))
                {
                    let path = dir.join(&entry);
                    let meta = match fsutil::lstat(&path)? {
                        Some(meta) => meta,
                        None => continue,
                    };
                    if meta.mtime() >= cutoff {
                        continue;
                    }
                    (self.sink)(&PurgeWarning::StaleElement { path: path.clone() });
                    reap_stale_entry(&path)?;
                }
            }
        }

        if opts.maxlock > 0 {
            let cutoff = now - opts.maxlock as i64;
            for bucket in buckets {
                let dir = self.root.join(&bucket);
                for entry in fsutil::read_dir(&dir, false)?
                    .into_iter()
                    .filter(|name| LOCKED_ELEMENT_RE.is_match(name))
                {
                    let path = dir.join(&entry);
                    let meta = match fsutil::lstat(&path)? {
                        Some(meta) => meta,
                        None => continue,
                    };
                    if meta.mtime() >= cutoff {
                        continue;
                    }
                    let element = entry.trim_end_matches(LOCKED_SUFFIX);
                    let name = format!("{bucket}/{element}");
                    (self.sink)(&PurgeWarning::StaleLock { name: name.clone() });
                    self.unlock_opt(&name, true)?;
                }
            }
        }
        Ok(())
    }
}

impl Queue for SimpleQueue {
    fn path(&self) -> &Path {
        &self.root
    }

    fn id(&self) -> &QueueId {
        &self.id
    }

    fn count(&self) -> Result<usize> {
        self.count_elements()
    }

    fn first(&mut self) -> Result<Option<String>> {
        self.cursor.reset(&self.root)?;
        Ok(self.cursor.advance(&self.root)?)
    }

    fn next(&mut self) -> Result<Option<String>> {
        Ok(self.cursor.advance(&self.root)?)
    }

    fn touch(&self, name: &str) -> Result<()> {
        self.check_name(name)?;
        Ok(fsutil::touch(&self.root.join(name))?)
    }

    fn purge_with(&mut self, opts: PurgeOptions) -> Result<()> {
        self.purge_impl(opts)
    }

    fn boxed_copy(&self) -> Box<dyn Queue> {
        Box::new(self.copy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_lock_get_remove() {
        let dir = tempdir().unwrap();
        let mut queue = SimpleQueue::open(dir.path().join("q")).unwrap();

        let name = queue.add(b"payload").unwrap();
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.first().unwrap().as_deref(), Some(name.as_str()));

        assert!(queue.lock(&name).unwrap());
        // locked elements leave the visible set
        assert_eq!(queue.count().unwrap(), 0);
        assert!(!queue.lock(&name).unwrap());

        assert_eq!(queue.get(&name).unwrap(), b"payload");
        queue.remove(&name).unwrap();
        assert_eq!(queue.count().unwrap(), 0);
        assert!(queue.first().unwrap().is_none());
    }

    #[test]
    fn test_unlock_restores_visibility() {
        let dir = tempdir().unwrap();
        let queue = SimpleQueue::open(dir.path().join("q")).unwrap();
        let name = queue.add(b"x").unwrap();
        assert!(queue.lock(&name).unwrap());
        assert!(queue.unlock(&name).unwrap());
        assert_eq!(queue.count().unwrap(), 1);
        // strict unlock of an unlocked element is a protocol error
        assert!(matches!(
            queue.unlock(&name),
            Err(QueueError::NotLocked { .. })
        ));
    }

    #[test]
    fn test_get_requires_lock() {
        let dir = tempdir().unwrap();
        let queue = SimpleQueue::open(dir.path().join("q")).unwrap();
        let name = queue.add(b"x").unwrap();
        assert!(matches!(
            queue.get(&name),
            Err(QueueError::NotLocked { .. })
        ));
        assert!(matches!(
            queue.remove(&name),
            Err(QueueError::NotLocked { .. })
        ));
    }

    #[test]
    fn test_staging_is_empty_after_add() {
        let dir = tempdir().unwrap();
        let queue = SimpleQueue::open(dir.path().join("q")).unwrap();
        queue.add(b"x").unwrap();
        let staged = fsutil::read_dir(&dir.path().join("q").join(TEMPORARY_DIR), true).unwrap();
        assert!(staged.is_empty());
    }
}
