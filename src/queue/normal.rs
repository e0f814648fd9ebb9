//! Schema-bearing queue
//!
//! Each element is a directory holding one file per schema field, plus
//! a `locked/` sub-directory while a consumer owns it. The element
//! lifecycle is:
//!
//! ```text
//!         add                 lock               remove
//! [new] ──────▶ [unlocked] ──────▶ [locked] ──────▶ [deleted]
//!                   ▲                  │
//!                   └───── unlock ─────┘
//! ```
//!
//! `add` populates a directory under `temporary/` and renames it into
//! an intermediate bucket; `remove` renames it into `obsolete/` before
//! tearing it down, so iteration never observes a half-built or
//! half-destroyed element.

use crate::error::{QueueError, Result, SchemaError};
use crate::fsutil::{self, DirCreate, DirRemove, TransferOutcome};
use crate::name::{
    bucket_name, bucket_seq, new_name, BUCKET_RE, ELEMENT_PATH_RE, ELEMENT_RE, LOCKED_DIR,
    OBSOLETE_DIR, TEMPORARY_DIR,
};
use crate::queue::{
    default_sink, init_root, reap_stale_entry, Cursor, PurgeOptions, PurgeWarning, Queue, QueueId,
    WarningSink, DEFAULT_MAXELTS,
};
use crate::schema::{FieldMap, Schema};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Rename retries before the remove loop starts yielding the CPU
const REMOVE_SPIN_LIMIT: u32 = 10;

/// A queue of schema-bearing elements
pub struct NormalQueue {
    root: PathBuf,
    id: QueueId,
    schema: Option<Schema>,
    maxelts: usize,
    umask: Option<u32>,
    trust_nlink: bool,
    cursor: Cursor,
    sink: WarningSink,
}

impl std::fmt::Debug for NormalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalQueue")
            .field("root", &self.root)
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("maxelts", &self.maxelts)
            .field("umask", &self.umask)
            .field("trust_nlink", &self.trust_nlink)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

/// Builder for [`NormalQueue`]
pub struct NormalQueueBuilder {
    path: PathBuf,
    schema: Option<Schema>,
    maxelts: usize,
    umask: Option<u32>,
    sink: WarningSink,
}

impl NormalQueueBuilder {
    /// Declare the element schema
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

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
    pub fn open(self) -> Result<NormalQueue> {
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
        let (id, trust_nlink) = init_root(&self.path, self.umask)?;
        Ok(NormalQueue {
            root: self.path,
            id,
            schema: self.schema,
            maxelts: self.maxelts,
            umask: self.umask,
            trust_nlink,
            cursor: Cursor::default(),
            sink: self.sink,
        })
    }
}

impl NormalQueue {
    /// Start building a queue rooted at `path`
    pub fn builder(path: impl Into<PathBuf>) -> NormalQueueBuilder {
        NormalQueueBuilder {
            path: path.into(),
            schema: None,
            maxelts: DEFAULT_MAXELTS,
            umask: None,
            sink: default_sink(),
        }
    }

    /// Open a queue with default options and no schema
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(path).open()
    }

    /// Independent handle over the same queue, cursor reset
    pub fn copy(&self) -> Self {
        Self {
            root: self.root.clone(),
            id: self.id.clone(),
            schema: self.schema.clone(),
            maxelts: self.maxelts,
            umask: self.umask,
            trust_nlink: self.trust_nlink,
            cursor: Cursor::default(),
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if ELEMENT_PATH_RE.is_match(name) {
            Ok(())
        } else {
            Err(QueueError::InvalidName { name: name.into() })
        }
    }

    /// Insert a new element; returns its `bucket/element` name
    ///
    /// Every mandatory schema field must be present in `fields`, and
    /// every supplied field must be declared and match its type.
    pub fn add(&self, fields: &FieldMap<'_>) -> Result<String> {
        let schema = self.schema.as_ref().ok_or(QueueError::NoSchema)?;

        // claim a staging directory; a same-microsecond sibling in
        // this process means a fresh name is needed
        let staging_area = self.root.join(TEMPORARY_DIR);
        let staged = loop {
            let candidate = staging_area.join(new_name());
            match fsutil::create_dir(&candidate, self.umask)? {
                DirCreate::Created => break candidate,
                DirCreate::Exists => continue,
                DirCreate::Missing => return Err(fsutil::gone("mkdir", &candidate).into()),
            }
        };

        for (field, value) in fields {
            let spec = schema
                .field(field)
                .ok_or_else(|| SchemaError::UnknownField {
                    field: field.clone(),
                })?;
            let bytes = spec.encode(field, value)?;
            // the staging directory is ours alone, so any failure here
            // is unexpected
            fsutil::write_file(&staged.join(field), &bytes, self.umask, true)?;
        }
        for (field, spec) in schema.fields() {
            if !spec.optional && !fields.contains_key(field) {
                return Err(SchemaError::MissingField {
                    field: field.clone(),
                }
                .into());
            }
        }

        // publish: rename into the insertion bucket, retrying with a
        // fresh name when another producer shares our microsecond
        loop {
            let bucket = self.insertion_bucket()?;
            let element = new_name();
            let target = self.root.join(&bucket).join(&element);
            match fsutil::rename(&staged, &target)? {
                TransferOutcome::Done => {
                    let name = format!("{bucket}/{element}");
                    debug!("added element {name}");
                    return Ok(name);
                }
                TransferOutcome::Collision => continue,
                TransferOutcome::NoEntry => {
                    // either the bucket was purged under us (pick a
                    // fresh one) or our staging directory is gone
                    if fsutil::lstat(&staged)?.is_none() {
                        return Err(fsutil::gone("rename", &staged).into());
                    }
                    continue;
                }
            }
        }
    }

    /// Pick the bucket new elements are renamed into
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
        match fsutil::subdir_count(&self.root.join(&last), self.trust_nlink)? {
            Some(used) if (used as usize) < self.maxelts => Ok(last),
            _ => {
                let seq = bucket_seq(&last).ok_or_else(|| QueueError::InvalidName {
                    name: last.clone(),
                })?;
                // on sequence exhaustion keep filling the last bucket
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
            DirCreate::Created => {
                debug!("created bucket {name}");
                Ok(name)
            }
            DirCreate::Exists => Ok(name),
            DirCreate::Missing => Err(fsutil::gone("mkdir", &path).into()),
        }
    }

    /// Try to take the advisory lock on an element
    ///
    /// Returns false when the element is already locked or has been
    /// consumed by someone else.
    pub fn lock(&self, name: &str) -> Result<bool> {
        self.lock_opt(name, true)
    }

    /// Lock with explicit strictness; when `permissive` is unset a
    /// lost race is an error instead of `false`
    pub fn lock_opt(&self, name: &str, permissive: bool) -> Result<bool> {
        self.check_name(name)?;
        let element = self.root.join(name);
        match fsutil::create_dir(&element.join(LOCKED_DIR), self.umask)? {
            DirCreate::Created => {
                // the element may have been renamed away while our
                // mkdir landed; such a lock is void
                if fsutil::lstat(&element)?.is_none() {
                    return Ok(false);
                }
                debug!("locked element {name}");
                Ok(true)
            }
            DirCreate::Exists => {
                if permissive {
                    Ok(false)
                } else {
                    Err(QueueError::AlreadyLocked { name: name.into() })
                }
            }
            DirCreate::Missing => {
                if permissive {
                    Ok(false)
                } else {
                    Err(QueueError::NoSuchElement { name: name.into() })
                }
            }
        }
    }

    /// Release the advisory lock
    ///
    /// Strict by default since unlock is ordinarily called by the lock
    /// holder; a missing lock then means a protocol violation.
    pub fn unlock(&self, name: &str) -> Result<bool> {
        self.unlock_opt(name, false)
    }

    /// Unlock with explicit strictness
    pub fn unlock_opt(&self, name: &str, permissive: bool) -> Result<bool> {
        self.check_name(name)?;
        let marker = self.root.join(name).join(LOCKED_DIR);
        match fsutil::try_remove_dir(&marker)? {
            DirRemove::Removed => {
                debug!("unlocked element {name}");
                Ok(true)
            }
            DirRemove::Missing => {
                if permissive {
                    Ok(false)
                } else {
                    Err(QueueError::NotLocked { name: name.into() })
                }
            }
            DirRemove::NotEmpty => Err(fsutil::fatal("rmdir", &marker, libc::ENOTEMPTY).into()),
        }
    }

    /// Read a locked element's fields
    pub fn get(&self, name: &str) -> Result<FieldMap<'static>> {
        let schema = self.schema.as_ref().ok_or(QueueError::NoSchema)?;
        self.check_name(name)?;
        let element = self.root.join(name);
        if fsutil::lstat(&element.join(LOCKED_DIR))?.is_none() {
            return Err(QueueError::NotLocked { name: name.into() });
        }
        let mut fields = FieldMap::new();
        for (field, spec) in schema.fields() {
            match fsutil::read_file(&element.join(field))? {
                Some(bytes) => {
                    fields.insert(field.clone(), spec.decode(field, bytes)?);
                }
                None if spec.optional => {}
                None => {
                    return Err(SchemaError::MissingField {
                        field: field.clone(),
                    }
                    .into())
                }
            }
        }
        Ok(fields)
    }

    /// Destroy a locked element
    pub fn remove(&self, name: &str) -> Result<()> {
        self.check_name(name)?;
        let element = self.root.join(name);
        if fsutil::lstat(&element.join(LOCKED_DIR))?.is_none() {
            return Err(QueueError::NotLocked { name: name.into() });
        }

        // move the doomed element out of iteration range
        let grave = loop {
            let candidate = self.root.join(OBSOLETE_DIR).join(new_name());
            match fsutil::rename(&element, &candidate)? {
                TransferOutcome::Done => break candidate,
                TransferOutcome::Collision => continue,
                TransferOutcome::NoEntry => {
                    return Err(fsutil::gone("rename", &element).into())
                }
            }
        };

        for entry in fsutil::read_dir(&grave, true)? {
            if entry == LOCKED_DIR {
                continue;
            }
            fsutil::unlink(&grave.join(&entry))?;
        }

        // a late locker can re-create `locked/` between our rmdirs,
        // so loop until the element directory goes away
        let mut attempts = 0u32;
        loop {
            fsutil::remove_dir(&grave.join(LOCKED_DIR))?;
            match fsutil::try_remove_dir(&grave)? {
                DirRemove::Removed | DirRemove::Missing => break,
                DirRemove::NotEmpty => {
                    attempts += 1;
                    if attempts > REMOVE_SPIN_LIMIT {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
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
            if let Some(used) = fsutil::subdir_count(&self.root.join(&bucket), self.trust_nlink)? {
                total += used as usize;
            }
        }
        Ok(total)
    }

    fn purge_impl(&mut self, opts: PurgeOptions) -> Result<()> {
        let now = fsutil::now_secs();

        // drop empty buckets, keeping the newest as insertion target
        let mut buckets: Vec<String> = fsutil::read_dir(&self.root, true)?
            .into_iter()
            .filter(|name| BUCKET_RE.is_match(name))
            .collect();
        buckets.sort_unstable();
        if let Some((_, rest)) = buckets.split_last() {
            for bucket in rest {
                let path = self.root.join(bucket);
                if let Some(0) = fsutil::subdir_count(&path, self.trust_nlink)? {
                    // losing the race against a producer is fine
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
            let mut element = self.first()?;
            while let Some(name) = element.take() {
                let marker = self.root.join(&name).join(LOCKED_DIR);
                if let Some(meta) = fsutil::lstat(&marker)? {
                    if meta.mtime() < cutoff {
                        (self.sink)(&PurgeWarning::StaleLock { name: name.clone() });
                        self.unlock_opt(&name, true)?;
                    }
                }
                element = self.next()?;
            }
        }
        Ok(())
    }
}

impl Queue for NormalQueue {
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
