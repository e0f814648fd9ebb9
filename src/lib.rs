//! dirqueue - Filesystem Directory Queue
//!
//! A persistent multi-producer, multi-consumer queue that uses a POSIX
//! filesystem as its sole storage and coordination substrate. Any
//! number of uncoordinated processes, possibly on different hosts
//! sharing a filesystem, can produce and consume concurrently; the
//! protocol is built entirely from atomic filesystem primitives
//! (`mkdir`, `rename`, `link`, `rmdir`).
//!
//! # Features
//!
//! - **No server**: the directory tree is the queue. Anything that can
//!   reach the filesystem can participate.
//!
//! - **Best-effort FIFO**: element names embed a high-resolution
//!   timestamp, so lexical iteration order approximates insertion
//!   order.
//!
//! - **Crash-tolerant**: partially built and partially destroyed
//!   elements live in staging directories invisible to iteration, and
//!   a purge routine reaps whatever crashed participants leave behind.
//!
//! - **Typed payloads**: a per-queue schema of `binary`, `string` and
//!   `table` fields, or a schema-less single-payload variant.
//!
//! # Architecture
//!
//! ```text
//!  producer                                    consumer
//!     │                                           │
//!     │ mkdir + write                             │ first/next
//!     ▼                                           ▼
//! ┌───────────┐   rename    ┌───────────┐   lock (mkdir locked/)
//! │ temporary/│ ──────────▶ │ NNNNNNNN/ │ ◀─────────────────────
//! └───────────┘   atomic    │  buckets  │
//!                           └─────┬─────┘
//!                                 │ rename after get
//!                                 ▼
//!                           ┌───────────┐
//!                           │ obsolete/ │ ──▶ unlink + rmdir
//!                           └───────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dirqueue::{FieldMap, FieldValue, NormalQueue, Queue, Schema};
//!
//! # fn main() -> dirqueue::Result<()> {
//! let schema = Schema::parse([("body", "string"), ("header", "table?")])?;
//! let mut queue = NormalQueue::builder("/var/spool/work")
//!     .schema(schema)
//!     .open()?;
//!
//! // produce
//! let mut fields = FieldMap::new();
//! fields.insert("body".into(), FieldValue::string("hello".to_string()));
//! queue.add(&fields)?;
//!
//! // consume
//! let mut element = queue.first()?;
//! while let Some(name) = element.take() {
//!     if queue.lock(&name)? {
//!         let fields = queue.get(&name)?;
//!         println!("{:?}", fields["body"]);
//!         queue.remove(&name)?;
//!     }
//!     element = queue.next()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fsutil;
pub mod name;
pub mod queue;
pub mod schema;

pub use error::{FsError, QueueError, Result, SchemaError};
pub use queue::normal::{NormalQueue, NormalQueueBuilder};
pub use queue::set::QueueSet;
pub use queue::simple::{SimpleQueue, SimpleQueueBuilder};
pub use queue::{PurgeOptions, PurgeWarning, Queue, QueueId, WarningSink, DEFAULT_MAXELTS};
pub use schema::{FieldKind, FieldMap, FieldSpec, FieldValue, Schema};
