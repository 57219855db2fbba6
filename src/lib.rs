//! Braid materializes denormalized tree-shaped records from normalized
//! change streams.
//!
//! A deployment declares one or more *relation trees*: a root entity and a
//! hierarchy of child entities joined by declared key fields, equivalent to
//! a LEFT OUTER JOIN at every parent→child edge:
//!
//! ```sql
//! SELECT ... FROM media LEFT OUTER JOIN caption ON media.id = caption.media_id
//! ```
//!
//! Braid consumes the change streams of all involved entities, maintains a
//! pair of reversible foreign-key indices per tree edge in an embedded
//! key-value store, and emits, per root primary key, the current
//! denormalized record to the root's output stream. The record key of each
//! input stream is the primary key; a record with a null value is a
//! tombstone.
//!
//! # How a change flows through
//!
//! Input streams are interleaved into a single global order by the
//! [`merge::Scheduler`], which respects upstream transaction boundaries
//! carried on a synthetic `transactions` stream. Each record is absorbed by
//! the [`engine::Engine`]: the join index of the record's entity is
//! updated, and the parent indices translate the change into the set of
//! root primary keys whose output is now stale (the *pending set*). When a
//! flush is allowed — never inside an upstream transaction — pending roots
//! are recomputed: their parent-index filings are scrubbed, the tree is
//! rebuilt from the current input records via the join indices, and the
//! result is written to the output stream, children ordered by primary key
//! so emits are deterministic.
//!
//! Indices and pending sets live in the state store and flush through a
//! single write barrier; together with the input streams' committed
//! positions they form the checkpoint a restarted engine resumes from.

pub mod bytes;
pub mod config;
pub mod engine;
pub mod index;
pub mod merge;
pub mod metrics;
pub mod record;
pub mod relation;
pub mod state;
pub mod topic;

pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::record::DenormalizedRecord;
pub use crate::relation::{load_relations, Relation};

use slog::{o, Drain};

/// A terminal logger for binaries and tests.
pub fn terminal_logger(verbose: bool) -> slog::Logger {
    use std::sync::Mutex;
    let level = if verbose {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };
    let drain = Mutex::new(slog_term::term_full()).fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, o!())
}
