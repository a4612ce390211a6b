//! The queue data model: entries, their grouping into Minimum Schedulable
//! Blocks, and the ordered contents with its movable highlight.

pub(crate) mod contents;
pub(crate) mod entry;
pub(crate) mod msb;

pub use contents::{EntryBatch, QueueContents};
pub use entry::{Entry, EntryId, EntryStatus};
pub use msb::{Msb, MsbKey};
