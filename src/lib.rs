//! # mvtree
//!
//! A persistent, crash-consistent ordered key/value engine backed by a
//! single memory-mapped pool file.
//!
//! The tree has a dual representation:
//! - *Leaves* live in the pool and are the durable authority. Each leaf
//!   holds a fixed number of unordered slots plus a `next` link forming a
//!   singly-linked recovery list.
//! - *Inner nodes* live in volatile memory and exist purely to route
//!   lookups. They are rebuilt from the leaf list on every open, which
//!   removes a whole class of recovery bugs: only the leaf level and one
//!   root pointer ever need to be crash-consistent.
//!
//! Mutations run inside pool transactions with an on-media undo log, so a
//! `put` or `remove` either commits in full or leaves no trace, even when
//! the process dies mid-operation.
//!
//! ## Design
//!
//! Keys and values are arbitrary byte strings. Short keys and values are
//! stored inline in the leaf slot; oversized ones move to a separately
//! allocated indirect blob. Emptied leaves are never freed: after the next
//! reopen they park in a free-leaf pool and satisfy later inserts without
//! a fresh allocation, which keeps `put` making progress even when the
//! pool itself is out of growth room.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mvtree::{MvTree, Status};
//!
//! let mut kv = MvTree::open("/dev/shm/example.pool", mvtree::POOL_MIN_SIZE)?;
//! assert_eq!(kv.put(b"key1", b"value1"), Status::Ok);
//!
//! let mut out = Vec::new();
//! assert_eq!(kv.get(b"key1", &mut out), Status::Ok);
//! assert_eq!(out, b"value1");
//! # Ok::<(), mvtree::OpenError>(())
//! ```

pub mod internode;
pub mod leaf;
pub mod permuter;
pub mod pool;
pub mod tree;

mod tracing_helpers;

pub use internode::INNER_KEYS;
pub use leaf::{KEY_INLINE_LEN, LEAF_KEYS, MAX_KEY_LEN, MAX_VALUE_LEN, VALUE_INLINE_LEN};
pub use pool::{Oid, OpenError, POOL_MAX_SIZE, POOL_MIN_SIZE};
pub use tree::{MvTree, MvTreeAnalysis, Status};
