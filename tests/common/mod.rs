//! Common test utilities.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     let mut t = common::TestKv::new();
//!     assert_eq!(t.kv().put(b"k", b"v"), Status::Ok);
//!     t.reopen();
//! }
//! ```
//!
//! Set `RUST_LOG` (with the crate's `tracing` feature enabled) to watch
//! recovery and split activity while a test runs.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use mvtree::{MvTree, MvTreeAnalysis, Oid, Status, POOL_MIN_SIZE};
use tempfile::TempDir;

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber from `RUST_LOG`.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Pool size used by the functional suites.
pub const TEST_POOL_SIZE: u64 = POOL_MIN_SIZE;

/// A tree over a throwaway pool file, with reopen support.
///
/// Mirrors the shape of the operational suites: one pool per test, torn
/// down with the temp directory.
pub struct TestKv {
    _dir: TempDir,
    path: PathBuf,
    size: u64,
    kv: Option<MvTree>,
}

impl TestKv {
    pub fn new() -> Self {
        Self::with_size(TEST_POOL_SIZE)
    }

    pub fn with_size(size: u64) -> Self {
        init_tracing();

        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("mvtree.pool");
        let kv = MvTree::open(&path, size).expect("open pool");

        Self {
            _dir: dir,
            path,
            size,
            kv: Some(kv),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn kv(&mut self) -> &mut MvTree {
        self.kv.as_mut().expect("tree is open")
    }

    pub fn kv_ref(&self) -> &MvTree {
        self.kv.as_ref().expect("tree is open")
    }

    /// Close and recover the tree from the same pool file.
    pub fn reopen(&mut self) {
        self.kv = None; // drop first: one mapping at a time
        self.kv = Some(MvTree::open(&self.path, self.size).expect("reopen pool"));
    }

    /// Close and recover using the caller-held root object form.
    pub fn reopen_with_root(&mut self, root: Oid) {
        self.kv = None;
        self.kv = Some(MvTree::open_with_root(&self.path, root, self.size).expect("reopen pool"));
    }

    /// Run `analyze` and assert the reported path.
    pub fn analyze(&self) -> MvTreeAnalysis {
        let mut analysis = MvTreeAnalysis::default();
        self.kv_ref().analyze(&mut analysis);
        assert_eq!(&analysis.path, self.path());
        analysis
    }

    /// Assert the full leaf census in one call.
    #[track_caller]
    pub fn assert_leaves(&self, empty: u64, prealloc: u64, total: u64) {
        let analysis = self.analyze();
        assert_eq!(analysis.leaf_empty, empty, "leaf_empty");
        assert_eq!(analysis.leaf_prealloc, prealloc, "leaf_prealloc");
        assert_eq!(analysis.leaf_total, total, "leaf_total");
    }

    /// `get` returning the value as an owned vec.
    #[track_caller]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        match self.kv_ref().get(key, &mut out) {
            Status::Ok => Some(out),
            Status::NotFound => None,
            Status::Failed => panic!("get returned Failed"),
        }
    }

    /// `put` that must succeed.
    #[track_caller]
    pub fn put_ok(&mut self, key: &[u8], value: &[u8]) {
        assert_eq!(self.kv().put(key, value), Status::Ok, "put {key:?}");
    }

    /// `get` that must hit and match.
    #[track_caller]
    pub fn assert_get(&self, key: &[u8], value: &[u8]) {
        match self.get(key) {
            Some(v) => assert_eq!(v, value, "value mismatch for {key:?}"),
            None => panic!("key {key:?} not found"),
        }
    }

    /// `get` that must miss.
    #[track_caller]
    pub fn assert_absent(&self, key: &[u8]) {
        assert_eq!(self.get(key), None, "key {key:?} unexpectedly present");
    }
}
