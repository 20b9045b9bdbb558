//! Filepath: src/tree.rs
//!
//! `MvTree`: the engine coordinator.
//!
//! This module owns the pool, the durable list head ([`MvRoot`]), the
//! volatile inner structure, and the free-leaf pool. It implements the
//! public surface (`open`/`open_with_root`, `get`, `put`, `remove`,
//! `analyze`, `root_oid`) plus the two pieces of hard machinery:
//!
//! - **Recovery**: on open the persistent leaf list is walked once, a
//!   handle (with its sorted permutation) is built per leaf, and the inner
//!   structure is packed bottom-up over the non-empty leaves ordered by
//!   minimum key. Empty leaves park in the free-leaf pool instead of
//!   attaching. A half-built tree never escapes: any failure drops the
//!   pool inside `open`.
//! - **Split propagation**: a full leaf splits inside the same transaction
//!   as the insert, popping a (separator, right sibling) pair that inner
//!   nodes absorb or re-split; height grows only at the root.
//!
//! Durable and volatile mutation are strictly ordered inside `put`: every
//! fallible (allocating) step happens before any volatile restructuring,
//! so an aborted transaction leaves the inner structure untouched too.

use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

use crate::internode::{Child, InnerNode, INNER_CHILDREN};
use crate::leaf::{migrate_slot, AssignResult, LeafHandle, SPLIT_KEEP};
use crate::leaf::{LEAF_KEYS, LEAF_SIZE, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::permuter::Permuter;
use crate::pool::{Oid, OpenError, Pool, Tx, TxError};
use crate::tracing_helpers::{debug_log, trace_log};

// ============================================================================
//  Status
// ============================================================================

/// Three-way operation result.
///
/// `Remove` of an absent key is `Ok` by contract: callers treat removal as
/// set-difference, not query-and-delete.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The operation committed (or was a defined no-op).
    Ok,

    /// `get` of an absent key; the output buffer is untouched.
    NotFound,

    /// `put` aborted its transaction; durable state equals the pre-call
    /// state.
    Failed,
}

// ============================================================================
//  Analysis
// ============================================================================

/// Leaf census filled by [`MvTree::analyze`].
#[derive(Clone, Debug, Default)]
pub struct MvTreeAnalysis {
    /// Pool file path.
    pub path: PathBuf,

    /// Leaves with zero occupied slots (attached or pooled).
    pub leaf_empty: u64,

    /// Leaves currently parked in the free-leaf pool.
    pub leaf_prealloc: u64,

    /// Length of the durable leaf list.
    pub leaf_total: u64,

    /// Volatile inner nodes currently routing.
    pub inner_total: u64,
}

// ============================================================================
//  MvRoot
// ============================================================================

/// The durable head of the leaf list.
#[repr(C)]
struct MvRoot {
    leaf_head: Oid,
}

fn leaf_head(pool: &Pool, root: Oid) -> Oid {
    pool.read_oid(root.off() + offset_of!(MvRoot, leaf_head) as u64)
}

fn set_leaf_head(tx: &mut Tx<'_>, root: Oid, head: Oid) -> Result<(), TxError> {
    tx.write_oid(root.off() + offset_of!(MvRoot, leaf_head) as u64, head)
}

/// Allocate a fresh MvRoot with a NULL head inside `tx`.
fn alloc_mvroot(pool: &Pool, tx: &mut Tx<'_>) -> Result<Oid, TxError> {
    let oid: Oid = tx.alloc(size_of::<MvRoot>() as u64)?;
    pool.write_raw(oid.off(), &[0u8; size_of::<MvRoot>()]);
    Ok(oid)
}

// ============================================================================
//  RootNode
// ============================================================================

/// The root of the volatile structure.
///
/// A single-leaf tree routes nothing; taller trees root at an inner node.
enum RootNode {
    Leaf(LeafHandle),
    Inner(Box<InnerNode>),
}

impl RootNode {
    fn into_child(self) -> Child {
        match self {
            Self::Leaf(h) => Child::Leaf(h),
            Self::Inner(n) => Child::Inner(n),
        }
    }
}

/// Walk from the root to the leaf responsible for `key`.
fn locate_leaf<'t>(root: &'t RootNode, key: &[u8]) -> &'t LeafHandle {
    match root {
        RootNode::Leaf(h) => h,
        RootNode::Inner(n) => {
            let mut inner: &InnerNode = n;
            loop {
                match inner.child(inner.locate(key)) {
                    Child::Leaf(h) => return h,
                    Child::Inner(m) => inner = m,
                }
            }
        }
    }
}

// ============================================================================
//  MvTree
// ============================================================================

/// A persistent ordered key/value tree over one pool file.
///
/// Single-threaded per instance: reads take `&self`, mutations `&mut self`.
/// Instances on distinct pools are independent.
pub struct MvTree {
    pool: Pool,

    /// The MvRoot object this instance hangs off (pool default or
    /// caller-supplied).
    root_oid: Oid,

    /// Volatile routing structure; `None` when no leaf is attached.
    root: Option<RootNode>,

    /// Empty leaves detached at open, reusable without allocation.
    free_leaves: Vec<LeafHandle>,
}

impl MvTree {
    /// Open or create a pool and recover the tree from its default root
    /// object (installed on first open).
    ///
    /// # Errors
    ///
    /// Path/size/layout violations surface as [`OpenError`]; no pool stays
    /// mapped on failure.
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self, OpenError> {
        let pool = Pool::open(path.as_ref(), size)?;

        let root_oid: Oid = if pool.root_oid().is_null() {
            let mut tx = pool.tx();
            let oid = alloc_mvroot(&pool, &mut tx)?;
            tx.set_root_oid(oid)?;
            tx.commit();
            oid
        } else {
            pool.root_oid()
        };

        Self::build(pool, root_oid)
    }

    /// Open or create a pool using a caller-held root object.
    ///
    /// Passing [`Oid::NULL`] allocates a fresh root object; retrieve it
    /// with [`MvTree::root_oid`] and pass it back on the next open. The
    /// pool's default root is neither consulted nor installed.
    ///
    /// # Errors
    ///
    /// As [`MvTree::open`], plus a corruption error when the oid belongs to
    /// a different pool.
    pub fn open_with_root(
        path: impl AsRef<Path>,
        root_oid: Oid,
        size: u64,
    ) -> Result<Self, OpenError> {
        let pool = Pool::open(path.as_ref(), size)?;

        let root_oid: Oid = if root_oid.is_null() {
            let mut tx = pool.tx();
            let oid = alloc_mvroot(&pool, &mut tx)?;
            tx.commit();
            oid
        } else {
            if root_oid.pool_uuid() != pool.uuid() {
                return Err(OpenError::Corrupted(
                    "root oid belongs to a different pool".into(),
                ));
            }
            root_oid
        };

        Self::build(pool, root_oid)
    }

    /// Recover the volatile structure from the persistent leaf list.
    fn build(pool: Pool, root_oid: Oid) -> Result<Self, OpenError> {
        // A healthy list cannot hold more leaves than the pool has room for;
        // anything longer means a corrupted (cyclic) next chain.
        let max_leaves: u64 = pool.size() / LEAF_SIZE as u64;

        let mut attached: Vec<LeafHandle> = Vec::new();
        let mut free_leaves: Vec<LeafHandle> = Vec::new();

        let mut cur: Oid = leaf_head(&pool, root_oid);
        let mut total: u64 = 0;
        while !cur.is_null() {
            total += 1;
            if total > max_leaves {
                return Err(OpenError::Corrupted("leaf list does not terminate".into()));
            }

            let mut handle = LeafHandle::open(&pool, cur);
            cur = handle.next();
            handle.sort(&pool);

            if handle.is_empty() {
                free_leaves.push(handle);
            } else {
                attached.push(handle);
            }
        }

        attached.sort_by(|a, b| a.min_key(&pool).cmp(b.min_key(&pool)));
        let root: Option<RootNode> = build_inner(&pool, attached);

        debug_log!(
            path = %pool.path().display(),
            leaves = total,
            prealloc = free_leaves.len(),
            "recovered tree"
        );

        Ok(Self {
            pool,
            root_oid,
            root,
            free_leaves,
        })
    }

    // ========================================================================
    //  Public surface
    // ========================================================================

    /// Pool file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    /// The oid of this tree's root object, suitable for
    /// [`MvTree::open_with_root`].
    #[must_use]
    pub fn root_oid(&self) -> Oid {
        self.root_oid
    }

    /// Look up `key`, **appending** the value to `out` on a hit.
    ///
    /// Appending (not assigning) is part of the contract: callers may
    /// pre-seed the buffer. On [`Status::NotFound`] the buffer is
    /// untouched. Performs no pool allocation and no transaction.
    pub fn get(&self, key: &[u8], out: &mut Vec<u8>) -> Status {
        let Some(root) = self.root.as_ref() else {
            return Status::NotFound;
        };

        let leaf: &LeafHandle = locate_leaf(root, key);
        match leaf.find(&self.pool, key) {
            Some(i) => {
                leaf.append_value(&self.pool, i, out);
                Status::Ok
            }
            None => Status::NotFound,
        }
    }

    /// Store `key -> value`.
    ///
    /// Returns [`Status::Failed`] when any allocation the operation needs
    /// cannot be satisfied (or when a length exceeds the on-media u16
    /// bound); the transaction aborts and durable state is exactly the
    /// pre-call state. Every store is an allocation point, so injected
    /// allocator failure fails every put, not just the growing ones.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Status {
        if key.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
            return Status::Failed;
        }

        match self.put_txn(key, value) {
            Ok(()) => Status::Ok,
            Err(e) => {
                debug_log!(error = %e, "put aborted");
                Status::Failed
            }
        }
    }

    fn put_txn(&mut self, key: &[u8], value: &[u8]) -> Result<(), TxError> {
        let Self {
            ref pool,
            ref mut root,
            ref mut free_leaves,
            root_oid,
        } = *self;

        let mut tx = pool.tx();

        // Empty tree: attach a prealloc leaf, or allocate the very first
        // leaf and install it as the list head.
        let Some(root_node) = root.as_mut() else {
            let (handle, reused) = match free_leaves.pop() {
                Some(h) => (h, true),
                None => {
                    let h = LeafHandle::alloc(pool, &mut tx)?;
                    set_leaf_head(&mut tx, root_oid, h.oid())?;
                    (h, false)
                }
            };

            match handle.assign(pool, &mut tx, key, value) {
                Ok(result) => {
                    debug_assert_eq!(result, AssignResult::Assigned, "empty leaf has room");
                }
                Err(e) => {
                    if reused {
                        free_leaves.push(handle);
                    }
                    return Err(e);
                }
            }

            tx.commit();
            *root = Some(RootNode::Leaf(handle));
            return Ok(());
        };

        let popup: Option<(Box<[u8]>, Child)> = match root_node {
            RootNode::Leaf(h) => put_leaf(pool, &mut tx, free_leaves, h, key, value)?
                .map(|(sep, right)| (sep, Child::Leaf(right))),
            RootNode::Inner(n) => put_recursive(pool, &mut tx, free_leaves, n, key, value)?,
        };

        // All fallible work is done; make it durable, then restructure.
        tx.commit();

        if let Some((sep, right)) = popup {
            let old: RootNode = match root.take() {
                Some(r) => r,
                None => unreachable!("split popup from an empty tree"),
            };
            *root = Some(RootNode::Inner(InnerNode::from_split(
                old.into_child(),
                sep,
                right,
            )));
            trace_log!("root split; tree grew by one level");
        }

        Ok(())
    }

    /// Remove `key`. Idempotent: [`Status::Ok`] whether or not the key was
    /// present. A fully emptied leaf stays linked and attached (it is
    /// recycled by the next insert into its range, or pooled at the next
    /// open).
    pub fn remove(&mut self, key: &[u8]) -> Status {
        if key.len() > MAX_KEY_LEN {
            return Status::Ok; // cannot be stored, so cannot be present
        }

        let Some(root) = self.root.as_ref() else {
            return Status::Ok;
        };

        let leaf: &LeafHandle = locate_leaf(root, key);
        let mut tx = self.pool.tx();
        match leaf.erase(&self.pool, &mut tx, key) {
            Ok(_found) => {
                tx.commit();
                Status::Ok
            }
            Err(e) => {
                debug_log!(error = %e, "remove aborted");
                Status::Failed
            }
        }
    }

    /// Walk the persistent leaf list once and fill `analysis`.
    ///
    /// Deterministic and allocation-free on the pool side.
    pub fn analyze(&self, analysis: &mut MvTreeAnalysis) {
        analysis.path = self.pool.path().to_path_buf();
        analysis.leaf_total = 0;
        analysis.leaf_empty = 0;

        let mut cur: Oid = leaf_head(&self.pool, self.root_oid);
        while !cur.is_null() {
            let handle = LeafHandle::open(&self.pool, cur);
            analysis.leaf_total += 1;
            if handle.is_empty() {
                analysis.leaf_empty += 1;
            }
            cur = handle.next();
        }

        analysis.leaf_prealloc = self.free_leaves.len() as u64;
        analysis.inner_total = match self.root.as_ref() {
            Some(RootNode::Inner(n)) => n.count_inner(),
            _ => 0,
        };
    }
}

// ============================================================================
//  Recovery packing
// ============================================================================

/// Pack non-empty leaves (ascending by minimum key) into a balanced inner
/// structure, layer by layer. Separators are the group-internal minimum
/// keys; each group's own minimum propagates upward.
fn build_inner(pool: &Pool, leaves: Vec<LeafHandle>) -> Option<RootNode> {
    if leaves.is_empty() {
        return None;
    }

    let mut level: Vec<(Vec<u8>, Child)> = leaves
        .into_iter()
        .map(|h| {
            let min: Vec<u8> = h.min_key(pool).to_vec();
            (min, Child::Leaf(h))
        })
        .collect();

    while level.len() > 1 {
        let groups: usize = level.len().div_ceil(INNER_CHILDREN);
        let base: usize = level.len() / groups;
        let extra: usize = level.len() % groups;

        let mut next: Vec<(Vec<u8>, Child)> = Vec::with_capacity(groups);
        let mut iter = level.into_iter();

        for g in 0..groups {
            let take: usize = base + usize::from(g < extra);
            let mut children: Vec<Child> = Vec::with_capacity(take);
            let mut keys: Vec<Box<[u8]>> = Vec::with_capacity(take.saturating_sub(1));
            let mut group_min: Vec<u8> = Vec::new();

            for j in 0..take {
                let Some((min, child)) = iter.next() else {
                    unreachable!("group sizing covered every child")
                };
                if j == 0 {
                    group_min = min;
                } else {
                    keys.push(min.into_boxed_slice());
                }
                children.push(child);
            }

            next.push((group_min, Child::Inner(InnerNode::new(children, keys))));
        }

        level = next;
    }

    level.into_iter().next().map(|(_, child)| match child {
        Child::Leaf(h) => RootNode::Leaf(h),
        Child::Inner(n) => RootNode::Inner(n),
    })
}

// ============================================================================
//  Put descent
// ============================================================================

/// Descend one inner level; absorb or propagate the popup.
fn put_recursive(
    pool: &Pool,
    tx: &mut Tx<'_>,
    free_leaves: &mut Vec<LeafHandle>,
    node: &mut InnerNode,
    key: &[u8],
    value: &[u8],
) -> Result<Option<(Box<[u8]>, Child)>, TxError> {
    let at: usize = node.locate(key);

    let popup: Option<(Box<[u8]>, Child)> = match node.child_mut(at) {
        Child::Leaf(h) => put_leaf(pool, tx, free_leaves, h, key, value)?
            .map(|(sep, right)| (sep, Child::Leaf(right))),
        Child::Inner(m) => put_recursive(pool, tx, free_leaves, m, key, value)?,
    };

    Ok(popup.and_then(|(sep, child)| {
        node.insert_split(at, sep, child)
            .map(|(median, right)| (median, Child::Inner(right)))
    }))
}

/// Assign into a leaf, splitting it when full.
///
/// The sibling is a recycled prealloc leaf when one is available (already
/// linked somewhere in the recovery list, so its list position is kept);
/// otherwise a fresh leaf linked immediately after the split origin. On
/// any failure the popped prealloc handle is restored to the pool, so an
/// aborted put has no volatile footprint either.
fn put_leaf(
    pool: &Pool,
    tx: &mut Tx<'_>,
    free_leaves: &mut Vec<LeafHandle>,
    leaf: &mut LeafHandle,
    key: &[u8],
    value: &[u8],
) -> Result<Option<(Box<[u8]>, LeafHandle)>, TxError> {
    match leaf.assign(pool, tx, key, value)? {
        AssignResult::Assigned => return Ok(None),
        AssignResult::NoRoom => {}
    }

    let perm = leaf.sort(pool);
    let sep: Box<[u8]> = leaf.key_bytes(pool, perm.get(SPLIT_KEEP)).into();

    let (right, reused) = match free_leaves.pop() {
        Some(h) => (h, true),
        None => {
            let h = LeafHandle::alloc(pool, tx)?;
            h.set_next_raw(pool, leaf.next());
            leaf.set_next(tx, h.oid())?;
            (h, false)
        }
    };

    match split_into(pool, tx, leaf, &perm, &right, &sep, key, value) {
        Ok(()) => {
            trace_log!(
                left = leaf.oid().off(),
                right = right.oid().off(),
                reused,
                "leaf split"
            );
            Ok(Some((sep, right)))
        }
        Err(e) => {
            if reused {
                free_leaves.push(right);
            }
            Err(e)
        }
    }
}

/// Move the upper slots into the sibling and place the new pair.
#[expect(clippy::too_many_arguments, reason = "split state is genuinely wide")]
fn split_into(
    pool: &Pool,
    tx: &mut Tx<'_>,
    left: &LeafHandle,
    perm: &Permuter<LEAF_KEYS>,
    right: &LeafHandle,
    sep: &[u8],
    key: &[u8],
    value: &[u8],
) -> Result<(), TxError> {
    for (dst, pos) in (SPLIT_KEEP..LEAF_KEYS).enumerate() {
        migrate_slot(tx, left, perm.get(pos), right, dst)?;
    }

    let target: &LeafHandle = if key < sep { left } else { right };
    match target.assign(pool, tx, key, value)? {
        AssignResult::Assigned => Ok(()),
        AssignResult::NoRoom => unreachable!("a freshly split leaf has empty slots"),
    }
}

// ============================================================================
//  Tests
// ============================================================================
