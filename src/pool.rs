//! Filepath: src/pool.rs
//!
//! Memory-mapped persistent pool with a transactional allocator.
//!
//! The pool is a single file mapped read/write. Its layout:
//!
//! | Region | Offset | Contents |
//! |---|---|---|
//! | Header | 0 | magic, layout version, uuid, allocator state, root oid |
//! | Undo log | 4 KiB | `{nentries, used}` + packed `{off, len, data}` entries |
//! | Heap | 4 KiB + 1 MiB | bump-allocated blocks, 16-byte headers |
//!
//! Persistent objects are named by a 16-byte [`Oid`] (pool uuid, byte
//! offset). All mutation of pool memory happens inside a [`Tx`]: callers
//! snapshot a range into the undo log before overwriting it, and the log is
//! replayed in reverse on abort. The log lives in the file itself, so a
//! process that dies mid-transaction is rolled back by the next open.
//!
//! # Flush ordering
//!
//! `snapshot` flushes the undo entry before the caller is allowed to touch
//! the tracked range; `commit` flushes every dirty range and only then
//! resets (and flushes) the log head. A crash at any point therefore lands
//! on either the pre-state (log non-empty, rolled back on open) or the
//! post-state (log empty).
//!
//! # Allocator
//!
//! First-fit over a singly-linked free list, falling back to bumping
//! `heap_top`. Blocks are not split or coalesced: leaves are uniform-size
//! and never freed, and indirect blobs reuse whole blocks. Allocator state
//! words are themselves snapshotted, so an aborted transaction reclaims its
//! allocations and un-frees its frees.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use thiserror::Error;

use crate::tracing_helpers::{debug_log, error_log, trace_log};

/// Smallest pool a caller may request.
pub const POOL_MIN_SIZE: u64 = 8 * 1024 * 1024;

/// Largest pool the substrate will attempt to map.
pub const POOL_MAX_SIZE: u64 = 1 << 44;

const POOL_MAGIC: u64 = 0x4d56_5452_4545_4c46; // "MVTREELF"
const POOL_VERSION: u32 = 1;

const HEADER_SIZE: u64 = 4096;
const UNDO_BASE: u64 = HEADER_SIZE;
const UNDO_HEADER_SIZE: u64 = 16;
const UNDO_CAPACITY: u64 = 1 << 20;
const HEAP_BASE: u64 = UNDO_BASE + UNDO_CAPACITY;

/// Per-block bookkeeping: `{size: u64, next_free: u64}` ahead of the payload.
const BLOCK_HEADER_SIZE: u64 = 16;
const ALLOC_ALIGN: u64 = 16;

// ============================================================================
//  Oid
// ============================================================================

/// A 16-byte persistent object id: (pool uuid, byte offset).
///
/// Offset 0 is the pool header and never a valid object, so the all-zero
/// value doubles as [`Oid::NULL`]. Oids are stable across reopen and are
/// safe to store inside other persistent objects.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Oid {
    pool: u64,
    off: u64,
}

impl Oid {
    /// The null object id.
    pub const NULL: Self = Self { pool: 0, off: 0 };

    pub(crate) const fn new(pool: u64, off: u64) -> Self {
        Self { pool, off }
    }

    /// Check for the null id.
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.off == 0
    }

    #[inline]
    pub(crate) const fn off(&self) -> u64 {
        self.off
    }

    #[inline]
    pub(crate) const fn pool_uuid(&self) -> u64 {
        self.pool
    }
}

// ============================================================================
//  Errors
// ============================================================================

/// Construction failures for [`Pool::open`].
#[derive(Debug, Error)]
pub enum OpenError {
    /// The path could not be opened or mapped.
    #[error("pool I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested size is below the substrate minimum.
    #[error("pool size {requested} below minimum {min}")]
    SizeTooSmall { requested: u64, min: u64 },

    /// Requested size exceeds what the substrate will map.
    #[error("pool size {requested} above maximum {max}")]
    SizeTooLarge { requested: u64, max: u64 },

    /// The file exists but is not a pool of this layout version.
    #[error("not a pool of this layout: {0}")]
    BadLayout(String),

    /// The file is a pool but its metadata is inconsistent.
    #[error("pool corrupted: {0}")]
    Corrupted(String),

    /// Initializing a fresh pool's root object failed.
    #[error("pool initialization failed: {0}")]
    Init(#[from] TxError),
}

/// Failures inside a transaction. Any of these aborts the transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum TxError {
    /// The allocator could not satisfy the request.
    #[error("pool out of space")]
    OutOfSpace,

    /// The undo log cannot hold another snapshot.
    #[error("transaction undo log full")]
    LogFull,

    /// Failure injected via [`test_hooks::set_tx_alloc_should_fail`].
    #[error("allocation failure injected")]
    AllocFailPoint,
}

// ============================================================================
//  Test hooks
// ============================================================================

/// Process-global failure injection for transactional allocation.
///
/// The out-of-space test suites flip this flag to fail every allocation
/// point: [`Tx::alloc`] itself, and every leaf store (each assign checks
/// the flag before touching its slot). That exercises the abort paths
/// without actually exhausting a pool. Ships unconditionally; production
/// code never sets it.
pub mod test_hooks {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TX_ALLOC_SHOULD_FAIL: AtomicBool = AtomicBool::new(false);

    /// Make every transactional allocation fail (or stop doing so).
    pub fn set_tx_alloc_should_fail(fail: bool) {
        TX_ALLOC_SHOULD_FAIL.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn tx_alloc_should_fail() -> bool {
        TX_ALLOC_SHOULD_FAIL.load(Ordering::SeqCst)
    }
}

// ============================================================================
//  On-media header
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
struct PoolHeader {
    magic: u64,
    version: u32,
    _reserved: u32,
    uuid: u64,
    size: u64,
    heap_top: u64,
    free_head: u64,
    root_oid: Oid,
}

/// A weak uuid: wall clock nanos mixed with a stack address, forced odd.
/// Uniqueness only needs to hold across pools a process might confuse.
fn fresh_uuid() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let stack: u64 = (&nanos as *const u64) as u64;

    (nanos ^ stack.rotate_left(32)) | 1
}

const fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

// ============================================================================
//  Pool
// ============================================================================

/// A mapped pool file.
///
/// Reads go through shared references; writes go through raw pointers and
/// are only legal inside a [`Tx`]. The pool is single-threaded by design
/// (it is not `Sync`), matching the engine's serialization contract.
pub struct Pool {
    /// Keeps the mapping alive; also used for range flushes.
    mmap: MmapMut,

    /// Base pointer of the mapping, captured once. Stable for the life of
    /// the pool because `MmapMut` never remaps.
    base: *mut u8,

    len: usize,
    path: PathBuf,
    uuid: u64,

    /// Guards against nested transactions (a programming error).
    in_tx: Cell<bool>,
}

impl Pool {
    /// Open or create a pool at `path` with the given byte size.
    ///
    /// A fresh file is formatted; an existing file is validated against the
    /// layout version and any interrupted transaction is rolled back before
    /// the pool is returned.
    ///
    /// # Errors
    ///
    /// See [`OpenError`]: path/size violations, layout mismatch, corruption.
    pub fn open(path: &Path, size: u64) -> Result<Self, OpenError> {
        if size < POOL_MIN_SIZE {
            return Err(OpenError::SizeTooSmall {
                requested: size,
                min: POOL_MIN_SIZE,
            });
        }
        if size > POOL_MAX_SIZE {
            return Err(OpenError::SizeTooLarge {
                requested: size,
                max: POOL_MAX_SIZE,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len: u64 = file.metadata()?.len();
        let fresh: bool = file_len == 0;

        if fresh {
            file.set_len(size)?;
        } else if file_len < HEAP_BASE {
            return Err(OpenError::Corrupted(
                "file shorter than the pool metadata region".into(),
            ));
        }

        // SAFETY: the file stays open for the lifetime of the mapping and
        // no other mapping of it exists in this process.
        let mut mmap: MmapMut = unsafe { MmapMut::map_mut(&file) }?;
        let base: *mut u8 = mmap.as_mut_ptr();
        let len: usize = mmap.len();

        let mut pool = Self {
            mmap,
            base,
            len,
            path: path.to_path_buf(),
            uuid: 0,
            in_tx: Cell::new(false),
        };

        if fresh {
            pool.format(size);
            debug_log!(path = %pool.path.display(), size, "formatted fresh pool");
        } else {
            pool.validate()?;
            pool.undo_rollback();
            debug_log!(path = %pool.path.display(), "recovered existing pool");
        }

        Ok(pool)
    }

    fn format(&mut self, size: u64) {
        let header = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            _reserved: 0,
            uuid: fresh_uuid(),
            size,
            heap_top: HEAP_BASE,
            free_head: 0,
            root_oid: Oid::NULL,
        };
        self.uuid = header.uuid;

        // SAFETY: PoolHeader is repr(C) with no uninitialized padding.
        let bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(
                (&header as *const PoolHeader).cast::<u8>(),
                size_of::<PoolHeader>(),
            )
        };
        self.write_raw(0, bytes);

        // Fresh file reads back as zeroes, so the undo header is already
        // empty; flush the formatted metadata in one go.
        self.flush_range(0, HEADER_SIZE + UNDO_HEADER_SIZE);
    }

    fn validate(&mut self) -> Result<(), OpenError> {
        let header: &PoolHeader = self.header();

        if header.magic != POOL_MAGIC {
            return Err(OpenError::BadLayout("bad magic".into()));
        }
        if header.version != POOL_VERSION {
            return Err(OpenError::BadLayout(format!(
                "layout version {} (supported: {POOL_VERSION})",
                header.version
            )));
        }
        if header.size as usize != self.len {
            return Err(OpenError::Corrupted(format!(
                "formatted size {} does not match file size {}",
                header.size, self.len
            )));
        }
        if header.heap_top < HEAP_BASE || header.heap_top > header.size {
            return Err(OpenError::Corrupted("heap top out of range".into()));
        }

        self.uuid = header.uuid;
        Ok(())
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// Pool file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pool uuid (the first half of every oid this pool issues).
    #[must_use]
    pub(crate) fn uuid(&self) -> u64 {
        self.uuid
    }

    /// Mapped size in bytes.
    #[must_use]
    pub(crate) fn size(&self) -> u64 {
        self.len as u64
    }

    /// The pool's default root object, or NULL before one is installed.
    #[must_use]
    pub fn root_oid(&self) -> Oid {
        self.header().root_oid
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: offset 0 holds a PoolHeader for the life of the mapping.
        unsafe { &*self.base.cast::<PoolHeader>() }
    }

    /// Raw pointer to an object's payload.
    ///
    /// # Panics
    ///
    /// Debug-panics when the oid belongs to another pool or lies outside
    /// the mapping.
    #[must_use]
    pub(crate) fn direct(&self, oid: Oid) -> *mut u8 {
        debug_assert!(!oid.is_null(), "direct: null oid");
        debug_assert_eq!(oid.pool_uuid(), self.uuid, "direct: oid from another pool");
        debug_assert!((oid.off() as usize) < self.len, "direct: oid out of range");

        // SAFETY: bounds asserted above; offset arithmetic stays inside the map.
        unsafe { self.base.add(oid.off() as usize) }
    }

    /// Borrow a byte range of the mapping.
    #[must_use]
    pub(crate) fn bytes(&self, off: u64, len: usize) -> &[u8] {
        debug_assert!(off as usize + len <= self.len, "bytes: range out of map");

        // SAFETY: bounds asserted; single-threaded access discipline means
        // no mutation overlaps a live borrow.
        unsafe { std::slice::from_raw_parts(self.base.add(off as usize), len) }
    }

    pub(crate) fn read_u32(&self, off: u64) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(off, 4));
        u32::from_le_bytes(buf)
    }

    pub(crate) fn read_u64(&self, off: u64) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(off, 8));
        u64::from_le_bytes(buf)
    }

    pub(crate) fn read_oid(&self, off: u64) -> Oid {
        Oid::new(self.read_u64(off), self.read_u64(off + 8))
    }

    /// Write bytes without undo logging.
    ///
    /// Only legal for ranges that need no rollback: freshly allocated
    /// blocks (an abort reclaims the whole allocation) and pool formatting.
    pub(crate) fn write_raw(&self, off: u64, data: &[u8]) {
        debug_assert!(
            off as usize + data.len() <= self.len,
            "write_raw: range out of map"
        );

        // SAFETY: bounds asserted; mutation goes through the raw base
        // pointer, never through a shared reference.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add(off as usize),
                data.len(),
            );
        }
    }

    fn write_u64_raw(&self, off: u64, v: u64) {
        self.write_raw(off, &v.to_le_bytes());
    }

    fn flush_range(&self, off: u64, len: u64) {
        if let Err(e) = self.mmap.flush_range(off as usize, len as usize) {
            error_log!(off, len, error = %e, "pool flush failed");
        }
    }

    /// Payload capacity of an allocated block.
    pub(crate) fn alloc_size(&self, oid: Oid) -> u64 {
        self.read_u64(oid.off() - BLOCK_HEADER_SIZE)
    }

    // ========================================================================
    //  Transactions
    // ========================================================================

    /// Begin a transaction. Aborts on drop unless committed.
    ///
    /// # Panics
    ///
    /// Debug-panics if a transaction is already open (they do not nest).
    pub fn tx(&self) -> Tx<'_> {
        debug_assert!(!self.in_tx.get(), "tx: transactions do not nest");
        self.in_tx.set(true);

        Tx {
            pool: self,
            committed: false,
            dirty: Vec::new(),
            freed: Vec::new(),
        }
    }

    /// Replay the undo log in reverse and reset it.
    ///
    /// Called on open (crash recovery) and on transaction abort. A no-op
    /// when the log is empty.
    fn undo_rollback(&self) {
        let nentries: u64 = self.read_u64(UNDO_BASE);
        if nentries == 0 {
            return;
        }

        trace_log!(nentries, "rolling back interrupted transaction");

        // Walk forward to locate every entry, then restore newest-first.
        let mut entries: Vec<(u64, u64, u64)> = Vec::with_capacity(nentries as usize);
        let mut cursor: u64 = UNDO_BASE + UNDO_HEADER_SIZE;
        for _ in 0..nentries {
            let off: u64 = self.read_u64(cursor);
            let len: u64 = self.read_u64(cursor + 8);
            entries.push((off, len, cursor + 16));
            cursor += 16 + len;
        }

        for &(off, len, data_off) in entries.iter().rev() {
            // SAFETY: undo region and target ranges never overlap (the log
            // only tracks heap and header ranges).
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.base.add(data_off as usize),
                    self.base.add(off as usize),
                    len as usize,
                );
            }
            self.flush_range(off, len);
        }

        self.write_u64_raw(UNDO_BASE, 0);
        self.write_u64_raw(UNDO_BASE + 8, 0);
        self.flush_range(UNDO_BASE, UNDO_HEADER_SIZE);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.mmap.flush() {
            error_log!(path = %self.path.display(), error = %e, "flush on close failed");
        }
    }
}

// ============================================================================
//  Tx
// ============================================================================

/// A scoped transaction over a [`Pool`].
///
/// Every mutation of pre-existing pool memory must be preceded by a
/// [`Tx::snapshot`] of the range (or go through [`Tx::write_bytes`], which
/// does both). Dropping the guard without [`Tx::commit`] replays the undo
/// log, restoring the pool to its pre-transaction state, including the
/// allocator.
pub struct Tx<'p> {
    pool: &'p Pool,
    committed: bool,

    /// Ranges to flush on commit.
    dirty: Vec<(u64, u64)>,

    /// Block offsets freed in this transaction. Quarantined from re-use so
    /// an abort restores the previous owner's bytes untouched.
    freed: Vec<u64>,
}

impl<'p> Tx<'p> {
    /// The pool this transaction runs against.
    pub(crate) fn pool(&self) -> &'p Pool {
        self.pool
    }

    /// Record the current contents of `[off, off+len)` in the undo log.
    ///
    /// The entry is flushed before this returns, so the caller may then
    /// overwrite the range in place.
    ///
    /// # Errors
    ///
    /// [`TxError::LogFull`] when the undo region cannot hold the entry.
    pub fn snapshot(&mut self, off: u64, len: u64) -> Result<(), TxError> {
        let nentries: u64 = self.pool.read_u64(UNDO_BASE);
        let used: u64 = self.pool.read_u64(UNDO_BASE + 8);
        let need: u64 = 16 + len;

        if used + need > UNDO_CAPACITY - UNDO_HEADER_SIZE {
            return Err(TxError::LogFull);
        }

        let entry: u64 = UNDO_BASE + UNDO_HEADER_SIZE + used;
        self.pool.write_u64_raw(entry, off);
        self.pool.write_u64_raw(entry + 8, len);
        // SAFETY: source (tracked range) and destination (undo region) are
        // disjoint by construction.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.pool.base.add(off as usize),
                self.pool.base.add((entry + 16) as usize),
                len as usize,
            );
        }
        self.pool.write_u64_raw(UNDO_BASE, nentries + 1);
        self.pool.write_u64_raw(UNDO_BASE + 8, used + need);
        self.pool.flush_range(UNDO_BASE, UNDO_HEADER_SIZE + used + need);

        self.dirty.push((off, len));
        Ok(())
    }

    /// Snapshot a range and overwrite it.
    pub fn write_bytes(&mut self, off: u64, data: &[u8]) -> Result<(), TxError> {
        self.snapshot(off, data.len() as u64)?;
        self.pool.write_raw(off, data);
        Ok(())
    }

    /// Snapshot and overwrite a single u64.
    pub fn write_u64(&mut self, off: u64, v: u64) -> Result<(), TxError> {
        self.write_bytes(off, &v.to_le_bytes())
    }

    /// Snapshot and overwrite an oid.
    pub fn write_oid(&mut self, off: u64, oid: Oid) -> Result<(), TxError> {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&oid.pool_uuid().to_le_bytes());
        buf[8..].copy_from_slice(&oid.off().to_le_bytes());
        self.write_bytes(off, &buf)
    }

    /// Install the pool's default root object.
    pub fn set_root_oid(&mut self, oid: Oid) -> Result<(), TxError> {
        self.write_oid(offset_of!(PoolHeader, root_oid) as u64, oid)
    }

    /// Allocate a block with at least `size` payload bytes.
    ///
    /// The payload of a fresh allocation needs no snapshots: aborting the
    /// transaction reclaims the whole block.
    ///
    /// # Errors
    ///
    /// [`TxError::OutOfSpace`] when neither the free list nor the heap can
    /// satisfy the request; [`TxError::AllocFailPoint`] under injection.
    pub fn alloc(&mut self, size: u64) -> Result<Oid, TxError> {
        if test_hooks::tx_alloc_should_fail() {
            return Err(TxError::AllocFailPoint);
        }

        let want: u64 = align_up(size.max(8), ALLOC_ALIGN);
        let free_head_off: u64 = offset_of!(PoolHeader, free_head) as u64;

        // First fit over the free list.
        let mut prev: Option<u64> = None;
        let mut cur: u64 = self.pool.header().free_head;
        while cur != 0 {
            let block_size: u64 = self.pool.read_u64(cur);
            let next: u64 = self.pool.read_u64(cur + 8);

            if block_size >= want && !self.freed.contains(&cur) {
                match prev {
                    None => self.write_u64(free_head_off, next)?,
                    Some(p) => self.write_u64(p + 8, next)?,
                }
                self.write_u64(cur + 8, 0)?;
                self.dirty.push((cur + BLOCK_HEADER_SIZE, block_size));

                trace_log!(off = cur, size = block_size, "alloc: reused free block");
                return Ok(Oid::new(self.pool.uuid(), cur + BLOCK_HEADER_SIZE));
            }

            prev = Some(cur);
            cur = next;
        }

        // Bump the heap.
        let top: u64 = self.pool.header().heap_top;
        let total: u64 = BLOCK_HEADER_SIZE + want;
        if top + total > self.pool.header().size {
            return Err(TxError::OutOfSpace);
        }

        self.write_u64(offset_of!(PoolHeader, heap_top) as u64, top + total)?;
        self.pool.write_u64_raw(top, want);
        self.pool.write_u64_raw(top + 8, 0);
        self.dirty.push((top, total));

        trace_log!(off = top, size = want, "alloc: bumped heap");
        Ok(Oid::new(self.pool.uuid(), top + BLOCK_HEADER_SIZE))
    }

    /// Return a block to the free list. A no-op for NULL.
    ///
    /// The block's bytes are left untouched; it is only re-issued by a
    /// later transaction (never this one), so an abort restores it intact.
    pub fn free(&mut self, oid: Oid) -> Result<(), TxError> {
        if oid.is_null() {
            return Ok(());
        }

        let block: u64 = oid.off() - BLOCK_HEADER_SIZE;
        let free_head_off: u64 = offset_of!(PoolHeader, free_head) as u64;
        let head: u64 = self.pool.header().free_head;

        self.write_u64(block + 8, head)?;
        self.write_u64(free_head_off, block)?;
        self.freed.push(block);

        trace_log!(off = block, "freed block");
        Ok(())
    }

    /// Make the transaction durable.
    ///
    /// Flushes every dirty range, then resets the undo log. After this
    /// returns, a crash can no longer undo the transaction.
    pub fn commit(mut self) {
        for &(off, len) in &self.dirty {
            self.pool.flush_range(off, len);
        }

        self.pool.write_u64_raw(UNDO_BASE, 0);
        self.pool.write_u64_raw(UNDO_BASE + 8, 0);
        self.pool.flush_range(UNDO_BASE, UNDO_HEADER_SIZE);

        self.committed = true;
        self.pool.in_tx.set(false);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.undo_rollback();
            self.pool.in_tx.set(false);
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
