//! Fixed-size memory blocks and the global free-block pool.
//!
//! All heap memory is divided into `BLOCK_BYTES`-sized, `BLOCK_BYTES`-
//! aligned blocks carved out of larger mapped chunks. Each block starts
//! with a [`BlockHeader`], so any object address locates its block with
//! a single mask — the same trick the BiBOP layout uses for pages.
//!
//! A block is owned by exactly one of: the free pool, a step's block
//! list, or one workspace slot (scan, todo, staged, or scavd). Ownership
//! moves only by transferring the [`BlockRef`] handle; the header's
//! cursor fields are touched only by the current owner. The one
//! cross-thread field is the flag word, which carries the atomic
//! large-object evacuated bit.
//!
//! Large objects occupy a *group*: a contiguous, block-aligned run of
//! blocks with a single header at the base.

use std::cell::Cell;
use std::process;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use block_alloc::Chunk;
use parking_lot::Mutex;

use crate::object::{InfoWord, Word, WORD_BYTES};

/// Size of one block in bytes. Also its alignment.
pub const BLOCK_BYTES: usize = 4096;
/// Mask extracting a block base address from an object address.
pub const BLOCK_MASK: usize = !(BLOCK_BYTES - 1);
/// Size of one block in words.
pub const BLOCK_WORDS: usize = BLOCK_BYTES / WORD_BYTES;
/// Blocks carved per mapped chunk (1 MiB chunks).
const CHUNK_BLOCKS: usize = 256;

/// Magic number identifying a collector block ("SCOR").
pub const MAGIC_BLOCK: u32 = 0x5343_4F52;

/// Block flag: this block heads a large-object group.
pub const BF_LARGE: u16 = 0b001;
/// Block flag: this block is to-space of the collection in progress.
/// On a large-object group it doubles as the "reached this collection"
/// claim; objects in flagged blocks are never copied again.
pub const BF_EVACUATED: u16 = 0b010;
/// Block flag: the block is in the free pool.
pub const BF_FREE: u16 = 0b100;

/// Metadata at the base of every block (or block group).
#[repr(C)]
pub struct BlockHeader {
    magic: u32,
    gen_no: Cell<u8>,
    step_no: Cell<u8>,
    flags: AtomicU16,
    /// Word offset of the next free word, from the block base.
    free: Cell<u32>,
    /// Word offset of the scan cursor, from the block base.
    scan: Cell<u32>,
    /// Number of blocks in this group; 1 for an ordinary block.
    blocks: Cell<u32>,
}

/// Words taken up by the header at the base of each block.
pub const BLOCK_HDR_WORDS: usize =
    (std::mem::size_of::<BlockHeader>() + WORD_BYTES - 1) / WORD_BYTES;

/// A handle to one block (or block group). Plain-old-data; cheap to
/// copy. Transferring the handle transfers ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef(NonNull<BlockHeader>);

// SAFETY: the handle is an address. Single ownership of the cursor
// fields is the collector's discipline; the flag word is atomic.
unsafe impl Send for BlockRef {}
// SAFETY: see Send.
unsafe impl Sync for BlockRef {}

impl BlockRef {
    /// Initializes a header at `base` and returns the handle.
    ///
    /// # Safety
    ///
    /// `base` must be the start of `blocks * BLOCK_BYTES` bytes of
    /// writable, `BLOCK_BYTES`-aligned memory owned by the caller.
    unsafe fn init(base: *mut u8, blocks: u32, flags: u16) -> Self {
        debug_assert_eq!(base as usize & !BLOCK_MASK, 0);
        let hdr = base.cast::<BlockHeader>();
        // SAFETY: per the caller's contract the memory is ours.
        unsafe {
            hdr.write(BlockHeader {
                magic: MAGIC_BLOCK,
                gen_no: Cell::new(0),
                step_no: Cell::new(0),
                flags: AtomicU16::new(flags),
                free: Cell::new(BLOCK_HDR_WORDS as u32),
                scan: Cell::new(BLOCK_HDR_WORDS as u32),
                blocks: Cell::new(blocks),
            });
            Self(NonNull::new_unchecked(hdr))
        }
    }

    /// The block containing an object address.
    ///
    /// Valid only for addresses of objects allocated in blocks; an
    /// object always starts within the first block of its group.
    #[must_use]
    pub fn of_object(p: *const Word) -> Self {
        let base = (p as usize & BLOCK_MASK) as *mut BlockHeader;
        // SAFETY: object addresses come from block allocation, so the
        // masked base carries a live header.
        let bd = unsafe { NonNull::new_unchecked(base) };
        let this = Self(bd);
        debug_assert_eq!(this.hdr().magic, MAGIC_BLOCK, "address outside any block");
        this
    }

    fn hdr(&self) -> &BlockHeader {
        // SAFETY: headers live for the lifetime of the pool's chunks.
        unsafe { self.0.as_ref() }
    }

    /// Base of the block as a word pointer.
    #[must_use]
    pub fn base(&self) -> *mut Word {
        self.0.as_ptr().cast::<Word>()
    }

    /// First usable word offset.
    #[must_use]
    pub fn start_off(&self) -> usize {
        BLOCK_HDR_WORDS
    }

    /// Capacity of the whole group in words, header included.
    #[must_use]
    pub fn capacity_words(&self) -> usize {
        self.hdr().blocks.get() as usize * BLOCK_WORDS
    }

    /// Number of blocks in this group.
    #[must_use]
    pub fn group_blocks(&self) -> usize {
        self.hdr().blocks.get() as usize
    }

    /// Owning generation.
    #[must_use]
    pub fn gen_no(&self) -> usize {
        self.hdr().gen_no.get() as usize
    }

    /// Owning step within the generation.
    #[must_use]
    pub fn step_no(&self) -> usize {
        self.hdr().step_no.get() as usize
    }

    /// Reassigns the owning step. Owner-only.
    pub fn set_step(&self, gen_no: usize, step_no: usize) {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.hdr().gen_no.set(gen_no as u8);
            self.hdr().step_no.set(step_no as u8);
        }
    }

    /// Word offset of the next free word.
    #[must_use]
    pub fn free_off(&self) -> usize {
        self.hdr().free.get() as usize
    }

    /// Word offset of the scan cursor.
    #[must_use]
    pub fn scan_off(&self) -> usize {
        self.hdr().scan.get() as usize
    }

    /// Advances the scan cursor. Owner-only.
    pub fn set_scan_off(&self, off: usize) {
        debug_assert!(off <= self.free_off());
        #[allow(clippy::cast_possible_truncation)]
        self.hdr().scan.set(off as u32);
    }

    /// Words of live data in the block.
    #[must_use]
    pub fn words_used(&self) -> usize {
        self.free_off() - BLOCK_HDR_WORDS
    }

    /// Whether every word allocated so far has been scavenged.
    #[must_use]
    pub fn fully_scanned(&self) -> bool {
        self.scan_off() >= self.free_off()
    }

    /// Bump-allocates `words` words. Owner-only. `None` when full.
    #[must_use]
    pub fn try_alloc(&self, words: usize) -> Option<*mut Word> {
        let free = self.free_off();
        if free + words > self.capacity_words() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.hdr().free.set((free + words) as u32);
        // SAFETY: within the group's mapped capacity.
        Some(unsafe { self.base().add(free) })
    }

    /// Undoes the most recent [`try_alloc`](Self::try_alloc) of `words`
    /// words. Owner-only; used when a forwarding race is lost.
    pub fn retract(&self, words: usize) {
        let free = self.free_off();
        debug_assert!(free >= BLOCK_HDR_WORDS + words);
        #[allow(clippy::cast_possible_truncation)]
        self.hdr().free.set((free - words) as u32);
    }

    /// Raw flag word.
    #[must_use]
    pub fn flags(&self) -> u16 {
        self.hdr().flags.load(Ordering::Acquire)
    }

    /// Whether this block heads a large-object group.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.flags() & BF_LARGE != 0
    }

    /// Whether this block sits in the free pool.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.flags() & BF_FREE != 0
    }

    /// Atomically claims the large object in this group for the current
    /// collection. Returns true for the single winner.
    pub fn try_claim_evacuated(&self) -> bool {
        self.hdr().flags.fetch_or(BF_EVACUATED, Ordering::AcqRel) & BF_EVACUATED == 0
    }

    /// Marks this block as to-space of the collection in progress.
    pub fn set_evacuated(&self) {
        self.hdr().flags.fetch_or(BF_EVACUATED, Ordering::Release);
    }

    /// Clears the per-collection evacuated bit.
    pub fn clear_evacuated(&self) {
        self.hdr().flags.fetch_and(!BF_EVACUATED, Ordering::Release);
    }

    fn set_flags(&self, flags: u16) {
        self.hdr().flags.store(flags, Ordering::Release);
    }

    /// Iterates the objects laid out contiguously in this block, from
    /// the first usable word to the free cursor. Every header in that
    /// range must be an info word.
    pub fn objects(&self) -> BlockObjects {
        BlockObjects {
            bd: *self,
            off: BLOCK_HDR_WORDS,
        }
    }
}

/// Iterator over the objects of a block. See [`BlockRef::objects`].
pub struct BlockObjects {
    bd: BlockRef,
    off: usize,
}

impl Iterator for BlockObjects {
    type Item = crate::object::HeapRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.bd.free_off() {
            return None;
        }
        // SAFETY: off stays below the free cursor, which bounds the
        // initialized words of the block.
        let p = unsafe { self.bd.base().add(self.off) };
        let obj = crate::object::HeapRef::from_ptr(p);
        // SAFETY: the range holds back-to-back objects with info-word
        // headers.
        let info = InfoWord::decode(unsafe { p.read() });
        self.off += info.size_words();
        Some(obj)
    }
}

/// Number of blocks needed for an object of `words` words.
#[must_use]
pub const fn blocks_for_words(words: usize) -> usize {
    (BLOCK_HDR_WORDS + words).div_ceil(BLOCK_WORDS)
}

// ----------------------------------------------------------------------------
// Free-block pool
// ----------------------------------------------------------------------------

struct PoolInner {
    free: Vec<BlockRef>,
    /// Freed large-object groups, reusable on an exact size match.
    /// Retained mapped so stale references stay readable until reuse.
    free_groups: Vec<BlockRef>,
    /// Backing mappings, held for the lifetime of the pool.
    chunks: Vec<Chunk>,
}

/// The global free-block pool.
///
/// Globally owned and lock-protected; GC threads buffer batches of
/// blocks locally so the lock is taken once per refill, not once per
/// block.
pub struct BlockPool {
    inner: Mutex<PoolInner>,
    /// Blocks currently handed out (not in the free lists).
    in_use: AtomicUsize,
    /// Optional hard cap on handed-out blocks.
    limit_blocks: Option<usize>,
}

impl BlockPool {
    /// Creates an empty pool. `limit_blocks` caps the number of blocks
    /// that may be live at once; exceeding it aborts the process.
    #[must_use]
    pub fn new(limit_blocks: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                free_groups: Vec::new(),
                chunks: Vec::new(),
            }),
            in_use: AtomicUsize::new(0),
            limit_blocks,
        }
    }

    fn charge(&self, blocks: usize) {
        let now = self.in_use.fetch_add(blocks, Ordering::Relaxed) + blocks;
        if let Some(limit) = self.limit_blocks {
            if now > limit {
                exhausted("block limit exceeded during collection");
            }
        }
    }

    /// Allocates one ordinary block.
    #[must_use]
    pub fn alloc(&self) -> BlockRef {
        let mut out = Vec::with_capacity(1);
        self.alloc_batch(1, &mut out);
        out.pop().expect("alloc_batch returned short")
    }

    /// Allocates `n` ordinary blocks into `out`, taking the pool lock
    /// once.
    pub fn alloc_batch(&self, n: usize, out: &mut Vec<BlockRef>) {
        self.charge(n);
        let mut inner = self.inner.lock();
        while inner.free.len() < n {
            Self::grow(&mut inner);
        }
        for _ in 0..n {
            let bd = inner.free.pop().expect("free list short after grow");
            bd.set_flags(0);
            bd.hdr().free.set(BLOCK_HDR_WORDS as u32);
            bd.hdr().scan.set(BLOCK_HDR_WORDS as u32);
            out.push(bd);
        }
    }

    /// Allocates a large-object group of `n_blocks` contiguous blocks.
    #[must_use]
    pub fn alloc_group(&self, n_blocks: usize) -> BlockRef {
        debug_assert!(n_blocks >= 1);
        self.charge(n_blocks);
        let mut inner = self.inner.lock();
        if let Some(ix) = inner
            .free_groups
            .iter()
            .position(|g| g.group_blocks() == n_blocks)
        {
            let bd = inner.free_groups.swap_remove(ix);
            bd.set_flags(BF_LARGE);
            bd.hdr().free.set(BLOCK_HDR_WORDS as u32);
            bd.hdr().scan.set(BLOCK_HDR_WORDS as u32);
            return bd;
        }
        let chunk = match Chunk::map_aligned(n_blocks * BLOCK_BYTES, BLOCK_BYTES) {
            Ok(c) => c,
            Err(e) => exhausted(&format!("large-object mapping failed: {e}")),
        };
        // SAFETY: the chunk is freshly mapped, aligned, and retained in
        // the pool for the life of the header.
        let bd = unsafe { BlockRef::init(chunk.ptr(), n_blocks as u32, BF_LARGE) };
        inner.chunks.push(chunk);
        bd
    }

    /// Returns an ordinary block to the pool. The memory stays mapped;
    /// headers of dead objects remain readable until the block is
    /// reused.
    pub fn free(&self, bd: BlockRef) {
        debug_assert!(!bd.is_large());
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        bd.set_flags(BF_FREE);
        self.inner.lock().free.push(bd);
    }

    /// Returns a large-object group to the pool.
    pub fn free_group(&self, bd: BlockRef) {
        debug_assert!(bd.is_large());
        self.in_use.fetch_sub(bd.group_blocks(), Ordering::Relaxed);
        bd.set_flags(BF_LARGE | BF_FREE);
        self.inner.lock().free_groups.push(bd);
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn grow(inner: &mut PoolInner) {
        let chunk = match Chunk::map_aligned(CHUNK_BLOCKS * BLOCK_BYTES, BLOCK_BYTES) {
            Ok(c) => c,
            Err(e) => exhausted(&format!("chunk mapping failed: {e}")),
        };
        let base = chunk.ptr();
        for i in 0..CHUNK_BLOCKS {
            // SAFETY: each slice of the chunk is block-aligned and ours.
            let bd = unsafe { BlockRef::init(base.add(i * BLOCK_BYTES), 1, BF_FREE) };
            inner.free.push(bd);
        }
        inner.chunks.push(chunk);
    }
}

/// Allocator exhaustion is fatal: the collection cannot pause mid-
/// traversal with mutators stopped and half-moved objects.
fn exhausted(what: &str) -> ! {
    eprintln!("scoria-gc: out of block storage ({what}); aborting");
    process::abort();
}
