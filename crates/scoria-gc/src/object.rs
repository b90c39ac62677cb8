//! Heap object representation.
//!
//! Every object is a run of words: one header word followed by the
//! payload. The header is either an *info word* describing the payload
//! (pointer-field count, raw-field count, kind, static bit) or a
//! *forwarding marker* left behind after the object has been relocated.
//! The two are distinguished by the low bit; object addresses are always
//! word-aligned, so a tagged address can never be mistaken for an info
//! word.
//!
//! Forwarding is installed with an atomic compare-and-install so that
//! evacuators racing on the same object agree on exactly one winner.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// One heap word.
pub type Word = u64;

/// Size of a heap word in bytes.
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Header tag bit: the header is a forwarding marker, not an info word.
const FWD_TAG: Word = 0b1;
/// Info-word bit: the object lives in static storage, not in a block.
const STATIC_BIT: Word = 0b10;
/// Info-word bit: visited marker. Doubles as the static "already
/// scavenged" bit and the in-place mark bit for a non-moving oldest
/// generation; the two uses never apply to the same object.
const MARK_BIT: Word = 0b100;

const KIND_SHIFT: u32 = 3;
const KIND_MASK: Word = 0b11;
const PTRS_SHIFT: u32 = 16;
const RAWS_SHIFT: u32 = 32;
const FIELD_MASK: Word = 0xFFFF;

/// Object kind, used only for the instrumented mutable-list counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjKind {
    /// Plain immutable data.
    Data = 0,
    /// A single mutable reference cell.
    MutVar = 1,
    /// A mutable array of references.
    Array = 2,
    /// Anything else.
    Other = 3,
}

impl ObjKind {
    const fn from_bits(bits: Word) -> Self {
        match bits {
            0 => Self::Data,
            1 => Self::MutVar,
            2 => Self::Array,
            _ => Self::Other,
        }
    }
}

/// Decoded info word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoWord {
    /// Number of reference fields. They occupy the first `ptrs` payload
    /// words; a zero word is a null reference.
    pub ptrs: u16,
    /// Number of raw (non-reference) payload words following the
    /// reference fields.
    pub raws: u16,
    /// Object kind.
    pub kind: ObjKind,
    /// Object lives in static storage.
    pub is_static: bool,
    /// Visited marker (see [`MARK_BIT`]).
    pub marked: bool,
}

impl InfoWord {
    /// Builds the info word for a freshly allocated object.
    #[must_use]
    pub const fn new(ptrs: u16, raws: u16, kind: ObjKind) -> Self {
        Self {
            ptrs,
            raws,
            kind,
            is_static: false,
            marked: false,
        }
    }

    /// Encodes into a header word. The low bit is always clear.
    #[must_use]
    pub const fn encode(self) -> Word {
        let mut w = (self.ptrs as Word) << PTRS_SHIFT
            | (self.raws as Word) << RAWS_SHIFT
            | ((self.kind as Word) & KIND_MASK) << KIND_SHIFT;
        if self.is_static {
            w |= STATIC_BIT;
        }
        if self.marked {
            w |= MARK_BIT;
        }
        w
    }

    /// Decodes a header word known to be an info word.
    #[must_use]
    pub const fn decode(w: Word) -> Self {
        debug_assert!(w & FWD_TAG == 0, "decoding a forwarding marker");
        Self {
            ptrs: ((w >> PTRS_SHIFT) & FIELD_MASK) as u16,
            raws: ((w >> RAWS_SHIFT) & FIELD_MASK) as u16,
            kind: ObjKind::from_bits((w >> KIND_SHIFT) & KIND_MASK),
            is_static: w & STATIC_BIT != 0,
            marked: w & MARK_BIT != 0,
        }
    }

    /// Total object size in words, header included.
    #[must_use]
    pub const fn size_words(self) -> usize {
        1 + self.ptrs as usize + self.raws as usize
    }
}

/// A reference to a heap (or static) object: the address of its header
/// word.
///
/// `HeapRef` is a bare address. It is only meaningful while the object
/// it names is live under the collector's rules; in particular a
/// from-space reference is stale after a subsequent allocation reuses
/// the reclaimed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(NonZeroUsize);

// SAFETY: a HeapRef is an address; which thread holds it does not
// matter. Cross-thread access to the object it names is governed by the
// collector's ownership discipline, not by this handle.
unsafe impl Send for HeapRef {}
// SAFETY: see Send.
unsafe impl Sync for HeapRef {}

impl HeapRef {
    /// Wraps a raw header address.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the address is null or unaligned.
    #[must_use]
    pub fn from_ptr(p: *mut Word) -> Self {
        debug_assert!(!p.is_null());
        debug_assert_eq!(p as usize % WORD_BYTES, 0);
        Self(NonZeroUsize::new(p as usize).expect("null object address"))
    }

    /// Reconstructs a reference from a field word; `0` is null.
    #[must_use]
    pub fn from_field(w: Word) -> Option<Self> {
        debug_assert_eq!(w & FWD_TAG, 0, "raw forwarding address in a field");
        #[allow(clippy::cast_possible_truncation)]
        NonZeroUsize::new(w as usize).map(Self)
    }

    /// The header address.
    #[must_use]
    pub const fn as_ptr(self) -> *mut Word {
        self.0.get() as *mut Word
    }

    /// The header address as a field word.
    #[must_use]
    pub const fn as_word(self) -> Word {
        self.0.get() as Word
    }

    fn header(self) -> &'static AtomicU64 {
        // SAFETY: the header word is word-aligned and only ever accessed
        // through this atomic view during a collection.
        unsafe { &*self.as_ptr().cast::<AtomicU64>() }
    }

    /// Loads the raw header word.
    #[must_use]
    pub fn header_word(self) -> Word {
        self.header().load(Ordering::Acquire)
    }

    /// Decodes the info word. The object must not be forwarded.
    #[must_use]
    pub fn info(self) -> InfoWord {
        InfoWord::decode(self.header_word())
    }

    /// Returns the relocation target if this object carries a
    /// forwarding marker.
    #[must_use]
    pub fn forwarded_to(self) -> Option<Self> {
        forwarding_target(self.header_word())
    }

    /// Atomically installs a forwarding marker over `expected_info`.
    ///
    /// On failure returns the header word that beat us; the caller
    /// retracts its copy and follows the winner.
    pub(crate) fn try_forward(self, expected_info: Word, to: Self) -> Result<(), Word> {
        let fwd = to.as_word() | FWD_TAG;
        self.header()
            .compare_exchange(expected_info, fwd, Ordering::Release, Ordering::Acquire)
            .map(|_| ())
    }

    /// Atomically sets the visited/mark bit. Returns true if this call
    /// was the one that set it.
    pub(crate) fn try_mark(self) -> bool {
        self.header().fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
    }

    /// Clears the visited/mark bit. Owner-only; used between marking
    /// collections.
    pub(crate) fn clear_mark(self) {
        self.header().fetch_and(!MARK_BIT, Ordering::Relaxed);
    }

    /// Pointer to payload word `i`.
    fn payload_ptr(self, i: usize) -> *mut Word {
        // SAFETY: the payload follows the header contiguously; callers
        // stay within the bounds given by the info word.
        unsafe { self.as_ptr().add(1 + i) }
    }

    /// Reads reference field `i`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `i` is out of bounds.
    #[must_use]
    pub fn ref_field(self, i: usize) -> Option<Self> {
        debug_assert!(i < self.info().ptrs as usize);
        // SAFETY: in bounds per the info word.
        Self::from_field(unsafe { self.payload_ptr(i).read() })
    }

    /// Writes reference field `i`.
    pub fn set_ref_field(self, i: usize, v: Option<Self>) {
        debug_assert!(i < self.info().ptrs as usize);
        let w = v.map_or(0, Self::as_word);
        // SAFETY: in bounds per the info word.
        unsafe { self.payload_ptr(i).write(w) };
    }

    /// Reads raw word `i` (indexed after the reference fields).
    #[must_use]
    pub fn raw_field(self, i: usize) -> Word {
        let info = self.info();
        debug_assert!(i < info.raws as usize);
        // SAFETY: in bounds per the info word.
        unsafe { self.payload_ptr(info.ptrs as usize + i).read() }
    }

    /// Writes raw word `i`.
    pub fn set_raw_field(self, i: usize, v: Word) {
        let info = self.info();
        debug_assert!(i < info.raws as usize);
        // SAFETY: in bounds per the info word.
        unsafe { self.payload_ptr(info.ptrs as usize + i).write(v) };
    }
}

/// Decodes a header word into a forwarding target, if it is one.
#[must_use]
pub fn forwarding_target(header: Word) -> Option<HeapRef> {
    if header & FWD_TAG == 0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(HeapRef(
        NonZeroUsize::new((header & !FWD_TAG) as usize).expect("null forwarding target"),
    ))
}
