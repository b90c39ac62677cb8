//! Static-object bookkeeping.
//!
//! Static objects have program lifetime and live outside the block
//! heap. Heap scanning never initiates a walk of static data: a static
//! object joins the scavenged list the first time a scavenged reference
//! is discovered to point at it, and only then are its own references
//! scavenged. Unreferenced statics are never visited and never
//! reclaimed.
//!
//! Exactly-once movement is enforced by the sticky visited bit in the
//! object header, so concurrent discoverers agree on a single winner
//! before the list splice takes its lock.

use parking_lot::Mutex;

use crate::object::{HeapRef, InfoWord, ObjKind, Word};

/// One static allocation. The registry owns the words; references point
/// into them.
struct StaticSlot {
    words: Box<[Word]>,
}

/// The process-wide static-object registry.
pub struct StaticRegistry {
    /// All static allocations, visited or not. Objects without the
    /// visited bit form the not-yet-scanned set.
    objects: Mutex<Vec<StaticSlot>>,
    /// Statics discovered by some collection, in discovery order.
    scavenged: Mutex<Vec<HeapRef>>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            scavenged: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a static object with zeroed fields.
    #[must_use]
    pub fn alloc(&self, ptrs: u16, raws: u16, kind: ObjKind) -> HeapRef {
        let mut info = InfoWord::new(ptrs, raws, kind);
        info.is_static = true;
        let mut words = vec![0 as Word; info.size_words()].into_boxed_slice();
        words[0] = info.encode();
        let r = HeapRef::from_ptr(words.as_mut_ptr());
        self.objects.lock().push(StaticSlot { words });
        r
    }

    /// Records the first discovery of `obj`. Returns true for the
    /// single caller that wins the visited bit; that caller must then
    /// queue the object's own references for scavenging.
    pub fn discover(&self, obj: HeapRef) -> bool {
        debug_assert!(obj.info().is_static);
        if !obj.try_mark() {
            return false;
        }
        self.scavenged.lock().push(obj);
        true
    }

    /// Snapshot of the scavenged list. Re-scavenged as roots each
    /// collection so previously discovered statics keep their referents
    /// live without an exhaustive static rescan.
    #[must_use]
    pub fn scavenged_snapshot(&self) -> Vec<HeapRef> {
        self.scavenged.lock().clone()
    }

    /// Number of statics on the scavenged list.
    #[must_use]
    pub fn scavenged_len(&self) -> usize {
        self.scavenged.lock().len()
    }

    /// Number of static allocations, visited or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether no statics exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}
