//! Bounded mark stack with overflow tolerance.
//!
//! Liveness marking that cannot go through the copy path (a non-moving
//! oldest generation during a major collection) uses one process-wide,
//! fixed-capacity stack of pending objects. A push that would exceed
//! capacity raises the overflow flag and is dropped — never an error.
//! The object stays marked, so a later linear pass over all marked
//! objects re-examines their children; passes repeat until one raises
//! no overflow and marks nothing new. The stack is an explicit
//! index-cursored array so the capacity check is a single compare.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::HeapRef;

struct Inner {
    /// Pending entries, stored as raw header addresses.
    items: Box<[usize]>,
    /// Stack cursor: number of live entries.
    sp: usize,
}

/// The shared mark stack. Protected by a short-held lock; the depth
/// mirror and overflow flag are readable without it.
pub struct MarkStack {
    inner: Mutex<Inner>,
    depth: AtomicUsize,
    overflowed: AtomicBool,
}

impl MarkStack {
    /// Creates a stack with room for `capacity` pending objects.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: vec![0usize; capacity].into_boxed_slice(),
                sp: 0,
            }),
            depth: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    /// Pushes a pending object. On a full stack the push is dropped and
    /// the overflow flag raised; the caller must have marked the object
    /// first so a rescan pass can find it.
    pub fn push(&self, obj: HeapRef) {
        let mut inner = self.inner.lock();
        if inner.sp == inner.items.len() {
            self.overflowed.store(true, Ordering::Release);
            return;
        }
        let sp = inner.sp;
        inner.items[sp] = obj.as_ptr() as usize;
        inner.sp = sp + 1;
        self.depth.store(inner.sp, Ordering::Release);
    }

    /// Pops the most recently pushed pending object.
    #[must_use]
    pub fn pop(&self) -> Option<HeapRef> {
        let mut inner = self.inner.lock();
        if inner.sp == 0 {
            return None;
        }
        inner.sp -= 1;
        let addr = inner.items[inner.sp];
        self.depth.store(inner.sp, Ordering::Release);
        Some(HeapRef::from_ptr(addr as *mut _))
    }

    /// Approximate depth without the lock.
    #[must_use]
    pub fn depth_hint(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Reads and clears the overflow flag.
    #[must_use]
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }

    /// Whether an overflow is pending.
    #[must_use]
    pub fn overflow_pending(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::MarkStack;
    use crate::object::{HeapRef, InfoWord, ObjKind};

    fn dummy_objects(n: usize) -> (Vec<Box<[u64; 2]>>, Vec<HeapRef>) {
        let mut storage = Vec::with_capacity(n);
        let mut refs = Vec::with_capacity(n);
        for _ in 0..n {
            let mut b = Box::new([0u64; 2]);
            b[0] = InfoWord::new(0, 1, ObjKind::Data).encode();
            refs.push(HeapRef::from_ptr(b.as_mut_ptr()));
            storage.push(b);
        }
        (storage, refs)
    }

    #[test]
    fn lifo_order() {
        let (_hold, refs) = dummy_objects(3);
        let stack = MarkStack::new(8);
        for &r in &refs {
            stack.push(r);
        }
        assert_eq!(stack.depth_hint(), 3);
        assert_eq!(stack.pop(), Some(refs[2]));
        assert_eq!(stack.pop(), Some(refs[1]));
        assert_eq!(stack.pop(), Some(refs[0]));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn overflow_drops_without_losing_the_flag() {
        let (_hold, refs) = dummy_objects(4);
        let stack = MarkStack::new(2);
        for &r in &refs {
            stack.push(r);
        }
        assert_eq!(stack.depth_hint(), 2);
        assert!(stack.overflow_pending());

        // Flag reads once, then clears.
        assert!(stack.take_overflow());
        assert!(!stack.take_overflow());

        // The two retained entries are intact.
        assert_eq!(stack.pop(), Some(refs[1]));
        assert_eq!(stack.pop(), Some(refs[0]));
        assert_eq!(stack.pop(), None);
    }
}
