//! Evacuation: moving reachable objects out of from-space.
//!
//! `evacuate` is the heart of the collector. Given a reference it
//! returns the object's to-space address, copying it if this thread
//! gets there first. Concurrent evacuators race on the forwarding
//! compare-and-install; losers retract their copy and follow the
//! winner, so every object moves at most once per collection.
//!
//! Large objects and a non-moving oldest generation take the same entry
//! point but relocate nothing: the first is claimed by a block flag and
//! re-listed on its destination step, the second is marked in place and
//! queued on the mark stack.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::block::{BlockRef, BF_EVACUATED, BF_LARGE};
use crate::object::{forwarding_target, HeapRef, InfoWord, Word, WORD_BYTES};
use crate::thread::GcThread;

impl GcThread {
    /// Evacuates `obj` and returns its surviving address.
    ///
    /// Sets `failed_to_evac` when the survivor ends up younger than
    /// `evac_gen`; the caller then remembers the object it is
    /// scavenging.
    pub(crate) fn evacuate(&mut self, obj: HeapRef) -> HeapRef {
        let heap = Arc::clone(&self.heap);
        let collect_gen = heap.collect_gen.load(Ordering::Acquire);
        let mark_mode = heap.mark_mode.load(Ordering::Acquire);
        loop {
            let header = obj.header_word();
            if let Some(to) = forwarding_target(header) {
                self.note_survivor_gen(to);
                return to;
            }
            let info = InfoWord::decode(header);
            if info.is_static {
                if heap.statics.discover(obj) {
                    heap.push_static_todo(obj);
                }
                return obj;
            }

            let bd = BlockRef::of_object(obj.as_ptr());
            let flags = bd.flags();
            if flags & BF_EVACUATED != 0 || bd.gen_no() > collect_gen {
                // Already in to-space, or resident in an uncollected
                // generation.
                if bd.gen_no() < self.evac_gen {
                    self.failed_to_evac = true;
                }
                return obj;
            }
            if flags & BF_LARGE != 0 {
                return self.evacuate_large(obj, bd, mark_mode);
            }
            if mark_mode && (bd.gen_no(), bd.step_no()) == heap.marked_step() {
                if obj.try_mark() {
                    heap.mark_stack.push(obj);
                }
                return obj;
            }

            let dest = if self.eager_promotion {
                self.evac_dest
            } else {
                heap.step(bd.gen_no(), bd.step_no()).to
            };
            if dest.0 < self.evac_gen {
                self.failed_to_evac = true;
            }

            let words = info.size_words();
            let mut copy_info = info;
            if heap.config.mark_oldest && dest == heap.marked_step() {
                // Keep the mark bits of the in-place step coherent for
                // liveness queries. Minor collections promote here too,
                // while the bits from the last marking round still stand.
                copy_info.marked = true;
            }
            let p = self.alloc_in(dest, words);
            // SAFETY: alloc_in reserved `words` words; the source object
            // is `words` words long per its info word.
            unsafe {
                p.write(copy_info.encode());
                std::ptr::copy_nonoverlapping(obj.as_ptr().add(1), p.add(1), words - 1);
            }
            let to = HeapRef::from_ptr(p);
            match obj.try_forward(header, to) {
                Ok(()) => {
                    let bytes = words * WORD_BYTES;
                    if info.ptrs == 0 {
                        self.stats.note_scavd_copied(bytes);
                    } else {
                        self.stats.note_copied(bytes);
                    }
                    return to;
                }
                Err(beaten_by) => {
                    self.retract_in(dest, words);
                    if let Some(to) = forwarding_target(beaten_by) {
                        self.note_survivor_gen(to);
                        return to;
                    }
                    // The header changed under us without forwarding
                    // (a concurrent mark); take it from the top.
                }
            }
        }
    }

    /// Large objects never move; the first thread to claim the group
    /// re-lists it on its destination step and queues it for an
    /// in-place scavenge.
    fn evacuate_large(&mut self, obj: HeapRef, bd: BlockRef, mark_mode: bool) -> HeapRef {
        let heap = Arc::clone(&self.heap);
        if mark_mode && (bd.gen_no(), bd.step_no()) == heap.marked_step() {
            if obj.try_mark() {
                heap.mark_stack.push(obj);
            }
            return obj;
        }
        let dest = if self.eager_promotion {
            self.evac_dest
        } else {
            heap.step(bd.gen_no(), bd.step_no()).to
        };
        if dest.0 < self.evac_gen {
            self.failed_to_evac = true;
        }
        if bd.try_claim_evacuated() {
            bd.set_step(dest.0, dest.1);
            if heap.config.mark_oldest && dest == heap.marked_step() {
                obj.try_mark();
            }
            let ix = self.ws_index(dest.0, dest.1);
            self.workspaces[ix].todo_large.push(obj);
        } else if bd.gen_no() < self.evac_gen {
            // A racing thread claimed it for a destination we cannot
            // accept; its gen is already final for this round.
            self.failed_to_evac = true;
        }
        obj
    }

    /// After following a forwarding marker, account for where the
    /// winner put the object.
    fn note_survivor_gen(&mut self, to: HeapRef) {
        if self.evac_gen > 0 && BlockRef::of_object(to.as_ptr()).gen_no() < self.evac_gen {
            self.failed_to_evac = true;
        }
    }

    fn alloc_in(&mut self, dest: (usize, usize), words: usize) -> *mut Word {
        let heap = Arc::clone(&self.heap);
        let step = heap.step(dest.0, dest.1);
        let ix = self.ws_index(dest.0, dest.1);
        self.workspaces[ix].alloc(
            words,
            &step.queue,
            &mut self.free_blocks,
            &heap.pool,
            heap.config.free_list_refill,
        )
    }

    fn retract_in(&mut self, dest: (usize, usize), words: usize) {
        let ix = self.ws_index(dest.0, dest.1);
        self.workspaces[ix].retract_alloc(words);
    }
}
