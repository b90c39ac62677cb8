//! Aligned address-space chunks for block-structured heaps.
//!
//! A block-structured collector wants large chunks of memory whose base
//! address is aligned to the chunk size, so that dividing a chunk into
//! fixed-size blocks lets any interior address locate its block header
//! with a single mask. `mmap` only guarantees page alignment, so the unix
//! backend over-maps and trims; other platforms fall back to
//! `std::alloc` with an explicit alignment.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
use fallback as os;

pub use os::page_size;

/// A handle to one aligned chunk of address space.
///
/// The memory is released when the handle is dropped. The chunk is
/// readable and writable for its whole length.
pub struct Chunk {
    inner: os::ChunkInner,
}

impl Chunk {
    /// Maps `len` bytes whose base address is a multiple of `align`.
    ///
    /// `align` must be a power of two and a multiple of the page size;
    /// `len` must be a non-zero multiple of `align`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the mapping cannot be created, typically
    /// address-space exhaustion.
    pub fn map_aligned(len: usize, align: usize) -> io::Result<Self> {
        if len == 0 || !align.is_power_of_two() || len % align != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "len must be a non-zero multiple of a power-of-two align",
            ));
        }
        let inner = os::ChunkInner::map_aligned(len, align)?;
        Ok(Self { inner })
    }

    /// Base address of the chunk. Guaranteed aligned to the requested
    /// alignment and valid for `len()` bytes while the handle lives.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the chunk in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the chunk is empty. Always false for a mapped chunk.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

// SAFETY: the chunk owns its mapping outright; nothing in the handle is
// tied to the creating thread.
unsafe impl Send for Chunk {}
// SAFETY: the handle itself only exposes the base pointer and length.
unsafe impl Sync for Chunk {}

#[cfg(test)]
mod tests {
    use super::{page_size, Chunk};
    use std::ptr;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn rejects_zero_len() {
        assert!(Chunk::map_aligned(0, 4096).is_err());
    }

    #[test]
    fn rejects_unaligned_len() {
        assert!(Chunk::map_aligned(4096 + 8, 4096).is_err());
    }

    #[test]
    fn maps_and_aligns() {
        let align = 1 << 16;
        let chunk = Chunk::map_aligned(align * 4, align).expect("map failed");
        assert_eq!(chunk.ptr() as usize % align, 0);
        assert_eq!(chunk.len(), align * 4);

        // The whole range must be writable.
        unsafe {
            ptr::write_volatile(chunk.ptr(), 0xAB);
            ptr::write_volatile(chunk.ptr().add(chunk.len() - 1), 0xCD);
            assert_eq!(ptr::read_volatile(chunk.ptr()), 0xAB);
            assert_eq!(ptr::read_volatile(chunk.ptr().add(chunk.len() - 1)), 0xCD);
        }
    }

    #[test]
    fn chunks_do_not_overlap() {
        let align = 1 << 16;
        let a = Chunk::map_aligned(align, align).expect("map failed");
        let b = Chunk::map_aligned(align, align).expect("map failed");
        let (sa, sb) = (a.ptr() as usize, b.ptr() as usize);
        assert!(sa + a.len() <= sb || sb + b.len() <= sa);
    }
}
