use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;

/// Page size stand-in for platforms without a cheap query.
pub fn page_size() -> usize {
    4096
}

pub struct ChunkInner {
    ptr: *mut u8,
    layout: Layout,
}

impl ChunkInner {
    pub fn map_aligned(len: usize, align: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, align)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout is non-zero sized.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "aligned allocation failed",
            ));
        }
        Ok(Self { ptr, layout })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for ChunkInner {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in map_aligned.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}
