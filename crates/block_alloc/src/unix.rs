use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf with a valid name has no preconditions.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ChunkInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ChunkInner {
    /// Maps an anonymous region of `len` bytes aligned to `align`.
    ///
    /// `mmap` only promises page alignment, so we map `len + align`
    /// bytes and unmap the misaligned head and the surplus tail.
    pub fn map_aligned(len: usize, align: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let over = len + align;

        // SAFETY: anonymous mapping with no address hint; the kernel
        // chooses the placement.
        let base = unsafe { libc::mmap(ptr::null_mut(), over, prot, flags, -1, 0) };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let addr = base as usize;
        let aligned = (addr + align - 1) & !(align - 1);
        let head = aligned - addr;
        let tail = over - head - len;

        // SAFETY: head and tail lie inside the mapping we just created
        // and do not intersect [aligned, aligned + len).
        unsafe {
            if head > 0 {
                libc::munmap(base, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ChunkInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: we own [ptr, ptr + len); the trimmed head and tail
            // were already unmapped at creation.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
