//! Executable memory for emitted post-op kernels.
//!
//! Assembled bytes are copied into an anonymous mapping which is then
//! flipped to read+execute. The buffer owns the mapping for the lifetime of
//! the kernel that was compiled into it.

use crate::regmap::JitError;

/// One page-rounded anonymous mapping holding an assembled kernel, readable
/// and executable for as long as the value lives.
pub struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping belongs to this value alone, nothing hands out a
// mutable view of it, and its protection stays PROT_READ|PROT_EXEC from
// construction until munmap in Drop.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Map a fresh region, copy `code` in, and seal it read+execute.
    pub fn new(code: &[u8]) -> Result<Self, JitError> {
        if code.is_empty() {
            return Ok(ExecutableBuffer { ptr: std::ptr::null_mut(), len: 0 });
        }

        // The mapped length is a whole number of pages.
        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: private anonymous mapping, no fd behind it; MAP_FAILED is
        // handled right below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(JitError::Executable("anonymous mapping for emitted code failed".into()));
        }

        let ptr = ptr as *mut u8;

        // SAFETY: the mapping is at least code.len() bytes and freshly owned.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(JitError::Executable("sealing emitted code read+execute failed".into()));
        }

        Ok(ExecutableBuffer { ptr, len })
    }

    /// Base of the executable region. Null for an empty buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mapped size in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
