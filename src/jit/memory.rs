//! Executable memory management using mmap.
//!
//! Pages are mapped read-write, filled, then flipped to read-execute with
//! mprotect. They are never writable and executable at the same time.

use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("mmap failed")]
    AllocationFailed,
    #[error("mprotect failed")]
    ProtectionFailed,
    #[error("invalid size {0}")]
    InvalidSize(usize),
}

/// A block of memory allocated via mmap.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map `size` bytes (rounded up to whole pages), initially writable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let page = page_size();
        let size = size.div_ceil(page) * page;

        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;

        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `data` to `offset`. Fails once the memory is executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.size)
            .ok_or(MemoryError::InvalidSize(offset + data.len()))?;

        // SAFETY: offset..end lies inside the writable mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), end - offset);
        }
        Ok(())
    }

    /// Make the memory read-execute. It can no longer be written.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        // SAFETY: ptr/size describe exactly the mapping created in `new`.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    /// Start of the mapping, or `None` while it is still writable.
    pub fn entry_ptr(&self) -> Option<*const u8> {
        self.executable.then_some(self.ptr.as_ptr() as *const u8)
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `new`; nothing refers to it
        // once the owning CompiledFunction is gone.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}
