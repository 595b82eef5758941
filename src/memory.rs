//! Executable memory management using mmap.
//!
//! A region starts writable, receives the finalized code bytes exactly
//! once, and is then flipped to read+execute. On architectures with
//! incoherent instruction caches the flip also synchronizes the icache.

use std::ptr::NonNull;

use log::trace;

use crate::error::JitError;

/// A page-aligned block of memory destined to hold executable code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a writable, non-executable block of at least `size` bytes.
    pub fn new(size: usize) -> Result<Self, JitError> {
        if size == 0 {
            return Err(JitError::EmptyBuffer);
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(JitError::AllocationFailed)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` into the region at `offset`. Only valid while writable;
    /// the finalizer writes once and the bounds are its own invariant.
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) {
        debug_assert!(!self.executable, "write to executable region");
        debug_assert!(offset + data.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Flip the region to read+execute and synchronize the instruction
    /// cache. After this call the region can never be written again.
    pub(crate) fn protect_exec(&mut self) -> Result<(), JitError> {
        debug_assert!(!self.executable, "region already executable");
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(JitError::ProtectionFailed);
        }
        self.flush_icache();
        self.executable = true;
        trace!("protected {} bytes RX at {:p}", self.size, self.as_ptr());
        Ok(())
    }

    #[cfg(target_arch = "aarch64")]
    fn flush_icache(&self) {
        unsafe extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        unsafe {
            let start = self.ptr.as_ptr() as *mut libc::c_char;
            __clear_cache(start, start.add(self.size));
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn flush_icache(&self) {
        // x86-64 keeps data and instruction caches coherent.
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The region is exclusively owned during construction and immutable after
// the protection flip, so it may move across and be shared between threads.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// A finalized, immutable, executable code artifact.
///
/// May be invoked concurrently from any number of threads; invocation
/// never mutates the region.
pub struct ExecutableCode {
    mem: ExecutableMemory,
    len: usize,
}

impl ExecutableCode {
    pub(crate) fn new(mem: ExecutableMemory, len: usize) -> Self {
        debug_assert!(mem.is_executable());
        Self { mem, len }
    }

    /// The entry address of the generated code.
    pub fn entry(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    /// The exact number of emitted code bytes (the mapped region may be
    /// larger due to page rounding).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reinterpret the entry address as a callable function pointer.
    ///
    /// # Safety
    /// `F` must be a function-pointer type whose signature matches the
    /// calling convention and arguments the emitted code expects.
    pub unsafe fn entry_fn<F: Copy>(&self) -> F {
        debug_assert_eq!(size_of::<F>(), size_of::<*const u8>());
        let entry = self.mem.as_ptr();
        unsafe { std::mem::transmute_copy(&entry) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_to_page() {
        let mem = ExecutableMemory::new(100).unwrap();
        assert!(mem.size() >= 100);
        assert_eq!(mem.size() % 4096, 0);
        assert!(!mem.is_executable());
    }

    #[test]
    fn write_then_protect() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(0, &[0x90, 0x90, 0x90, 0x90]);
        mem.protect_exec().unwrap();
        assert!(mem.is_executable());
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(ExecutableMemory::new(0).is_err());
    }
}
