//! Executable memory for compiled kernels.
//!
//! A mapping starts out read-write so the linked code can be copied in, then
//! is flipped to read-execute before anything runs. Writable and executable
//! never hold at the same time.
//!
//! # Safety
//! Every platform call lives in this module. Callers only see
//! [`ExecutableBuffer`], whose one unsafe operation is jumping into the code.

use std::ptr::NonNull;

use crate::core::error::{CompileError, CompileResult};

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old_protect) != 0 }
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }
}

/// Allocation granularity.
pub const PAGE_SIZE: usize = 4096;

fn memory_error(reason: impl Into<String>) -> CompileError {
    CompileError::Memory {
        reason: reason.into(),
    }
}

/// Page-aligned mapping holding one kernel.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    executable: bool,
}

impl ExecutableBuffer {
    /// Map at least `size` writable bytes.
    pub fn reserve(size: usize) -> CompileResult<Self> {
        let capacity = size
            .max(1)
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or_else(|| memory_error(format!("cannot map {size} bytes")))?;
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| memory_error(format!("mapping {capacity} bytes failed")))?;
        log::trace!("mapped {capacity} bytes at {:p}", ptr);
        Ok(Self {
            ptr,
            capacity,
            len: 0,
            executable: false,
        })
    }

    /// Address the code will run at; what absolute fixups are linked against.
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy linked `code` in and make the mapping read-execute.
    pub fn finalize(&mut self, code: &[u8]) -> CompileResult<()> {
        if self.executable {
            return Err(memory_error("buffer is already executable"));
        }
        if code.len() > self.capacity {
            return Err(memory_error(format!(
                "{} bytes of code exceed the {} byte mapping",
                code.len(),
                self.capacity
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
            if !platform::make_executable(self.ptr.as_ptr(), self.capacity) {
                return Err(memory_error("changing page protection failed"));
            }
        }
        self.len = code.len();
        self.executable = true;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Run the code as a zero-argument function.
    ///
    /// # Safety
    /// The buffer must hold a complete kernel that only touches memory the
    /// caller has made valid for it.
    pub unsafe fn call(&self) {
        debug_assert!(self.executable);
        let entry: extern "C" fn() = unsafe { std::mem::transmute(self.ptr.as_ptr()) };
        entry();
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe { platform::free(self.ptr.as_ptr(), self.capacity) };
    }
}

impl std::fmt::Debug for ExecutableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableBuffer")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len)
            .field("executable", &self.executable)
            .finish()
    }
}
