//! Physical memory window backed by an mmap'ed file.
//!
//! On a real host the file is `/dev/mem` (or a reserved-memory device node);
//! in tests it is a plain temporary file. The window covers physical
//! addresses `base..base + len`, mapped from `offset` in the file.

use super::PhysMemory;
use cohost_shared::errors::{CohostError, CohostResult};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct MappedWindow {
    ptr: *mut u8,
    base: u64,
    len: usize,
    _file: File,
}

// SAFETY: the mapping is owned by this value and every access goes through
// bounds-checked copies or atomics.
unsafe impl Send for MappedWindow {}
unsafe impl Sync for MappedWindow {}

impl MappedWindow {
    /// Map `len` bytes of `path` starting at file `offset` as physical
    /// addresses starting at `base`.
    pub fn open(path: &Path, offset: u64, base: u64, len: usize) -> CohostResult<Self> {
        if len == 0 {
            return Err(CohostError::Validation("empty physical window".into()));
        }
        let page = page_size();
        if offset % page != 0 || base % page != 0 {
            return Err(CohostError::Validation(format!(
                "window offset {:#x} and base {:#x} must be page aligned",
                offset, base
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: fresh shared mapping of a file we keep open for the
        // lifetime of the mapping.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        tracing::info!(
            path = %path.display(),
            base = format_args!("{:#x}", base),
            len,
            "mapped physical window"
        );

        Ok(Self {
            ptr: ptr as *mut u8,
            base,
            len,
            _file: file,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset_of(&self, phys: u64, len: usize) -> CohostResult<usize> {
        let offset = phys
            .checked_sub(self.base)
            .ok_or_else(|| super::out_of_bounds(phys, len))? as usize;
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset),
            _ => Err(super::out_of_bounds(phys, len)),
        }
    }
}

impl PhysMemory for MappedWindow {
    fn read(&self, phys: u64, buf: &mut [u8]) -> CohostResult<()> {
        let offset = self.offset_of(phys, buf.len())?;
        // SAFETY: offset..offset+len is inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, phys: u64, data: &[u8]) -> CohostResult<()> {
        let offset = self.offset_of(phys, data.len())?;
        // SAFETY: offset..offset+len is inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    fn compare_exchange_u32(&self, phys: u64, current: u32, new: u32) -> CohostResult<bool> {
        if phys % 4 != 0 {
            return Err(super::out_of_bounds(phys, 4));
        }
        let offset = self.offset_of(phys, 4)?;
        // SAFETY: aligned, in bounds, and shared with the guest only through
        // atomic operations on this word.
        let word = unsafe { AtomicU32::from_ptr(self.ptr.add(offset) as *mut u32) };
        Ok(word
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "munmap of physical window failed"
            );
        }
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 0x1000 }
}
