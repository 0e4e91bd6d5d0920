//! POSIX shared-memory mapping (`shm_open` + `ftruncate` + `mmap`).
//!
//! ## Safety contracts
//!
//! All `unsafe` blocks in this module rely on these guarantees:
//! 1. `addr` comes from a successful `mmap` of exactly `len` bytes and stays valid
//!    until `unmap` runs (at most once, tracked by `mapped`)
//! 2. `len` is never zero (mmap rejects it; checked before mapping)
//! 3. Copies never exceed `len` (checked before every copy)
//!
//! Other processes may write the same pages at any time. Callers coordinate access
//! out of band; this layer only guarantees it stays inside the mapping.

use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::off_t;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

pub struct MappedSegment {
    #[allow(dead_code)] // Descriptor stays open as long as the mapping
    file: File,
    addr: NonNull<c_void>,
    len: usize,
    writable: bool,
    mapped: bool,
}

// Safety: the mapping is process-wide memory owned by this value; nothing ties it
// to the creating thread.
unsafe impl Send for MappedSegment {}

impl MappedSegment {
    /// Create a new segment, replacing an abandoned one left under the same name.
    pub fn create(name: &str, mode: Mode, size: usize) -> Result<Self, Errno> {
        let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
        let flags = OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_EXCL;

        let fd = match shm_open(name, flags, mode) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                tracing::debug!(name, "Shared memory is abandoned, replacing");
                shm_unlink(name)?;
                shm_open(name, flags, mode)?
            }
            Err(e) => return Err(e),
        };

        let sized = off_t::try_from(size)
            .map_err(|_| Errno::EFBIG)
            .and_then(|size| ftruncate(&fd, size));
        let mapped = sized.and_then(|()| Self::map(File::from(fd), len, true));

        if mapped.is_err() {
            // Don't leave a half-initialized name behind.
            let _ = shm_unlink(name);
        }
        mapped
    }

    /// Attach to an existing segment of at least `size` bytes.
    ///
    /// Asks for read-write access first and falls back to a read-only mapping.
    pub fn open(name: &str, size: usize) -> Result<Self, Errno> {
        let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;

        let (fd, writable) = match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => (fd, true),
            Err(Errno::EACCES) => (shm_open(name, OFlag::O_RDONLY, Mode::empty())?, false),
            Err(e) => return Err(e),
        };

        let file = File::from(fd);
        let actual = file
            .metadata()
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(0)))?
            .len();
        if actual < size as u64 {
            tracing::debug!(name, actual, requested = size, "Existing segment is too small");
            return Err(Errno::EINVAL);
        }

        Self::map(file, len, writable)
    }

    fn map(file: File, len: NonZeroUsize, writable: bool) -> Result<Self, Errno> {
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };

        // Safety: fresh mapping with no address hint; the kernel validates fd and length.
        let addr = unsafe { mmap(None, len, prot, MapFlags::MAP_SHARED, &file, 0)? };

        Ok(Self {
            file,
            addr,
            len: len.get(),
            writable,
            mapped: true,
        })
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Copy `data` to offset 0.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Errno> {
        if !self.writable {
            return Err(Errno::EACCES);
        }
        if data.len() > self.len {
            return Err(Errno::EFBIG);
        }
        // Safety: mapping is live, writable, and at least data.len() bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr.as_ptr().cast::<u8>(), data.len());
        }
        Ok(())
    }

    /// Fill `out` from offset 0.
    pub fn read(&self, out: &mut [u8]) -> Result<(), Errno> {
        if out.len() > self.len {
            return Err(Errno::EFBIG);
        }
        // Safety: mapping is live and at least out.len() bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.as_ptr().cast::<u8>(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn unmap(&mut self) -> Result<(), Errno> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        // Safety: addr/len are exactly what mmap returned, and `mapped` guards double unmap.
        unsafe { munmap(self.addr, self.len) }
    }

    /// Unmap and close the descriptor. The name stays in the namespace.
    pub fn close(mut self) -> Result<(), Errno> {
        self.unmap()
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            tracing::warn!(error = %e, "Failed to unmap shared memory");
        }
    }
}

pub fn unlink(name: &str) -> Result<(), Errno> {
    shm_unlink(name)
}
