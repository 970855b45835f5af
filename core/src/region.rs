// Copyright (C) 2019  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Memory shared between a client and the switch.

use std::{fmt, fs, io, os::unix::io::AsRawFd as _, ptr::NonNull};

/// Alignment guaranteed for the start of every region.
pub const REGION_ALIGNMENT: usize = 8;

/// Contiguous range of memory that might be accessed concurrently by somebody else.
///
/// The content is never accessed through references by this type. All accesses go through raw
/// pointers, and the code in [`crate::ring`] only uses atomic operations for the fields that the
/// other side can modify.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

enum Backing {
    /// Memory allocated by us. The `Vec` is never touched after creation and only keeps the
    /// allocation alive.
    Heap(#[allow(dead_code)] Vec<u64>),
    /// Mapping created with `mmap`, unmapped on drop.
    Mapped,
    /// Memory owned by somebody else.
    Borrowed,
}

// The region is only ever accessed through raw pointers with the appropriate atomic operations.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a zero-filled region on the heap.
    pub fn zeroed(len: usize) -> SharedRegion {
        let words = (len + 7) / 8;
        let mut storage = vec![0u64; words.max(1)];
        let ptr = NonNull::new(storage.as_mut_ptr() as *mut u8).unwrap_or_else(NonNull::dangling);
        SharedRegion {
            ptr,
            len,
            backing: Backing::Heap(storage),
        }
    }

    /// Maps the first `len` bytes of `file`, shared and writable.
    ///
    /// The file must be at least `len` bytes long.
    pub fn map(file: &fs::File, len: usize) -> io::Result<SharedRegion> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"));
        }

        // SAFETY: We request a fresh shared mapping of a file descriptor we own for the duration
        // of the call. The result is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = match NonNull::new(ptr as *mut u8) {
            Some(p) => p,
            None => return Err(io::Error::new(io::ErrorKind::Other, "mmap returned null")),
        };

        log::trace!("mapped {} bytes at {:p}", len, ptr);
        Ok(SharedRegion {
            ptr,
            len,
            backing: Backing::Mapped,
        })
    }

    /// Wraps memory owned by somebody else.
    ///
    /// Returns `None` if `ptr` is null or not properly aligned.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes for `len` bytes for as long as the region
    /// is alive.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<SharedRegion> {
        let ptr = NonNull::new(ptr)?;
        if (ptr.as_ptr() as usize) % REGION_ALIGNMENT != 0 {
            return None;
        }
        Some(SharedRegion {
            ptr,
            len,
            backing: Backing::Borrowed,
        })
    }

    /// Address of the first byte of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region was created by [`SharedRegion::map`].
    pub fn is_mapped(&self) -> bool {
        match self.backing {
            Backing::Mapped => true,
            Backing::Heap(_) | Backing::Borrowed => false,
        }
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.backing {
            Backing::Heap(_) => "heap",
            Backing::Mapped => "mapped",
            Backing::Borrowed => "borrowed",
        };
        f.debug_struct("SharedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("kind", &kind)
            .finish()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Mapped = self.backing {
            // SAFETY: The pointer and length are the ones passed to and returned by `mmap`, and
            // the mapping is unmapped exactly once.
            let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
            if ret != 0 {
                log::warn!("munmap failed: {}", io::Error::last_os_error());
            }
        }
    }
}
