//! Shared-memory buffers
//!
//! CPU-visible buffers backed by an anonymous memfd. These serve the
//! software renderer and the nested backends, which hand the memory to the
//! host display server.

use std::{fmt, os::unix::io::{AsFd, BorrowedFd, OwnedFd}, ptr::NonNull};

use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};

use super::{format::get_bpp, Allocator, AllocatorError, Format, Fourcc, Modifier};
use crate::buffer::{Buffer, BufferCaps, BufferSource};
use crate::utils::{BufferCoords, Size};

/// A CPU mapping of buffer memory
pub struct ShmMapping {
    ptr: NonNull<u8>,
    len: usize,
    stride: u32,
    format: Fourcc,
    size: Size<i32, BufferCoords>,
    _fd: OwnedFd,
}

impl ShmMapping {
    /// Allocate a new mapping of `height * stride` bytes
    pub fn new(size: Size<i32, BufferCoords>, stride: u32, format: Fourcc) -> std::io::Result<ShmMapping> {
        let len = stride as usize * size.h as usize;
        let fd = rustix::fs::memfd_create("waylight-shm", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
            .map_err(std::io::Error::from)?;
        rustix::fs::ftruncate(&fd, len as u64).map_err(std::io::Error::from)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(std::io::Error::from)?;

        Ok(ShmMapping {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
            stride,
            format,
            size,
            _fd: fd,
        })
    }

    /// Map an existing fd instead of allocating a new memfd
    ///
    /// Used for buffers whose memory is owned elsewhere (prime fds of dumb
    /// buffers, host-provided pools).
    pub fn from_fd(
        fd: OwnedFd,
        size: Size<i32, BufferCoords>,
        stride: u32,
        format: Fourcc,
    ) -> std::io::Result<ShmMapping> {
        let len = stride as usize * size.h as usize;
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(std::io::Error::from)?;

        Ok(ShmMapping {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
            stride,
            format,
            size,
            _fd: fd,
        })
    }

    /// The fd backing this mapping, for sharing with a host display server
    pub fn fd(&self) -> BorrowedFd<'_> {
        self._fd.as_fd()
    }

    /// Bytes per row
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Fourcc of the stored pixels
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Size in pixels
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    /// Pointer to the first byte of the mapping
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes
    ///
    /// # Safety
    ///
    /// The caller must not hold a mutable slice of the same mapping.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// The mapped bytes, mutably
    ///
    /// # Safety
    ///
    /// The caller must not hold any other slice of the same mapping.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        let _ = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

impl fmt::Debug for ShmMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmMapping")
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}

/// Allocator for CPU-visible shared-memory buffers
#[derive(Debug, Default)]
pub struct ShmAllocator;

impl ShmAllocator {
    /// Create a new allocator
    pub fn new() -> ShmAllocator {
        ShmAllocator
    }
}

impl Allocator for ShmAllocator {
    fn alloc_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocatorError> {
        if !modifiers.is_empty()
            && !modifiers.contains(&Modifier::Linear)
            && !modifiers.contains(&Modifier::Invalid)
        {
            return Err(AllocatorError::UnsupportedFormat(Format {
                code: fourcc,
                modifier: modifiers[0],
            }));
        }
        let bpp = get_bpp(fourcc).ok_or(AllocatorError::UnsupportedFormat(Format {
            code: fourcc,
            modifier: Modifier::Linear,
        }))?;
        let stride = width * (bpp / 8) as u32;
        let size = Size::from((width as i32, height as i32));
        let mapping = ShmMapping::new(size, stride, fourcc)?;
        Ok(Buffer::new(size, BufferSource::Shm(mapping)))
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DATA_PTR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_mappable_buffer() {
        let mut allocator = ShmAllocator::new();
        let buffer = allocator
            .alloc_buffer(64, 32, Fourcc::Argb8888, &[Modifier::Linear])
            .unwrap();
        assert_eq!(buffer.width(), 64);
        assert_eq!(buffer.height(), 32);
        assert!(buffer.caps().contains(BufferCaps::DATA_PTR));
        buffer
            .with_shm(|shm| {
                assert_eq!(shm.stride(), 64 * 4);
                assert_eq!(shm.len(), 64 * 4 * 32);
            })
            .unwrap();
    }

    #[test]
    fn refuses_tiled_modifiers() {
        let mut allocator = ShmAllocator::new();
        let result = allocator.alloc_buffer(8, 8, Fourcc::Argb8888, &[Modifier::I915_x_tiled]);
        assert!(result.is_err());
    }
}
