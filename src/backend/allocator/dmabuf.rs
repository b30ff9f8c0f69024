//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! A dmabuf describes GPU-visible memory as one file descriptor per plane
//! together with an explicit fourcc format and layout modifier. Dmabufs are
//! the interchange currency between allocators, renderers and KMS planes.

use std::{
    fmt,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
    sync::{Arc, Weak},
};

use super::{Format, Fourcc, Modifier};
use crate::utils::{BufferCoords, Size};

/// Maximum number of planes a dmabuf can carry
pub const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Possible flags for a dmabuf
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmabufFlags: u32 {
        /// The buffer content is y-inverted
        const Y_INVERT = 1 << 0;
        /// The buffer content is interlaced
        const INTERLACED = 1 << 1;
        /// The buffer content's fields are in bottom-first order
        const BOTTOM_FIRST = 1 << 2;
    }
}

#[derive(Debug)]
struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
}

#[derive(Debug)]
struct DmabufInternal {
    planes: Vec<Plane>,
    size: Size<i32, BufferCoords>,
    format: Format,
    flags: DmabufFlags,
}

/// Strong handle to a dmabuf
#[derive(Clone)]
pub struct Dmabuf(Arc<DmabufInternal>);

/// Weak handle to a dmabuf
#[derive(Clone)]
pub struct WeakDmabuf(Weak<DmabufInternal>);

/// Builder for a [`Dmabuf`]
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the constructed dmabuf
    ///
    /// Returns `false` (and drops the fd) if the dmabuf already holds
    /// [`MAX_PLANES`] planes.
    pub fn add_plane(&mut self, fd: OwnedFd, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane { fd, offset, stride });
        true
    }

    /// Finish the construction
    ///
    /// Returns `None` if no planes were added.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }
        self.internal.planes.shrink_to_fit();
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new dmabuf by initializing with values from an existing buffer
    pub fn builder_from_buffer(src: &crate::buffer::Buffer, format: Format, flags: DmabufFlags) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                size: src.size(),
                format,
                flags,
            },
        }
    }

    /// Create a new dmabuf builder
    pub fn builder(
        size: impl Into<Size<i32, BufferCoords>>,
        fourcc: Fourcc,
        modifier: Modifier,
        flags: DmabufFlags,
    ) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                size: size.into(),
                format: Format {
                    code: fourcc,
                    modifier,
                },
                flags,
            },
        }
    }

    /// Width of this dmabuf in pixels
    pub fn width(&self) -> u32 {
        self.0.size.w as u32
    }

    /// Height of this dmabuf in pixels
    pub fn height(&self) -> u32 {
        self.0.size.h as u32
    }

    /// Size of this dmabuf in pixels
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.0.size
    }

    /// Format of this dmabuf
    pub fn format(&self) -> Format {
        self.0.format
    }

    /// The extra flags of this dmabuf
    pub fn flags(&self) -> DmabufFlags {
        self.0.flags
    }

    /// Number of planes of this dmabuf
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Borrowed file descriptors of the planes
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.0.planes.iter().map(|plane| plane.fd.as_fd())
    }

    /// Offsets of the planes
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|plane| plane.offset)
    }

    /// Strides of the planes
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|plane| plane.stride)
    }

    /// Returns true if the layout of the buffer is described by an explicit modifier
    pub fn has_modifier(&self) -> bool {
        self.0.format.modifier != Modifier::Invalid
    }

    /// Create a weak handle to this dmabuf
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }

    /// Map the first plane into process memory
    ///
    /// Only sensible for linear single-plane buffers; tiled layouts read
    /// back garbage.
    pub fn map_plane(&self, plane: usize, len: usize, mode: DmabufMappingMode) -> std::io::Result<DmabufMapping> {
        let fd = self
            .0
            .planes
            .get(plane)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?
            .fd
            .as_fd();

        let (prot, flags) = match mode {
            DmabufMappingMode::Read => (rustix::mm::ProtFlags::READ, rustix::mm::MapFlags::SHARED),
            DmabufMappingMode::ReadWrite => (
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::SHARED,
            ),
        };

        let ptr = unsafe { rustix::mm::mmap(std::ptr::null_mut(), len, prot, flags, fd, 0) }
            .map_err(std::io::Error::from)?;

        Ok(DmabufMapping {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
        })
    }

    /// Export a sync file describing the pending accesses of this dmabuf
    pub fn export_sync_file(&self, flags: SyncFlags) -> std::io::Result<OwnedFd> {
        use std::os::unix::io::FromRawFd;

        let mut data = dma_buf_sync_file {
            flags: flags.bits(),
            fd: -1,
        };
        let fd = self.0.planes[0].fd.as_raw_fd();
        // SAFETY: fd is a valid dmabuf, data matches the kernel struct
        let ret = unsafe { libc::ioctl(fd, DMA_BUF_IOCTL_EXPORT_SYNC_FILE, &mut data) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd) })
    }

    /// Import a sync file as the pending access of this dmabuf
    pub fn import_sync_file(&self, sync_file: BorrowedFd<'_>, flags: SyncFlags) -> std::io::Result<()> {
        let data = dma_buf_sync_file {
            flags: flags.bits(),
            fd: sync_file.as_raw_fd(),
        };
        for plane in &self.0.planes {
            // SAFETY: fd is a valid dmabuf, data matches the kernel struct
            let ret = unsafe { libc::ioctl(plane.fd.as_raw_fd(), DMA_BUF_IOCTL_IMPORT_SYNC_FILE, &data) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl WeakDmabuf {
    /// Try to upgrade to a strong handle
    ///
    /// Fails if no strong handles exist anymore and the fds were closed.
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }
}

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl PartialEq for WeakDmabuf {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Dmabuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dmabuf")
            .field("size", &self.0.size)
            .field("format", &self.0.format)
            .field("planes", &self.0.planes.len())
            .finish()
    }
}

impl fmt::Debug for WeakDmabuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakDmabuf { .. }")
    }
}

/// How a dmabuf plane mapping will be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmabufMappingMode {
    /// Read-only access
    Read,
    /// Read and write access
    ReadWrite,
}

/// A memory mapping of a dmabuf plane
#[derive(Debug)]
pub struct DmabufMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl DmabufMapping {
    /// Pointer to the mapped memory
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
}

impl Drop for DmabufMapping {
    fn drop(&mut self) {
        let _ = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

bitflags::bitflags! {
    /// Access directions covered by a sync-file transfer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        /// Read accesses
        const READ = 1 << 0;
        /// Write accesses
        const WRITE = 1 << 1;
    }
}

#[repr(C)]
struct dma_buf_sync_file {
    flags: u32,
    fd: i32,
}

const fn _ioc(dir: libc::c_ulong, ty: libc::c_ulong, nr: libc::c_ulong, size: libc::c_ulong) -> libc::c_ulong {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

const DMA_BUF_IOCTL_EXPORT_SYNC_FILE: libc::c_ulong =
    _ioc(3, b'b' as libc::c_ulong, 2, std::mem::size_of::<dma_buf_sync_file>() as libc::c_ulong);
const DMA_BUF_IOCTL_IMPORT_SYNC_FILE: libc::c_ulong =
    _ioc(1, b'b' as libc::c_ulong, 3, std::mem::size_of::<dma_buf_sync_file>() as libc::c_ulong);
