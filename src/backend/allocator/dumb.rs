//! Module for [DumbBuffer](https://docs.kernel.org/gpu/drm-kms.html#dumb-buffer-objects) buffers
//!
//! Dumb buffers are linear, CPU-mappable kernel buffers. They are slow to
//! draw to but universally supported, which makes them the allocator of
//! choice for cursor planes and for the blank frames used to light up an
//! output before the first real content arrives.

use std::os::unix::io::AsRawFd;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;

use super::{format::get_bpp, Allocator, AllocatorError, Format, Fourcc, Modifier};
use crate::backend::drm::DrmDeviceFd;
use crate::buffer::{Buffer, BufferCaps, BufferSource};
use crate::utils::Size;

use super::{dmabuf::DmabufFlags, shm::ShmMapping};

/// Allocator for kernel dumb buffers on a DRM device
#[derive(Debug, Clone)]
pub struct DumbAllocator {
    fd: DrmDeviceFd,
}

impl DumbAllocator {
    /// Create a new allocator for the given device
    pub fn new(fd: DrmDeviceFd) -> DumbAllocator {
        DumbAllocator { fd }
    }
}

/// Keeps the kernel handle alive for as long as the [`Buffer`] exists.
struct DumbHandle {
    fd: DrmDeviceFd,
    handle: drm::control::dumbbuffer::DumbBuffer,
}

impl Drop for DumbHandle {
    fn drop(&mut self) {
        let _ = self.fd.destroy_dumb_buffer(self.handle);
    }
}

impl Allocator for DumbAllocator {
    fn alloc_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocatorError> {
        // dumb buffers are always linear
        if !modifiers.is_empty()
            && modifiers
                .iter()
                .all(|&modifier| modifier != Modifier::Invalid && modifier != Modifier::Linear)
        {
            return Err(AllocatorError::UnsupportedFormat(Format {
                code: fourcc,
                modifier: modifiers[0],
            }));
        }

        let bpp = get_bpp(fourcc).ok_or(AllocatorError::UnsupportedFormat(Format {
            code: fourcc,
            modifier: Modifier::Linear,
        }))? as u32;

        let handle = self
            .fd
            .create_dumb_buffer((width, height), fourcc, bpp)
            .map_err(|err| AllocatorError::Io(err.into()))?;
        let stride = handle.pitch();

        let prime_fd = self
            .fd
            .buffer_to_prime_fd(handle.handle(), libc::O_CLOEXEC | libc::O_RDWR)
            .map_err(|err| {
                let _ = self.fd.destroy_dumb_buffer(handle);
                AllocatorError::Io(err.into())
            })?;

        let size = Size::from((width as i32, height as i32));
        let mut builder = crate::backend::allocator::dmabuf::Dmabuf::builder(
            size,
            fourcc,
            Modifier::Linear,
            DmabufFlags::empty(),
        );
        builder.add_plane(
            prime_fd.try_clone().map_err(|err| {
                let _ = self.fd.destroy_dumb_buffer(handle);
                AllocatorError::Io(err)
            })?,
            0,
            stride,
        );
        let dmabuf = builder.build().expect("dumb buffer has one plane");

        let mapping = ShmMapping::from_fd(prime_fd, size, stride, fourcc).map_err(|err| {
            let _ = self.fd.destroy_dumb_buffer(handle);
            AllocatorError::Io(err)
        })?;

        let buffer = Buffer::new(size, BufferSource::DmabufAndShm(dmabuf, mapping));
        // destroyed together with the buffer storage
        buffer.with_addons(|addons| {
            addons.insert(DumbHandle {
                fd: self.fd.clone(),
                handle,
            })
        });

        Ok(buffer)
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF | BufferCaps::DATA_PTR
    }
}

impl std::fmt::Debug for DumbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumbHandle")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}
