//! Buffer allocation through [libgbm](gbm)
//!
//! The [`GbmAllocator`] produces dmabuf-backed buffers suitable for GPU
//! rendering and KMS scan-out.

use std::os::unix::io::{AsFd, BorrowedFd};

use tracing::instrument;

pub use gbm::{BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};

use super::{dmabuf::DmabufFlags, Allocator, AllocatorError, Format, Fourcc, Modifier};
use crate::buffer::{Buffer, BufferCaps, BufferSource};
use crate::utils::Size;

/// Light wrapper around a [`GbmDevice`] implementing the [`Allocator`] trait
#[derive(Debug)]
pub struct GbmAllocator<A: AsFd + 'static> {
    device: GbmDevice<A>,
    default_flags: GbmBufferFlags,
}

impl<A: AsFd + 'static> AsRef<GbmDevice<A>> for GbmAllocator<A> {
    fn as_ref(&self) -> &GbmDevice<A> {
        &self.device
    }
}

impl<A: AsFd + 'static> AsFd for GbmAllocator<A> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

impl<A: AsFd + 'static> GbmAllocator<A> {
    /// Create a new allocator with the usage flags applied to every
    /// [`Allocator::alloc_buffer`] call.
    pub fn new(device: GbmDevice<A>, default_flags: GbmBufferFlags) -> GbmAllocator<A> {
        GbmAllocator {
            device,
            default_flags,
        }
    }

    /// Alternative to [`Allocator::alloc_buffer`] for one-off buffers with
    /// different usage flags.
    #[instrument(level = "trace", skip(self))]
    #[profiling::function]
    pub fn alloc_buffer_with_flags(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
        flags: GbmBufferFlags,
    ) -> Result<Buffer, AllocatorError> {
        let bo = if modifiers.is_empty()
            || modifiers.contains(&Modifier::Invalid)
            || modifiers.contains(&Modifier::Linear)
        {
            // implicit layout requested, or the driver may not support
            // explicit modifiers at all
            match self
                .device
                .create_buffer_object_with_modifiers::<()>(width, height, fourcc, modifiers.iter().copied())
            {
                Ok(bo) => bo,
                Err(_) => self
                    .device
                    .create_buffer_object::<()>(width, height, fourcc, flags)
                    .map_err(AllocatorError::Io)?,
            }
        } else {
            self.device
                .create_buffer_object_with_modifiers::<()>(width, height, fourcc, modifiers.iter().copied())
                .map_err(AllocatorError::Io)?
        };

        let plane_count = bo.plane_count().map_err(|err| AllocatorError::Export(err.to_string()))?;
        let modifier = bo
            .modifier()
            .map_err(|err| AllocatorError::Export(err.to_string()))?;

        let size = Size::from((width as i32, height as i32));
        let mut builder = super::dmabuf::Dmabuf::builder(
            size,
            fourcc,
            modifier,
            DmabufFlags::empty(),
        );
        for idx in 0..plane_count as i32 {
            let fd = bo.fd().map_err(|err| AllocatorError::Export(err.to_string()))?;
            let offset = bo
                .offset(idx)
                .map_err(|err| AllocatorError::Export(err.to_string()))?;
            let stride = bo
                .stride_for_plane(idx)
                .map_err(|err| AllocatorError::Export(err.to_string()))?;
            builder.add_plane(fd, offset, stride);
        }
        let dmabuf = builder
            .build()
            .ok_or_else(|| AllocatorError::Export("buffer with zero planes".into()))?;

        let buffer = Buffer::new(size, BufferSource::Dmabuf(dmabuf));
        // the bo must outlive the exported planes for tiled layouts, where
        // auxiliary state lives in the driver
        buffer.with_addons(|addons| addons.insert(bo));

        Ok(buffer)
    }

    fn effective_format(fourcc: Fourcc, modifier: Modifier) -> Format {
        Format {
            code: fourcc,
            modifier,
        }
    }
}

impl<A: AsFd + 'static> Allocator for GbmAllocator<A> {
    #[profiling::function]
    fn alloc_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocatorError> {
        let flags = self.default_flags;
        self.alloc_buffer_with_flags(width, height, fourcc, modifiers, flags)
            .map_err(|err| match err {
                AllocatorError::Io(io) if io.kind() == std::io::ErrorKind::InvalidInput => {
                    AllocatorError::UnsupportedFormat(Self::effective_format(
                        fourcc,
                        modifiers.first().copied().unwrap_or(Modifier::Invalid),
                    ))
                }
                other => other,
            })
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }
}
