//! Buffer allocation and format negotiation
//!
//! An [`Allocator`] hands out [`Buffer`](crate::buffer::Buffer)s with
//! declared access capabilities. Outputs draw their back buffers from a
//! [`Swapchain`] over an allocator; cursors and blank frames come from the
//! dumb-buffer allocator; nested backends use shared memory.

pub mod dmabuf;
#[cfg(feature = "backend_drm")]
pub mod dumb;
pub mod format;
#[cfg(feature = "backend_gbm")]
pub mod gbm;
pub mod shm;

mod swapchain;
pub use swapchain::{Slot, Swapchain, SLOT_CAP};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};
pub use format::FormatSet;

use crate::buffer::{Buffer, BufferCaps};

/// Errors an allocator can produce
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// The underlying io operation failed
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// The allocator cannot produce buffers of this format
    #[error("Format {0:?} is not supported by this allocator")]
    UnsupportedFormat(Format),
    /// The buffer could not be exported in the requested representation
    #[error("Failed to export buffer: {0}")]
    Export(String),
}

/// Common interface for buffer allocation
pub trait Allocator {
    /// Try to create a buffer with the given dimensions, fourcc and one of
    /// the given layout modifiers.
    ///
    /// An empty modifier list leaves the layout to the allocator.
    fn alloc_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocatorError>;

    /// The access capabilities of the buffers this allocator produces
    fn buffer_caps(&self) -> BufferCaps;
}

impl Allocator for Box<dyn Allocator> {
    fn alloc_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocatorError> {
        (**self).alloc_buffer(width, height, fourcc, modifiers)
    }

    fn buffer_caps(&self) -> BufferCaps {
        (**self).buffer_caps()
    }
}
