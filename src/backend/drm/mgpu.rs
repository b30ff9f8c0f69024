//! Multi-GPU support
//!
//! Buffers rendered on the primary GPU are generally not scan-out capable
//! on a secondary GPU. Each secondary DRM backend therefore owns a small
//! blit context: frames are copied into secondary-local buffers before the
//! commit. The format set advertised for secondary outputs is the
//! intersection of both sides with implicit modifiers removed, since an
//! implicit layout negotiated on one GPU means nothing on another.

use tracing::{debug, trace};

use crate::backend::allocator::{Allocator, FormatSet, Fourcc, Modifier, Swapchain};
#[cfg(feature = "backend_gbm")]
use crate::backend::allocator::gbm::{GbmAllocator, GbmBufferFlags, GbmDevice};
use crate::backend::renderer::{
    BlendMode, FilterMode, PassOptions, Renderer, TextureArgs,
};
use crate::buffer::Buffer;
use crate::utils::Rectangle;

use super::{error::DrmError, DrmDeviceFd};

/// Blit context of one secondary GPU
pub(crate) struct MgpuContext {
    fd: DrmDeviceFd,
    renderer: Box<dyn Renderer>,
    swapchain: Option<Swapchain<Box<dyn Allocator>>>,
}

impl std::fmt::Debug for MgpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgpuContext")
            .field("swapchain", &self.swapchain.is_some())
            .finish()
    }
}

fn scanout_allocator(fd: &DrmDeviceFd) -> Result<Box<dyn Allocator>, DrmError> {
    #[cfg(feature = "backend_gbm")]
    {
        let device = GbmDevice::new(fd.clone()).map_err(|source| DrmError::Access {
            errmsg: "open gbm device",
            source,
        })?;
        Ok(Box::new(GbmAllocator::new(
            device,
            GbmBufferFlags::SCANOUT | GbmBufferFlags::LINEAR,
        )))
    }
    #[cfg(not(feature = "backend_gbm"))]
    {
        Ok(Box::new(crate::backend::allocator::dumb::DumbAllocator::new(fd.clone())))
    }
}

impl MgpuContext {
    /// Create the blit context for a secondary device
    pub(crate) fn new(fd: DrmDeviceFd) -> Result<MgpuContext, DrmError> {
        // make sure the device can take an allocator before committing to it
        let _probe = scanout_allocator(&fd)?;

        let renderer: Box<dyn Renderer> =
            Box::new(crate::backend::renderer::pixman::PixmanRenderer::new());

        Ok(MgpuContext {
            fd,
            renderer,
            swapchain: None,
        })
    }

    /// Scan-out formats to advertise for a secondary output
    pub(crate) fn scanout_formats(&self, display: &FormatSet) -> FormatSet {
        display
            .intersect(self.renderer.render_formats())
            .remove_implicit()
    }

    /// Copy a primary-GPU frame into a secondary-local buffer
    pub(crate) fn import_frame(
        &mut self,
        source: &Buffer,
        display_formats: &FormatSet,
    ) -> Result<Buffer, DrmError> {
        let width = source.width() as u32;
        let height = source.height() as u32;

        let fourcc = self
            .scanout_formats(display_formats)
            .fourccs()
            .next()
            .or_else(|| display_formats.has(Fourcc::Xrgb8888).then_some(Fourcc::Xrgb8888))
            .ok_or(DrmError::UnsupportedBuffer)?;

        let needs_new = match &self.swapchain {
            Some(chain) => chain.size() != (width, height) || chain.format() != fourcc,
            None => true,
        };
        if needs_new {
            debug!("Creating secondary-GPU swapchain {}x{} {:?}", width, height, fourcc);
            self.swapchain = Some(Swapchain::new(
                scanout_allocator(&self.fd)?,
                width,
                height,
                fourcc,
                vec![Modifier::Linear],
            ));
        }

        let chain = self.swapchain.as_mut().expect("created above");
        let slot = chain
            .acquire()
            .map_err(|_| DrmError::UnsupportedBuffer)?
            .ok_or(DrmError::UnsupportedBuffer)?;
        let target = slot.buffer();

        trace!("Blitting {}x{} frame across GPUs", width, height);
        let texture = self
            .renderer
            .texture_from_buffer(source)
            .map_err(|_| DrmError::UnsupportedBuffer)?;
        let mut pass = self
            .renderer
            .begin_buffer_pass(&target, &PassOptions::default())
            .map_err(|_| DrmError::UnsupportedBuffer)?;
        pass.add_texture(TextureArgs {
            texture: texture.as_ref(),
            src: Default::default(),
            dst: Rectangle::from_size((width as i32, height as i32).into()),
            transform: Default::default(),
            clip: None,
            filter: FilterMode::Nearest,
            blend: BlendMode::None,
            alpha: 1.0,
        });
        pass.submit().map_err(|_| DrmError::UnsupportedBuffer)?;

        chain.submitted(&slot);
        Ok(target)
    }
}
