//! Software rendering through pixman
//!
//! The pixman renderer draws into any buffer whose memory the CPU can see:
//! shared-memory buffers directly, dmabufs through a linear mapping. It is
//! the renderer of the headless and nested paths and the reference against
//! which scan-out output is compared in tests.

use std::{any::Any, cell::RefCell, os::unix::io::BorrowedFd};

use pixman::{Filter, FormatCode, Image, Operation, Repeat};
use tracing::{info_span, warn};

use crate::backend::allocator::{
    dmabuf::{DmabufMapping, DmabufMappingMode},
    format::has_alpha,
    Format, FormatSet, Fourcc, Modifier,
};
use crate::buffer::{Buffer, BufferLock};
use crate::utils::{signal::Signal, Physical, Rectangle, Region, Size, Transform};

use super::{
    BlendMode, Color, FilterMode, PassOptions, RectArgs, RenderPass, Renderer, RendererError, Texture,
    TextureArgs,
};

const SUPPORTED_FORMATS: &[Fourcc] = &[
    #[cfg(target_endian = "little")]
    Fourcc::Rgb565,
    Fourcc::Xrgb8888,
    Fourcc::Argb8888,
    Fourcc::Xbgr8888,
    Fourcc::Abgr8888,
    Fourcc::Rgbx8888,
    Fourcc::Rgba8888,
    Fourcc::Bgrx8888,
    Fourcc::Bgra8888,
    #[cfg(target_endian = "little")]
    Fourcc::Xrgb2101010,
    #[cfg(target_endian = "little")]
    Fourcc::Argb2101010,
    #[cfg(target_endian = "little")]
    Fourcc::Xbgr2101010,
    #[cfg(target_endian = "little")]
    Fourcc::Abgr2101010,
];

/// A renderer drawing with the CPU via pixman
#[derive(Debug)]
pub struct PixmanRenderer {
    render_formats: FormatSet,
    dmabuf_formats: FormatSet,
    shm_formats: Vec<Fourcc>,
    lost: Signal<()>,
    span: tracing::Span,
}

impl PixmanRenderer {
    /// Create a new pixman renderer
    pub fn new() -> PixmanRenderer {
        let span = info_span!("renderer_pixman");
        let formats: FormatSet = SUPPORTED_FORMATS
            .iter()
            .flat_map(|&code| {
                [
                    Format {
                        code,
                        modifier: Modifier::Linear,
                    },
                    Format {
                        code,
                        modifier: Modifier::Invalid,
                    },
                ]
            })
            .collect();

        PixmanRenderer {
            render_formats: formats.clone(),
            dmabuf_formats: formats,
            shm_formats: SUPPORTED_FORMATS.to_vec(),
            lost: Signal::new(),
            span,
        }
    }

    fn target_image(&self, buffer: &Buffer) -> Result<(Image<'static, 'static>, Option<DmabufMapping>), RendererError> {
        if let Some(image) = buffer.with_shm(|shm| {
            let code = FormatCode::try_from(shm.format())
                .map_err(|_| RendererError::UnsupportedFormat(shm.format()))?;
            // SAFETY: the mapping outlives the image; the pass holds a lock
            unsafe {
                Image::from_raw_mut(
                    code,
                    shm.size().w as usize,
                    shm.size().h as usize,
                    shm.ptr().as_ptr() as *mut u32,
                    shm.stride() as usize,
                    false,
                )
            }
            .map_err(|_| RendererError::UnsupportedTarget)
        }) {
            return image.map(|image| (image, None));
        }

        let Some(dmabuf) = buffer.dmabuf() else {
            return Err(RendererError::UnsupportedTarget);
        };
        if dmabuf.format().modifier != Modifier::Linear && dmabuf.format().modifier != Modifier::Invalid {
            return Err(RendererError::UnsupportedTarget);
        }
        let code = FormatCode::try_from(dmabuf.format().code)
            .map_err(|_| RendererError::UnsupportedFormat(dmabuf.format().code))?;
        let stride = dmabuf.strides().next().expect("dmabuf without planes");
        let len = stride as usize * dmabuf.height() as usize;
        let mapping = dmabuf
            .map_plane(0, len, DmabufMappingMode::ReadWrite)
            .map_err(RendererError::Io)?;
        // SAFETY: the mapping is stored next to the image and dropped after it
        let image = unsafe {
            Image::from_raw_mut(
                code,
                dmabuf.width() as usize,
                dmabuf.height() as usize,
                mapping.ptr().as_ptr() as *mut u32,
                stride as usize,
                false,
            )
        }
        .map_err(|_| RendererError::UnsupportedTarget)?;
        Ok((image, Some(mapping)))
    }
}

impl Default for PixmanRenderer {
    fn default() -> Self {
        PixmanRenderer::new()
    }
}

impl Renderer for PixmanRenderer {
    #[profiling::function]
    fn begin_buffer_pass(
        &mut self,
        buffer: &Buffer,
        _options: &PassOptions,
    ) -> Result<Box<dyn RenderPass>, RendererError> {
        let _guard = self.span.enter();
        let (image, mapping) = self.target_image(buffer)?;
        let size = Size::from((image.width() as i32, image.height() as i32));
        Ok(Box::new(PixmanPass {
            image,
            _mapping: mapping,
            _lock: buffer.lock(),
            size,
            failed: None,
        }))
    }

    fn render_formats(&self) -> &FormatSet {
        &self.render_formats
    }

    fn dmabuf_texture_formats(&self) -> &FormatSet {
        &self.dmabuf_formats
    }

    fn shm_texture_formats(&self) -> &[Fourcc] {
        &self.shm_formats
    }

    fn drm_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn texture_from_buffer(&mut self, buffer: &Buffer) -> Result<Box<dyn Texture>, RendererError> {
        let (image, mapping) = self.target_image(buffer)?;
        Ok(Box::new(PixmanTexture {
            image: RefCell::new(image),
            _mapping: mapping,
            _lock: buffer.lock(),
        }))
    }

    fn lost_signal(&self) -> Signal<()> {
        self.lost.clone()
    }
}

/// A buffer imported into the pixman renderer
pub struct PixmanTexture {
    image: RefCell<Image<'static, 'static>>,
    _mapping: Option<DmabufMapping>,
    _lock: BufferLock,
}

impl Texture for PixmanTexture {
    fn width(&self) -> u32 {
        self.image.borrow().width() as u32
    }

    fn height(&self) -> u32 {
        self.image.borrow().height() as u32
    }

    fn format(&self) -> Option<Fourcc> {
        Fourcc::try_from(self.image.borrow().format()).ok()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for PixmanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixmanTexture")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

struct PixmanPass {
    image: Image<'static, 'static>,
    _mapping: Option<DmabufMapping>,
    _lock: BufferLock,
    size: Size<i32, Physical>,
    failed: Option<RendererError>,
}

impl PixmanPass {
    fn clip_region(&self, dst: Rectangle<i32, Physical>, clip: Option<&Region<Physical>>) -> pixman::Region32 {
        let mut region = pixman::Region32::init_rect(0, 0, self.size.w as u32, self.size.h as u32)
            .intersect(&pixman::Region32::init_rect(
                dst.loc.x,
                dst.loc.y,
                dst.size.w as u32,
                dst.size.h as u32,
            ));
        if let Some(clip) = clip {
            let boxes = clip
                .rects()
                .iter()
                .map(|rect| pixman::Box32 {
                    x1: rect.loc.x,
                    y1: rect.loc.y,
                    x2: rect.loc.x + rect.size.w,
                    y2: rect.loc.y + rect.size.h,
                })
                .collect::<Vec<_>>();
            region = region.intersect(&pixman::Region32::init_rects(&boxes));
        }
        region
    }

    fn record_failure(&mut self, error: RendererError) {
        warn!("render pass operation failed: {}", error);
        if self.failed.is_none() {
            self.failed = Some(error);
        }
    }

    fn try_add_texture(&mut self, args: &TextureArgs<'_>) -> Result<(), RendererError> {
        let texture = args
            .texture
            .as_any()
            .downcast_ref::<PixmanTexture>()
            .ok_or(RendererError::UnsupportedTarget)?;

        let src = if args.src.is_empty() {
            Rectangle::from_size((texture.width() as f64, texture.height() as f64).into())
        } else {
            args.src
        };
        let src: Rectangle<i32, _> = src.to_i32_up();
        let dst = args.dst;
        if dst.is_empty() {
            return Ok(());
        }

        // pixman transforms map destination to source
        let image_transform = args.transform.invert();
        let src_size_on_dst = image_transform.transform_size(src.size);
        let scale_x = src_size_on_dst.w as f64 / dst.size.w as f64;
        let scale_y = src_size_on_dst.h as f64 / dst.size.h as f64;
        let needs_matrix = image_transform != Transform::Normal || scale_x != 1.0 || scale_y != 1.0;

        let clip = self.clip_region(dst, args.clip);
        self.image
            .set_clip_region32(Some(&clip))
            .map_err(|err| RendererError::PassFailed(err.to_string()))?;

        let (src_loc, dst_loc, extent, matrix) = if needs_matrix {
            let mut matrix = pixman::Transform::identity();
            matrix = matrix
                .translate(-dst.loc.x, -dst.loc.y, false)
                .ok_or_else(|| RendererError::PassFailed("transform overflow".into()))?;
            matrix = matrix
                .scale(scale_x, scale_y, false)
                .ok_or_else(|| RendererError::PassFailed("transform overflow".into()))?;

            let (cos, sin, x, y) = match image_transform {
                Transform::Normal => (1, 0, 0, 0),
                Transform::_90 => (0, -1, 0, src.size.h),
                Transform::_180 => (-1, 0, src.size.w, src.size.h),
                Transform::_270 => (0, 1, src.size.w, 0),
                Transform::Flipped => (1, 0, src.size.w, 0),
                Transform::Flipped90 => (0, -1, src.size.w, src.size.h),
                Transform::Flipped180 => (-1, 0, 0, src.size.h),
                Transform::Flipped270 => (0, 1, 0, 0),
            };
            matrix = matrix
                .rotate(cos, sin, false)
                .ok_or_else(|| RendererError::PassFailed("transform overflow".into()))?;
            if image_transform.flipped() {
                matrix = matrix
                    .scale(-1, 1, false)
                    .ok_or_else(|| RendererError::PassFailed("transform overflow".into()))?;
            }
            matrix = matrix
                .translate(x, y, false)
                .ok_or_else(|| RendererError::PassFailed("transform overflow".into()))?;
            matrix = matrix
                .translate(src.loc.x, src.loc.y, false)
                .ok_or_else(|| RendererError::PassFailed("transform overflow".into()))?;

            ((0, 0), (0, 0), (self.size.w, self.size.h), Some(matrix))
        } else {
            (
                (src.loc.x, src.loc.y),
                (dst.loc.x, dst.loc.y),
                (src.size.w, src.size.h),
                None,
            )
        };

        let mut src_image = texture.image.borrow_mut();
        if let Some(matrix) = matrix {
            src_image
                .set_transform(matrix)
                .map_err(|err| RendererError::PassFailed(err.to_string()))?;
        } else {
            src_image
                .clear_transform()
                .map_err(|err| RendererError::PassFailed(err.to_string()))?;
        }
        let filter = match args.filter {
            FilterMode::Bilinear => Filter::Bilinear,
            FilterMode::Nearest => Filter::Nearest,
        };
        src_image
            .set_filter(filter, &[])
            .map_err(|err| RendererError::PassFailed(err.to_string()))?;
        src_image.set_repeat(Repeat::None);

        let source_has_alpha = texture.format().map(has_alpha).unwrap_or(true);
        let op = match args.blend {
            BlendMode::PremultipliedAlpha if source_has_alpha || args.alpha < 1.0 => Operation::Over,
            _ => Operation::Src,
        };

        let mask = if args.alpha != 1.0 {
            Some(
                pixman::Solid::new([0.0, 0.0, 0.0, args.alpha])
                    .map_err(|_| RendererError::PassFailed("solid mask".into()))?,
            )
        } else {
            None
        };

        self.image.composite32(
            op,
            &src_image,
            mask.as_deref(),
            src_loc,
            (0, 0),
            dst_loc,
            extent,
        );

        src_image
            .clear_transform()
            .map_err(|err| RendererError::PassFailed(err.to_string()))?;
        self.image
            .set_clip_region32(None)
            .map_err(|err| RendererError::PassFailed(err.to_string()))?;

        Ok(())
    }

    fn try_add_rect(&mut self, args: &RectArgs<'_>) -> Result<(), RendererError> {
        if args.dst.is_empty() {
            return Ok(());
        }
        let solid = pixman::Solid::new(args.color.components())
            .map_err(|_| RendererError::PassFailed("solid source".into()))?;

        let clip = self.clip_region(args.dst, args.clip);
        self.image
            .set_clip_region32(Some(&clip))
            .map_err(|err| RendererError::PassFailed(err.to_string()))?;

        let op = match args.blend {
            BlendMode::PremultipliedAlpha if !args.color.is_opaque() => Operation::Over,
            _ => Operation::Src,
        };

        self.image.composite32(
            op,
            &solid,
            None,
            (0, 0),
            (0, 0),
            (0, 0),
            (self.size.w, self.size.h),
        );

        self.image
            .set_clip_region32(None)
            .map_err(|err| RendererError::PassFailed(err.to_string()))?;
        Ok(())
    }
}

impl RenderPass for PixmanPass {
    #[profiling::function]
    fn add_rect(&mut self, args: RectArgs<'_>) {
        if let Err(err) = self.try_add_rect(&args) {
            self.record_failure(err);
        }
    }

    #[profiling::function]
    fn add_texture(&mut self, args: TextureArgs<'_>) {
        if let Err(err) = self.try_add_texture(&args) {
            self.record_failure(err);
        }
    }

    fn submit(mut self: Box<Self>) -> Result<(), RendererError> {
        match self.failed.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PixmanPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixmanPass")
            .field("size", &self.size)
            .field("failed", &self.failed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{shm::ShmAllocator, Allocator};

    fn buffer(width: u32, height: u32) -> Buffer {
        ShmAllocator::new()
            .alloc_buffer(width, height, Fourcc::Argb8888, &[Modifier::Linear])
            .unwrap()
    }

    fn pixel_at(buffer: &Buffer, x: usize, y: usize) -> u32 {
        buffer
            .with_shm(|shm| {
                let stride = shm.stride() as usize;
                let bytes = unsafe { shm.as_slice() };
                let offset = y * stride + x * 4;
                u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
            })
            .unwrap()
    }

    #[test]
    fn rect_fill_writes_pixels() {
        let mut renderer = PixmanRenderer::new();
        let target = buffer(16, 16);

        let mut pass = renderer.begin_buffer_pass(&target, &PassOptions::default()).unwrap();
        pass.add_rect(RectArgs {
            dst: Rectangle::new((0, 0).into(), (16, 16).into()),
            color: Color { r: 1.0, g: 0.0, b: 0.0, a: 1.0 },
            blend: BlendMode::None,
            clip: None,
        });
        pass.submit().unwrap();

        assert_eq!(pixel_at(&target, 4, 4), 0xffff0000);
    }

    #[test]
    fn clip_limits_fill() {
        let mut renderer = PixmanRenderer::new();
        let target = buffer(16, 16);

        let clip = Region::from_rect(Rectangle::new((0, 0).into(), (8, 16).into()));
        let mut pass = renderer.begin_buffer_pass(&target, &PassOptions::default()).unwrap();
        pass.add_rect(RectArgs {
            dst: Rectangle::new((0, 0).into(), (16, 16).into()),
            color: Color { r: 0.0, g: 1.0, b: 0.0, a: 1.0 },
            blend: BlendMode::None,
            clip: Some(&clip),
        });
        pass.submit().unwrap();

        assert_eq!(pixel_at(&target, 2, 2), 0xff00ff00);
        assert_ne!(pixel_at(&target, 12, 2), 0xff00ff00);
    }

    #[test]
    fn texture_copy_round_trips() {
        let mut renderer = PixmanRenderer::new();
        let source = buffer(8, 8);
        let target = buffer(8, 8);

        let mut pass = renderer.begin_buffer_pass(&source, &PassOptions::default()).unwrap();
        pass.add_rect(RectArgs {
            dst: Rectangle::new((0, 0).into(), (8, 8).into()),
            color: Color { r: 0.0, g: 0.0, b: 1.0, a: 1.0 },
            blend: BlendMode::None,
            clip: None,
        });
        pass.submit().unwrap();

        let texture = renderer.texture_from_buffer(&source).unwrap();
        let mut pass = renderer.begin_buffer_pass(&target, &PassOptions::default()).unwrap();
        pass.add_texture(TextureArgs {
            texture: texture.as_ref(),
            src: Default::default(),
            dst: Rectangle::new((0, 0).into(), (8, 8).into()),
            transform: Transform::Normal,
            clip: None,
            filter: FilterMode::Nearest,
            blend: BlendMode::None,
            alpha: 1.0,
        });
        pass.submit().unwrap();

        assert_eq!(pixel_at(&target, 3, 5), 0xff0000ff);
    }
}
