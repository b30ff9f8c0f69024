//! Rendering contracts
//!
//! The core never draws by itself; it describes frames against the narrow
//! interfaces in this module. A [`Renderer`] opens [`RenderPass`]es against
//! a [`Buffer`](crate::buffer::Buffer) and advertises which formats it can
//! sample from and render into. Concrete GPU renderers are pluggable
//! implementations of these traits; the in-tree [`pixman`] renderer is the
//! software reference used by the headless path and the test suite.

use std::any::Any;
use std::os::unix::io::BorrowedFd;

use crate::backend::allocator::{FormatSet, Fourcc};
use crate::buffer::Buffer;
use crate::utils::{signal::Signal, BufferCoords, Physical, Rectangle, Region, Transform};

#[cfg(feature = "renderer_pixman")]
pub mod pixman;

/// A color value, with straight alpha
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    /// Red component
    pub r: f32,
    /// Green component
    pub g: f32,
    /// Blue component
    pub b: f32,
    /// Alpha component
    pub a: f32,
}

impl Color {
    /// Opaque black
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    /// Fully transparent
    pub const TRANSPARENT: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    /// Returns true if compositing this color cannot show anything beneath it
    pub fn is_opaque(&self) -> bool {
        self.a >= 1.0
    }

    /// The components as an array, as expected by solid sources
    pub fn components(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl From<[f32; 4]> for Color {
    fn from([r, g, b, a]: [f32; 4]) -> Self {
        Color { r, g, b, a }
    }
}

/// How source pixels are combined with the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// Alpha blending with premultiplied source
    #[default]
    PremultipliedAlpha,
    /// Source pixels replace the destination
    None,
}

/// Sampling filter for scaled textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Bilinear interpolation
    #[default]
    Bilinear,
    /// Nearest-neighbour sampling
    Nearest,
}

/// A texture imported into a renderer
pub trait Texture {
    /// Width of the texture in pixels
    fn width(&self) -> u32;
    /// Height of the texture in pixels
    fn height(&self) -> u32;
    /// Fourcc of the underlying storage, if known
    fn format(&self) -> Option<Fourcc>;
    /// Downcast support for renderer implementations
    fn as_any(&self) -> &dyn Any;
}

/// Options for [`Renderer::begin_buffer_pass`]
///
/// Currently empty; present so that pass creation can grow options without
/// breaking implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassOptions {}

/// A solid rectangle draw operation
#[derive(Debug)]
pub struct RectArgs<'a> {
    /// Destination in buffer pixels
    pub dst: Rectangle<i32, Physical>,
    /// Fill color
    pub color: Color,
    /// Blending applied to the fill
    pub blend: BlendMode,
    /// Restricts the operation to this region, if set
    pub clip: Option<&'a Region<Physical>>,
}

/// A texture draw operation
pub struct TextureArgs<'a> {
    /// The texture to sample from
    pub texture: &'a dyn Texture,
    /// Source rectangle in texture coordinates; empty means the whole texture
    pub src: Rectangle<f64, BufferCoords>,
    /// Destination in buffer pixels
    pub dst: Rectangle<i32, Physical>,
    /// Transform applied to the source content
    pub transform: Transform,
    /// Restricts the operation to this region, if set
    pub clip: Option<&'a Region<Physical>>,
    /// Sampling filter for scaling
    pub filter: FilterMode,
    /// Blending applied to the texture
    pub blend: BlendMode,
    /// Opacity multiplier in `[0.0, 1.0]`
    pub alpha: f32,
}

impl std::fmt::Debug for TextureArgs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureArgs")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("transform", &self.transform)
            .field("filter", &self.filter)
            .field("blend", &self.blend)
            .field("alpha", &self.alpha)
            .finish()
    }
}

/// A recording of draw operations against one buffer
///
/// Operations are applied in call order, bottom-most first. Failures are
/// sticky: they do not abort the frame but surface when the pass is
/// submitted.
pub trait RenderPass {
    /// Draw a solid rectangle
    fn add_rect(&mut self, args: RectArgs<'_>);
    /// Draw a texture
    fn add_texture(&mut self, args: TextureArgs<'_>);
    /// Finish the pass, making the buffer content defined
    fn submit(self: Box<Self>) -> Result<(), RendererError>;
}

/// Errors of renderer implementations
#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    /// The buffer cannot be used as a render target
    #[error("Buffer is not usable as a render target")]
    UnsupportedTarget,
    /// The buffer or format cannot be imported as a texture
    #[error("Unsupported texture format: {0:?}")]
    UnsupportedFormat(Fourcc),
    /// An operation of the pass failed
    #[error("Render pass operation failed: {0}")]
    PassFailed(String),
    /// The underlying device was lost
    #[error("The render device was lost")]
    Lost,
    /// Io error while accessing buffer memory
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interface all renderers need to implement
pub trait Renderer {
    /// Begin recording a render pass against the given buffer
    ///
    /// The buffer stays locked until the pass is submitted or dropped. The
    /// pass is self-contained; the renderer stays usable (e.g. for texture
    /// imports) while a pass is being recorded.
    fn begin_buffer_pass(
        &mut self,
        buffer: &Buffer,
        options: &PassOptions,
    ) -> Result<Box<dyn RenderPass>, RendererError>;

    /// Formats this renderer can render into
    fn render_formats(&self) -> &FormatSet;

    /// Dmabuf formats this renderer can sample from
    fn dmabuf_texture_formats(&self) -> &FormatSet;

    /// Shared-memory formats this renderer can sample from
    fn shm_texture_formats(&self) -> &[Fourcc];

    /// The DRM render node driving this renderer, if any
    fn drm_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Import a buffer as a texture
    fn texture_from_buffer(&mut self, buffer: &Buffer) -> Result<Box<dyn Texture>, RendererError>;

    /// Emitted when the rendering device is lost
    ///
    /// All textures and pending passes are invalid afterwards; the
    /// compositor is expected to build a new renderer.
    fn lost_signal(&self) -> Signal<()>;
}

/// Renderer selection honoring the `RENDERER` environment variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererChoice {
    /// Pick whatever fits the backend
    Auto,
    /// The software renderer
    Pixman,
    /// A GLES2 renderer provided by the compositor
    Gles2,
    /// A Vulkan renderer provided by the compositor
    Vulkan,
}

impl RendererChoice {
    /// Read the `RENDERER` environment variable
    pub fn from_env() -> RendererChoice {
        crate::utils::env::choice_env(
            "RENDERER",
            &[
                ("auto", RendererChoice::Auto),
                ("pixman", RendererChoice::Pixman),
                ("gles2", RendererChoice::Gles2),
                ("vulkan", RendererChoice::Vulkan),
            ],
        )
        .unwrap_or(RendererChoice::Auto)
    }
}

/// The render node requested through `RENDER_DRM_DEVICE`, if any
///
/// GPU renderer implementations should open this node instead of deriving
/// one from the backend device.
pub fn render_node_from_env() -> Option<std::path::PathBuf> {
    let path = std::env::var_os("RENDER_DRM_DEVICE")?;
    if path.is_empty() {
        return None;
    }
    Some(std::path::PathBuf::from(path))
}
