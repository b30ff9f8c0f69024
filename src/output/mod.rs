//! Outputs and the output commit state machine
//!
//! An [`Output`] is the compositor-facing handle for one display, whatever
//! backend drives it. Configuration is double-buffered: the compositor
//! fills an [`OutputState`] and either probes it with
//! [`test_state`](Output::test_state) or applies it with
//! [`commit_state`](Output::commit_state). Only a successful commit touches
//! the output; a failed one has no side effects.
//!
//! Frame pacing runs through the output's signals: `frame` asks the
//! compositor to submit the next frame, `precommit`/`commit` bracket a
//! state application, and `present` reports when and how a committed frame
//! reached the screen.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, info, instrument, warn};

use crate::backend::allocator::{
    Allocator, FormatSet, Fourcc, Modifier, Slot, Swapchain,
};
use crate::buffer::{Buffer, BufferCaps};
use crate::utils::{
    addons::AddonSet,
    clock::{Clock, Monotonic, Time},
    signal::Signal,
    BufferCoords, Physical, Point, Raw, Region, Size, Transform,
};

mod cursor;
mod layer;

pub use cursor::CursorState;
pub use layer::{LayerFeedback, LayerState, OutputLayer};

/// Subpixel geometry of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Subpixel {
    /// Unknown subpixel layout
    #[default]
    Unknown,
    /// No subpixel structure
    None,
    /// Horizontal, red-green-blue
    HorizontalRgb,
    /// Horizontal, blue-green-red
    HorizontalBgr,
    /// Vertical, red-green-blue
    VerticalRgb,
    /// Vertical, blue-green-red
    VerticalBgr,
}

/// Picture aspect ratio advertised by a mode
///
/// The kernel does not document the mask as exhaustive; unrecognised values
/// map to [`PictureAspectRatio::Unknown`] rather than being guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureAspectRatio {
    /// No aspect ratio information
    #[default]
    None,
    /// 4:3
    Ratio4_3,
    /// 16:9
    Ratio16_9,
    /// 64:27
    Ratio64_27,
    /// 256:135
    Ratio256_135,
    /// A value this library does not recognise
    Unknown,
}

/// One display timing an output can run at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputMode {
    /// Resolution in physical pixels
    pub size: Size<i32, Physical>,
    /// Refresh rate in millihertz
    pub refresh: i32,
    /// Whether the display prefers this mode
    pub preferred: bool,
    /// Aspect ratio hint carried by the mode
    pub aspect_ratio: PictureAspectRatio,
}

/// The mode field of a pending [`OutputState`]
#[derive(Debug, Clone, PartialEq)]
pub enum ModeRequest {
    /// One of the modes advertised by the output
    Fixed(OutputMode),
    /// A custom timing to be synthesised by the backend
    Custom {
        /// Width in pixels
        width: i32,
        /// Height in pixels
        height: i32,
        /// Refresh in millihertz, 0 for "whatever works"
        refresh: i32,
    },
}

impl ModeRequest {
    /// The pixel size this request would give the output
    pub fn size(&self) -> Size<i32, Physical> {
        match self {
            ModeRequest::Fixed(mode) => mode.size,
            ModeRequest::Custom { width, height, .. } => (*width, *height).into(),
        }
    }
}

/// A gamma ramp for each color channel
#[derive(Debug, Clone, PartialEq)]
pub struct GammaLut {
    /// Red channel ramp
    pub red: Vec<u16>,
    /// Green channel ramp
    pub green: Vec<u16>,
    /// Blue channel ramp
    pub blue: Vec<u16>,
}

bitflags::bitflags! {
    /// Which fields of an [`OutputState`] are set
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Committed: u32 {
        /// `enabled` is set
        const ENABLED = 1 << 0;
        /// `mode` is set
        const MODE = 1 << 1;
        /// `scale` is set
        const SCALE = 1 << 2;
        /// `transform` is set
        const TRANSFORM = 1 << 3;
        /// `adaptive_sync_enabled` is set
        const ADAPTIVE_SYNC = 1 << 4;
        /// `render_format` is set
        const RENDER_FORMAT = 1 << 5;
        /// `subpixel` is set
        const SUBPIXEL = 1 << 6;
        /// `buffer` is set
        const BUFFER = 1 << 7;
        /// `damage` is set
        const DAMAGE = 1 << 8;
        /// `gamma_lut` is set
        const GAMMA_LUT = 1 << 9;
        /// `layers` is set
        const LAYERS = 1 << 10;
    }
}

/// A pending, double-buffered output configuration
///
/// All fields are optional; unset fields keep their current value. The
/// state is inert until handed to [`Output::test_state`] or
/// [`Output::commit_state`].
#[derive(Debug, Clone, Default)]
pub struct OutputState {
    /// Whether the output should be enabled
    pub enabled: Option<bool>,
    /// The mode to set
    pub mode: Option<ModeRequest>,
    /// The scale to advertise
    pub scale: Option<f64>,
    /// The transform to apply at present time
    pub transform: Option<Transform>,
    /// Whether adaptive sync should be active
    pub adaptive_sync_enabled: Option<bool>,
    /// Fourcc of the back buffer to render into
    pub render_format: Option<Fourcc>,
    /// Subpixel layout override
    pub subpixel: Option<Subpixel>,
    /// The frame to present
    pub buffer: Option<Buffer>,
    /// Damage of `buffer` relative to the previously presented frame, in
    /// buffer-local coordinates
    pub damage: Option<Region<BufferCoords>>,
    /// Gamma ramps to load
    pub gamma_lut: Option<GammaLut>,
    /// States for every layer of the output, bottom to top
    pub layers: Option<Vec<LayerState>>,
    /// Present `buffer` without waiting for vblank
    pub tearing_page_flip: bool,
    /// Allow this commit to perform a disruptive reconfiguration
    pub allow_reconfiguration: bool,
}

impl OutputState {
    /// Create an empty pending state
    pub fn new() -> OutputState {
        Default::default()
    }

    /// Which fields are present
    pub fn committed(&self) -> Committed {
        let mut committed = Committed::empty();
        if self.enabled.is_some() {
            committed |= Committed::ENABLED;
        }
        if self.mode.is_some() {
            committed |= Committed::MODE;
        }
        if self.scale.is_some() {
            committed |= Committed::SCALE;
        }
        if self.transform.is_some() {
            committed |= Committed::TRANSFORM;
        }
        if self.adaptive_sync_enabled.is_some() {
            committed |= Committed::ADAPTIVE_SYNC;
        }
        if self.render_format.is_some() {
            committed |= Committed::RENDER_FORMAT;
        }
        if self.subpixel.is_some() {
            committed |= Committed::SUBPIXEL;
        }
        if self.buffer.is_some() {
            committed |= Committed::BUFFER;
        }
        if self.damage.is_some() {
            committed |= Committed::DAMAGE;
        }
        if self.gamma_lut.is_some() {
            committed |= Committed::GAMMA_LUT;
        }
        if self.layers.is_some() {
            committed |= Committed::LAYERS;
        }
        committed
    }

    /// Returns true if nothing is set
    pub fn is_empty(&self) -> bool {
        self.committed().is_empty() && !self.tearing_page_flip
    }

    /// Set the enabled field
    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.enabled = Some(enabled);
        self
    }

    /// Request one of the output's fixed modes
    pub fn set_mode(&mut self, mode: OutputMode) -> &mut Self {
        self.mode = Some(ModeRequest::Fixed(mode));
        self
    }

    /// Request a custom mode
    pub fn set_custom_mode(&mut self, width: i32, height: i32, refresh: i32) -> &mut Self {
        self.mode = Some(ModeRequest::Custom {
            width,
            height,
            refresh,
        });
        self
    }

    /// Set the buffer to present
    pub fn set_buffer(&mut self, buffer: &Buffer) -> &mut Self {
        self.buffer = Some(buffer.clone());
        self
    }

    /// Set the frame damage
    pub fn set_damage(&mut self, damage: Region<BufferCoords>) -> &mut Self {
        self.damage = Some(damage);
        self
    }

    /// Set the scale
    pub fn set_scale(&mut self, scale: f64) -> &mut Self {
        self.scale = Some(scale);
        self
    }

    /// Set the transform
    pub fn set_transform(&mut self, transform: Transform) -> &mut Self {
        self.transform = Some(transform);
        self
    }

    /// Set adaptive sync
    pub fn set_adaptive_sync_enabled(&mut self, enabled: bool) -> &mut Self {
        self.adaptive_sync_enabled = Some(enabled);
        self
    }

    /// Set the render format
    pub fn set_render_format(&mut self, fourcc: Fourcc) -> &mut Self {
        self.render_format = Some(fourcc);
        self
    }
}

bitflags::bitflags! {
    /// How a frame made it to screen
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentFlags: u32 {
        /// The presentation was synchronised to vblank
        const VSYNC = 1 << 0;
        /// The timestamp comes from the display hardware clock
        const HW_CLOCK = 1 << 1;
        /// The hardware signalled completion itself
        const HW_COMPLETION = 1 << 2;
        /// The buffer was scanned out directly with no copy
        const ZERO_COPY = 1 << 3;
    }
}

/// Delivery report for one committed frame
#[derive(Debug, Clone)]
pub struct PresentEvent {
    /// The [`Output::commit_seq`] of the frame this event belongs to
    pub commit_seq: u32,
    /// When the frame was presented
    pub when: Time<Monotonic>,
    /// Nominal time until the next presentation, in nanoseconds, 0 if
    /// unknown
    pub refresh: u64,
    /// How the frame was presented
    pub flags: PresentFlags,
}

/// Payload of the `precommit` and `commit` events
#[derive(Debug, Clone)]
pub struct CommitEvent {
    /// When the commit was applied
    pub when: Time<Monotonic>,
    /// The state that was committed
    pub state: OutputState,
}

/// The signals of an [`Output`]
#[derive(Debug, Clone, Default)]
pub struct OutputEvents {
    /// Time to submit the next frame
    pub frame: Signal<()>,
    /// Content became outdated, in output-local coordinates
    pub damage: Signal<Region<Physical>>,
    /// A frame is wanted even without new content
    pub needs_frame: Signal<()>,
    /// About to apply a state
    pub precommit: Signal<CommitEvent>,
    /// A state was applied
    pub commit: Signal<CommitEvent>,
    /// A committed frame reached the screen
    pub present: Signal<PresentEvent>,
    /// The backend asks the compositor to commit this configuration
    pub request_state: Signal<OutputState>,
    /// The output is going away
    pub destroy: Signal<()>,
}

/// Static identity of a display
#[derive(Debug, Clone)]
pub struct PhysicalProperties {
    /// Physical dimensions in millimeters
    pub size: Size<i32, Raw>,
    /// Subpixel layout
    pub subpixel: Subpixel,
    /// Manufacturer, typically from the EDID
    pub make: String,
    /// Model, typically from the EDID
    pub model: String,
    /// Serial number, typically from the EDID
    pub serial: String,
}

/// Errors of output configuration
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// The pending state violates an invariant and was rejected before
    /// reaching the backend
    #[error("Invalid output state: {0}")]
    InvalidState(&'static str),
    /// The backend or driver declined the configuration
    #[error("Backend refused the commit: {0}")]
    BackendRefused(String),
    /// A non-blocking commit was attempted while a page-flip is in flight
    #[error("A page-flip is still pending on this output")]
    FlipPending,
    /// Buffer allocation failed
    #[error("Allocation failed: {0}")]
    Allocation(#[from] crate::backend::allocator::AllocatorError),
    /// The session is paused; commits resume with the session
    #[error("The session is paused")]
    SessionPaused,
    /// The output or its backend is gone
    #[error("The output backend is gone")]
    BackendGone,
    /// This backend has no usable cursor plane
    #[error("Hardware cursors are not supported")]
    HardwareCursorUnsupported,
}

/// Backend half of an output
///
/// Implemented by each backend; consumed exclusively by [`Output`].
pub trait OutputBackend {
    /// Check whether a state could be committed, without side effects
    fn test(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError>;
    /// Apply a state. Only called with states that passed validation.
    fn commit(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError>;
    /// Arrange for a `frame` event when the output is ready for the next
    /// frame
    fn schedule_frame(&mut self, output: &Output);
    /// Formats the primary plane accepts for the given buffer capabilities
    fn primary_formats(&self, caps: BufferCaps) -> FormatSet;
    /// Formats the cursor plane accepts, or `None` without a cursor plane
    fn cursor_formats(&self, _caps: BufferCaps) -> Option<FormatSet> {
        None
    }
    /// Preferred cursor plane dimensions
    fn cursor_size(&self) -> Option<Size<i32, Physical>> {
        None
    }
    /// Size of the gamma ramps, if gamma is supported
    fn gamma_size(&self) -> Option<u32> {
        None
    }
    /// Put a buffer on the hardware cursor plane (`None` hides it)
    fn set_hardware_cursor(
        &mut self,
        _output: &Output,
        _buffer: Option<&Buffer>,
        _hotspot: Point<i32, Physical>,
    ) -> Result<(), OutputError> {
        Err(OutputError::HardwareCursorUnsupported)
    }
    /// Move the hardware cursor plane
    fn move_hardware_cursor(&mut self, _output: &Output, _position: Point<i32, Physical>) -> Result<(), OutputError> {
        Err(OutputError::HardwareCursorUnsupported)
    }
    /// An allocator producing buffers this output can scan out
    fn create_allocator(&self) -> Box<dyn Allocator>;
}

pub(crate) struct OutputInner {
    name: String,
    description: String,
    physical: PhysicalProperties,
    modes: Vec<OutputMode>,
    current_mode: Option<OutputMode>,
    enabled: bool,
    scale: f64,
    transform: Transform,
    subpixel: Subpixel,
    adaptive_sync_enabled: bool,
    render_format: Fourcc,
    commit_seq: u32,
    needs_frame: bool,
    frame_pending: bool,
    attach_render_locks: u32,
    backend: Option<Box<dyn OutputBackend>>,
    swapchain: Option<Swapchain<Box<dyn Allocator>>>,
    // slot currently being displayed, kept so the swapchain does not reuse it
    displayed_slot: Option<Slot>,
    pub(crate) cursor: CursorState,
    layers: Vec<OutputLayer>,
    events: OutputEvents,
    addons: AddonSet,
    destroyed: bool,
    span: tracing::Span,
}

/// Handle to one display
#[derive(Clone)]
pub struct Output {
    inner: Rc<RefCell<OutputInner>>,
}

/// Weak handle to an [`Output`]
#[derive(Clone)]
pub struct WeakOutput {
    inner: Weak<RefCell<OutputInner>>,
}

impl Output {
    /// Create a new output
    ///
    /// Called by backends; compositors receive outputs through
    /// [`BackendEvents::new_output`](crate::backend::BackendEvents).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        backend: Box<dyn OutputBackend>,
        physical: PhysicalProperties,
        modes: Vec<OutputMode>,
        current_mode: Option<OutputMode>,
        render_format: Fourcc,
    ) -> Output {
        let span = tracing::info_span!("output", name = name.as_str());
        info!(parent: &span, "New output {} ({} {})", name, physical.make, physical.model);

        let description = format!("{} {} ({})", physical.make, physical.model, name);
        let subpixel = physical.subpixel;
        Output {
            inner: Rc::new(RefCell::new(OutputInner {
                name,
                description,
                physical,
                modes,
                current_mode,
                enabled: current_mode.is_some(),
                scale: 1.0,
                transform: Transform::Normal,
                subpixel,
                adaptive_sync_enabled: false,
                render_format,
                commit_seq: 0,
                needs_frame: false,
                frame_pending: false,
                attach_render_locks: 0,
                backend: Some(backend),
                swapchain: None,
                displayed_slot: None,
                cursor: CursorState::new(),
                layers: Vec::new(),
                events: OutputEvents::default(),
                addons: AddonSet::new(),
                destroyed: false,
                span,
            })),
        }
    }

    /// Stable name, unique for the lifetime of the output
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Human readable description
    pub fn description(&self) -> String {
        self.inner.borrow().description.clone()
    }

    /// Replace the human readable description
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.inner.borrow_mut().description = description.into();
    }

    /// Physical identity of the display
    pub fn physical_properties(&self) -> PhysicalProperties {
        self.inner.borrow().physical.clone()
    }

    /// The modes this output advertises
    pub fn modes(&self) -> Vec<OutputMode> {
        self.inner.borrow().modes.clone()
    }

    /// The currently programmed mode
    pub fn current_mode(&self) -> Option<OutputMode> {
        self.inner.borrow().current_mode
    }

    /// Current width in pixels, 0 when disabled
    pub fn width(&self) -> i32 {
        self.inner.borrow().current_mode.map(|mode| mode.size.w).unwrap_or(0)
    }

    /// Current height in pixels, 0 when disabled
    pub fn height(&self) -> i32 {
        self.inner.borrow().current_mode.map(|mode| mode.size.h).unwrap_or(0)
    }

    /// Current refresh rate in millihertz, 0 when disabled
    pub fn refresh(&self) -> i32 {
        self.inner.borrow().current_mode.map(|mode| mode.refresh).unwrap_or(0)
    }

    /// Whether the output is currently enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.borrow().enabled
    }

    /// Current scale factor
    pub fn scale(&self) -> f64 {
        self.inner.borrow().scale
    }

    /// Current transform
    pub fn transform(&self) -> Transform {
        self.inner.borrow().transform
    }

    /// Current subpixel layout
    pub fn subpixel(&self) -> Subpixel {
        self.inner.borrow().subpixel
    }

    /// Whether adaptive sync is currently active
    pub fn adaptive_sync_enabled(&self) -> bool {
        self.inner.borrow().adaptive_sync_enabled
    }

    /// Fourcc used for back buffers
    pub fn render_format(&self) -> Fourcc {
        self.inner.borrow().render_format
    }

    /// Size of the output in physical pixels after the transform
    pub fn effective_resolution(&self) -> Size<i32, Physical> {
        let inner = self.inner.borrow();
        let size = inner
            .current_mode
            .map(|mode| mode.size)
            .unwrap_or_else(|| (0, 0).into());
        inner.transform.transform_size(size)
    }

    /// Monotonically increasing commit counter, may wrap
    pub fn commit_seq(&self) -> u32 {
        self.inner.borrow().commit_seq
    }

    /// The signal set of this output
    pub fn events(&self) -> OutputEvents {
        self.inner.borrow().events.clone()
    }

    /// Compositor-side extension storage
    pub fn with_addons<T>(&self, f: impl FnOnce(&AddonSet) -> T) -> T {
        f(&self.inner.borrow().addons)
    }

    /// Create a weak handle
    pub fn downgrade(&self) -> WeakOutput {
        WeakOutput {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Register a new layer on this output, above all existing layers
    pub fn create_layer(&self) -> OutputLayer {
        let layer = OutputLayer::new();
        self.inner.borrow_mut().layers.push(layer.clone());
        layer
    }

    /// The layers registered on this output, bottom to top
    pub fn layers(&self) -> Vec<OutputLayer> {
        self.inner.borrow().layers.clone()
    }

    /// Formats usable for the primary plane with the given capabilities
    pub fn get_primary_formats(&self, caps: BufferCaps) -> FormatSet {
        self.with_backend(|backend, _| backend.primary_formats(caps))
            .unwrap_or_default()
    }

    /// Size of the gamma ramps, `None` if gamma is unsupported
    pub fn get_gamma_size(&self) -> Option<u32> {
        self.with_backend(|backend, _| backend.gamma_size()).flatten()
    }

    /// Ask the backend to emit `frame` when the output can take the next
    /// frame
    pub fn schedule_frame(&self) {
        {
            let inner = self.inner.borrow();
            if inner.frame_pending || inner.destroyed {
                return;
            }
        }
        self.with_backend(|backend, output| backend.schedule_frame(output));
        self.inner.borrow_mut().frame_pending = true;
    }

    /// Note that the content of the output became outdated
    ///
    /// Emits `damage` and `needs_frame`.
    pub fn set_needs_frame(&self) {
        let events = {
            let mut inner = self.inner.borrow_mut();
            if inner.needs_frame {
                return;
            }
            inner.needs_frame = true;
            inner.events.clone()
        };
        events.needs_frame.emit(());
    }

    /// Check a pending configuration without applying anything
    #[instrument(level = "debug", skip_all)]
    pub fn test_state(&self, state: &OutputState) -> Result<(), OutputError> {
        let state = self.prune_noops(state);
        if state.is_empty() {
            return Ok(());
        }
        self.validate(&state)?;

        let (state, _slot) = self.ensure_back_buffer(state, true)?;
        self.with_backend(|backend, output| backend.test(output, &state))
            .ok_or(OutputError::BackendGone)?
    }

    /// Apply a pending configuration
    ///
    /// Implements test-then-commit: validation and backend errors leave the
    /// output untouched. On success the output's current values, the commit
    /// counter and the swapchain bookkeeping are updated and `precommit`/
    /// `commit` are emitted around the backend call.
    #[instrument(level = "debug", skip_all)]
    pub fn commit_state(&self, state: &OutputState) -> Result<(), OutputError> {
        if self.inner.borrow().destroyed {
            return Err(OutputError::BackendGone);
        }

        // 1. drop no-op fields
        let state = self.prune_noops(state);
        if state.is_empty() {
            return Ok(());
        }

        // 2. validate against the current state
        self.validate(&state)?;

        // 3. make sure a buffer is there when the commit needs one
        let (state, slot) = self.ensure_back_buffer(state, false)?;

        let now = Clock::<Monotonic>::new().now();
        let events = self.inner.borrow().events.clone();

        // 4. give observers a chance to inspect the final state
        events.precommit.emit(CommitEvent {
            when: now,
            state: state.clone(),
        });

        // 5. hand the state to the backend
        let result = self
            .with_backend(|backend, output| backend.commit(output, &state))
            .ok_or(OutputError::BackendGone)?;
        if let Err(err) = result {
            // release a locally allocated back buffer without side effects
            drop(slot);
            warn!(parent: &self.inner.borrow().span, "Output commit failed: {}", err);
            return Err(err);
        }

        // 6. apply the state to the output
        self.apply_state(&state, slot);

        // 7. done
        events.commit.emit(CommitEvent { when: now, state });
        Ok(())
    }

    /// Emit `frame`, marking the output ready for the next submission
    ///
    /// Called by backends.
    pub fn send_frame(&self) {
        let events = {
            let mut inner = self.inner.borrow_mut();
            inner.frame_pending = false;
            inner.events.clone()
        };
        events.frame.emit(());
    }

    /// Report a committed frame as presented
    ///
    /// Called by backends.
    pub fn send_present(&self, event: &PresentEvent) {
        let events = self.inner.borrow().events.clone();
        events.present.emit(event.clone());
    }

    /// Ask the compositor to commit the given configuration
    ///
    /// Called by backends, e.g. when the host window of a nested output was
    /// resized.
    pub fn send_request_state(&self, state: OutputState) {
        let events = self.inner.borrow().events.clone();
        events.request_state.emit(state);
    }

    /// Destroy the output
    ///
    /// Emits `destroy`; afterwards all commits fail.
    pub fn destroy(&self) {
        let events = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.swapchain = None;
            inner.displayed_slot = None;
            inner.backend = None;
            inner.events.clone()
        };
        events.destroy.emit(());
    }

    /// Returns true once [`destroy`](Output::destroy) ran
    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    /// Forbid or allow direct scan-out of client buffers
    ///
    /// Each `true` call must be paired with a `false` call. While locks are
    /// held, the scene falls back to composition.
    pub fn lock_attach_render(&self, lock: bool) {
        let mut inner = self.inner.borrow_mut();
        if lock {
            inner.attach_render_locks += 1;
        } else {
            debug_assert!(inner.attach_render_locks > 0);
            inner.attach_render_locks = inner.attach_render_locks.saturating_sub(1);
        }
    }

    /// Number of active attach-render locks
    pub fn attach_render_locks(&self) -> u32 {
        self.inner.borrow().attach_render_locks
    }

    // --- internals ---

    /// Run a closure with the backend temporarily taken out of the inner
    /// cell, so backend implementations can call back into the output.
    pub(crate) fn with_backend<T>(
        &self,
        f: impl FnOnce(&mut dyn OutputBackend, &Output) -> T,
    ) -> Option<T> {
        let mut backend = self.inner.borrow_mut().backend.take()?;
        let result = f(backend.as_mut(), self);
        self.inner.borrow_mut().backend = Some(backend);
        Some(result)
    }

    /// Current pixel size the pending state would give the output
    fn pending_size(&self, state: &OutputState) -> Option<Size<i32, Physical>> {
        state
            .mode
            .as_ref()
            .map(ModeRequest::size)
            .or_else(|| self.inner.borrow().current_mode.map(|mode| mode.size))
    }

    fn prune_noops(&self, state: &OutputState) -> OutputState {
        let inner = self.inner.borrow();
        let mut pruned = state.clone();

        if pruned.enabled == Some(inner.enabled) {
            pruned.enabled = None;
        }
        if let Some(ModeRequest::Fixed(mode)) = &pruned.mode {
            if Some(*mode) == inner.current_mode {
                pruned.mode = None;
            }
        }
        if pruned.scale == Some(inner.scale) {
            pruned.scale = None;
        }
        if pruned.transform == Some(inner.transform) {
            pruned.transform = None;
        }
        if pruned.adaptive_sync_enabled == Some(inner.adaptive_sync_enabled) {
            pruned.adaptive_sync_enabled = None;
        }
        if pruned.render_format == Some(inner.render_format) {
            pruned.render_format = None;
        }
        if pruned.subpixel == Some(inner.subpixel) {
            pruned.subpixel = None;
        }
        pruned
    }

    fn validate(&self, state: &OutputState) -> Result<(), OutputError> {
        let inner = self.inner.borrow();

        let enabled_after = state.enabled.unwrap_or(inner.enabled);

        if state.tearing_page_flip && state.buffer.is_none() {
            return Err(OutputError::InvalidState("tearing page-flip requires a buffer"));
        }

        if !enabled_after {
            let forbidden = Committed::BUFFER
                | Committed::MODE
                | Committed::GAMMA_LUT
                | Committed::ADAPTIVE_SYNC
                | Committed::RENDER_FORMAT
                | Committed::SUBPIXEL;
            if state.committed().intersects(forbidden) {
                return Err(OutputError::InvalidState(
                    "field not applicable to a disabled output",
                ));
            }
            return Ok(());
        }

        // output will be enabled after this commit
        let size = self
            .pending_size(state)
            .filter(|size| !size.is_empty())
            .ok_or(OutputError::InvalidState("enabling an output requires a mode"))?;

        if let Some(buffer) = &state.buffer {
            if buffer.width() != size.w || buffer.height() != size.h {
                return Err(OutputError::InvalidState("buffer size does not match the mode"));
            }
        }

        if state.mode.is_some() && inner.enabled && state.buffer.is_none() && !state.allow_reconfiguration {
            return Err(OutputError::InvalidState(
                "mode change requires a new buffer or allow_reconfiguration",
            ));
        }

        if let Some(layers) = &state.layers {
            if layers.len() != inner.layers.len()
                || !inner
                    .layers
                    .iter()
                    .all(|layer| layers.iter().any(|entry| entry.layer == *layer))
            {
                return Err(OutputError::InvalidState(
                    "layer states must enumerate every registered layer",
                ));
            }
        }

        Ok(())
    }

    /// Whether this commit must carry a buffer even if the caller did not
    /// attach one
    fn needs_buffer(&self, state: &OutputState) -> bool {
        if state.buffer.is_some() {
            return false;
        }
        let inner = self.inner.borrow();
        let enabling = state.enabled == Some(true) && !inner.enabled;
        enabling
            || state.mode.is_some()
            || state.render_format.is_some()
            || (state.allow_reconfiguration && inner.swapchain.is_none())
    }

    /// Steps 3 of the commit algorithm: allocate and clear a back buffer
    /// when one is required, recreating the swapchain as needed.
    fn ensure_back_buffer(
        &self,
        mut state: OutputState,
        test_only: bool,
    ) -> Result<(OutputState, Option<Slot>), OutputError> {
        let enabled_after = state.enabled.unwrap_or(self.inner.borrow().enabled);
        if !enabled_after || !self.needs_buffer(&state) {
            return Ok((state, None));
        }

        let size = self
            .pending_size(&state)
            .ok_or(OutputError::InvalidState("no mode to size the back buffer after"))?;
        let fourcc = state
            .render_format
            .unwrap_or(self.inner.borrow().render_format);

        self.reconfigure_swapchain(size, fourcc, /* implicit_only */ false)?;
        let slot = self.acquire_back_buffer()?;
        clear_buffer(&slot.buffer());
        state.buffer = Some(slot.buffer());

        // probe the configuration; some drivers lack explicit modifier
        // support and want an implicit layout instead
        let probe = self
            .with_backend(|backend, output| backend.test(output, &state))
            .ok_or(OutputError::BackendGone)?;
        if probe.is_err() {
            debug!(parent: &self.inner.borrow().span, "Back buffer test failed, retrying without modifiers");
            drop(slot);
            self.reconfigure_swapchain(size, fourcc, true)?;
            let slot = self.acquire_back_buffer()?;
            clear_buffer(&slot.buffer());
            state.buffer = Some(slot.buffer());
            self.with_backend(|backend, output| backend.test(output, &state))
                .ok_or(OutputError::BackendGone)?
                .map_err(|err| {
                    warn!("Back buffer rejected with and without modifiers");
                    err
                })?;
            if test_only {
                return Ok((state, None));
            }
            return Ok((state, Some(slot)));
        }

        if test_only {
            return Ok((state, None));
        }
        Ok((state, Some(slot)))
    }

    fn reconfigure_swapchain(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        implicit_only: bool,
    ) -> Result<(), OutputError> {
        let formats = self
            .with_backend(|backend, _| {
                let caps = backend.create_allocator().buffer_caps();
                backend.primary_formats(caps)
            })
            .ok_or(OutputError::BackendGone)?;

        let modifiers: Vec<Modifier> = if implicit_only {
            vec![Modifier::Invalid]
        } else {
            formats.modifiers(fourcc).collect()
        };

        let mut inner = self.inner.borrow_mut();
        let needs_new = match &inner.swapchain {
            Some(swapchain) => {
                swapchain.format() != fourcc
                    || swapchain.size() != (size.w as u32, size.h as u32)
                    || swapchain.modifiers() != modifiers.as_slice()
            }
            None => true,
        };
        if needs_new {
            let allocator = inner
                .backend
                .as_ref()
                .ok_or(OutputError::BackendGone)?
                .create_allocator();
            inner.swapchain = Some(Swapchain::new(
                allocator,
                size.w as u32,
                size.h as u32,
                fourcc,
                modifiers,
            ));
        }
        Ok(())
    }

    fn acquire_back_buffer(&self) -> Result<Slot, OutputError> {
        let mut inner = self.inner.borrow_mut();
        let swapchain = inner.swapchain.as_mut().ok_or(OutputError::BackendGone)?;
        swapchain
            .acquire()?
            .ok_or(OutputError::InvalidState("swapchain exhausted"))
    }

    /// Acquire the next back buffer for rendering
    ///
    /// Returns the slot and its age in frames. Used by the scene's render
    /// path; plain clients can also use it for manual frame submission.
    pub fn acquire_swapchain_buffer(&self) -> Result<(Slot, u8), OutputError> {
        let size = self
            .inner
            .borrow()
            .current_mode
            .map(|mode| mode.size)
            .ok_or(OutputError::InvalidState("output has no mode"))?;
        let fourcc = self.inner.borrow().render_format;
        self.reconfigure_swapchain(size, fourcc, false)?;
        let slot = self.acquire_back_buffer()?;
        let age = slot.age();
        Ok((slot, age))
    }

    /// Record that the given slot was put on screen by a commit
    pub(crate) fn mark_slot_submitted(&self, slot: &Slot) {
        let mut inner = self.inner.borrow_mut();
        if let Some(swapchain) = inner.swapchain.as_mut() {
            swapchain.submitted(slot);
        }
        inner.displayed_slot = Some(slot.clone());
    }

    fn apply_state(&self, state: &OutputState, slot: Option<Slot>) {
        let mut inner = self.inner.borrow_mut();

        inner.commit_seq = inner.commit_seq.wrapping_add(1);

        if let Some(enabled) = state.enabled {
            inner.enabled = enabled;
            if !enabled {
                inner.current_mode = None;
                inner.swapchain = None;
                inner.displayed_slot = None;
            }
        }
        if let Some(request) = &state.mode {
            let mode = match request {
                ModeRequest::Fixed(mode) => *mode,
                ModeRequest::Custom {
                    width,
                    height,
                    refresh,
                } => OutputMode {
                    size: (*width, *height).into(),
                    refresh: *refresh,
                    preferred: false,
                    aspect_ratio: PictureAspectRatio::None,
                },
            };
            inner.current_mode = Some(mode);
        }
        if let Some(scale) = state.scale {
            inner.scale = scale;
        }
        if let Some(transform) = state.transform {
            inner.transform = transform;
        }
        if let Some(adaptive) = state.adaptive_sync_enabled {
            inner.adaptive_sync_enabled = adaptive;
        }
        if let Some(fourcc) = state.render_format {
            inner.render_format = fourcc;
        }
        if let Some(subpixel) = state.subpixel {
            inner.subpixel = subpixel;
        }
        if state.buffer.is_some() {
            inner.needs_frame = false;
            inner.frame_pending = true;
        }
        if let Some(layers) = &state.layers {
            // commit per-layer ordering and geometry
            let order: Vec<OutputLayer> = layers.iter().map(|entry| entry.layer.clone()).collect();
            inner.layers = order;
            for entry in layers {
                entry.layer.apply(entry);
            }
        }

        drop(inner);
        // a back buffer we allocated ourselves is marked here; buffers from
        // the scene's swapchain path are marked by their submitter
        if let Some(slot) = slot {
            self.mark_slot_submitted(&slot);
        }
    }
}

fn clear_buffer(buffer: &Buffer) {
    let cleared = buffer
        .with_shm(|shm| {
            // SAFETY: freshly acquired back buffer, no aliasing readers yet
            unsafe { shm.as_mut_slice() }.fill(0);
        })
        .is_some();
    if !cleared {
        debug!("Back buffer is not mappable, relying on allocator zeroing");
    }
}

impl WeakOutput {
    /// Try to upgrade to a strong handle
    pub fn upgrade(&self) -> Option<Output> {
        self.inner.upgrade().map(|inner| Output { inner })
    }
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Output {}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Output")
            .field("name", &inner.name)
            .field("enabled", &inner.enabled)
            .field("current_mode", &inner.current_mode)
            .field("commit_seq", &inner.commit_seq)
            .finish()
    }
}

impl fmt::Debug for WeakOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakOutput { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct StubBackend {
        refuse: std::cell::Cell<bool>,
        commits: std::cell::Cell<u32>,
    }

    impl OutputBackend for Rc<StubBackend> {
        fn test(&mut self, _output: &Output, _state: &OutputState) -> Result<(), OutputError> {
            if self.refuse.get() {
                return Err(OutputError::BackendRefused("refused".into()));
            }
            Ok(())
        }

        fn commit(&mut self, _output: &Output, _state: &OutputState) -> Result<(), OutputError> {
            if self.refuse.get() {
                return Err(OutputError::BackendRefused("refused".into()));
            }
            self.commits.set(self.commits.get() + 1);
            Ok(())
        }

        fn schedule_frame(&mut self, output: &Output) {
            output.send_frame();
        }

        fn primary_formats(&self, _caps: BufferCaps) -> FormatSet {
            [crate::backend::allocator::Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Linear,
            }]
            .into_iter()
            .collect()
        }

        fn create_allocator(&self) -> Box<dyn Allocator> {
            Box::new(crate::backend::allocator::shm::ShmAllocator::new())
        }
    }

    fn test_output() -> (Output, Rc<StubBackend>) {
        let backend = Rc::new(StubBackend::default());
        let mode = OutputMode {
            size: (640, 480).into(),
            refresh: 60_000,
            preferred: true,
            aspect_ratio: PictureAspectRatio::None,
        };
        let output = Output::new(
            "TEST-1".into(),
            Box::new(backend.clone()),
            PhysicalProperties {
                size: (0, 0).into(),
                subpixel: Subpixel::Unknown,
                make: "Test".into(),
                model: "Panel".into(),
                serial: String::new(),
            },
            vec![mode],
            Some(mode),
            Fourcc::Xrgb8888,
        );
        (output, backend)
    }

    #[test]
    fn empty_commit_is_a_noop() {
        let (output, backend) = test_output();
        let seq = output.commit_seq();
        output.commit_state(&OutputState::new()).unwrap();
        assert_eq!(output.commit_seq(), seq);
        assert_eq!(backend.commits.get(), 0);
    }

    #[test]
    fn commit_seq_increases() {
        let (output, _) = test_output();
        let mut state = OutputState::new();
        state.set_scale(2.0);
        let before = output.commit_seq();
        output.commit_state(&state).unwrap();
        assert!(output.commit_seq() > before);
        assert_eq!(output.scale(), 2.0);
    }

    #[test]
    fn buffer_size_must_match_mode() {
        let (output, _) = test_output();
        let buffer = crate::backend::allocator::shm::ShmAllocator::new()
            .alloc_buffer(100, 100, Fourcc::Xrgb8888, &[Modifier::Linear])
            .unwrap();
        let mut state = OutputState::new();
        state.set_buffer(&buffer);
        assert!(matches!(
            output.commit_state(&state),
            Err(OutputError::InvalidState(_))
        ));
    }

    #[test]
    fn disabled_output_rejects_buffer_fields() {
        let (output, _) = test_output();
        let mut off = OutputState::new();
        off.set_enabled(false);
        output.commit_state(&off).unwrap();

        let mut state = OutputState::new();
        state.set_render_format(Fourcc::Argb8888);
        assert!(matches!(
            output.commit_state(&state),
            Err(OutputError::InvalidState(_))
        ));
    }

    #[test]
    fn tearing_requires_buffer() {
        let (output, _) = test_output();
        let mut state = OutputState::new();
        state.tearing_page_flip = true;
        assert!(matches!(
            output.commit_state(&state),
            Err(OutputError::InvalidState(_))
        ));
    }

    #[test]
    fn mode_change_needs_buffer_or_reconfiguration() {
        let (output, _) = test_output();
        let mut state = OutputState::new();
        state.set_custom_mode(800, 600, 60_000);
        assert!(matches!(
            output.commit_state(&state),
            Err(OutputError::InvalidState(_))
        ));

        state.allow_reconfiguration = true;
        output.commit_state(&state).unwrap();
        assert_eq!(output.width(), 800);
        assert_eq!(output.height(), 600);
    }

    #[test]
    fn failed_commit_has_no_side_effects() {
        let (output, backend) = test_output();
        backend.refuse.set(true);

        let mut state = OutputState::new();
        state.set_scale(3.0);
        assert!(output.commit_state(&state).is_err());
        assert_eq!(output.scale(), 1.0);
        assert_eq!(output.commit_seq(), 0);
    }

    #[test]
    fn state_round_trip() {
        let (output, _) = test_output();
        let mut state = OutputState::new();
        state
            .set_scale(2.0)
            .set_transform(Transform::_90)
            .set_adaptive_sync_enabled(true);
        output.test_state(&state).unwrap();
        output.commit_state(&state).unwrap();
        assert_eq!(output.scale(), 2.0);
        assert_eq!(output.transform(), Transform::_90);
        assert!(output.adaptive_sync_enabled());
        // untouched fields keep their values
        assert_eq!(output.render_format(), Fourcc::Xrgb8888);
        assert_eq!(output.width(), 640);
    }
}
