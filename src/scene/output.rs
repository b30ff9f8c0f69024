//! Per-output view of a scene
//!
//! A [`SceneOutput`] ties one [`Output`] into a [`Scene`]: it tracks the
//! output's position in layout space, accumulates damage in an aged ring,
//! and turns the visible nodes into frames, either by handing a single
//! buffer to the output for direct scan-out or by compositing through a
//! renderer.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, trace};

use crate::backend::renderer::{
    BlendMode, Color, FilterMode, PassOptions, RectArgs, RenderPass, Renderer, TextureArgs,
};
use crate::output::{Output, OutputError, OutputState};
use crate::utils::{
    clock::{Monotonic, Time},
    Logical, Physical, Point, Rectangle, Region, Size, Transform,
};

use super::damage_ring::DamageRing;
use super::{buffer_render_size, DebugDamage, Kind, Node, Scene, SceneInner};

pub(crate) struct SceneOutputInner {
    pub(crate) scene: Weak<SceneInner>,
    pub(crate) output: Output,
    pub(crate) position: Point<i32, Logical>,
    pub(crate) index: usize,
    pub(crate) damage_ring: DamageRing,
    /// Footprint of the software cursor in the last frame
    last_cursor: Option<Rectangle<i32, Physical>>,
}

impl SceneOutputInner {
    /// The rectangle the output covers in layout coordinates
    pub(crate) fn layout_rect(&self) -> Rectangle<i32, Logical> {
        let scale = self.output.scale();
        let size = self.output.effective_resolution().to_logical(scale);
        Rectangle::new(self.position, size)
    }
}

/// One output's view into a scene
#[derive(Clone)]
pub struct SceneOutput {
    inner: Rc<RefCell<SceneOutputInner>>,
}

/// Clip layout-space damage to the output and feed its ring
pub(crate) fn damage_layout(inner: &Rc<RefCell<SceneOutputInner>>, region: &Region<Logical>) {
    let (output, damage) = {
        let mut guard = inner.borrow_mut();
        let layout_rect = guard.layout_rect();
        let scale = guard.output.scale();
        let position = guard.position;

        let mut local = region.clone();
        local.clamp(layout_rect);
        if local.is_empty() {
            return;
        }
        local.translate(Point::default() - position);
        let physical: Region<Physical> = local.map(|rect| rect.to_physical(scale));
        guard.damage_ring.add(&physical);
        (guard.output.clone(), physical)
    };
    output.events().damage.emit(damage);
    output.set_needs_frame();
}

/// One visible node, in front-to-back order
struct RenderEntry {
    node: Node,
    /// Node origin relative to the output, in layout coordinates
    local_position: Point<i32, Logical>,
}

impl SceneOutput {
    /// Attach an output to a scene at layout position (0, 0)
    ///
    /// Fails once 64 outputs are attached.
    pub fn create(scene: &Scene, output: &Output) -> Option<SceneOutput> {
        let index = scene.alloc_output_index()?;
        debug!("Scene output {} for {}", index, output.name());

        let inner = Rc::new(RefCell::new(SceneOutputInner {
            scene: Rc::downgrade(&scene.inner),
            output: output.clone(),
            position: Default::default(),
            index,
            damage_ring: DamageRing::new(output.effective_resolution()),
            last_cursor: None,
        }));
        scene.inner.outputs.borrow_mut().push(Rc::downgrade(&inner));

        let scene_output = SceneOutput { inner };
        scene_output.damage_whole();
        scene.update_outputs();
        Some(scene_output)
    }

    /// The output this view belongs to
    pub fn output(&self) -> Output {
        self.inner.borrow().output.clone()
    }

    /// The index used in [`SceneBuffer::active_outputs`](super::SceneBuffer::active_outputs) masks
    pub fn index(&self) -> usize {
        self.inner.borrow().index
    }

    /// Position of the output in layout coordinates
    pub fn position(&self) -> Point<i32, Logical> {
        self.inner.borrow().position
    }

    /// Move the output within the layout
    pub fn set_position(&self, x: i32, y: i32) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.position == (x, y).into() {
                return;
            }
            inner.position = (x, y).into();
        }
        self.damage_whole();
        if let Some(scene) = self.scene() {
            scene.update_outputs();
        }
    }

    /// Detach from the scene
    pub fn destroy(&self) {
        let Some(scene) = self.scene() else { return };
        let index = self.inner.borrow().index;
        scene.free_output_index(index);
        scene
            .inner
            .outputs
            .borrow_mut()
            .retain(|weak| weak.upgrade().map(|other| !Rc::ptr_eq(&other, &self.inner)).unwrap_or(false));
        scene.update_outputs();
    }

    /// Mark the entire output as damaged
    pub fn damage_whole(&self) {
        let output = {
            let mut inner = self.inner.borrow_mut();
            let bounds = inner.output.effective_resolution();
            inner.damage_ring.set_bounds(bounds);
            inner.damage_ring.add_whole();
            inner.output.clone()
        };
        output.set_needs_frame();
    }

    /// Ask the output for a `frame` event
    pub fn schedule_frame(&self) {
        self.inner.borrow().output.schedule_frame();
    }

    /// Report a presented frame to every buffer shown on this output
    pub fn send_frame_done(&self, time: Time<Monotonic>) {
        let Some(scene) = self.scene() else { return };
        let index = self.inner.borrow().index;
        let Some(root) = scene.inner.root.borrow().clone() else { return };
        send_frame_done_walk(&root, index, time);
    }

    /// Build and submit the next frame
    ///
    /// Tries direct scan-out of a single fullscreen buffer first, falling
    /// back to compositing with the given renderer. Returns `Ok(false)`
    /// when nothing needed to be drawn.
    #[profiling::function]
    pub fn commit(&self, renderer: &mut dyn Renderer) -> Result<bool, OutputError> {
        let Some(scene) = self.scene() else {
            return Err(OutputError::BackendGone);
        };
        let output = self.output();
        if !output.is_enabled() {
            return Ok(false);
        }

        {
            // the mode may have changed since the last frame
            let mut inner = self.inner.borrow_mut();
            let bounds = inner.output.effective_resolution();
            inner.damage_ring.set_bounds(bounds);

            // a software cursor damages what it covers, before and after
            let cursor_rect = if !output.cursor_is_hardware() {
                output.cursor_buffer().map(|cursor| {
                    let scale = output.scale();
                    let position = output.cursor_position();
                    let hotspot = output.cursor_hotspot();
                    let origin: Point<i32, Logical> =
                        (position.x as i32 - hotspot.x, position.y as i32 - hotspot.y).into();
                    Rectangle::new(
                        origin.to_physical(scale),
                        Size::<i32, Physical>::from((cursor.width(), cursor.height())),
                    )
                })
            } else {
                None
            };
            if cursor_rect != inner.last_cursor {
                if let Some(rect) = inner.last_cursor.take() {
                    inner.damage_ring.add_rect(rect);
                }
                if let Some(rect) = cursor_rect {
                    inner.damage_ring.add_rect(rect);
                }
                inner.last_cursor = cursor_rect;
            }
        }

        let entries = self.build_render_list(&scene);

        if self.try_direct_scanout(&scene, &output, &entries)? {
            trace!("Frame presented by direct scan-out");
            self.inner.borrow_mut().damage_ring.rotate();
            return Ok(true);
        }

        self.render_frame(&scene, &output, renderer, &entries)
    }

    fn scene(&self) -> Option<Scene> {
        self.inner.borrow().scene.upgrade().map(|inner| Scene { inner })
    }

    /// Collect visible nodes, front to back, pruning behind a fullscreen
    /// opaque black rectangle
    fn build_render_list(&self, scene: &Scene) -> Vec<RenderEntry> {
        let guard = self.inner.borrow();
        let layout_rect = guard.layout_rect();
        let position = guard.position;
        drop(guard);

        let mut entries = Vec::new();
        let Some(root) = scene.inner.root.borrow().clone() else {
            return entries;
        };
        collect_render_list(&root, Point::default(), layout_rect, position, &mut entries);
        entries
    }

    fn try_direct_scanout(
        &self,
        scene: &Scene,
        output: &Output,
        entries: &[RenderEntry],
    ) -> Result<bool, OutputError> {
        if scene.inner.direct_scanout_disabled
            || scene.inner.debug_damage == DebugDamage::Highlight
            || output.attach_render_locks() > 0
        {
            return Ok(false);
        }
        // a software cursor has to be composited
        if output.cursor_buffer().is_some() && !output.cursor_is_hardware() {
            return Ok(false);
        }
        let [entry] = entries else {
            return Ok(false);
        };

        let guard = self.inner.borrow();
        let scale = guard.output.scale();
        let node = entry.node.borrow();
        let Kind::Buffer(data) = &node.kind else {
            return Ok(false);
        };
        let Some(buffer) = data.buffer.clone() else {
            return Ok(false);
        };

        if data.transform != output.transform() {
            return Ok(false);
        }

        // the buffer must exactly cover the output
        let dst = Rectangle::new(
            entry.local_position.to_physical(scale),
            buffer_render_size(data).to_physical(scale),
        );
        if dst.loc != Point::default() || dst.size != output.effective_resolution() {
            return Ok(false);
        }

        // partial source crops cannot be expressed to the primary plane
        if !data.src.is_empty() {
            let full = Rectangle::from_size((buffer.width() as f64, buffer.height() as f64).into());
            if data.src != full {
                return Ok(false);
            }
        }

        let damage = guard
            .damage_ring
            .current()
            .map(|rect| rect.retag::<crate::utils::BufferCoords>());
        drop(node);
        drop(guard);

        let mut state = OutputState::new();
        state.set_buffer(&buffer);
        state.set_damage(damage);

        if output.test_state(&state).is_err() {
            return Ok(false);
        }
        output.commit_state(&state)?;
        Ok(true)
    }

    #[profiling::function]
    fn render_frame(
        &self,
        scene: &Scene,
        output: &Output,
        renderer: &mut dyn Renderer,
        entries: &[RenderEntry],
    ) -> Result<bool, OutputError> {
        let needs_frame = {
            let guard = self.inner.borrow();
            !guard.damage_ring.is_empty()
        };
        if !needs_frame {
            return Ok(false);
        }

        let (slot, age) = output.acquire_swapchain_buffer()?;
        let buffer = slot.buffer();

        let (mut damage, scale, position, transform, effective) = {
            let guard = self.inner.borrow();
            let damage = guard.damage_ring.buffer_damage(age as usize);
            (
                damage,
                guard.output.scale(),
                guard.position,
                guard.output.transform(),
                guard.output.effective_resolution(),
            )
        };
        if scene.inner.debug_damage == DebugDamage::Rerender {
            damage = Region::from_rect(Rectangle::from_size(effective));
        }

        // draw everything in buffer-local orientation
        let to_buffer =
            |rect: Rectangle<i32, Physical>| transform.transform_rect_in(rect, &effective);
        let buffer_damage: Region<Physical> = damage.map(to_buffer);

        let mut pass = renderer
            .begin_buffer_pass(&buffer, &PassOptions::default())
            .map_err(|err| OutputError::BackendRefused(err.to_string()))?;

        // black background where no opaque content will land
        let mut background = buffer_damage.clone();
        for entry in entries {
            let node = entry.node.borrow();
            let opaque = match &node.kind {
                Kind::Rect(rect) if rect.color.is_opaque() => {
                    Region::from_rect(Rectangle::from_size(rect.size))
                }
                Kind::Buffer(data) => data.opaque.clone(),
                _ => Region::new(),
            };
            let mut opaque = opaque;
            opaque.translate(entry.local_position);
            let physical: Region<Physical> = opaque.map(|rect| rect.to_physical(scale));
            background = background.subtract(&physical.map(to_buffer));
        }
        pass.add_rect(RectArgs {
            dst: Rectangle::from_size(transform.transform_size(effective)),
            color: Color::BLACK,
            blend: BlendMode::None,
            clip: Some(&background),
        });

        // bottom to top
        for entry in entries.iter().rev() {
            let node = entry.node.borrow();
            match &node.kind {
                Kind::Rect(rect) => {
                    let dst = to_buffer(Rectangle::new(
                        entry.local_position.to_physical(scale),
                        rect.size.to_physical(scale),
                    ));
                    pass.add_rect(RectArgs {
                        dst,
                        color: rect.color,
                        blend: BlendMode::PremultipliedAlpha,
                        clip: Some(&buffer_damage),
                    });
                }
                Kind::Buffer(data) => {
                    let Some(node_buffer) = &data.buffer else { continue };
                    let texture = match renderer.texture_from_buffer(node_buffer) {
                        Ok(texture) => texture,
                        Err(err) => {
                            debug!("Skipping undrawable buffer: {}", err);
                            continue;
                        }
                    };
                    let dst = to_buffer(Rectangle::new(
                        entry.local_position.to_physical(scale),
                        buffer_render_size(data).to_physical(scale),
                    ));
                    pass.add_texture(TextureArgs {
                        texture: texture.as_ref(),
                        src: data.src,
                        dst,
                        transform: data.transform.compose(transform),
                        clip: Some(&buffer_damage),
                        filter: FilterMode::Bilinear,
                        blend: BlendMode::PremultipliedAlpha,
                        alpha: 1.0,
                    });
                }
                Kind::Tree => {}
            }
        }

        self.draw_software_cursor(output, renderer, pass.as_mut(), scale, transform, effective);

        if scene.inner.debug_damage == DebugDamage::Highlight {
            pass.add_rect(RectArgs {
                dst: Rectangle::from_size(transform.transform_size(effective)),
                color: Color { r: 1.0, g: 0.0, b: 0.0, a: 0.3 },
                blend: BlendMode::PremultipliedAlpha,
                clip: Some(&buffer_damage),
            });
        }

        pass.submit()
            .map_err(|err| OutputError::BackendRefused(err.to_string()))?;

        let mut state = OutputState::new();
        state.set_buffer(&buffer);
        state.set_damage(buffer_damage.map(|rect| rect.retag()));
        output.commit_state(&state)?;
        output.mark_slot_submitted(&slot);

        self.inner.borrow_mut().damage_ring.rotate();
        trace!("Frame composited");
        Ok(true)
    }

    fn draw_software_cursor(
        &self,
        output: &Output,
        renderer: &mut dyn Renderer,
        pass: &mut dyn RenderPass,
        scale: f64,
        transform: Transform,
        effective: Size<i32, Physical>,
    ) {
        if output.cursor_is_hardware() {
            return;
        }
        let Some(cursor) = output.cursor_buffer() else { return };
        let Ok(texture) = renderer.texture_from_buffer(&cursor) else {
            return;
        };

        let position = output.cursor_position();
        let hotspot = output.cursor_hotspot();
        let origin: Point<i32, Logical> =
            (position.x as i32 - hotspot.x, position.y as i32 - hotspot.y).into();
        let dst = transform.transform_rect_in(
            Rectangle::new(
                origin.to_physical(scale),
                Size::<i32, Physical>::from((cursor.width(), cursor.height())),
            ),
            &effective,
        );
        pass.add_texture(TextureArgs {
            texture: texture.as_ref(),
            src: Default::default(),
            dst,
            transform,
            clip: None,
            filter: FilterMode::Bilinear,
            blend: BlendMode::PremultipliedAlpha,
            alpha: 1.0,
        });
    }
}

impl fmt::Debug for SceneOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SceneOutput")
            .field("output", &inner.output.name())
            .field("index", &inner.index)
            .field("position", &inner.position)
            .finish()
    }
}

/// Depth-first, top-most first; returns true when an opaque fullscreen
/// black rectangle ended the contribution of everything behind it.
fn collect_render_list(
    node: &Node,
    parent_position: Point<i32, Logical>,
    layout_rect: Rectangle<i32, Logical>,
    output_position: Point<i32, Logical>,
    entries: &mut Vec<RenderEntry>,
) -> bool {
    let (children, position, enabled) = {
        let inner = node.borrow();
        (inner.children.clone(), inner.position, inner.enabled)
    };
    if !enabled {
        return false;
    }
    let absolute = parent_position + position;

    for child in children.iter().rev() {
        if collect_render_list(child, absolute, layout_rect, output_position, entries) {
            return true;
        }
    }

    let inner = node.borrow();
    if inner.visible.is_empty() || !inner.visible.overlaps(layout_rect) {
        return false;
    }

    match &inner.kind {
        Kind::Tree => false,
        Kind::Rect(rect) => {
            if rect.color.a <= 0.0 {
                return false;
            }
            entries.push(RenderEntry {
                node: node.clone(),
                local_position: absolute - output_position,
            });
            // a fully opaque black rectangle covering the output swallows
            // everything behind it
            let is_black = rect.color.is_opaque()
                && rect.color.r == 0.0
                && rect.color.g == 0.0
                && rect.color.b == 0.0;
            is_black && Rectangle::new(absolute, rect.size).intersection(layout_rect) == Some(layout_rect)
        }
        Kind::Buffer(data) => {
            if data.buffer.is_none() {
                return false;
            }
            entries.push(RenderEntry {
                node: node.clone(),
                local_position: absolute - output_position,
            });
            false
        }
    }
}

fn send_frame_done_walk(node: &Node, index: usize, time: Time<Monotonic>) {
    let children = node.borrow().children.clone();
    for child in &children {
        send_frame_done_walk(child, index, time);
    }
    let events = {
        let inner = node.borrow();
        match &inner.kind {
            Kind::Buffer(data) if data.active_outputs & (1 << index) != 0 => Some(data.events.clone()),
            _ => None,
        }
    };
    if let Some(events) = events {
        events.frame_done.emit(time);
    }
}
