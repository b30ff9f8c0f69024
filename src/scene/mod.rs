//! Retained scene graph
//!
//! Compositors describe each frame as a tree of nodes: subtrees for
//! grouping, solid rectangles, and buffers carrying client content. The
//! scene computes per-output visibility and damage, decides between direct
//! scan-out and a render pass per frame, and drives frame callbacks.
//!
//! Node mutations (moving, enabling, reparenting, new content) damage
//! exactly the areas they touched on every output the node is visible on;
//! nothing is repainted unless something changed above it.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::backend::allocator::FormatSet;
use crate::backend::renderer::Color;
use crate::buffer::Buffer;
use crate::utils::{
    addons::AddonSet,
    clock::{Monotonic, Time},
    env,
    signal::Signal,
    BufferCoords, Logical, Point, Rectangle, Region, Size, Transform,
};

mod damage_ring;
pub mod output;

pub use damage_ring::{DamageRing, PREVIOUS_LEN};
pub use output::SceneOutput;

/// How the scene visualises damage, from `SCENE_DEBUG_DAMAGE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugDamage {
    /// No debugging
    #[default]
    None,
    /// Ignore damage tracking and repaint everything
    Rerender,
    /// Tint repainted regions
    Highlight,
}

pub(crate) type Node = Rc<RefCell<NodeInner>>;
pub(crate) type WeakNode = Weak<RefCell<NodeInner>>;

#[derive(Debug)]
pub(crate) struct NodeInner {
    pub(crate) scene: Weak<SceneInner>,
    pub(crate) parent: Option<WeakNode>,
    /// Z-order: the last child is on top
    pub(crate) children: Vec<Node>,
    pub(crate) position: Point<i32, Logical>,
    pub(crate) enabled: bool,
    /// Cached visibility in layout coordinates
    pub(crate) visible: Region<Logical>,
    pub(crate) kind: Kind,
    pub(crate) addons: AddonSet,
    pub(crate) destroyed: bool,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Tree,
    Rect(RectData),
    Buffer(BufferData),
}

#[derive(Debug)]
pub(crate) struct RectData {
    pub(crate) size: Size<i32, Logical>,
    pub(crate) color: Color,
}

#[derive(Debug)]
pub(crate) struct BufferData {
    pub(crate) buffer: Option<Buffer>,
    /// Source crop in buffer coordinates; empty means the whole buffer
    pub(crate) src: Rectangle<f64, BufferCoords>,
    /// Destination size; zero means the (transformed) buffer size
    pub(crate) dst_size: Size<i32, Logical>,
    pub(crate) transform: Transform,
    /// Node-local opaque region
    pub(crate) opaque: Region<Logical>,
    /// Bitmask over scene output indices this node is visible on
    pub(crate) active_outputs: u64,
    /// Scene output index covering the largest visible area
    pub(crate) primary_output: Option<usize>,
    pub(crate) events: SceneBufferEvents,
    pub(crate) last_feedback: Option<ScanoutFeedback>,
}

/// Signals of a buffer node
#[derive(Debug, Clone, Default)]
pub struct SceneBufferEvents {
    /// The set of outputs showing this buffer changed
    pub outputs_update: Signal<OutputsUpdate>,
    /// A frame containing this buffer was presented
    pub frame_done: Signal<Time<Monotonic>>,
    /// Buffer allocation feedback for direct scan-out
    pub feedback: Signal<ScanoutFeedback>,
}

/// Payload of [`SceneBufferEvents::outputs_update`]
#[derive(Debug, Clone, Copy)]
pub struct OutputsUpdate {
    /// Bitmask over scene output indices
    pub active: u64,
    /// Index of the output covering the largest area, if any
    pub primary: Option<usize>,
}

/// Formats that would allow direct scan-out of a buffer node
#[derive(Debug, Clone)]
pub struct ScanoutFeedback {
    /// Formats the renderer can sample, always usable
    pub render_formats: FormatSet,
    /// Formats the primary output could scan out directly
    pub scanout_formats: FormatSet,
}

impl PartialEq for ScanoutFeedback {
    fn eq(&self, other: &Self) -> bool {
        let same = |a: &FormatSet, b: &FormatSet| {
            a.iter().count() == b.iter().count() && a.iter().all(|format| b.contains(&format))
        };
        same(&self.render_formats, &other.render_formats)
            && same(&self.scanout_formats, &other.scanout_formats)
    }
}

pub(crate) struct SceneInner {
    pub(crate) root: RefCell<Option<Node>>,
    pub(crate) outputs: RefCell<Vec<Weak<RefCell<output::SceneOutputInner>>>>,
    pub(crate) used_indices: Cell<u64>,
    pub(crate) direct_scanout_disabled: bool,
    pub(crate) visibility_disabled: bool,
    pub(crate) debug_damage: DebugDamage,
    pub(crate) dmabuf_feedback_formats: RefCell<FormatSet>,
}

/// The root of a retained node tree
#[derive(Clone)]
pub struct Scene {
    pub(crate) inner: Rc<SceneInner>,
}

impl Scene {
    /// Create an empty scene
    pub fn new() -> Scene {
        let inner = Rc::new(SceneInner {
            root: RefCell::new(None),
            outputs: RefCell::new(Vec::new()),
            used_indices: Cell::new(0),
            direct_scanout_disabled: env::bool_env("SCENE_DISABLE_DIRECT_SCANOUT"),
            visibility_disabled: env::bool_env("SCENE_DISABLE_VISIBILITY"),
            debug_damage: env::choice_env(
                "SCENE_DEBUG_DAMAGE",
                &[
                    ("none", DebugDamage::None),
                    ("rerender", DebugDamage::Rerender),
                    ("highlight", DebugDamage::Highlight),
                ],
            )
            .unwrap_or_default(),
            dmabuf_feedback_formats: RefCell::new(FormatSet::new()),
        });

        let root = Rc::new(RefCell::new(NodeInner {
            scene: Rc::downgrade(&inner),
            parent: None,
            children: Vec::new(),
            position: Default::default(),
            enabled: true,
            visible: Region::new(),
            kind: Kind::Tree,
            addons: AddonSet::new(),
            destroyed: false,
        }));
        *inner.root.borrow_mut() = Some(root);

        Scene { inner }
    }

    /// The root subtree
    pub fn tree(&self) -> SceneTree {
        SceneTree {
            node: self.inner.root.borrow().clone().expect("scene root"),
        }
    }

    /// Set the dmabuf formats of the compositor's renderer
    ///
    /// These seed the per-buffer scan-out feedback.
    pub fn set_dmabuf_feedback_formats(&self, formats: FormatSet) {
        *self.inner.dmabuf_feedback_formats.borrow_mut() = formats;
    }

    pub(crate) fn alloc_output_index(&self) -> Option<usize> {
        let used = self.inner.used_indices.get();
        for index in 0..64 {
            if used & (1 << index) == 0 {
                self.inner.used_indices.set(used | (1 << index));
                return Some(index);
            }
        }
        None
    }

    pub(crate) fn free_output_index(&self, index: usize) {
        let used = self.inner.used_indices.get();
        self.inner.used_indices.set(used & !(1 << index));
    }

    /// Recompute every node's cached visibility
    pub(crate) fn update_visibility(&self) {
        let Some(root) = self.inner.root.borrow().clone() else { return };
        let mut opaque_above: Region<Logical> = Region::new();
        update_node_visibility(&root, Point::default(), &mut opaque_above, self.inner.visibility_disabled);
        self.update_outputs();
    }

    /// Push layout-space damage to every attached output
    pub(crate) fn damage(&self, region: &Region<Logical>) {
        if region.is_empty() {
            return;
        }
        // observers of the resulting damage events may touch the scene, so
        // the output list must not stay borrowed while they run
        let outputs: Vec<_> = self
            .inner
            .outputs
            .borrow()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect();
        for scene_output in outputs {
            output::damage_layout(&scene_output, region);
        }
    }

    /// Recompute enter/leave state of every buffer node
    pub(crate) fn update_outputs(&self) {
        let outputs: Vec<(usize, Rectangle<i32, Logical>)> = self
            .inner
            .outputs
            .borrow()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|scene_output| {
                let inner = scene_output.borrow();
                (inner.index, inner.layout_rect())
            })
            .collect();

        let Some(root) = self.inner.root.borrow().clone() else { return };
        let feedback_formats = self.inner.dmabuf_feedback_formats.borrow().clone();
        let scene_outputs = self.inner.outputs.borrow().clone();
        update_buffer_outputs(&root, &outputs, &feedback_formats, &scene_outputs);
    }
}

impl Default for Scene {
    fn default() -> Self {
        Scene::new()
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("outputs", &self.inner.outputs.borrow().len())
            .finish()
    }
}

fn update_node_visibility(
    node: &Node,
    parent_position: Point<i32, Logical>,
    opaque_above: &mut Region<Logical>,
    visibility_disabled: bool,
) {
    let (children, position, enabled) = {
        let inner = node.borrow();
        (inner.children.clone(), inner.position, inner.enabled)
    };
    let absolute = parent_position + position;

    if !enabled {
        let mut inner = node.borrow_mut();
        inner.visible.clear();
        // children of a disabled subtree are invisible too
        drop(inner);
        for child in &children {
            clear_visibility(child);
        }
        return;
    }

    // top-most children first so occlusion accumulates downwards
    for child in children.iter().rev() {
        update_node_visibility(child, absolute, opaque_above, visibility_disabled);
    }

    let mut inner = node.borrow_mut();
    let bounds = node_bounds_inner(&inner);
    let mut visible = Region::new();
    if !bounds.is_empty() {
        let mut abs_bounds = bounds;
        abs_bounds.loc += absolute;
        visible = Region::from_rect(abs_bounds);
        if !visibility_disabled {
            visible = visible.subtract(opaque_above);
        }
    }
    inner.visible = visible;

    // this node now occludes everything behind it
    let opaque = node_opaque_inner(&inner);
    if !opaque.is_empty() {
        let mut opaque = opaque;
        opaque.translate(absolute);
        opaque_above.union(&opaque);
    }
}

fn clear_visibility(node: &Node) {
    let children = {
        let mut inner = node.borrow_mut();
        inner.visible.clear();
        inner.children.clone()
    };
    for child in &children {
        clear_visibility(child);
    }
}

/// The node's own bounds in parent-relative coordinates, excluding children
fn node_bounds_inner(inner: &NodeInner) -> Rectangle<i32, Logical> {
    match &inner.kind {
        Kind::Tree => Rectangle::default(),
        Kind::Rect(rect) => Rectangle::from_size(rect.size),
        Kind::Buffer(data) => {
            let size = buffer_render_size(data);
            Rectangle::from_size(size)
        }
    }
}

/// The size a buffer node occupies in layout space
pub(crate) fn buffer_render_size(data: &BufferData) -> Size<i32, Logical> {
    if !data.dst_size.is_empty() {
        return data.dst_size;
    }
    let Some(buffer) = &data.buffer else {
        return Size::default();
    };
    let size: Size<i32, BufferCoords> = if data.src.is_empty() {
        buffer.size()
    } else {
        data.src.size.to_i32_round().retag()
    };
    data.transform.transform_size(size).retag()
}

/// The node's opaque region in parent-relative coordinates
fn node_opaque_inner(inner: &NodeInner) -> Region<Logical> {
    match &inner.kind {
        Kind::Tree => Region::new(),
        Kind::Rect(rect) => {
            if rect.color.is_opaque() {
                Region::from_rect(Rectangle::from_size(rect.size))
            } else {
                Region::new()
            }
        }
        Kind::Buffer(data) => {
            let mut opaque = data.opaque.clone();
            opaque.clamp(Rectangle::from_size(buffer_render_size(data)));
            opaque
        }
    }
}

fn update_buffer_outputs(
    node: &Node,
    outputs: &[(usize, Rectangle<i32, Logical>)],
    feedback_formats: &FormatSet,
    scene_outputs: &[Weak<RefCell<output::SceneOutputInner>>],
) {
    let children = node.borrow().children.clone();
    for child in &children {
        update_buffer_outputs(child, outputs, feedback_formats, scene_outputs);
    }

    let mut inner = node.borrow_mut();
    let visible_bounds = inner.visible.bounds();
    let Kind::Buffer(data) = &mut inner.kind else { return };

    let mut active = 0u64;
    let mut primary = None;
    let mut primary_area = 0i64;
    for (index, rect) in outputs {
        let Some(overlap) = visible_bounds.intersection(*rect) else {
            continue;
        };
        active |= 1 << index;
        let area = overlap.size.w as i64 * overlap.size.h as i64;
        if area > primary_area {
            primary_area = area;
            primary = Some(*index);
        }
    }

    let changed = data.active_outputs != active || data.primary_output != primary;
    let primary_changed = data.primary_output != primary;
    data.active_outputs = active;
    data.primary_output = primary;

    if changed {
        let events = data.events.clone();
        let update = OutputsUpdate { active, primary };
        drop(inner);
        events.outputs_update.emit(update);
        let mut inner = node.borrow_mut();
        let Kind::Buffer(data) = &mut inner.kind else { return };

        // tell the client how to allocate for direct scan-out on its new
        // primary output
        if primary_changed {
            if let Some(primary) = primary {
                let scanout_formats = scene_outputs
                    .iter()
                    .filter_map(|weak| weak.upgrade())
                    .find(|scene_output| scene_output.borrow().index == primary)
                    .map(|scene_output| {
                        let guard = scene_output.borrow();
                        guard
                            .output
                            .get_primary_formats(crate::buffer::BufferCaps::DMABUF)
                    })
                    .unwrap_or_default();
                let feedback = ScanoutFeedback {
                    render_formats: feedback_formats.clone(),
                    scanout_formats,
                };
                // identical feedback is suppressed
                if data.last_feedback.as_ref() != Some(&feedback) {
                    data.last_feedback = Some(feedback.clone());
                    let events = data.events.clone();
                    drop(inner);
                    events.feedback.emit(feedback);
                }
            }
        }
    }
}

/// Absolute position of a node in layout coordinates
pub(crate) fn node_absolute_position(node: &Node) -> Point<i32, Logical> {
    let mut position = node.borrow().position;
    let mut current = node.borrow().parent.clone();
    while let Some(parent) = current.and_then(|weak| weak.upgrade()) {
        position += parent.borrow().position;
        current = parent.borrow().parent.clone();
    }
    position
}

/// Shared behavior of all node types
#[derive(Clone)]
pub struct SceneNode {
    pub(crate) node: Node,
}

impl SceneNode {
    fn scene(&self) -> Option<Scene> {
        self.node.borrow().scene.upgrade().map(|inner| Scene { inner })
    }

    /// Damage the node's footprint before and after a mutation
    fn mutate(&self, f: impl FnOnce(&mut NodeInner)) {
        let before = self.node.borrow().visible.clone();
        f(&mut self.node.borrow_mut());
        let Some(scene) = self.scene() else { return };
        scene.update_visibility();

        let mut damage = before;
        damage.union(&self.node.borrow().visible);
        scene.damage(&damage);
    }

    /// Position relative to the parent
    pub fn position(&self) -> Point<i32, Logical> {
        self.node.borrow().position
    }

    /// Move the node within its parent
    pub fn set_position(&self, x: i32, y: i32) {
        if self.node.borrow().position == (x, y).into() {
            return;
        }
        self.mutate(|inner| inner.position = (x, y).into());
    }

    /// Whether the node (and its subtree) is shown
    pub fn is_enabled(&self) -> bool {
        self.node.borrow().enabled
    }

    /// Show or hide the node and its subtree
    pub fn set_enabled(&self, enabled: bool) {
        if self.node.borrow().enabled == enabled {
            return;
        }
        self.mutate(|inner| inner.enabled = enabled);
    }

    /// The cached visible region, in layout coordinates
    pub fn visible(&self) -> Region<Logical> {
        self.node.borrow().visible.clone()
    }

    /// Compositor-side extension storage
    pub fn with_addons<T>(&self, f: impl FnOnce(&AddonSet) -> T) -> T {
        f(&self.node.borrow().addons)
    }

    /// Move the node above all its siblings
    pub fn raise_to_top(&self) {
        self.restack(|siblings, index| {
            let node = siblings.remove(index);
            siblings.push(node);
        });
    }

    /// Move the node below all its siblings
    pub fn lower_to_bottom(&self) {
        self.restack(|siblings, index| {
            let node = siblings.remove(index);
            siblings.insert(0, node);
        });
    }

    /// Place this node directly above a sibling
    pub fn place_above(&self, sibling: &SceneNode) {
        let target = sibling.node.clone();
        self.restack(move |siblings, index| {
            let node = siblings.remove(index);
            let anchor = siblings
                .iter()
                .position(|candidate| Rc::ptr_eq(candidate, &target))
                .map(|anchor| anchor + 1)
                .unwrap_or(siblings.len());
            siblings.insert(anchor, node);
        });
    }

    /// Place this node directly below a sibling
    pub fn place_below(&self, sibling: &SceneNode) {
        let target = sibling.node.clone();
        self.restack(move |siblings, index| {
            let node = siblings.remove(index);
            let anchor = siblings
                .iter()
                .position(|candidate| Rc::ptr_eq(candidate, &target))
                .unwrap_or(0);
            siblings.insert(anchor, node);
        });
    }

    fn restack(&self, rearrange: impl FnOnce(&mut Vec<Node>, usize)) {
        let Some(parent) = self.node.borrow().parent.clone().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let before = self.node.borrow().visible.clone();
        {
            let mut parent = parent.borrow_mut();
            let Some(index) = parent
                .children
                .iter()
                .position(|candidate| Rc::ptr_eq(candidate, &self.node))
            else {
                return;
            };
            rearrange(&mut parent.children, index);
        }
        if let Some(scene) = self.scene() {
            scene.update_visibility();
            // stacking changes repaint whatever the node covers or reveals
            let mut damage = before;
            damage.union(&self.node.borrow().visible);
            scene.damage(&damage);
        }
    }

    /// Move the node into another subtree
    ///
    /// Fails when the new parent lives below this node, which would create
    /// a cycle.
    pub fn reparent(&self, new_parent: &SceneTree) -> bool {
        // walk upwards from the target to reject cycles
        let mut current = Some(new_parent.node.clone());
        while let Some(candidate) = current {
            if Rc::ptr_eq(&candidate, &self.node) {
                return false;
            }
            current = candidate.borrow().parent.clone().and_then(|weak| weak.upgrade());
        }

        let before = self.node.borrow().visible.clone();
        if let Some(old_parent) = self.node.borrow().parent.clone().and_then(|weak| weak.upgrade()) {
            old_parent
                .borrow_mut()
                .children
                .retain(|candidate| !Rc::ptr_eq(candidate, &self.node));
        }
        new_parent.node.borrow_mut().children.push(self.node.clone());
        self.node.borrow_mut().parent = Some(Rc::downgrade(&new_parent.node));

        if let Some(scene) = self.scene() {
            scene.update_visibility();
            let mut damage = before;
            damage.union(&self.node.borrow().visible);
            scene.damage(&damage);
        }
        true
    }

    /// Remove the node (and its subtree) from the scene
    pub fn destroy(&self) {
        let before = self.node.borrow().visible.clone();
        if let Some(parent) = self.node.borrow().parent.clone().and_then(|weak| weak.upgrade()) {
            parent
                .borrow_mut()
                .children
                .retain(|candidate| !Rc::ptr_eq(candidate, &self.node));
        }
        {
            let mut inner = self.node.borrow_mut();
            inner.parent = None;
            inner.destroyed = true;
            inner.children.clear();
        }
        if let Some(scene) = self.scene() {
            scene.update_visibility();
            scene.damage(&before);
        }
    }
}

impl fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.node.borrow();
        f.debug_struct("SceneNode")
            .field("position", &inner.position)
            .field("enabled", &inner.enabled)
            .field(
                "kind",
                &match inner.kind {
                    Kind::Tree => "tree",
                    Kind::Rect(_) => "rect",
                    Kind::Buffer(_) => "buffer",
                },
            )
            .finish()
    }
}

fn new_node(parent: &SceneTree, kind: Kind) -> Node {
    let scene = parent.node.borrow().scene.clone();
    let node = Rc::new(RefCell::new(NodeInner {
        scene,
        parent: Some(Rc::downgrade(&parent.node)),
        children: Vec::new(),
        position: Default::default(),
        enabled: true,
        visible: Region::new(),
        kind,
        addons: AddonSet::new(),
        destroyed: false,
    }));
    parent.node.borrow_mut().children.push(node.clone());
    node
}

/// A grouping node; children are stacked in insertion order
#[derive(Clone, Debug)]
pub struct SceneTree {
    pub(crate) node: Node,
}

impl SceneTree {
    /// Create a subtree under `parent`
    pub fn create(parent: &SceneTree) -> SceneTree {
        let node = new_node(parent, Kind::Tree);
        let tree = SceneTree { node };
        if let Some(scene) = tree.node().scene() {
            scene.update_visibility();
        }
        tree
    }

    /// The generic node handle
    pub fn node(&self) -> SceneNode {
        SceneNode {
            node: self.node.clone(),
        }
    }
}

/// A solid colored rectangle
#[derive(Clone, Debug)]
pub struct SceneRect {
    node: Node,
}

impl SceneRect {
    /// Create a rectangle node under `parent`
    pub fn create(parent: &SceneTree, size: Size<i32, Logical>, color: Color) -> SceneRect {
        let node = new_node(parent, Kind::Rect(RectData { size, color }));
        let rect = SceneRect { node };
        rect.node().mutate(|_| {});
        rect
    }

    /// The generic node handle
    pub fn node(&self) -> SceneNode {
        SceneNode {
            node: self.node.clone(),
        }
    }

    /// Change the dimensions
    pub fn set_size(&self, size: Size<i32, Logical>) {
        self.node().mutate(|inner| {
            if let Kind::Rect(data) = &mut inner.kind {
                data.size = size;
            }
        });
    }

    /// Change the fill color
    pub fn set_color(&self, color: Color) {
        self.node().mutate(|inner| {
            if let Kind::Rect(data) = &mut inner.kind {
                data.color = color;
            }
        });
    }

    /// The current fill color
    pub fn color(&self) -> Color {
        match &self.node.borrow().kind {
            Kind::Rect(data) => data.color,
            _ => unreachable!("rect handle over non-rect node"),
        }
    }
}

/// A node showing (part of) a buffer
#[derive(Clone, Debug)]
pub struct SceneBuffer {
    pub(crate) node: Node,
}

impl SceneBuffer {
    /// Create a buffer node under `parent`
    pub fn create(parent: &SceneTree, buffer: Option<&Buffer>) -> SceneBuffer {
        let node = new_node(
            parent,
            Kind::Buffer(BufferData {
                buffer: buffer.cloned(),
                src: Default::default(),
                dst_size: Size::default(),
                transform: Transform::Normal,
                opaque: Region::new(),
                active_outputs: 0,
                primary_output: None,
                events: SceneBufferEvents::default(),
                last_feedback: None,
            }),
        );
        let scene_buffer = SceneBuffer { node };
        scene_buffer.node().mutate(|_| {});
        scene_buffer
    }

    /// The generic node handle
    pub fn node(&self) -> SceneNode {
        SceneNode {
            node: self.node.clone(),
        }
    }

    /// The signals of this buffer node
    pub fn events(&self) -> SceneBufferEvents {
        match &self.node.borrow().kind {
            Kind::Buffer(data) => data.events.clone(),
            _ => unreachable!("buffer handle over non-buffer node"),
        }
    }

    /// Swap the content, optionally with buffer-local damage
    pub fn set_buffer(&self, buffer: Option<&Buffer>, damage: Option<&Region<BufferCoords>>) {
        if damage.is_some() {
            // partial update: content size is unchanged, only damage the
            // reported area
            let position = node_absolute_position(&self.node);
            {
                let mut inner = self.node.borrow_mut();
                if let Kind::Buffer(data) = &mut inner.kind {
                    data.buffer = buffer.cloned();
                }
            }
            if let (Some(scene), Some(damage)) = (self.node().scene(), damage) {
                let mut layout_damage: Region<Logical> = damage.map(|rect| rect.retag());
                layout_damage.translate(position);
                let visible = self.node.borrow().visible.clone();
                scene.damage(&layout_damage.intersect(&visible));
            }
            return;
        }

        self.node().mutate(|inner| {
            if let Kind::Buffer(data) = &mut inner.kind {
                data.buffer = buffer.cloned();
            }
        });
    }

    /// The current buffer
    pub fn buffer(&self) -> Option<Buffer> {
        match &self.node.borrow().kind {
            Kind::Buffer(data) => data.buffer.clone(),
            _ => unreachable!("buffer handle over non-buffer node"),
        }
    }

    /// Set the source crop, in buffer coordinates
    pub fn set_source_box(&self, src: Rectangle<f64, BufferCoords>) {
        self.node().mutate(|inner| {
            if let Kind::Buffer(data) = &mut inner.kind {
                data.src = src;
            }
        });
    }

    /// Set the destination size in layout coordinates
    pub fn set_dest_size(&self, size: Size<i32, Logical>) {
        self.node().mutate(|inner| {
            if let Kind::Buffer(data) = &mut inner.kind {
                data.dst_size = size;
            }
        });
    }

    /// Set the content transform
    pub fn set_transform(&self, transform: Transform) {
        self.node().mutate(|inner| {
            if let Kind::Buffer(data) = &mut inner.kind {
                data.transform = transform;
            }
        });
    }

    /// Declare the opaque region of the content, node-local
    pub fn set_opaque_region(&self, opaque: Region<Logical>) {
        self.node().mutate(|inner| {
            if let Kind::Buffer(data) = &mut inner.kind {
                data.opaque = opaque;
            }
        });
    }

    /// Bitmask over scene output indices this buffer is visible on
    pub fn active_outputs(&self) -> u64 {
        match &self.node.borrow().kind {
            Kind::Buffer(data) => data.active_outputs,
            _ => unreachable!("buffer handle over non-buffer node"),
        }
    }

    /// Index of the output showing the largest part of this buffer
    pub fn primary_output(&self) -> Option<usize> {
        match &self.node.borrow().kind {
            Kind::Buffer(data) => data.primary_output,
            _ => unreachable!("buffer handle over non-buffer node"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_occludes_content_below() {
        let scene = Scene::new();
        let root = scene.tree();

        let below = SceneRect::create(
            &root,
            (100, 100).into(),
            Color { r: 1.0, g: 0.0, b: 0.0, a: 1.0 },
        );
        let above = SceneRect::create(
            &root,
            (100, 100).into(),
            Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 },
        );
        let _ = above;

        assert!(below.node().visible().is_empty());
    }

    #[test]
    fn translucent_rect_does_not_occlude() {
        let scene = Scene::new();
        let root = scene.tree();

        let below = SceneRect::create(
            &root,
            (100, 100).into(),
            Color { r: 1.0, g: 0.0, b: 0.0, a: 1.0 },
        );
        let _above = SceneRect::create(
            &root,
            (100, 100).into(),
            Color { r: 0.0, g: 0.0, b: 0.0, a: 0.5 },
        );

        assert!(!below.node().visible().is_empty());
    }

    #[test]
    fn disabling_restores_visibility_below() {
        let scene = Scene::new();
        let root = scene.tree();

        let below = SceneRect::create(
            &root,
            (50, 50).into(),
            Color { r: 1.0, g: 1.0, b: 1.0, a: 1.0 },
        );
        let above = SceneRect::create(
            &root,
            (50, 50).into(),
            Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 },
        );

        assert!(below.node().visible().is_empty());
        above.node().set_enabled(false);
        assert!(!below.node().visible().is_empty());
    }

    #[test]
    fn reparent_rejects_cycles() {
        let scene = Scene::new();
        let root = scene.tree();

        let outer = SceneTree::create(&root);
        let inner = SceneTree::create(&outer);

        assert!(!outer.node().reparent(&inner));
        assert!(inner.node().reparent(&root));
    }

    #[test]
    fn partial_visibility_with_offset_occluder() {
        let scene = Scene::new();
        let root = scene.tree();

        let below = SceneRect::create(
            &root,
            (100, 100).into(),
            Color { r: 1.0, g: 1.0, b: 1.0, a: 1.0 },
        );
        let above = SceneRect::create(
            &root,
            (100, 100).into(),
            Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 },
        );
        above.node().set_position(50, 0);

        let visible = below.node().visible();
        assert!(visible.overlaps(Rectangle::new((0, 0).into(), (50, 100).into())));
        assert!(!visible.overlaps(Rectangle::new((60, 0).into(), (40, 100).into())));
    }
}
