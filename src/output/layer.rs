//! Output layers
//!
//! A layer is a sub-region of an output composed by the display hardware
//! (an overlay plane) instead of the renderer. Compositors register layers
//! with [`Output::create_layer`](super::Output::create_layer) and submit a
//! [`LayerState`] for every registered layer with each commit that sets
//! the `layers` field.
//!
//! Whether a layer actually made it onto a plane is reported back through
//! [`OutputLayer::accepted`]; layers the hardware refused must be drawn by
//! the compositor. The `feedback` signal carries the buffer formats that
//! would let a candidate plane take the layer next frame.

use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
};

use crate::backend::allocator::FormatSet;
use crate::buffer::Buffer;
use crate::utils::{signal::Signal, BufferCoords, Physical, Rectangle};

/// Formats candidate planes would accept for a layer
#[derive(Debug, Clone)]
pub struct LayerFeedback {
    /// Dmabuf formats to reallocate the layer buffer in
    pub formats: FormatSet,
}

#[derive(Debug, Default)]
struct LayerInner {
    buffer: Option<Buffer>,
    src: Rectangle<f64, BufferCoords>,
    dst: Rectangle<i32, Physical>,
    accepted: bool,
    feedback: Signal<LayerFeedback>,
}

/// Handle to one layer of an output
#[derive(Clone, Default)]
pub struct OutputLayer {
    inner: Rc<RefCell<LayerInner>>,
}

/// Pending state of one layer, submitted with the output commit
#[derive(Debug, Clone)]
pub struct LayerState {
    /// The layer this state belongs to
    pub layer: OutputLayer,
    /// The content of the layer, `None` to turn it off
    pub buffer: Option<Buffer>,
    /// Source crop in buffer coordinates; empty means the whole buffer
    pub src: Rectangle<f64, BufferCoords>,
    /// Placement on the output in physical pixels
    pub dst: Rectangle<i32, Physical>,
}

impl OutputLayer {
    pub(crate) fn new() -> OutputLayer {
        Default::default()
    }

    /// The currently committed buffer of this layer
    pub fn buffer(&self) -> Option<Buffer> {
        self.inner.borrow().buffer.clone()
    }

    /// The currently committed source crop
    pub fn src(&self) -> Rectangle<f64, BufferCoords> {
        self.inner.borrow().src
    }

    /// The currently committed placement
    pub fn dst(&self) -> Rectangle<i32, Physical> {
        self.inner.borrow().dst
    }

    /// Whether the hardware took this layer in the last commit
    ///
    /// `false` means the compositor has to composite the layer content
    /// itself.
    pub fn accepted(&self) -> bool {
        self.inner.borrow().accepted
    }

    /// Emitted with formats that would make this layer scan-out capable
    pub fn feedback_signal(&self) -> Signal<LayerFeedback> {
        self.inner.borrow().feedback.clone()
    }

    pub(crate) fn apply(&self, state: &LayerState) {
        let mut inner = self.inner.borrow_mut();
        inner.buffer = state.buffer.clone();
        inner.src = state.src;
        inner.dst = state.dst;
    }

    pub(crate) fn set_accepted(&self, accepted: bool) {
        self.inner.borrow_mut().accepted = accepted;
    }

    pub(crate) fn send_feedback(&self, feedback: LayerFeedback) {
        let signal = self.inner.borrow().feedback.clone();
        signal.emit(feedback);
    }
}

impl PartialEq for OutputLayer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for OutputLayer {}

impl fmt::Debug for OutputLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("OutputLayer")
            .field("dst", &inner.dst)
            .field("accepted", &inner.accepted)
            .finish()
    }
}
