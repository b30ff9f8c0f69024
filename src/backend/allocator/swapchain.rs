use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use super::{Allocator, AllocatorError, Fourcc, Modifier};
use crate::buffer::Buffer;

/// Number of buffers a swapchain rotates through
pub const SLOT_CAP: usize = 4;

/// A small ring of identically shaped buffers
///
/// Each [`acquire`](Swapchain::acquire) hands out a currently unused slot
/// together with its age: the number of frames since the slot's content was
/// last displayed, or 0 if the buffer is new. The age feeds damage-history
/// composition, letting the renderer repaint only what changed since that
/// buffer was on screen.
pub struct Swapchain<A: Allocator> {
    /// The allocator the buffers are drawn from
    pub allocator: A,

    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: Vec<Modifier>,

    slots: [Slot; SLOT_CAP],
}

/// Handle to one buffer of a [`Swapchain`]
#[derive(Clone)]
pub struct Slot {
    inner: Rc<SlotInner>,
}

struct SlotInner {
    buffer: RefCell<Option<Buffer>>,
    acquired: Cell<bool>,
    // 0 = never displayed, 1 = displayed last frame, ...
    age: Cell<u8>,
}

impl Slot {
    /// The buffer of this slot
    pub fn buffer(&self) -> Buffer {
        self.inner
            .borrow_buffer()
            .clone()
            .expect("acquired slot without buffer")
    }

    /// Age of the slot content in frames, 0 for a fresh buffer
    pub fn age(&self) -> u8 {
        self.inner.age.get()
    }

    /// Release this slot back to the swapchain
    pub fn release(&self) {
        self.inner.acquired.set(false);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // the swapchain's own array holds one reference; release once the
        // last handle outside of it goes away
        if Rc::strong_count(&self.inner) <= 2 {
            self.inner.acquired.set(false);
        }
    }
}

impl SlotInner {
    fn borrow_buffer(&self) -> std::cell::Ref<'_, Option<Buffer>> {
        self.buffer.borrow()
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("acquired", &self.inner.acquired.get())
            .field("age", &self.inner.age.get())
            .finish()
    }
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            inner: Rc::new(SlotInner {
                buffer: RefCell::new(None),
                acquired: Cell::new(false),
                age: Cell::new(0),
            }),
        }
    }
}

impl<A: Allocator> Swapchain<A> {
    /// Create a new swapchain with the given dimensions and format
    pub fn new(allocator: A, width: u32, height: u32, fourcc: Fourcc, modifiers: Vec<Modifier>) -> Self {
        Swapchain {
            allocator,
            width,
            height,
            fourcc,
            modifiers,
            slots: Default::default(),
        }
    }

    /// Acquire a free slot, allocating its buffer if needed
    ///
    /// Returns `Ok(None)` if every slot is currently in use.
    pub fn acquire(&mut self) -> Result<Option<Slot>, AllocatorError> {
        let Some(slot) = self.slots.iter().find(|slot| !slot.inner.acquired.get()) else {
            return Ok(None);
        };

        if slot.inner.buffer.borrow().is_none() {
            let buffer =
                self.allocator
                    .alloc_buffer(self.width, self.height, self.fourcc, &self.modifiers)?;
            *slot.inner.buffer.borrow_mut() = Some(buffer);
            slot.inner.age.set(0);
        }

        slot.inner.acquired.set(true);
        Ok(Some(slot.clone()))
    }

    /// Record that the given slot is about to be displayed
    ///
    /// Ages every other slot by one frame; the submitted slot starts the
    /// next frame at age 1.
    pub fn submitted(&mut self, submitted: &Slot) {
        for slot in &self.slots {
            let age = slot.inner.age.get();
            if slot == submitted {
                slot.inner.age.set(1);
            } else if age > 0 {
                slot.inner.age.set(age.saturating_add(1));
            }
        }
    }

    /// Change the dimensions of the swapchain
    ///
    /// Invalidates all slots; previously handed out buffers stay alive until
    /// their holders release them.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.slots = Default::default();
    }

    /// Change the format of the swapchain, invalidating all slots
    pub fn reformat(&mut self, fourcc: Fourcc, modifiers: Vec<Modifier>) {
        if self.fourcc == fourcc && self.modifiers == modifiers {
            return;
        }
        self.fourcc = fourcc;
        self.modifiers = modifiers;
        self.slots = Default::default();
    }

    /// Dimensions of the buffers handed out by this swapchain
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Fourcc of the buffers handed out by this swapchain
    pub fn format(&self) -> Fourcc {
        self.fourcc
    }

    /// The modifiers buffers are allocated with
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }
}

impl<A: Allocator + fmt::Debug> fmt::Debug for Swapchain<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("allocator", &self.allocator)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fourcc", &self.fourcc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::shm::ShmAllocator;

    fn swapchain() -> Swapchain<ShmAllocator> {
        Swapchain::new(ShmAllocator::new(), 32, 32, Fourcc::Argb8888, vec![Modifier::Linear])
    }

    #[test]
    fn acquire_hands_out_distinct_slots() {
        let mut chain = swapchain();
        let a = chain.acquire().unwrap().unwrap();
        let b = chain.acquire().unwrap().unwrap();
        assert!(a != b);
        assert!(a.buffer() != b.buffer());
    }

    #[test]
    fn acquire_exhausts_at_capacity() {
        let mut chain = swapchain();
        let slots: Vec<_> = (0..SLOT_CAP).map(|_| chain.acquire().unwrap().unwrap()).collect();
        assert!(chain.acquire().unwrap().is_none());
        drop(slots);
        assert!(chain.acquire().unwrap().is_some());
    }

    #[test]
    fn age_counts_frames_since_display() {
        let mut chain = swapchain();

        let first = chain.acquire().unwrap().unwrap();
        assert_eq!(first.age(), 0);
        chain.submitted(&first);

        let second = chain.acquire().unwrap().unwrap();
        assert_eq!(second.age(), 0);
        chain.submitted(&second);
        // the first buffer left the screen with the flip to the second
        drop(first);

        let third = chain.acquire().unwrap().unwrap();
        assert_eq!(third.age(), 2);
        drop(second);
    }

    #[test]
    fn resize_invalidates_slots() {
        let mut chain = swapchain();
        let slot = chain.acquire().unwrap().unwrap();
        chain.submitted(&slot);
        drop(slot);

        chain.resize(64, 64);
        let fresh = chain.acquire().unwrap().unwrap();
        assert_eq!(fresh.age(), 0);
        assert_eq!(fresh.buffer().width(), 64);
    }
}
