//! Reference-counted pixel containers
//!
//! A [`Buffer`] is the unit of content handed between allocators, renderers,
//! scene nodes and outputs. It is a cheap handle; the underlying storage is
//! shared and lives until every handle and every [`BufferLock`] is gone.
//!
//! Consumers that need the content to stay valid (a plane scanning the
//! buffer out, a renderer sampling from it) take a [`BufferLock`]. Once the
//! producer calls [`Buffer::drop_buffer`] and the last lock is released, the
//! buffer destroys its storage and notifies observers.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use crate::backend::allocator::{dmabuf::Dmabuf, shm::ShmMapping};
use crate::utils::{addons::AddonSet, signal::Signal, BufferCoords, Size};

bitflags::bitflags! {
    /// Ways the content of a buffer can be accessed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferCaps: u32 {
        /// The buffer can be exported as a dmabuf
        const DMABUF = 1 << 0;
        /// The buffer content can be read through a plain pointer
        const DATA_PTR = 1 << 1;
    }
}

/// The backing storage of a [`Buffer`]
///
/// A buffer carries at most one dmabuf and one shared-memory view of the
/// same content.
#[derive(Debug)]
pub enum BufferSource {
    /// GPU-visible memory described by a dmabuf
    Dmabuf(Dmabuf),
    /// CPU-visible shared memory
    Shm(ShmMapping),
    /// Both views onto the same content
    DmabufAndShm(Dmabuf, ShmMapping),
    /// A client resource this crate cannot read directly
    Opaque {
        /// External resource identity
        id: u64,
    },
}

#[derive(Debug)]
struct BufferInner {
    size: Size<i32, BufferCoords>,
    source: BufferSource,
    locks: usize,
    dropped: bool,
    release: Signal<()>,
    destroy: Signal<()>,
    addons: AddonSet,
}

/// Handle to a pixel container
pub struct Buffer {
    inner: Rc<RefCell<BufferInner>>,
}

/// Weak handle to a [`Buffer`]
pub struct WeakBuffer {
    inner: Weak<RefCell<BufferInner>>,
}

impl Buffer {
    /// Create a buffer from its backing storage
    pub fn new(size: Size<i32, BufferCoords>, source: BufferSource) -> Buffer {
        Buffer {
            inner: Rc::new(RefCell::new(BufferInner {
                size,
                source,
                locks: 0,
                dropped: false,
                release: Signal::new(),
                destroy: Signal::new(),
                addons: AddonSet::new(),
            })),
        }
    }

    /// Width of the buffer in pixels
    pub fn width(&self) -> i32 {
        self.inner.borrow().size.w
    }

    /// Height of the buffer in pixels
    pub fn height(&self) -> i32 {
        self.inner.borrow().size.h
    }

    /// Size of the buffer in pixels
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.inner.borrow().size
    }

    /// The access capabilities of this buffer
    pub fn caps(&self) -> BufferCaps {
        match &self.inner.borrow().source {
            BufferSource::Dmabuf(_) => BufferCaps::DMABUF,
            BufferSource::Shm(_) => BufferCaps::DATA_PTR,
            BufferSource::DmabufAndShm(..) => BufferCaps::DMABUF | BufferCaps::DATA_PTR,
            BufferSource::Opaque { .. } => BufferCaps::empty(),
        }
    }

    /// The dmabuf view of this buffer, if it has one
    pub fn dmabuf(&self) -> Option<Dmabuf> {
        match &self.inner.borrow().source {
            BufferSource::Dmabuf(dmabuf) | BufferSource::DmabufAndShm(dmabuf, _) => {
                Some(dmabuf.clone())
            }
            _ => None,
        }
    }

    /// Run a closure with the shared-memory view of this buffer, if it has one
    pub fn with_shm<T>(&self, f: impl FnOnce(&ShmMapping) -> T) -> Option<T> {
        match &self.inner.borrow().source {
            BufferSource::Shm(shm) | BufferSource::DmabufAndShm(_, shm) => Some(f(shm)),
            _ => None,
        }
    }

    /// Acquire a lock, keeping the content alive until the guard is dropped
    pub fn lock(&self) -> BufferLock {
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(!inner.dropped || inner.locks > 0, "lock on a destroyed buffer");
            inner.locks += 1;
        }
        BufferLock {
            buffer: Buffer {
                inner: self.inner.clone(),
            },
        }
    }

    /// Number of outstanding locks
    pub fn lock_count(&self) -> usize {
        self.inner.borrow().locks
    }

    /// Mark the buffer as dropped by its producer
    ///
    /// The storage is destroyed once the last lock is released (immediately
    /// if there are none). Calling this twice is a no-op.
    pub fn drop_buffer(&self) {
        let destroy_now = {
            let mut inner = self.inner.borrow_mut();
            if inner.dropped {
                return;
            }
            inner.dropped = true;
            inner.locks == 0
        };
        if destroy_now {
            let destroy = self.inner.borrow().destroy.clone();
            destroy.emit(());
        }
    }

    /// Returns true if the producer has dropped this buffer
    pub fn is_dropped(&self) -> bool {
        self.inner.borrow().dropped
    }

    /// Signal emitted when the lock count returns to zero
    pub fn release_signal(&self) -> Signal<()> {
        self.inner.borrow().release.clone()
    }

    /// Signal emitted when the buffer is destroyed
    pub fn destroy_signal(&self) -> Signal<()> {
        self.inner.borrow().destroy.clone()
    }

    /// Compositor-side extension storage of this buffer
    pub fn with_addons<T>(&self, f: impl FnOnce(&AddonSet) -> T) -> T {
        f(&self.inner.borrow().addons)
    }

    /// Create a weak handle
    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer {
            inner: Rc::downgrade(&self.inner),
        }
    }

    fn unlock(&self) {
        let (released, destroyed) = {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(inner.locks > 0);
            inner.locks -= 1;
            (inner.locks == 0, inner.locks == 0 && inner.dropped)
        };
        if released {
            let release = self.inner.borrow().release.clone();
            release.emit(());
        }
        if destroyed {
            let destroy = self.inner.borrow().destroy.clone();
            destroy.emit(());
        }
    }
}

impl WeakBuffer {
    /// Try to upgrade to a strong handle
    ///
    /// Fails if all strong handles are gone.
    pub fn upgrade(&self) -> Option<Buffer> {
        self.inner.upgrade().map(|inner| Buffer { inner })
    }
}

/// RAII guard keeping a [`Buffer`]'s content alive
pub struct BufferLock {
    buffer: Buffer,
}

impl BufferLock {
    /// The buffer this lock refers to
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for BufferLock {
    fn drop(&mut self) {
        self.buffer.unlock();
    }
}

impl fmt::Debug for BufferLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLock").field("buffer", &self.buffer).finish()
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Buffer {
            inner: self.inner.clone(),
        }
    }
}

impl Clone for WeakBuffer {
    fn clone(&self) -> Self {
        WeakBuffer {
            inner: self.inner.clone(),
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Buffer")
            .field("size", &inner.size)
            .field("locks", &inner.locks)
            .field("dropped", &inner.dropped)
            .finish()
    }
}

impl fmt::Debug for WeakBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakBuffer { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn opaque_buffer() -> Buffer {
        Buffer::new((16, 16).into(), BufferSource::Opaque { id: 1 })
    }

    #[test]
    fn destroy_waits_for_locks() {
        let buffer = opaque_buffer();
        let destroyed = Rc::new(Cell::new(false));

        let destroyed2 = destroyed.clone();
        let _observer = buffer.destroy_signal().observe(move |_| destroyed2.set(true));

        let lock = buffer.lock();
        buffer.drop_buffer();
        assert!(!destroyed.get());

        drop(lock);
        assert!(destroyed.get());
    }

    #[test]
    fn release_fires_on_last_unlock() {
        let buffer = opaque_buffer();
        let released = Rc::new(Cell::new(0u32));

        let released2 = released.clone();
        let _observer = buffer.release_signal().observe(move |_| released2.set(released2.get() + 1));

        let lock1 = buffer.lock();
        let lock2 = buffer.lock();
        drop(lock1);
        assert_eq!(released.get(), 0);
        drop(lock2);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn drop_without_locks_destroys_immediately() {
        let buffer = opaque_buffer();
        let destroyed = Rc::new(Cell::new(false));

        let destroyed2 = destroyed.clone();
        let _observer = buffer.destroy_signal().observe(move |_| destroyed2.set(true));

        buffer.drop_buffer();
        assert!(destroyed.get());
        // second drop is a no-op
        buffer.drop_buffer();
    }
}
