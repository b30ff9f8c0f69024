//! Aggregation of several backends into one
//!
//! A [`MultiBackend`] exposes the union of its children's devices through a
//! single [`Backend`] interface. It also carries the multi-GPU topology:
//! exactly one DRM backend is the primary; further DRM backends become
//! secondaries whose frames are blitted to the primary before scan-out.

use std::os::unix::io::BorrowedFd;

use rustix::time::ClockId;
use tracing::info_span;

use crate::buffer::BufferCaps;
use crate::utils::signal::Observer;

use super::{Backend, BackendError, BackendEvents};

/// A backend composed of several child backends
pub struct MultiBackend {
    children: Vec<Box<dyn Backend>>,
    forwards: Vec<Observer>,
    events: BackendEvents,
    #[cfg(feature = "backend_drm")]
    drm_primary: Option<super::drm::DrmBackend>,
    started: bool,
    destroyed: bool,
    span: tracing::Span,
}

impl MultiBackend {
    /// Create an empty aggregate
    pub fn new() -> MultiBackend {
        MultiBackend {
            children: Vec::new(),
            forwards: Vec::new(),
            events: BackendEvents::new(),
            #[cfg(feature = "backend_drm")]
            drm_primary: None,
            started: false,
            destroyed: false,
            span: info_span!("backend_multi"),
        }
    }

    /// Returns true if no child backends have been added
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Add a child backend, forwarding its events
    pub fn add_backend(&mut self, backend: Box<dyn Backend>) {
        let _guard = self.span.enter();

        let events = backend.events();
        let new_input = self.events.new_input.clone();
        self.forwards.push(
            events
                .new_input
                .observe(move |device| new_input.emit(device.clone())),
        );
        let new_output = self.events.new_output.clone();
        self.forwards.push(
            events
                .new_output
                .observe(move |output| new_output.emit(output.clone())),
        );

        self.children.push(backend);
    }

    /// Add the primary DRM backend
    ///
    /// At most one DRM backend tree may be primary; submitting a second one
    /// turns it into a secondary GPU.
    #[cfg(feature = "backend_drm")]
    pub fn add_drm_primary(&mut self, backend: Box<super::drm::DrmBackend>) {
        if self.drm_primary.is_some() {
            return self.add_drm_secondary(backend);
        }
        self.drm_primary = Some((*backend).clone());
        self.add_backend(backend);
    }

    /// Add a secondary DRM backend, attached to the primary GPU
    #[cfg(feature = "backend_drm")]
    pub fn add_drm_secondary(&mut self, mut backend: Box<super::drm::DrmBackend>) {
        if let Some(primary) = &self.drm_primary {
            backend.set_parent(primary);
        }
        self.add_backend(backend);
    }

    /// The primary DRM backend, if one was added
    #[cfg(feature = "backend_drm")]
    pub fn drm_primary(&self) -> Option<&super::drm::DrmBackend> {
        self.drm_primary.as_ref()
    }

    /// Move all children of another aggregate into this one
    pub fn absorb(&mut self, mut other: MultiBackend) {
        #[cfg(feature = "backend_drm")]
        if self.drm_primary.is_none() {
            self.drm_primary = other.drm_primary.take();
        }
        other.destroyed = true;
        for child in other.children.drain(..) {
            self.add_backend(child);
        }
    }
}

impl Default for MultiBackend {
    fn default() -> Self {
        MultiBackend::new()
    }
}

impl Backend for MultiBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Ok(());
        }
        let _guard = self.span.enter();
        for child in &mut self.children {
            child.start()?;
        }
        self.started = true;
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for child in &mut self.children {
            child.destroy();
        }
        self.children.clear();
        self.forwards.clear();
        self.events.destroy.emit(());
    }

    fn events(&self) -> BackendEvents {
        self.events.clone()
    }

    fn buffer_caps(&self) -> BufferCaps {
        // a buffer must be presentable by every child that owns outputs
        self.children
            .iter()
            .map(|child| child.buffer_caps())
            .filter(|caps| !caps.is_empty())
            .reduce(|acc, caps| acc & caps)
            .unwrap_or(BufferCaps::empty())
    }

    fn drm_fd(&self) -> Option<BorrowedFd<'_>> {
        #[cfg(feature = "backend_drm")]
        if let Some(primary) = &self.drm_primary {
            return primary.drm_fd();
        }
        self.children.iter().find_map(|child| child.drm_fd())
    }

    fn presentation_clock(&self) -> ClockId {
        self.children
            .first()
            .map(|child| child.presentation_clock())
            .unwrap_or(ClockId::Monotonic)
    }
}

impl Drop for MultiBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for MultiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBackend")
            .field("children", &self.children.len())
            .field("started", &self.started)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
