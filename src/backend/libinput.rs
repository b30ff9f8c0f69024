//! Input device enumeration through libinput
//!
//! Devices are opened through the [`Session`] so the process never needs
//! CAP_SYS_ADMIN. The backend announces devices as they are added and
//! removed and suspends the libinput context while the session is paused.

use std::{
    cell::RefCell,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
    rc::Rc,
};

use calloop::{generic::Generic, Interest, LoopHandle, Mode, PostAction};
use input::{Libinput, LibinputInterface};
use rustix::fs::OFlags;
use tracing::{debug, info, info_span, warn};

use crate::backend::session::{Session, SessionEvent};
use crate::buffer::BufferCaps;
use crate::utils::signal::{Observer, Signal};

use super::{Backend, BackendError, BackendEvents, InputDevice, InputDeviceType};

struct SessionInterface<S: Session>(S);

impl<S: Session> LibinputInterface for SessionInterface<S> {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        self.0
            .open(path, OFlags::from_bits_truncate(flags as u32))
            .map_err(|err| {
                warn!("Failed to open input device {:?}: {}", path, err);
                -1
            })
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        if let Err(err) = self.0.close(fd) {
            warn!("Failed to close input device: {}", err);
        }
    }
}

/// Input backend on top of a libinput udev context
pub struct LibinputBackend {
    inner: Rc<RefCell<Inner>>,
    session_observer: Option<Observer>,
}

struct Inner {
    context: Libinput,
    events: BackendEvents,
    devices: Vec<(String, Signal<()>)>,
    started: bool,
    destroyed: bool,
    span: tracing::Span,
}

impl LibinputBackend {
    /// Create a libinput context bound to the session's seat
    pub fn new<S: Session + 'static>(
        session: S,
        handle: LoopHandle<'static, ()>,
    ) -> Result<LibinputBackend, BackendError> {
        let span = info_span!("backend_libinput");
        let _guard = span.enter();
        info!("Initializing libinput backend");

        let seat = session.seat();
        let mut context = Libinput::new_with_udev(SessionInterface(session));
        context
            .udev_assign_seat(&seat)
            .map_err(|_| BackendError::StartFailed(format!("failed to assign seat {}", seat)))?;

        drop(_guard);

        let inner = Rc::new(RefCell::new(Inner {
            context: context.clone(),
            events: BackendEvents::new(),
            devices: Vec::new(),
            started: false,
            destroyed: false,
            span,
        }));

        let fd = context.as_raw_fd();
        let source = Generic::new(
            // SAFETY: the context lives inside `inner`, which the callback owns
            unsafe { OwnedFd::from_raw_fd(dup_fd(fd)?) },
            Interest::READ,
            Mode::Level,
        );
        let source_inner = inner.clone();
        handle
            .insert_source(source, move |_, _, _| {
                Inner::dispatch(&source_inner);
                Ok(PostAction::Continue)
            })
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;

        Ok(LibinputBackend {
            inner,
            session_observer: None,
        })
    }

    /// Suspend and resume the context with the session
    pub fn link_session(&mut self, signal: &Signal<SessionEvent>) {
        let inner = self.inner.clone();
        self.session_observer = Some(signal.observe(move |event| {
            let mut guard = inner.borrow_mut();
            match event {
                SessionEvent::Pause => {
                    debug!(parent: &guard.span, "Suspending libinput");
                    guard.context.suspend();
                }
                SessionEvent::Activate => {
                    debug!(parent: &guard.span, "Resuming libinput");
                    if guard.context.resume().is_err() {
                        warn!(parent: &guard.span, "Failed to resume libinput context");
                    }
                }
            }
        }));
    }
}

fn dup_fd(fd: RawFd) -> std::io::Result<RawFd> {
    // SAFETY: fd is a valid libinput epoll fd for the duration of the call
    let duplicated = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if duplicated < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(duplicated)
}

impl Inner {
    fn dispatch(inner: &Rc<RefCell<Inner>>) {
        let (events, added, removed) = {
            let mut guard = inner.borrow_mut();
            if guard.context.dispatch().is_err() {
                warn!(parent: &guard.span, "libinput dispatch failed");
                return;
            }

            let mut added = Vec::new();
            let mut removed = Vec::new();
            let context = guard.context.clone();
            for event in context {
                match event {
                    input::Event::Device(input::event::DeviceEvent::Added(event)) => {
                        use input::event::EventTrait;
                        added.push(event.device());
                    }
                    input::Event::Device(input::event::DeviceEvent::Removed(event)) => {
                        use input::event::EventTrait;
                        removed.push(event.device());
                    }
                    // event dispatch beyond device enumeration is the
                    // compositor's business
                    _ => {}
                }
            }
            (guard.events.clone(), added, removed)
        };

        for device in removed {
            let name = device.name().to_owned();
            let destroy = {
                let mut guard = inner.borrow_mut();
                let position = guard.devices.iter().position(|(n, _)| *n == name);
                position.map(|idx| guard.devices.remove(idx).1)
            };
            if let Some(destroy) = destroy {
                debug!("Input device removed: {}", name);
                destroy.emit(());
            }
        }

        for device in added {
            for ty in device_types(&device) {
                let descriptor = InputDevice {
                    name: device.name().to_owned(),
                    ty,
                    vendor: device.id_vendor(),
                    product: device.id_product(),
                    destroy: Signal::new(),
                };
                debug!("Input device added: {} ({:?})", descriptor.name, ty);
                inner
                    .borrow_mut()
                    .devices
                    .push((descriptor.name.clone(), descriptor.destroy.clone()));
                events.new_input.emit(descriptor);
            }
        }
    }
}

fn device_types(device: &input::Device) -> Vec<InputDeviceType> {
    use input::DeviceCapability;

    let mut types = Vec::new();
    if device.has_capability(DeviceCapability::Keyboard) {
        types.push(InputDeviceType::Keyboard);
    }
    if device.has_capability(DeviceCapability::Pointer) {
        types.push(InputDeviceType::Pointer);
    }
    if device.has_capability(DeviceCapability::Touch) {
        types.push(InputDeviceType::Touch);
    }
    if device.has_capability(DeviceCapability::TabletTool) {
        types.push(InputDeviceType::TabletTool);
    }
    if device.has_capability(DeviceCapability::TabletPad) {
        types.push(InputDeviceType::TabletPad);
    }
    if device.has_capability(DeviceCapability::Switch) {
        types.push(InputDeviceType::Switch);
    }
    types
}

impl Backend for LibinputBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        let mut guard = self.inner.borrow_mut();
        if guard.started || guard.destroyed {
            return Ok(());
        }
        guard.started = true;
        drop(guard);
        // initial device scan is delivered through the event source on the
        // first dispatch
        Inner::dispatch(&self.inner);
        Ok(())
    }

    fn destroy(&mut self) {
        let (events, devices) = {
            let mut guard = self.inner.borrow_mut();
            if guard.destroyed {
                return;
            }
            guard.destroyed = true;
            guard.context.suspend();
            (guard.events.clone(), std::mem::take(&mut guard.devices))
        };
        for (_, destroy) in devices {
            destroy.emit(());
        }
        events.destroy.emit(());
        self.session_observer = None;
    }

    fn events(&self) -> BackendEvents {
        self.inner.borrow().events.clone()
    }

    fn buffer_caps(&self) -> BufferCaps {
        // input only
        BufferCaps::empty()
    }
}

impl std::fmt::Debug for LibinputBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibinputBackend")
            .field("started", &self.inner.borrow().started)
            .finish()
    }
}
