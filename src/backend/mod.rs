//! Display and input backends
//!
//! A [`Backend`] abstracts where outputs and input devices come from: real
//! KMS hardware behind a session, a window of a host Wayland or X11 server,
//! or nothing at all (headless). Whatever the source, a backend announces
//! devices through the same pair of signals and drives the attached
//! [`Output`](crate::output::Output)s.
//!
//! [`autocreate`] picks the right backend(s) for the environment the
//! process finds itself in.

use std::os::unix::io::BorrowedFd;
use std::time::{Duration, Instant};

use calloop::{EventLoop, LoopHandle};
use rustix::time::ClockId;
use tracing::{info, warn};

use crate::buffer::BufferCaps;
use crate::output::Output;
use crate::utils::{env, signal::Signal};

pub mod allocator;
pub mod headless;
#[cfg(feature = "backend_libinput")]
pub mod libinput;
pub mod multi;
pub mod renderer;
#[cfg(feature = "backend_session")]
pub mod session;
#[cfg(feature = "backend_udev")]
pub mod udev;
#[cfg(feature = "backend_drm")]
pub mod drm;
#[cfg(feature = "backend_wayland")]
pub mod wayland;
#[cfg(feature = "backend_x11")]
pub mod x11;

pub use multi::MultiBackend;

/// Class of an input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputDeviceType {
    /// A keyboard
    Keyboard,
    /// A pointing device
    Pointer,
    /// A touch screen
    Touch,
    /// A drawing tablet tool
    TabletTool,
    /// The pad of a drawing tablet
    TabletPad,
    /// A lid or tablet-mode switch
    Switch,
}

/// Descriptor for one input device announced by a backend
///
/// Event dispatch past enumeration is up to the compositor; the core only
/// reports devices appearing and disappearing.
#[derive(Debug, Clone)]
pub struct InputDevice {
    /// Human readable device name
    pub name: String,
    /// Device class
    pub ty: InputDeviceType,
    /// USB vendor id, if known
    pub vendor: u32,
    /// USB product id, if known
    pub product: u32,
    /// Emitted when the device goes away
    pub destroy: Signal<()>,
}

/// The signals every backend exposes
#[derive(Debug, Clone, Default)]
pub struct BackendEvents {
    /// A new input device appeared
    pub new_input: Signal<InputDevice>,
    /// A new output appeared
    pub new_output: Signal<Output>,
    /// The backend is going away
    pub destroy: Signal<()>,
}

impl BackendEvents {
    /// Create a fresh signal set
    pub fn new() -> BackendEvents {
        Default::default()
    }
}

/// Errors of backend creation and startup
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No backend fits the current environment
    #[error("No backend available for this environment")]
    NoBackendAvailable,
    /// An entry of `BACKENDS` was not recognised
    #[error("Unknown backend name: {0}")]
    UnknownBackend(String),
    /// The session did not become active in time
    #[error("Session did not become active")]
    SessionNotActive,
    /// Session setup failed
    #[cfg(feature = "backend_session_libseat")]
    #[error("Session error: {0}")]
    Session(#[from] session::libseat::Error),
    /// The backend failed to start
    #[error("Backend failed to start: {0}")]
    StartFailed(String),
    /// Io error during backend setup
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform interface over all backends
pub trait Backend {
    /// Begin emitting events for already-present devices
    ///
    /// Outputs and inputs known at startup are announced from here, not
    /// from the constructor, so callers can subscribe in between.
    fn start(&mut self) -> Result<(), BackendError>;

    /// Stop the backend and release its devices
    ///
    /// Emits the `destroy` event once; destroying twice is a no-op.
    fn destroy(&mut self);

    /// The event signals of this backend
    ///
    /// Signals are cheap handles; the returned set aliases the backend's.
    fn events(&self) -> BackendEvents;

    /// Capabilities of buffers this backend can present
    fn buffer_caps(&self) -> BufferCaps;

    /// The DRM device driving this backend, if any
    fn drm_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// The clock presentation timestamps are given in
    fn presentation_clock(&self) -> ClockId {
        ClockId::Monotonic
    }
}

/// How long [`autocreate`] waits for the session to become active
const SESSION_ACTIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the backend(s) fitting the host environment
///
/// The selection ladder:
/// 1. `BACKENDS`, a comma separated list of
///    `{wayland, x11, headless, drm, libinput}`, overrides all detection;
/// 2. a `WAYLAND_DISPLAY`/`WAYLAND_SOCKET` endpoint selects the nested
///    Wayland backend;
/// 3. a `DISPLAY` endpoint selects the nested X11 backend;
/// 4. otherwise a session is acquired, libinput is probed (unless
///    `LIBINPUT_NO_DEVICES` allows proceeding without input) and one DRM
///    backend per GPU is added, the first one as primary.
///
/// The returned [`MultiBackend`] aggregates everything that was created.
/// Event sources are inserted into the given loop; dispatching that loop
/// drives all backends.
pub fn autocreate(event_loop: &mut EventLoop<'static, ()>) -> Result<MultiBackend, BackendError> {
    let handle = event_loop.handle();
    let mut multi = MultiBackend::new();

    if let Some(names) = env::list_env("BACKENDS") {
        for name in names {
            let backend = create_named_backend(&name, &handle, event_loop, &mut multi)?;
            if let Some(backend) = backend {
                multi.add_backend(backend);
            }
        }
        if multi.is_empty() {
            return Err(BackendError::NoBackendAvailable);
        }
        return Ok(multi);
    }

    #[cfg(feature = "backend_wayland")]
    if std::env::var("WAYLAND_DISPLAY").is_ok() || std::env::var("WAYLAND_SOCKET").is_ok() {
        info!("Found a wayland compositor to nest into");
        let backend = wayland::WaylandBackend::new(handle.clone())?;
        multi.add_backend(Box::new(backend));
        return Ok(multi);
    }

    #[cfg(feature = "backend_x11")]
    if std::env::var("DISPLAY").is_ok() {
        info!("Found an X11 server to nest into");
        let backend = x11::X11Backend::new(handle.clone())?;
        multi.add_backend(Box::new(backend));
        return Ok(multi);
    }

    #[cfg(all(
        feature = "backend_session_libseat",
        feature = "backend_libinput",
        feature = "backend_udev",
        feature = "backend_drm"
    ))]
    {
        return autocreate_drm(event_loop, multi);
    }

    #[allow(unreachable_code)]
    Err(BackendError::NoBackendAvailable)
}

#[cfg(all(
    feature = "backend_session_libseat",
    feature = "backend_libinput",
    feature = "backend_udev",
    feature = "backend_drm"
))]
fn autocreate_drm(
    event_loop: &mut EventLoop<'static, ()>,
    mut multi: MultiBackend,
) -> Result<MultiBackend, BackendError> {
    use session::libseat::LibSeatSession;
    use session::Session;

    let handle = event_loop.handle();

    let (session, notifier) = LibSeatSession::new()?;
    let session_signal: Signal<session::SessionEvent> = Signal::new();
    {
        let session_signal = session_signal.clone();
        handle
            .insert_source(notifier, move |event, _, _| {
                session_signal.emit(event);
            })
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;
    }

    wait_for_session_active(event_loop, &session)?;

    match libinput::LibinputBackend::new(session.clone(), handle.clone()) {
        Ok(libinput) => {
            let mut libinput = Box::new(libinput);
            libinput.link_session(&session_signal);
            multi.add_backend(libinput);
        }
        Err(err) if env::bool_env("LIBINPUT_NO_DEVICES") => {
            warn!("Failed to create libinput backend, continuing without input: {}", err);
        }
        Err(err) => return Err(err),
    }

    let gpus = udev::discover_gpus(&session.seat())?;
    if gpus.is_empty() {
        return Err(BackendError::NoBackendAvailable);
    }
    let gpu_monitor = udev::monitor_gpus(&session.seat(), &handle)?;

    let mut primary: Option<std::path::PathBuf> = None;
    for gpu in gpus {
        let is_primary = primary.is_none();
        match drm::DrmBackend::new(session.clone(), &gpu, handle.clone()) {
            Ok(mut backend) => {
                backend.link_session(&session_signal);
                if let Some(monitor) = &gpu_monitor {
                    backend.link_gpu_events(monitor);
                }
                if is_primary {
                    primary = Some(gpu.clone());
                    multi.add_drm_primary(Box::new(backend));
                } else {
                    multi.add_drm_secondary(Box::new(backend));
                }
            }
            Err(err) => {
                warn!("Failed to open GPU {:?}: {}", gpu, err);
            }
        }
    }
    if primary.is_none() {
        return Err(BackendError::NoBackendAvailable);
    }

    Ok(multi)
}

/// Dispatch the loop until the session reports active, for at most
/// [`SESSION_ACTIVE_TIMEOUT`]. Other events keep being delivered while
/// waiting. Only the DRM path treats failure as fatal.
#[cfg(feature = "backend_session")]
fn wait_for_session_active<S: session::Session>(
    event_loop: &mut EventLoop<'static, ()>,
    session: &S,
) -> Result<(), BackendError> {
    let started = Instant::now();
    while !session.is_active() {
        if started.elapsed() > SESSION_ACTIVE_TIMEOUT {
            return Err(BackendError::SessionNotActive);
        }
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut ())
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;
    }
    Ok(())
}

#[allow(unused_variables)]
fn create_named_backend(
    name: &str,
    handle: &LoopHandle<'static, ()>,
    event_loop: &mut EventLoop<'static, ()>,
    multi: &mut MultiBackend,
) -> Result<Option<Box<dyn Backend>>, BackendError> {
    match name {
        "headless" => Ok(Some(Box::new(headless::HeadlessBackend::new(handle.clone())))),
        #[cfg(feature = "backend_wayland")]
        "wayland" => Ok(Some(Box::new(wayland::WaylandBackend::new(handle.clone())?))),
        #[cfg(feature = "backend_x11")]
        "x11" => Ok(Some(Box::new(x11::X11Backend::new(handle.clone())?))),
        #[cfg(all(
            feature = "backend_session_libseat",
            feature = "backend_libinput",
            feature = "backend_udev",
            feature = "backend_drm"
        ))]
        "drm" | "libinput" => {
            // both need the full session plumbing
            if multi.is_empty() {
                let replacement = autocreate_drm(event_loop, MultiBackend::new())?;
                multi.absorb(replacement);
            }
            Ok(None)
        }
        other => Err(BackendError::UnknownBackend(other.to_owned())),
    }
}
