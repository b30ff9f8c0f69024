//! Nested X11 backend
//!
//! Runs the compositor inside windows of a host X11 server. Frames are
//! uploaded with core `PutImage`; the presentation clock is synthesised
//! from the nominal refresh, as the core protocol offers no vblank.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use calloop::{generic::Generic, timer::TimeoutAction, timer::Timer, Interest, LoopHandle, Mode, PostAction};
use tracing::{debug, info, info_span, warn};
use x11rb::{
    connection::Connection as _,
    protocol::{
        xproto::{
            AtomEnum, ClientMessageEvent, ConnectionExt, CreateGCAux, CreateWindowAux, EventMask,
            ImageFormat, PropMode, WindowClass,
        },
        Event,
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as _,
};

use crate::backend::allocator::{shm::ShmAllocator, Allocator, Format, FormatSet, Fourcc, Modifier};
use crate::buffer::{Buffer, BufferCaps};
use crate::output::{
    Output, OutputBackend, OutputError, OutputMode, OutputState, PhysicalProperties,
    PictureAspectRatio, PresentEvent, PresentFlags, Subpixel,
};
use crate::utils::{
    clock::{Clock, Monotonic},
    env,
    signal::Signal,
};

use super::{Backend, BackendError, BackendEvents, InputDevice, InputDeviceType};

const DEFAULT_WIDTH: i32 = 1280;
const DEFAULT_HEIGHT: i32 = 720;
const DEFAULT_REFRESH: i32 = 60_000;

/// Backend presenting into windows of a host X11 server
#[derive(Debug)]
pub struct X11Backend {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    connection: Rc<RustConnection>,
    screen: usize,
    wm_protocols: u32,
    wm_delete_window: u32,
    handle: LoopHandle<'static, ()>,
    events: BackendEvents,
    windows: Vec<X11Window>,
    outputs: Vec<Output>,
    output_counter: usize,
    started: bool,
    destroyed: bool,
    span: tracing::Span,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("windows", &self.windows.len())
            .field("started", &self.started)
            .finish()
    }
}

struct X11Window {
    window: u32,
    gc: u32,
    output: crate::output::WeakOutput,
}

impl X11Backend {
    /// Connect to the host X11 server advertised by `DISPLAY`
    pub fn new(handle: LoopHandle<'static, ()>) -> Result<X11Backend, BackendError> {
        let span = info_span!("backend_x11");
        let _guard = span.enter();
        info!("Connecting to host X11 server");

        let (connection, screen) =
            RustConnection::connect(None).map_err(|err| BackendError::StartFailed(err.to_string()))?;
        let connection = Rc::new(connection);

        let wm_protocols = connection
            .intern_atom(false, b"WM_PROTOCOLS")
            .map_err(|err| BackendError::StartFailed(err.to_string()))?
            .reply()
            .map_err(|err| BackendError::StartFailed(err.to_string()))?
            .atom;
        let wm_delete_window = connection
            .intern_atom(false, b"WM_DELETE_WINDOW")
            .map_err(|err| BackendError::StartFailed(err.to_string()))?
            .reply()
            .map_err(|err| BackendError::StartFailed(err.to_string()))?
            .atom;

        drop(_guard);
        let inner = Rc::new(RefCell::new(Inner {
            connection: connection.clone(),
            screen,
            wm_protocols,
            wm_delete_window,
            handle: handle.clone(),
            events: BackendEvents::new(),
            windows: Vec::new(),
            outputs: Vec::new(),
            output_counter: 0,
            started: false,
            destroyed: false,
            span,
        }));

        let source_inner = Rc::downgrade(&inner);
        let stream_fd = {
            use std::os::unix::io::AsFd;
            connection
                .stream()
                .as_fd()
                .try_clone_to_owned()
                .map_err(|err| BackendError::StartFailed(err.to_string()))?
        };
        handle
            .insert_source(
                Generic::new(stream_fd, Interest::READ, Mode::Level),
                move |_, _, _| {
                    if let Some(inner) = source_inner.upgrade() {
                        dispatch_host_events(&inner);
                    }
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;

        Ok(X11Backend { inner })
    }

    /// Open one more host window backed output
    pub fn add_output(&self, width: i32, height: i32) -> Result<Output, BackendError> {
        let (output, events) = {
            let mut inner = self.inner.borrow_mut();
            inner.output_counter += 1;
            let name = format!("X11-{}", inner.output_counter);
            debug!(parent: &inner.span, name, "New nested X11 output");

            let connection = inner.connection.clone();
            let screen = &connection.setup().roots[inner.screen];
            let window = connection
                .generate_id()
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;
            connection
                .create_window(
                    x11rb::COPY_DEPTH_FROM_PARENT,
                    window,
                    screen.root,
                    0,
                    0,
                    width as u16,
                    height as u16,
                    0,
                    WindowClass::INPUT_OUTPUT,
                    0,
                    &CreateWindowAux::new()
                        .background_pixel(screen.black_pixel)
                        .event_mask(EventMask::STRUCTURE_NOTIFY | EventMask::EXPOSURE),
                )
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;
            connection
                .change_property32(
                    PropMode::REPLACE,
                    window,
                    inner.wm_protocols,
                    AtomEnum::ATOM,
                    &[inner.wm_delete_window],
                )
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;
            connection
                .change_property8(
                    PropMode::REPLACE,
                    window,
                    AtomEnum::WM_NAME,
                    AtomEnum::STRING,
                    name.as_bytes(),
                )
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;

            let gc = connection
                .generate_id()
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;
            connection
                .create_gc(gc, window, &CreateGCAux::new())
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;

            connection
                .map_window(window)
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;
            connection
                .flush()
                .map_err(|err| BackendError::StartFailed(err.to_string()))?;

            let mode = OutputMode {
                size: (width, height).into(),
                refresh: DEFAULT_REFRESH,
                preferred: true,
                aspect_ratio: PictureAspectRatio::None,
            };
            let output = Output::new(
                name,
                Box::new(X11Output {
                    inner: Rc::downgrade(&self.inner),
                    window,
                    gc,
                }),
                PhysicalProperties {
                    size: (0, 0).into(),
                    subpixel: Subpixel::Unknown,
                    make: "X11".into(),
                    model: "Host window".into(),
                    serial: String::new(),
                },
                vec![mode],
                Some(mode),
                Fourcc::Xrgb8888,
            );

            inner.windows.push(X11Window {
                window,
                gc,
                output: output.downgrade(),
            });
            inner.outputs.push(output.clone());
            (output, inner.events.clone())
        };
        events.new_output.emit(output.clone());
        Ok(output)
    }
}

fn dispatch_host_events(inner: &Rc<RefCell<Inner>>) {
    loop {
        let event = {
            let guard = inner.borrow();
            if guard.destroyed {
                return;
            }
            match guard.connection.poll_for_event() {
                Ok(event) => event,
                Err(err) => {
                    warn!(parent: &guard.span, "Lost the X11 connection: {}", err);
                    None
                }
            }
        };
        let Some(event) = event else { break };

        match event {
            Event::ClientMessage(ClientMessageEvent { window, data, .. }) => {
                let (delete_atom, target) = {
                    let guard = inner.borrow();
                    let target = guard
                        .windows
                        .iter()
                        .find(|candidate| candidate.window == window)
                        .and_then(|candidate| candidate.output.upgrade());
                    (guard.wm_delete_window, target)
                };
                if data.as_data32()[0] == delete_atom {
                    if let Some(output) = target {
                        warn!("Host closed the window of {}", output.name());
                        {
                            let mut guard = inner.borrow_mut();
                            guard.windows.retain(|candidate| candidate.window != window);
                            guard.outputs.retain(|candidate| *candidate != output);
                        }
                        output.destroy();
                    }
                }
            }
            Event::ConfigureNotify(configure) => {
                let target = {
                    let guard = inner.borrow();
                    guard
                        .windows
                        .iter()
                        .find(|candidate| candidate.window == configure.window)
                        .and_then(|candidate| candidate.output.upgrade())
                };
                if let Some(output) = target {
                    let width = configure.width as i32;
                    let height = configure.height as i32;
                    if width > 0 && height > 0 && (output.width() != width || output.height() != height) {
                        let mut request = OutputState::new();
                        request.set_custom_mode(width, height, DEFAULT_REFRESH);
                        output.send_request_state(request);
                    }
                }
            }
            Event::Expose(expose) => {
                let target = {
                    let guard = inner.borrow();
                    guard
                        .windows
                        .iter()
                        .find(|candidate| candidate.window == expose.window)
                        .and_then(|candidate| candidate.output.upgrade())
                };
                if let Some(output) = target {
                    output.set_needs_frame();
                }
            }
            _ => {}
        }
    }
}

impl Backend for X11Backend {
    fn start(&mut self) -> Result<(), BackendError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.started || inner.destroyed {
                return Ok(());
            }
            inner.started = true;
        }

        // the host seat looks like one keyboard and one pointer
        let events = self.inner.borrow().events.clone();
        for (name, ty) in [
            ("x11-keyboard", InputDeviceType::Keyboard),
            ("x11-pointer", InputDeviceType::Pointer),
        ] {
            events.new_input.emit(InputDevice {
                name: name.into(),
                ty,
                vendor: 0,
                product: 0,
                destroy: Signal::new(),
            });
        }

        let count = env::count_env("X11_OUTPUTS", 1);
        for _ in 0..count {
            self.add_output(DEFAULT_WIDTH, DEFAULT_HEIGHT)?;
        }
        Ok(())
    }

    fn destroy(&mut self) {
        let (events, outputs) = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.windows.clear();
            (inner.events.clone(), std::mem::take(&mut inner.outputs))
        };
        for output in outputs {
            output.destroy();
        }
        events.destroy.emit(());
    }

    fn events(&self) -> BackendEvents {
        self.inner.borrow().events.clone()
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DATA_PTR
    }
}

/// Per-output backend state
#[derive(Debug)]
struct X11Output {
    inner: Weak<RefCell<Inner>>,
    window: u32,
    gc: u32,
}

impl OutputBackend for X11Output {
    fn test(&mut self, _output: &Output, state: &OutputState) -> Result<(), OutputError> {
        if let Some(buffer) = &state.buffer {
            if buffer.with_shm(|_| ()).is_none() {
                return Err(OutputError::InvalidState(
                    "nested X11 outputs need CPU-visible buffers",
                ));
            }
        }
        Ok(())
    }

    fn commit(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        let inner = self.inner.upgrade().ok_or(OutputError::BackendGone)?;
        let Some(buffer) = &state.buffer else {
            return Ok(());
        };

        let guard = inner.borrow();
        let connection = guard.connection.clone();

        buffer
            .with_shm(|mapping| {
                // PutImage row length is implied; the stride must be packed
                let width = mapping.size().w as u16;
                let height = mapping.size().h as u16;
                let data = unsafe { mapping.as_slice() };
                let put = connection.put_image(
                    ImageFormat::Z_PIXMAP,
                    self.window,
                    self.gc,
                    width,
                    height,
                    0,
                    0,
                    0,
                    24,
                    data,
                );
                if let Err(err) = put.and_then(|_| connection.flush().map_err(Into::into)) {
                    warn!("Failed to upload frame: {}", err);
                }
            })
            .ok_or(OutputError::InvalidState(
                "nested X11 outputs need CPU-visible buffers",
            ))?;

        // no vblank in the core protocol; pace with a timer at the nominal
        // refresh
        let refresh = output
            .current_mode()
            .map(|mode| mode.refresh)
            .filter(|&refresh| refresh > 0)
            .unwrap_or(DEFAULT_REFRESH);
        let interval = Duration::from_secs_f64(1000.0 / refresh as f64);
        let commit_seq = output.commit_seq().wrapping_add(1);
        let timer_output = output.clone();
        let _ = guard
            .handle
            .insert_source(Timer::from_duration(interval), move |_, _, _| {
                timer_output.send_present(&PresentEvent {
                    commit_seq,
                    when: Clock::<Monotonic>::new().now(),
                    refresh: interval.as_nanos() as u64,
                    flags: PresentFlags::empty(),
                });
                timer_output.send_frame();
                TimeoutAction::Drop
            });

        Ok(())
    }

    fn schedule_frame(&mut self, output: &Output) {
        let Some(inner) = self.inner.upgrade() else { return };
        let output = output.clone();
        let _ = inner.borrow().handle.insert_source(
            Timer::from_duration(Duration::ZERO),
            move |_, _, _| {
                output.send_frame();
                TimeoutAction::Drop
            },
        );
    }

    fn primary_formats(&self, caps: BufferCaps) -> FormatSet {
        if !caps.contains(BufferCaps::DATA_PTR) {
            return FormatSet::new();
        }
        [Fourcc::Xrgb8888]
            .into_iter()
            .map(|code| Format {
                code,
                modifier: Modifier::Linear,
            })
            .collect()
    }

    fn create_allocator(&self) -> Box<dyn Allocator> {
        Box::new(ShmAllocator::new())
    }
}
