//! Nested Wayland backend
//!
//! Runs the compositor as a client of a host Wayland compositor: every
//! output is an xdg-toplevel window, frames are presented over `wl_shm`,
//! and host frame callbacks pace the output. Intended for development;
//! buffers must carry a CPU-visible view.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use calloop::{timer::TimeoutAction, timer::Timer, LoopHandle};
use calloop_wayland_source::WaylandSource;
use tracing::{debug, info, info_span, warn};
use wayland_client::{
    globals::{registry_queue_init, GlobalList, GlobalListContents},
    protocol::{wl_buffer, wl_callback, wl_compositor, wl_registry, wl_shm, wl_shm_pool, wl_surface},
    Connection, Dispatch, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use crate::backend::allocator::{shm::ShmAllocator, Allocator, Format, FormatSet, Fourcc, Modifier};
use crate::buffer::BufferCaps;
use crate::output::{
    Output, OutputBackend, OutputError, OutputMode, OutputState, PhysicalProperties,
    PictureAspectRatio, PresentEvent, PresentFlags, Subpixel,
};
use crate::utils::{
    clock::{Clock, Monotonic},
    env,
};

use super::{Backend, BackendError, BackendEvents};

const DEFAULT_WIDTH: i32 = 1280;
const DEFAULT_HEIGHT: i32 = 720;
const DEFAULT_REFRESH: i32 = 60_000;

/// Backend presenting into windows of a host Wayland compositor
#[derive(Debug)]
pub struct WaylandBackend {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Debug)]
struct Inner {
    connection: Connection,
    queue_handle: QueueHandle<HostState>,
    host: Rc<RefCell<HostState>>,
    handle: LoopHandle<'static, ()>,
    events: BackendEvents,
    outputs: Vec<Output>,
    output_counter: usize,
    started: bool,
    destroyed: bool,
    span: tracing::Span,
}

/// Client-side state dispatched by the host's event queue
#[derive(Debug)]
struct HostState {
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    windows: Vec<HostWindow>,
}

#[derive(Debug)]
struct HostWindow {
    surface: wl_surface::WlSurface,
    xdg_surface: xdg_surface::XdgSurface,
    toplevel: xdg_toplevel::XdgToplevel,
    output: crate::output::WeakOutput,
    configured: bool,
    closed: bool,
}

impl WaylandBackend {
    /// Connect to the host compositor advertised by the environment
    pub fn new(handle: LoopHandle<'static, ()>) -> Result<WaylandBackend, BackendError> {
        let span = info_span!("backend_wayland");
        let _guard = span.enter();
        info!("Connecting to host wayland compositor");

        let connection = Connection::connect_to_env()
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;
        let (globals, queue) = registry_queue_init::<HostState>(&connection)
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;
        let queue_handle = queue.handle();

        let host = Rc::new(RefCell::new(HostState {
            compositor: bind_global(&globals, &queue_handle),
            shm: bind_global(&globals, &queue_handle),
            wm_base: bind_global(&globals, &queue_handle),
            windows: Vec::new(),
        }));

        {
            let state = host.borrow();
            if state.compositor.is_none() || state.shm.is_none() || state.wm_base.is_none() {
                return Err(BackendError::StartFailed(
                    "host compositor is missing wl_compositor, wl_shm or xdg_wm_base".into(),
                ));
            }
        }

        let source_host = host.clone();
        WaylandSource::new(connection.clone(), queue)
            .insert_with(handle.clone(), move |event_count, queue, _| {
                let _ = event_count;
                let mut state = source_host.borrow_mut();
                queue.dispatch_pending(&mut state).map(|_| ())
            })
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;

        drop(_guard);
        Ok(WaylandBackend {
            inner: Rc::new(RefCell::new(Inner {
                connection,
                queue_handle,
                host,
                handle,
                events: BackendEvents::new(),
                outputs: Vec::new(),
                output_counter: 0,
                started: false,
                destroyed: false,
                span,
            })),
        })
    }

    /// Open one more host window backed output
    pub fn add_output(&self, width: i32, height: i32) -> Result<Output, BackendError> {
        let (output, events) = {
            let mut inner = self.inner.borrow_mut();
            inner.output_counter += 1;
            let name = format!("WL-{}", inner.output_counter);
            debug!(parent: &inner.span, name, "New nested wayland output");

            let qh = inner.queue_handle.clone();
            let host = inner.host.borrow();
            let compositor = host.compositor.as_ref().expect("checked at init");
            let wm_base = host.wm_base.as_ref().expect("checked at init");

            let surface = compositor.create_surface(&qh, ());
            let xdg = wm_base.get_xdg_surface(&surface, &qh, ());
            let toplevel = xdg.get_toplevel(&qh, ());
            toplevel.set_title(name.clone());
            toplevel.set_app_id("waylight".into());
            surface.commit();
            drop(host);

            let mode = OutputMode {
                size: (width, height).into(),
                refresh: DEFAULT_REFRESH,
                preferred: true,
                aspect_ratio: PictureAspectRatio::None,
            };
            let output = Output::new(
                name,
                Box::new(WaylandOutput {
                    inner: Rc::downgrade(&self.inner),
                    surface: surface.clone(),
                }),
                PhysicalProperties {
                    size: (0, 0).into(),
                    subpixel: Subpixel::Unknown,
                    make: "Wayland".into(),
                    model: "Host window".into(),
                    serial: String::new(),
                },
                vec![mode],
                Some(mode),
                Fourcc::Xrgb8888,
            );

            inner.host.borrow_mut().windows.push(HostWindow {
                surface,
                xdg_surface: xdg,
                toplevel,
                output: output.downgrade(),
                configured: false,
                closed: false,
            });
            inner.outputs.push(output.clone());
            let _ = inner.connection.flush();
            (output, inner.events.clone())
        };
        events.new_output.emit(output.clone());
        Ok(output)
    }
}

fn bind_global<G>(globals: &GlobalList, qh: &QueueHandle<HostState>) -> Option<G>
where
    G: wayland_client::Proxy + 'static,
    HostState: Dispatch<G, ()>,
{
    globals.bind(qh, 1..=u32::MAX, ()).ok()
}

impl Backend for WaylandBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.started || inner.destroyed {
                return Ok(());
            }
            inner.started = true;
        }
        let count = env::count_env("WL_OUTPUTS", 1);
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
            inner.host.borrow_mut().windows.clear();
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
struct WaylandOutput {
    inner: Weak<RefCell<Inner>>,
    surface: wl_surface::WlSurface,
}

impl OutputBackend for WaylandOutput {
    fn test(&mut self, _output: &Output, state: &OutputState) -> Result<(), OutputError> {
        if let Some(buffer) = &state.buffer {
            if buffer.with_shm(|_| ()).is_none() {
                return Err(OutputError::InvalidState(
                    "nested wayland outputs need CPU-visible buffers",
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

        let inner = inner.borrow();
        let qh = inner.queue_handle.clone();
        let host = inner.host.borrow();
        let shm = host.shm.as_ref().ok_or(OutputError::BackendGone)?;

        let attach_result: Result<(), OutputError> = buffer
            .with_shm(|mapping| {
                let wl_format = match mapping.format() {
                    Fourcc::Argb8888 => wl_shm::Format::Argb8888,
                    Fourcc::Xrgb8888 => wl_shm::Format::Xrgb8888,
                    _ => return Err(OutputError::InvalidState("host does not take this format")),
                };

                let pool = shm.create_pool(mapping.fd(), mapping.len() as i32, &qh, ());
                let wl_buffer = pool.create_buffer(
                    0,
                    mapping.size().w,
                    mapping.size().h,
                    mapping.stride() as i32,
                    wl_format,
                    &qh,
                    BufferData {
                        lock: RefCell::new(Some(buffer.lock())),
                    },
                );
                pool.destroy();

                self.surface.attach(Some(&wl_buffer), 0, 0);
                if let Some(damage) = &state.damage {
                    for rect in damage.rects() {
                        self.surface
                            .damage_buffer(rect.loc.x, rect.loc.y, rect.size.w, rect.size.h);
                    }
                } else {
                    self.surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
                }
                Ok(())
            })
            .ok_or(OutputError::InvalidState(
                "nested wayland outputs need CPU-visible buffers",
            ))?;
        attach_result?;

        // the host's frame callback paces us
        let commit_seq = output.commit_seq().wrapping_add(1);
        self.surface.frame(
            &qh,
            FrameData {
                output: output.downgrade(),
                commit_seq,
            },
        );
        self.surface.commit();
        let _ = inner.connection.flush();
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
        [Fourcc::Xrgb8888, Fourcc::Argb8888]
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

/// Userdata of presented wl_buffers: holds the lock until the host releases
struct BufferData {
    lock: RefCell<Option<crate::buffer::BufferLock>>,
}

/// Userdata of frame callbacks
struct FrameData {
    output: crate::output::WeakOutput,
    commit_seq: u32,
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for HostState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for HostState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_compositor::WlCompositor,
        _event: wl_compositor::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm::WlShm, ()> for HostState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm::WlShm,
        _event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for HostState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm_pool::WlShmPool,
        _event: wl_shm_pool::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_surface::WlSurface, ()> for HostState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_surface::WlSurface,
        _event: wl_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_buffer::WlBuffer, BufferData> for HostState {
    fn event(
        _state: &mut Self,
        proxy: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        data: &BufferData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            data.lock.borrow_mut().take();
            proxy.destroy();
        }
    }
}

impl Dispatch<wl_callback::WlCallback, FrameData> for HostState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_callback::WlCallback,
        event: wl_callback::Event,
        data: &FrameData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            if let Some(output) = data.output.upgrade() {
                output.send_present(&PresentEvent {
                    commit_seq: data.commit_seq,
                    when: Clock::<Monotonic>::new().now(),
                    refresh: 0,
                    flags: PresentFlags::VSYNC,
                });
                output.send_frame();
            }
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for HostState {
    fn event(
        _state: &mut Self,
        proxy: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            proxy.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for HostState {
    fn event(
        state: &mut Self,
        proxy: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            proxy.ack_configure(serial);
            if let Some(window) = state
                .windows
                .iter_mut()
                .find(|window| window.xdg_surface == *proxy)
            {
                window.configured = true;
                if let Some(output) = window.output.upgrade() {
                    // first configure kicks the frame loop
                    output.send_frame();
                }
            }
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for HostState {
    fn event(
        state: &mut Self,
        proxy: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if width > 0 && height > 0 {
                    if let Some(window) = state
                        .windows
                        .iter()
                        .find(|window| window.toplevel == *proxy)
                    {
                        if let Some(output) = window.output.upgrade() {
                            if output.width() != width || output.height() != height {
                                // ask the compositor to follow the host size
                                let mut request = OutputState::new();
                                request.set_custom_mode(width, height, DEFAULT_REFRESH);
                                output.send_request_state(request);
                            }
                        }
                    }
                }
            }
            xdg_toplevel::Event::Close => {
                if let Some(window) = state
                    .windows
                    .iter_mut()
                    .find(|window| window.toplevel == *proxy)
                {
                    window.closed = true;
                    if let Some(output) = window.output.upgrade() {
                        warn!("Host closed the window of {}", output.name());
                        output.destroy();
                    }
                }
            }
            _ => {}
        }
    }
}
