//! The DRM backend
//!
//! Owns one GPU: its connectors become [`Output`]s, commits are routed
//! through the negotiated [`DrmInterface`](super::iface::DrmInterface),
//! page-flip events complete frames, and VT switches replay the desired
//! connector state once the session comes back.

use std::{
    cell::RefCell,
    os::unix::io::BorrowedFd,
    path::Path,
    rc::{Rc, Weak},
    time::Duration,
};

use calloop::{generic::Generic, timer::TimeoutAction, timer::Timer, Interest, LoopHandle, Mode, PostAction};
use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;
use rustix::fs::OFlags;
use tracing::{debug, info, warn};

use crate::backend::allocator::{Allocator, FormatSet, Fourcc};
#[cfg(feature = "backend_gbm")]
use crate::backend::allocator::gbm::{GbmAllocator, GbmBufferFlags, GbmDevice};
use crate::backend::session::{Session, SessionEvent};
use crate::backend::{Backend, BackendError, BackendEvents};
use crate::buffer::{Buffer, BufferCaps};
use crate::output::{
    ModeRequest, Output, OutputBackend, OutputError, OutputState, PhysicalProperties, PresentEvent,
    PresentFlags,
};
use crate::utils::{
    signal::{Observer, Signal},
    Physical, Point, Size,
};

use super::device::{dispatch_events, DrmDevice, InterfaceKind, PageFlip};
use super::error::DrmError;
use super::framebuffer::DrmFramebuffer;
use super::iface::{CommitFlags, CrtcCommit, DrmIface};
use super::lease::{self, DrmLease};
use super::mgpu::MgpuContext;
use super::modes;
use super::resources::{DesiredState, DrmResources};
use super::solver::{assign_crtcs, SolverInput};
use super::DrmDeviceFd;

/// Object-safe slice of the session the DRM backend needs
trait DrmSession {
    fn open_device(&mut self, path: &Path) -> Result<std::os::unix::io::OwnedFd, std::io::Error>;
    fn active(&self) -> bool;
}

impl<S: Session> DrmSession for S {
    fn open_device(&mut self, path: &Path) -> Result<std::os::unix::io::OwnedFd, std::io::Error> {
        self.open(path, OFlags::RDWR | OFlags::NONBLOCK)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    }

    fn active(&self) -> bool {
        self.is_active()
    }
}

pub(crate) struct DrmBackendInner {
    pub(crate) resources: DrmResources,
    iface: DrmIface,
    session: Box<dyn DrmSession>,
    handle: LoopHandle<'static, ()>,
    events: BackendEvents,
    outputs: Vec<Output>,
    active: bool,
    started: bool,
    destroyed: bool,
    parent: Option<Weak<RefCell<DrmBackendInner>>>,
    mgpu: Option<MgpuContext>,
    cursor_swapchain: Option<crate::backend::allocator::Swapchain<Box<dyn Allocator>>>,
    lease_revoked: Signal<u32>,
    observers: Vec<Observer>,
    span: tracing::Span,
}

/// Backend driving one DRM device
#[derive(Clone)]
pub struct DrmBackend {
    inner: Rc<RefCell<DrmBackendInner>>,
    fd: DrmDeviceFd,
}

impl DrmBackend {
    /// Open a GPU through the session and probe it
    pub fn new<S: Session + 'static>(
        session: S,
        path: &Path,
        handle: LoopHandle<'static, ()>,
    ) -> Result<DrmBackend, BackendError> {
        let mut session: Box<dyn DrmSession> = Box::new(session);
        let fd = DrmDeviceFd::new(session.open_device(path)?);

        let device =
            DrmDevice::new(fd.clone(), path, false).map_err(|err| BackendError::StartFailed(err.to_string()))?;
        let span = device.span.clone();
        let mut resources =
            DrmResources::scan(device).map_err(|err| BackendError::StartFailed(err.to_string()))?;

        let mut iface = match resources.device.iface_kind {
            InterfaceKind::Legacy => DrmIface::Legacy(Default::default()),
            InterfaceKind::Atomic => DrmIface::Atomic(Default::default()),
            InterfaceKind::Planner => DrmIface::Planner(Default::default()),
        };
        iface
            .as_dyn()
            .init(&mut resources)
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;

        let active = session.active();
        let inner = Rc::new(RefCell::new(DrmBackendInner {
            resources,
            iface,
            session,
            handle: handle.clone(),
            events: BackendEvents::new(),
            outputs: Vec::new(),
            active,
            started: false,
            destroyed: false,
            parent: None,
            mgpu: None,
            cursor_swapchain: None,
            lease_revoked: Signal::new(),
            observers: Vec::new(),
            span,
        }));

        // page-flip events
        let source_inner = Rc::downgrade(&inner);
        handle
            .insert_source(
                Generic::new(fd.clone(), Interest::READ, Mode::Level),
                move |_, _, _| {
                    if let Some(inner) = source_inner.upgrade() {
                        handle_drm_events(&inner);
                    }
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| BackendError::StartFailed(err.to_string()))?;

        Ok(DrmBackend { inner, fd })
    }

    /// Suspend and replay with the session
    pub fn link_session(&mut self, signal: &Signal<SessionEvent>) {
        let inner = Rc::downgrade(&self.inner);
        let observer = signal.observe(move |event| {
            let Some(inner) = inner.upgrade() else { return };
            match event {
                SessionEvent::Pause => {
                    inner.borrow_mut().active = false;
                }
                SessionEvent::Activate => session_resume(&inner),
            }
        });
        self.inner.borrow_mut().observers.push(observer);
    }

    /// React to GPU udev events for this device
    pub fn link_gpu_events(&mut self, signal: &Signal<crate::backend::udev::GpuEvent>) {
        let inner = Rc::downgrade(&self.inner);
        let path = self.inner.borrow().resources.device.path.clone();
        let observer = signal.observe(move |event| {
            let Some(inner) = inner.upgrade() else { return };
            match event {
                crate::backend::udev::GpuEvent::Changed(changed) if *changed == path => {
                    hotplug_scan(&inner);
                    lease_scan(&inner);
                }
                crate::backend::udev::GpuEvent::Removed(removed) if *removed == path => {
                    destroy_backend(&inner);
                }
                _ => {}
            }
        });
        self.inner.borrow_mut().observers.push(observer);
    }

    /// Attach this backend as a secondary GPU of `parent`
    ///
    /// Requires PRIME export on this device; frames will be copied into
    /// device-local buffers before scan-out.
    pub fn set_parent(&mut self, parent: &DrmBackend) {
        // a secondary GPU must be able to export its buffers
        let prime = drm::Device::get_driver_capability(&self.fd, drm::DriverCapability::Prime).unwrap_or(0);
        if prime & (1 << 1) == 0 {
            warn!("Secondary GPU lacks PRIME export, ignoring");
            return;
        }
        let mgpu = match MgpuContext::new(self.fd.clone()) {
            Ok(mgpu) => mgpu,
            Err(err) => {
                warn!("Cannot set up multi-GPU copies: {}", err);
                return;
            }
        };
        let mut inner = self.inner.borrow_mut();
        inner.parent = Some(Rc::downgrade(&parent.inner));
        inner.mgpu = Some(mgpu);
    }

    /// Emitted with the lessee id when the kernel reports a lease gone
    pub fn lease_revoked_signal(&self) -> Signal<u32> {
        self.inner.borrow().lease_revoked.clone()
    }

    /// Lease the given outputs to an external DRM client
    ///
    /// Every output must belong to this backend and have a CRTC allocated.
    pub fn lease_outputs(&self, outputs: &[&Output]) -> Result<DrmLease, DrmError> {
        let mut inner = self.inner.borrow_mut();
        let mut indices = Vec::with_capacity(outputs.len());
        for output in outputs {
            let index = inner
                .resources
                .connectors
                .iter()
                .position(|conn| {
                    conn.output
                        .as_ref()
                        .and_then(|weak| weak.upgrade())
                        .map(|candidate| candidate == **output)
                        .unwrap_or(false)
                })
                .ok_or(DrmError::DeviceGone)?;
            indices.push(index);
        }
        lease::create_lease(&mut inner.resources, &indices)
    }

    fn announce_connected(&self) {
        let connected: Vec<usize> = {
            let inner = self.inner.borrow();
            inner
                .resources
                .connectors
                .iter()
                .enumerate()
                .filter(|(_, conn)| conn.connected && conn.output.is_none() && !conn.non_desktop)
                .map(|(index, _)| index)
                .collect()
        };
        allocate_crtcs(&self.inner);
        for index in connected {
            announce_connector(&self.inner, index);
        }
    }
}

impl Backend for DrmBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.started || inner.destroyed {
                return Ok(());
            }
            inner.started = true;
        }
        self.announce_connected();
        Ok(())
    }

    fn destroy(&mut self) {
        destroy_backend(&self.inner);
    }

    fn events(&self) -> BackendEvents {
        self.inner.borrow().events.clone()
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }

    fn drm_fd(&self) -> Option<BorrowedFd<'_>> {
        use std::os::unix::io::AsFd;
        Some(self.fd.as_fd())
    }
}

impl std::fmt::Debug for DrmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("DrmBackend")
            .field("device", &inner.resources.device.path)
            .field("outputs", &inner.outputs.len())
            .field("active", &inner.active)
            .finish()
    }
}

/// Run the CRTC solver over the current connector population
fn allocate_crtcs(inner: &Rc<RefCell<DrmBackendInner>>) {
    let mut guard = inner.borrow_mut();
    let leased_crtcs: u32 = guard
        .resources
        .crtcs
        .iter()
        .enumerate()
        .filter(|(_, crtc)| crtc.lease.is_some())
        .map(|(index, _)| 1u32 << index)
        .sum();

    let inputs: Vec<SolverInput> = guard
        .resources
        .connectors
        .iter()
        .map(|conn| SolverInput {
            possible: conn.possible_crtcs & !leased_crtcs,
            wants: conn.connected && conn.lease.is_none() && !conn.non_desktop,
            current: conn.crtc,
            pinned: conn.connected && conn.desired.enabled,
        })
        .collect();

    match assign_crtcs(&inputs) {
        Some(solution) => {
            for (conn, crtc) in guard.resources.connectors.iter_mut().zip(solution) {
                conn.crtc = crtc;
            }
        }
        None => {
            warn!(parent: &guard.span, "CRTC allocation failed, keeping previous mapping");
        }
    }
}

fn announce_connector(inner: &Rc<RefCell<DrmBackendInner>>, index: usize) {
    let (output, events) = {
        let mut guard = inner.borrow_mut();
        let conn = &guard.resources.connectors[index];
        info!(parent: &guard.span, "New output {}", conn.name);

        let output = Output::new(
            conn.name.clone(),
            Box::new(DrmOutput {
                inner: Rc::downgrade(inner),
                conn: index,
            }),
            PhysicalProperties {
                size: conn.physical_size,
                subpixel: conn.subpixel,
                make: conn.make.clone(),
                model: conn.model.clone(),
                serial: conn.serial.clone(),
            },
            conn.modes.iter().map(|(mode, _)| *mode).collect(),
            None,
            Fourcc::Xrgb8888,
        );

        guard.resources.connectors[index].output = Some(output.downgrade());
        guard.outputs.push(output.clone());
        (output, guard.events.clone())
    };
    events.new_output.emit(output);
}

fn destroy_backend(inner: &Rc<RefCell<DrmBackendInner>>) {
    let (events, outputs) = {
        let mut guard = inner.borrow_mut();
        if guard.destroyed {
            return;
        }
        guard.destroyed = true;
        guard.observers.clear();
        (guard.events.clone(), std::mem::take(&mut guard.outputs))
    };

    for output in outputs {
        output.destroy();
    }
    {
        let mut guard = inner.borrow_mut();
        let guard = &mut *guard;
        guard.iface.as_dyn().finish(&mut guard.resources);
    }
    events.destroy.emit(());
}

/// Connector hotplug: rescan and reconcile outputs
fn hotplug_scan(inner: &Rc<RefCell<DrmBackendInner>>) {
    let changed = {
        let mut guard = inner.borrow_mut();
        if !guard.active {
            return;
        }
        if let Err(err) = guard.resources.device.rescan_properties() {
            warn!(parent: &guard.span, "Property rescan failed: {}", err);
        }
        match guard.resources.rescan_connectors() {
            Ok(changed) => changed,
            Err(err) => {
                warn!(parent: &guard.span, "Connector rescan failed: {}", err);
                return;
            }
        }
    };
    if changed.is_empty() {
        return;
    }

    allocate_crtcs(inner);

    for index in changed {
        let (connected, non_desktop, existing) = {
            let guard = inner.borrow();
            let conn = &guard.resources.connectors[index];
            (
                conn.connected,
                conn.non_desktop,
                conn.output.as_ref().and_then(|weak| weak.upgrade()),
            )
        };
        match (connected, existing) {
            (true, None) if !non_desktop => announce_connector(inner, index),
            (false, Some(output)) => {
                {
                    let mut guard = inner.borrow_mut();
                    guard.resources.connectors[index].output = None;
                    guard.outputs.retain(|candidate| *candidate != output);
                }
                output.destroy();
            }
            _ => {}
        }
    }
}

/// Check for leases terminated by the kernel and drop dangling markers
fn lease_scan(inner: &Rc<RefCell<DrmBackendInner>>) {
    let (known, device) = {
        let guard = inner.borrow();
        let known: Vec<u32> = guard
            .resources
            .connectors
            .iter()
            .filter_map(|conn| conn.lease)
            .collect();
        (known, guard.resources.device.fd.clone())
    };
    if known.is_empty() {
        return;
    }

    let alive = match lease::active_lessees(&device) {
        Ok(alive) => alive,
        Err(err) => {
            warn!("Lessee scan failed: {}", err);
            return;
        }
    };

    let revoked_signal = inner.borrow().lease_revoked.clone();
    for lessee in known {
        if !alive.contains(&lessee) {
            debug!("Lease {} is gone", lessee);
            lease::clear_lease(&mut inner.borrow_mut().resources, lessee);
            revoked_signal.emit(lessee);
        }
    }
}

/// The previous DRM master left KMS in an unknown state; start from a clean
/// slate and re-commit every enabled connector.
fn session_resume(inner: &Rc<RefCell<DrmBackendInner>>) {
    let enabled: Vec<(usize, Output, DesiredState)> = {
        let mut guard = inner.borrow_mut();
        guard.active = true;
        info!(parent: &guard.span, "Session resumed, resetting KMS state");

        let crtcs: Vec<_> = guard.resources.crtcs.iter().map(|crtc| crtc.handle).collect();
        for crtc in crtcs {
            if let Err(err) = guard.resources.device.fd.set_crtc(crtc, None, (0, 0), &[], None) {
                warn!(parent: &guard.span, "Failed to reset {:?}: {}", crtc, err);
            }
        }
        for crtc in &mut guard.resources.crtcs {
            crtc.active = false;
        }

        guard
            .resources
            .connectors
            .iter()
            .enumerate()
            .filter(|(_, conn)| conn.desired.enabled)
            .filter_map(|(index, conn)| {
                conn.output
                    .as_ref()
                    .and_then(|weak| weak.upgrade())
                    .map(|output| (index, output, conn.desired.clone()))
            })
            .collect()
    };

    // the connector-crtc mapping may have changed while we were away
    hotplug_scan(inner);
    allocate_crtcs(inner);

    for (_index, output, desired) in enabled {
        let mut state = OutputState::new();
        state.set_enabled(true);
        state.allow_reconfiguration = true;
        if let Some(mode) = desired.mode {
            state.mode = Some(ModeRequest::Fixed(modes::output_mode(&mode)));
        }
        if desired.vrr {
            state.set_adaptive_sync_enabled(true);
        }
        if let Err(err) = output.commit_state(&state) {
            warn!("Failed to restore output {}: {}", output.name(), err);
            continue;
        }
        output.send_frame();
    }
}

fn handle_drm_events(inner: &Rc<RefCell<DrmBackendInner>>) {
    let mut flips: Vec<PageFlip> = Vec::new();
    {
        let guard = inner.borrow();
        if guard.destroyed {
            return;
        }
        if let Err(err) = dispatch_events(&guard.resources.device, |flip| flips.push(flip)) {
            warn!(parent: &guard.span, "Failed to dispatch drm events: {}", err);
            return;
        }
    }
    for flip in flips {
        handle_page_flip(inner, flip);
    }
}

fn handle_page_flip(inner: &Rc<RefCell<DrmBackendInner>>, flip: PageFlip) {
    let (output, present, active) = {
        let mut guard = inner.borrow_mut();
        let guard = &mut *guard;

        let Some(crtc_index) = guard.resources.crtc_index(flip.crtc) else {
            return;
        };
        let Some(conn_index) = guard
            .resources
            .connectors
            .iter()
            .position(|conn| conn.crtc == Some(crtc_index))
        else {
            // connector destroyed while the flip was in flight; drop the
            // event
            return;
        };

        guard.resources.connectors[conn_index].pending_flip = false;

        // what was queued is now on screen
        let primary_index = guard.resources.crtcs[crtc_index].primary_plane;
        guard.resources.planes[primary_index].promote_queued();
        if let Some(cursor_index) = guard.resources.crtcs[crtc_index].cursor_plane {
            guard.resources.planes[cursor_index].promote_queued();
        }
        let crtc_bit = 1u32 << crtc_index;
        for plane in &mut guard.resources.planes {
            if plane.ty == drm::control::PlaneType::Overlay && plane.possible_crtcs & crtc_bit != 0 {
                plane.promote_queued();
            }
        }

        let Some(output) = guard.resources.connectors[conn_index]
            .output
            .as_ref()
            .and_then(|weak| weak.upgrade())
        else {
            return;
        };

        let mut flags = PresentFlags::VSYNC | PresentFlags::HW_CLOCK | PresentFlags::HW_COMPLETION;
        if guard.parent.is_none() {
            // on a secondary GPU the frame went through a copy
            flags |= PresentFlags::ZERO_COPY;
        }

        let refresh_mhz = output.refresh();
        let refresh = if refresh_mhz > 0 {
            1_000_000_000_000u64 / refresh_mhz as u64
        } else {
            0
        };

        let present = PresentEvent {
            commit_seq: output.commit_seq(),
            when: Duration::new(flip.tv_sec, (flip.tv_usec * 1000) as u32).into(),
            refresh,
            flags,
        };
        (output, present, guard.active)
    };

    output.send_present(&present);
    if active {
        output.send_frame();
    }
}

/// Per-output half of the DRM backend
#[derive(Debug)]
struct DrmOutput {
    inner: Weak<RefCell<DrmBackendInner>>,
    conn: usize,
}

impl DrmOutput {
    fn prepare_commit(
        &self,
        inner: &Rc<RefCell<DrmBackendInner>>,
        output: &Output,
        state: &OutputState,
        test_only: bool,
    ) -> Result<(CommitFlags, Option<drm::control::Mode>, bool), OutputError> {
        let (flags, kernel_mode, enable, needs_crtc) = {
            let guard = inner.borrow();
            if !guard.active {
                return Err(OutputError::SessionPaused);
            }

            let conn = &guard.resources.connectors[self.conn];
            if conn.lease.is_some() {
                return Err(OutputError::BackendRefused("connector is leased".into()));
            }

            let enable = state.enabled.unwrap_or(output.is_enabled());
            let modeset = state.mode.is_some() || state.enabled.is_some();

            // resolve the kernel mode for mode requests
            let kernel_mode = match &state.mode {
                Some(ModeRequest::Fixed(mode)) => Some(
                    modes::find_kernel_mode(&conn.modes, mode)
                        .ok_or(OutputError::InvalidState("mode is not advertised by this output"))?,
                ),
                Some(ModeRequest::Custom {
                    width,
                    height,
                    refresh,
                }) => Some(
                    modes::find_custom_mode(&conn.modes, *width, *height, *refresh)
                        .ok_or(OutputError::InvalidState("no kernel mode for the custom request"))?,
                ),
                None if enable && state.enabled == Some(true) => {
                    // lighting up without a mode request: reuse the desired
                    // or preferred mode
                    conn.desired.mode.or_else(|| {
                        conn.modes
                            .iter()
                            .find(|(mode, _)| mode.preferred)
                            .or_else(|| conn.modes.first())
                            .map(|(_, kernel)| *kernel)
                    })
                }
                None => None,
            };

            let mut flags = CommitFlags::empty();
            if modeset || state.allow_reconfiguration {
                flags |= CommitFlags::ALLOW_MODESET;
            } else {
                flags |= CommitFlags::NONBLOCK;
            }
            if state.buffer.is_some() && !test_only {
                flags |= CommitFlags::PAGE_FLIP_EVENT;
            }
            if state.tearing_page_flip {
                flags |= CommitFlags::ASYNC;
            }

            if flags.contains(CommitFlags::NONBLOCK) && conn.pending_flip && !test_only {
                return Err(OutputError::FlipPending);
            }

            (flags, kernel_mode, enable, enable && conn.crtc.is_none())
        };

        if needs_crtc {
            inner.borrow_mut().resources.connectors[self.conn].desired.enabled = true;
            allocate_crtcs(inner);
            if inner.borrow().resources.connectors[self.conn].crtc.is_none() {
                return Err(OutputError::BackendRefused("no crtc available".into()));
            }
        }

        Ok((flags, kernel_mode, enable))
    }

    fn stage_primary_fb(
        &self,
        inner: &Rc<RefCell<DrmBackendInner>>,
        state: &OutputState,
    ) -> Result<(), OutputError> {
        let Some(buffer) = &state.buffer else {
            return Ok(());
        };

        // on a secondary GPU the frame first crosses over
        let local: Buffer = {
            let mut guard = inner.borrow_mut();
            let guard = &mut *guard;
            if let Some(mgpu) = guard.mgpu.as_mut() {
                let formats = guard.resources.primary_plane_formats(self.conn);
                mgpu.import_frame(buffer, &formats)
                    .map_err(|err| OutputError::BackendRefused(err.to_string()))?
            } else {
                buffer.clone()
            }
        };

        let mut guard = inner.borrow_mut();
        let guard = &mut *guard;
        let conn = &guard.resources.connectors[self.conn];
        let crtc_index = conn.crtc.ok_or(OutputError::BackendRefused("no crtc".into()))?;
        let primary_index = guard.resources.crtcs[crtc_index].primary_plane;

        let fb = DrmFramebuffer::create(&guard.resources.device, &local)
            .map_err(|err| OutputError::BackendRefused(err.to_string()))?;
        guard.resources.planes[primary_index].pending_fb = Some(fb);
        Ok(())
    }

    fn unstage_primary_fb(&self, inner: &Rc<RefCell<DrmBackendInner>>) {
        let mut guard = inner.borrow_mut();
        let guard = &mut *guard;
        if let Some(crtc_index) = guard.resources.connectors[self.conn].crtc {
            let primary_index = guard.resources.crtcs[crtc_index].primary_plane;
            guard.resources.planes[primary_index].pending_fb = None;
        }
    }
}

impl OutputBackend for DrmOutput {
    fn test(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        let inner = self.inner.upgrade().ok_or(OutputError::BackendGone)?;
        let (flags, kernel_mode, enable) = self.prepare_commit(&inner, output, state, true)?;

        self.stage_primary_fb(&inner, state)?;
        let result = {
            let mut guard = inner.borrow_mut();
            let guard = &mut *guard;
            let commit = CrtcCommit {
                conn: self.conn,
                state,
                kernel_mode,
                enable,
                layers: state.layers.as_deref(),
            };
            guard
                .iface
                .as_dyn()
                .crtc_commit(&mut guard.resources, &commit, flags | CommitFlags::TEST_ONLY)
        };
        self.unstage_primary_fb(&inner);

        result.map_err(|err| OutputError::BackendRefused(err.to_string()))
    }

    fn commit(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        let inner = self.inner.upgrade().ok_or(OutputError::BackendGone)?;
        let (flags, kernel_mode, enable) = self.prepare_commit(&inner, output, state, false)?;

        self.stage_primary_fb(&inner, state)?;
        let result = {
            let mut guard = inner.borrow_mut();
            let guard = &mut *guard;
            let commit = CrtcCommit {
                conn: self.conn,
                state,
                kernel_mode,
                enable,
                layers: state.layers.as_deref(),
            };
            guard.iface.as_dyn().crtc_commit(&mut guard.resources, &commit, flags)
        };

        match result {
            Ok(()) => {
                let mut guard = inner.borrow_mut();
                let conn = &mut guard.resources.connectors[self.conn];
                conn.desired.enabled = enable;
                if let Some(mode) = kernel_mode {
                    conn.desired.mode = Some(mode);
                }
                if let Some(vrr) = state.adaptive_sync_enabled {
                    conn.desired.vrr = vrr;
                }
                Ok(())
            }
            Err(err) => {
                self.unstage_primary_fb(&inner);
                Err(OutputError::BackendRefused(err.to_string()))
            }
        }
    }

    fn schedule_frame(&mut self, output: &Output) {
        let Some(inner) = self.inner.upgrade() else { return };
        let guard = inner.borrow();
        if guard.resources.connectors[self.conn].pending_flip {
            // the flip event will deliver the frame
            return;
        }
        let output = output.clone();
        let _ = guard
            .handle
            .insert_source(Timer::from_duration(Duration::ZERO), move |_, _, _| {
                output.send_frame();
                TimeoutAction::Drop
            });
    }

    fn primary_formats(&self, caps: BufferCaps) -> FormatSet {
        let Some(inner) = self.inner.upgrade() else {
            return FormatSet::new();
        };
        if !caps.contains(BufferCaps::DMABUF) {
            return FormatSet::new();
        }
        let guard = inner.borrow();
        let formats = guard.resources.primary_plane_formats(self.conn);
        match &guard.mgpu {
            Some(mgpu) => mgpu.scanout_formats(&formats),
            None => formats,
        }
    }

    fn cursor_formats(&self, caps: BufferCaps) -> Option<FormatSet> {
        let inner = self.inner.upgrade()?;
        if !caps.contains(BufferCaps::DMABUF) {
            return None;
        }
        let guard = inner.borrow();
        let crtc_index = guard.resources.connectors[self.conn].crtc?;
        let cursor_index = guard.resources.crtcs[crtc_index].cursor_plane?;
        Some(guard.resources.planes[cursor_index].formats.clone())
    }

    fn cursor_size(&self) -> Option<Size<i32, Physical>> {
        let inner = self.inner.upgrade()?;
        let size = inner.borrow().resources.device.cursor_size;
        Some(size)
    }

    fn gamma_size(&self) -> Option<u32> {
        let inner = self.inner.upgrade()?;
        let guard = inner.borrow();
        let crtc_index = guard.resources.connectors[self.conn].crtc?;
        let size = guard.resources.crtcs[crtc_index].gamma_size;
        (size > 0).then_some(size)
    }

    fn set_hardware_cursor(
        &mut self,
        output: &Output,
        buffer: Option<&Buffer>,
        hotspot: Point<i32, Physical>,
    ) -> Result<(), OutputError> {
        let inner = self.inner.upgrade().ok_or(OutputError::BackendGone)?;
        cursor::set_hardware_cursor(&inner, self.conn, output, buffer, hotspot)
    }

    fn move_hardware_cursor(&mut self, output: &Output, position: Point<i32, Physical>) -> Result<(), OutputError> {
        let inner = self.inner.upgrade().ok_or(OutputError::BackendGone)?;
        cursor::move_hardware_cursor(&inner, self.conn, output, position)
    }

    fn create_allocator(&self) -> Box<dyn Allocator> {
        let Some(inner) = self.inner.upgrade() else {
            return Box::new(crate::backend::allocator::shm::ShmAllocator::new());
        };
        let fd = inner.borrow().resources.device.fd.clone();

        #[cfg(feature = "backend_gbm")]
        if let Ok(device) = GbmDevice::new(fd.clone()) {
            return Box::new(GbmAllocator::new(
                device,
                GbmBufferFlags::SCANOUT | GbmBufferFlags::RENDERING,
            ));
        }

        Box::new(crate::backend::allocator::dumb::DumbAllocator::new(fd))
    }
}

/// Hardware cursor plumbing
pub(crate) mod cursor {
    use super::*;
    use crate::backend::renderer::{PassOptions, Renderer, TextureArgs};
    use crate::utils::Rectangle;

    /// Place (or hide) the cursor on the hardware cursor plane
    ///
    /// Runs outside the frame state machine: the cursor commits
    /// immediately and is not rolled back by failed output commits.
    pub(crate) fn set_hardware_cursor(
        inner: &Rc<RefCell<DrmBackendInner>>,
        conn_index: usize,
        output: &Output,
        buffer: Option<&Buffer>,
        hotspot: Point<i32, Physical>,
    ) -> Result<(), OutputError> {
        let cursor_size = {
            let guard = inner.borrow();
            if !guard.active {
                return Err(OutputError::SessionPaused);
            }
            let crtc_index = guard.resources.connectors[conn_index]
                .crtc
                .ok_or(OutputError::HardwareCursorUnsupported)?;
            if guard.resources.crtcs[crtc_index].cursor_plane.is_none() {
                return Err(OutputError::HardwareCursorUnsupported);
            }
            guard.resources.device.cursor_size
        };

        let staged = match buffer {
            None => None,
            Some(buffer) => {
                let prepared = prepare_cursor_buffer(inner, output, buffer, cursor_size)?;
                let guard = inner.borrow();
                let fb = DrmFramebuffer::create(&guard.resources.device, &prepared)
                    .map_err(|_| OutputError::HardwareCursorUnsupported)?;
                Some(fb)
            }
        };

        {
            let mut guard = inner.borrow_mut();
            let guard = &mut *guard;
            let conn = &mut guard.resources.connectors[conn_index];
            conn.cursor_enabled = staged.is_some();
            conn.cursor_hotspot = (hotspot.x, hotspot.y);
            let crtc_index = conn.crtc.expect("checked above");
            let cursor_index = guard.resources.crtcs[crtc_index].cursor_plane.expect("checked above");
            guard.resources.planes[cursor_index].pending_fb = staged;
        }

        commit_cursor_state(inner, conn_index)
    }

    /// Move the hardware cursor plane
    pub(crate) fn move_hardware_cursor(
        inner: &Rc<RefCell<DrmBackendInner>>,
        conn_index: usize,
        _output: &Output,
        position: Point<i32, Physical>,
    ) -> Result<(), OutputError> {
        {
            let mut guard = inner.borrow_mut();
            if !guard.active {
                return Err(OutputError::SessionPaused);
            }
            guard.resources.connectors[conn_index].cursor_position = (position.x, position.y);
        }
        commit_cursor_state(inner, conn_index)
    }

    fn commit_cursor_state(
        inner: &Rc<RefCell<DrmBackendInner>>,
        conn_index: usize,
    ) -> Result<(), OutputError> {
        let mut guard = inner.borrow_mut();
        let guard = &mut *guard;
        if matches!(guard.iface, DrmIface::Legacy(_)) {
            return legacy_cursor_commit(guard, conn_index);
        }
        match &mut guard.iface {
            DrmIface::Atomic(atomic) => atomic
                .commit_cursor(&mut guard.resources, conn_index)
                .map_err(|_| OutputError::HardwareCursorUnsupported),
            DrmIface::Planner(planner) => planner
                .atomic_mut()
                .commit_cursor(&mut guard.resources, conn_index)
                .map_err(|_| OutputError::HardwareCursorUnsupported),
            DrmIface::Legacy(_) => unreachable!("handled above"),
        }
    }

    fn legacy_cursor_commit(guard: &mut DrmBackendInner, conn_index: usize) -> Result<(), OutputError> {
        let conn = &guard.resources.connectors[conn_index];
        let crtc_index = conn.crtc.ok_or(OutputError::HardwareCursorUnsupported)?;
        let crtc = guard.resources.crtcs[crtc_index].handle;
        let cursor_index = guard.resources.crtcs[crtc_index]
            .cursor_plane
            .ok_or(OutputError::HardwareCursorUnsupported)?;

        if conn.cursor_enabled {
            let plane = &mut guard.resources.planes[cursor_index];
            plane.commit_pending();
            plane.promote_queued();
            let fb = plane
                .current_fb
                .as_ref()
                .ok_or(OutputError::HardwareCursorUnsupported)?;
            let buffer = fb.buffer();
            let hotspot = conn.cursor_hotspot;

            // SetCursor2 wants a GEM object; go through the dmabuf view
            let dmabuf = buffer.dmabuf().ok_or(OutputError::HardwareCursorUnsupported)?;
            let gem = guard
                .resources
                .device
                .fd
                .prime_fd_to_buffer(dmabuf.handles().next().expect("cursor dmabuf plane"))
                .map_err(|_| OutputError::HardwareCursorUnsupported)?;
            let cursor = CursorGem {
                handle: gem,
                size: (buffer.width() as u32, buffer.height() as u32),
                format: dmabuf.format().code,
                pitch: dmabuf.strides().next().unwrap_or(0),
            };
            let result = guard
                .resources
                .device
                .fd
                .set_cursor2(crtc, Some(&cursor), (hotspot.0, hotspot.1));
            let position = conn.cursor_position;
            let move_result = guard.resources.device.fd.move_cursor(
                crtc,
                (position.0 - hotspot.0, position.1 - hotspot.1),
            );
            result
                .and(move_result)
                .map_err(|_| OutputError::HardwareCursorUnsupported)
        } else {
            guard
                .resources
                .device
                .fd
                .set_cursor2(crtc, Option::<&CursorGem>::None, (0, 0))
                .map_err(|_| OutputError::HardwareCursorUnsupported)
        }
    }

    struct CursorGem {
        handle: drm::buffer::Handle,
        size: (u32, u32),
        format: Fourcc,
        pitch: u32,
    }

    impl drm::buffer::Buffer for CursorGem {
        fn size(&self) -> (u32, u32) {
            self.size
        }
        fn format(&self) -> Fourcc {
            self.format
        }
        fn pitch(&self) -> u32 {
            self.pitch
        }
        fn handle(&self) -> drm::buffer::Handle {
            self.handle
        }
    }

    /// Bring the cursor buffer into the size and orientation the cursor
    /// plane expects
    ///
    /// The buffer is drawn with the output's inverse transform into a
    /// cursor-sized dumb buffer, so compositors can hand over a
    /// logical-space image and hotspot.
    fn prepare_cursor_buffer(
        inner: &Rc<RefCell<DrmBackendInner>>,
        output: &Output,
        buffer: &Buffer,
        cursor_size: Size<i32, Physical>,
    ) -> Result<Buffer, OutputError> {
        if buffer.width() == cursor_size.w
            && buffer.height() == cursor_size.h
            && output.transform() == crate::utils::Transform::Normal
            && buffer.dmabuf().is_some()
        {
            return Ok(buffer.clone());
        }

        // cursor buffers must be CPU-writable and scan-out capable,
        // which is exactly what dumb buffers are for
        let target = {
                let mut guard = inner.borrow_mut();
                let fd = guard.resources.device.fd.clone();
                let chain = guard.cursor_swapchain.get_or_insert_with(|| {
                    crate::backend::allocator::Swapchain::new(
                        Box::new(crate::backend::allocator::dumb::DumbAllocator::new(fd))
                            as Box<dyn Allocator>,
                        cursor_size.w as u32,
                        cursor_size.h as u32,
                        Fourcc::Argb8888,
                        vec![crate::backend::allocator::Modifier::Linear],
                    )
                });
                chain.resize(cursor_size.w as u32, cursor_size.h as u32);
                let slot = chain
                    .acquire()
                    .ok()
                    .flatten()
                    .ok_or(OutputError::HardwareCursorUnsupported)?;
                let target = slot.buffer();
                chain.submitted(&slot);
                target
            };
            // start from a transparent plane
            target.with_shm(|shm| unsafe { shm.as_mut_slice() }.fill(0));

            let mut renderer = crate::backend::renderer::pixman::PixmanRenderer::new();
            let texture = renderer
                .texture_from_buffer(buffer)
                .map_err(|_| OutputError::HardwareCursorUnsupported)?;
            let mut pass = renderer
                .begin_buffer_pass(&target, &PassOptions::default())
                .map_err(|_| OutputError::HardwareCursorUnsupported)?;
            pass.add_texture(TextureArgs {
                texture: texture.as_ref(),
                src: Default::default(),
                dst: Rectangle::from_size((buffer.width(), buffer.height()).into()),
                transform: output.transform().invert(),
                clip: None,
                filter: crate::backend::renderer::FilterMode::Bilinear,
                blend: crate::backend::renderer::BlendMode::None,
                alpha: 1.0,
            });
            pass.submit().map_err(|_| OutputError::HardwareCursorUnsupported)?;
            return Ok(target);
        }

        #[cfg(not(feature = "renderer_pixman"))]
        Err(OutputError::HardwareCursorUnsupported)
    }
}
