//! Atomic modesetting implementation of the commit interface
//!
//! A commit builds a single atomic request covering connector, CRTC and
//! plane properties. Property blobs created for the request (mode, gamma
//! LUT, damage clips) live in a [`PendingBlobs`] set that is committed on
//! success, transferring ownership to the CRTC, or rolled back on failure.
//! Blobs are never leaked: an unconsumed set destroys its blobs on drop.

use drm::control::atomic::AtomicModeReq;
use drm::control::{connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice, Mode};
use tracing::{debug, trace, warn};

use crate::backend::allocator::Fourcc;
use crate::output::GammaLut;
use crate::utils::{BufferCoords, Region};

use super::device::DrmDevice;
use super::error::DrmError;
use super::iface::{CommitFlags, CrtcCommit, DrmInterface};
use super::resources::{DrmCrtc, DrmResources};

#[repr(C)]
struct ColorLut {
    red: u16,
    green: u16,
    blue: u16,
    reserved: u16,
}

#[repr(C)]
struct ModeRect {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

/// Kernel blobs created for a commit that is not yet known to succeed
///
/// On [`commit`](PendingBlobs::commit) the new blobs replace the CRTC's
/// current ones (which are destroyed); on [`rollback`](PendingBlobs::rollback)
/// or drop the new blobs are destroyed instead.
pub(crate) struct PendingBlobs<'a> {
    device: &'a DrmDevice,
    mode: Option<u64>,
    gamma: Option<u64>,
    damage: Option<u64>,
    consumed: bool,
}

impl<'a> PendingBlobs<'a> {
    pub(crate) fn new(device: &'a DrmDevice) -> PendingBlobs<'a> {
        PendingBlobs {
            device,
            mode: None,
            gamma: None,
            damage: None,
            consumed: false,
        }
    }

    pub(crate) fn create_mode_blob(&mut self, mode: &Mode) -> Result<u64, DrmError> {
        let value = self
            .device
            .fd
            .create_property_blob(mode)
            .map_err(|source| DrmError::Access {
                errmsg: "create mode blob",
                source: source.into(),
            })?;
        let id: u64 = value.into();
        self.mode = Some(id);
        Ok(id)
    }

    pub(crate) fn create_gamma_blob(&mut self, lut: &GammaLut) -> Result<u64, DrmError> {
        let entries: Vec<ColorLut> = lut
            .red
            .iter()
            .zip(lut.green.iter())
            .zip(lut.blue.iter())
            .map(|((&red, &green), &blue)| ColorLut {
                red,
                green,
                blue,
                reserved: 0,
            })
            .collect();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                entries.as_ptr() as *const u8,
                entries.len() * std::mem::size_of::<ColorLut>(),
            )
        };
        let id = self.device.create_blob(bytes)?;
        self.gamma = Some(id);
        Ok(id)
    }

    pub(crate) fn create_damage_blob(&mut self, damage: &Region<BufferCoords>) -> Result<u64, DrmError> {
        let rects: Vec<ModeRect> = damage
            .rects()
            .iter()
            .map(|rect| ModeRect {
                x1: rect.loc.x,
                y1: rect.loc.y,
                x2: rect.loc.x + rect.size.w,
                y2: rect.loc.y + rect.size.h,
            })
            .collect();
        let bytes = unsafe {
            std::slice::from_raw_parts(rects.as_ptr() as *const u8, rects.len() * std::mem::size_of::<ModeRect>())
        };
        let id = self.device.create_blob(bytes)?;
        self.damage = Some(id);
        Ok(id)
    }

    /// The commit succeeded: transfer blob ownership to the CRTC
    pub(crate) fn commit(mut self, crtc: &mut DrmCrtc) {
        self.consumed = true;
        if let Some(id) = self.mode.take() {
            if let Some(old) = crtc.mode_blob.replace(id) {
                self.device.destroy_blob(old);
            }
        }
        if let Some(id) = self.gamma.take() {
            if let Some(old) = crtc.gamma_blob.replace(id) {
                self.device.destroy_blob(old);
            }
        }
        // damage clips are consumed by the kernel during the commit
        if let Some(id) = self.damage.take() {
            self.device.destroy_blob(id);
        }
    }

    /// The commit failed or was a test: destroy the new blobs
    pub(crate) fn rollback(mut self) {
        self.consumed = true;
        for id in [self.mode.take(), self.gamma.take(), self.damage.take()].into_iter().flatten() {
            self.device.destroy_blob(id);
        }
    }
}

impl Drop for PendingBlobs<'_> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        for id in [self.mode.take(), self.gamma.take(), self.damage.take()].into_iter().flatten() {
            self.device.destroy_blob(id);
        }
    }
}

/// Request builder with a sticky failure flag
///
/// A missing required property poisons the request instead of aborting the
/// whole frame mid-construction; the error surfaces when the request is
/// finished.
pub(crate) struct AtomicReq<'a> {
    device: &'a DrmDevice,
    req: AtomicModeReq,
    failed: Option<&'static str>,
}

impl<'a> AtomicReq<'a> {
    pub(crate) fn new(device: &'a DrmDevice) -> AtomicReq<'a> {
        AtomicReq {
            device,
            req: AtomicModeReq::new(),
            failed: None,
        }
    }

    pub(crate) fn add_connector(&mut self, handle: connector::Handle, name: &'static str, value: property::Value<'static>) {
        match self.device.props.connector_prop(handle, name) {
            Ok(prop) => self.req.add_property(handle, prop, value),
            Err(_) => self.fail(name),
        }
    }

    pub(crate) fn add_connector_opt(
        &mut self,
        handle: connector::Handle,
        name: &str,
        value: property::Value<'static>,
    ) {
        if let Ok(prop) = self.device.props.connector_prop(handle, name) {
            self.req.add_property(handle, prop, value);
        }
    }

    pub(crate) fn add_crtc(&mut self, handle: crtc::Handle, name: &'static str, value: property::Value<'static>) {
        match self.device.props.crtc_prop(handle, name) {
            Ok(prop) => self.req.add_property(handle, prop, value),
            Err(_) => self.fail(name),
        }
    }

    pub(crate) fn add_crtc_opt(&mut self, handle: crtc::Handle, name: &str, value: property::Value<'static>) {
        if let Ok(prop) = self.device.props.crtc_prop(handle, name) {
            self.req.add_property(handle, prop, value);
        }
    }

    pub(crate) fn add_plane(&mut self, handle: plane::Handle, name: &'static str, value: property::Value<'static>) {
        match self.device.props.plane_prop(handle, name) {
            Ok(prop) => self.req.add_property(handle, prop, value),
            Err(_) => self.fail(name),
        }
    }

    pub(crate) fn add_plane_opt(&mut self, handle: plane::Handle, name: &str, value: property::Value<'static>) {
        if let Ok(prop) = self.device.props.plane_prop(handle, name) {
            self.req.add_property(handle, prop, value);
        }
    }

    fn fail(&mut self, name: &'static str) {
        warn!(parent: &self.device.span, "Missing required property {}", name);
        if self.failed.is_none() {
            self.failed = Some(name);
        }
    }

    pub(crate) fn finish(self) -> Result<AtomicModeReq, DrmError> {
        match self.failed {
            None => Ok(self.req),
            Some(name) => Err(DrmError::Access {
                errmsg: "build atomic request",
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing property {name}"),
                ),
            }),
        }
    }
}

/// Enable the primary plane of a CRTC with a 1:1 mapping of the given size
pub(crate) fn set_plane_props(
    req: &mut AtomicReq<'_>,
    plane: plane::Handle,
    crtc: crtc::Handle,
    fb: drm::control::framebuffer::Handle,
    (width, height): (u64, u64),
) {
    req.add_plane(plane, "CRTC_ID", property::Value::CRTC(Some(crtc)));
    req.add_plane(plane, "FB_ID", property::Value::Framebuffer(Some(fb)));
    // source coordinates are 16.16 fixed point
    req.add_plane(plane, "SRC_X", property::Value::UnsignedRange(0));
    req.add_plane(plane, "SRC_Y", property::Value::UnsignedRange(0));
    req.add_plane(plane, "SRC_W", property::Value::UnsignedRange(width << 16));
    req.add_plane(plane, "SRC_H", property::Value::UnsignedRange(height << 16));
    req.add_plane(plane, "CRTC_X", property::Value::SignedRange(0));
    req.add_plane(plane, "CRTC_Y", property::Value::SignedRange(0));
    req.add_plane(plane, "CRTC_W", property::Value::UnsignedRange(width));
    req.add_plane(plane, "CRTC_H", property::Value::UnsignedRange(height));
}

/// Disable a plane
pub(crate) fn clear_plane_props(req: &mut AtomicReq<'_>, plane: plane::Handle) {
    req.add_plane(plane, "CRTC_ID", property::Value::CRTC(None));
    req.add_plane(plane, "FB_ID", property::Value::Framebuffer(None));
}

/// The `max bpc` a framebuffer format calls for
fn format_max_bpc(fourcc: Fourcc) -> u64 {
    match fourcc {
        Fourcc::Xrgb2101010 | Fourcc::Argb2101010 | Fourcc::Xbgr2101010 | Fourcc::Abgr2101010 => 10,
        Fourcc::Xbgr16161616 | Fourcc::Abgr16161616 | Fourcc::Xbgr16161616f | Fourcc::Abgr16161616f => 16,
        _ => 8,
    }
}

/// Map interface commit flags onto the kernel's atomic flags
fn atomic_flags(flags: CommitFlags) -> AtomicCommitFlags {
    let mut out = AtomicCommitFlags::empty();
    if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
        out |= AtomicCommitFlags::PAGE_FLIP_EVENT;
    }
    if flags.contains(CommitFlags::ASYNC) {
        out |= AtomicCommitFlags::PAGE_FLIP_ASYNC;
    }
    if flags.contains(CommitFlags::TEST_ONLY) {
        out |= AtomicCommitFlags::TEST_ONLY;
    }
    if flags.contains(CommitFlags::NONBLOCK) {
        out |= AtomicCommitFlags::NONBLOCK;
    }
    if flags.contains(CommitFlags::ALLOW_MODESET) {
        out |= AtomicCommitFlags::ALLOW_MODESET;
    }
    out
}

/// The atomic commit path
#[derive(Debug, Default)]
pub(crate) struct AtomicIface;

/// Emit the property set showing the cursor plane at the connector's
/// immediately-committed cursor state.
fn set_cursor_plane_props(
    req: &mut AtomicReq<'_>,
    plane: plane::Handle,
    crtc: crtc::Handle,
    position: (i32, i32),
    hotspot: (i32, i32),
    fb: &super::framebuffer::DrmFramebuffer,
) {
    let buffer = fb.buffer();
    let (width, height) = (buffer.width() as u64, buffer.height() as u64);
    req.add_plane(plane, "CRTC_ID", property::Value::CRTC(Some(crtc)));
    req.add_plane(plane, "FB_ID", property::Value::Framebuffer(Some(fb.handle())));
    req.add_plane(plane, "SRC_X", property::Value::UnsignedRange(0));
    req.add_plane(plane, "SRC_Y", property::Value::UnsignedRange(0));
    req.add_plane(plane, "SRC_W", property::Value::UnsignedRange(width << 16));
    req.add_plane(plane, "SRC_H", property::Value::UnsignedRange(height << 16));
    req.add_plane(
        plane,
        "CRTC_X",
        property::Value::SignedRange(position.0 as i64 - hotspot.0 as i64),
    );
    req.add_plane(
        plane,
        "CRTC_Y",
        property::Value::SignedRange(position.1 as i64 - hotspot.1 as i64),
    );
    req.add_plane(plane, "CRTC_W", property::Value::UnsignedRange(width));
    req.add_plane(plane, "CRTC_H", property::Value::UnsignedRange(height));
}

impl AtomicIface {
    fn build_request<'d>(
        device: &'d DrmDevice,
        res: &DrmResources,
        commit: &CrtcCommit<'_>,
        blobs: &mut PendingBlobs<'_>,
    ) -> Result<AtomicReq<'d>, DrmError> {
        let conn = &res.connectors[commit.conn];
        let crtc_index = conn.crtc.ok_or(DrmError::NoCrtc(conn.handle))?;
        let crtc = &res.crtcs[crtc_index];
        let primary = &res.planes[crtc.primary_plane];

        let mut req = AtomicReq::new(device);

        if !commit.enable {
            req.add_connector(conn.handle, "CRTC_ID", property::Value::CRTC(None));
            req.add_crtc(crtc.handle, "MODE_ID", property::Value::Unknown(0));
            req.add_crtc(crtc.handle, "ACTIVE", property::Value::Boolean(false));
            clear_plane_props(&mut req, primary.handle);
            if let Some(cursor_index) = crtc.cursor_plane {
                clear_plane_props(&mut req, res.planes[cursor_index].handle);
            }
            return Ok(req);
        }

        // connector side
        req.add_connector(conn.handle, "CRTC_ID", property::Value::CRTC(Some(crtc.handle)));
        if commit.kernel_mode.is_some() {
            // a bad link state is retrained by a full modeset
            req.add_connector_opt(conn.handle, "link-status", property::Value::Unknown(0));
        }
        req.add_connector_opt(conn.handle, "content type", property::Value::Unknown(1));

        if let (Some(fb), Some((min, max))) = (primary.pending_fb.as_ref(), conn.max_bpc_range) {
            if commit.kernel_mode.is_some() {
                let wanted = format_max_bpc(fb.buffer().dmabuf().map(|d| d.format().code).unwrap_or(Fourcc::Xrgb8888));
                let clamped = wanted.clamp(min, max);
                req.add_connector_opt(conn.handle, "max bpc", property::Value::UnsignedRange(clamped));
            }
        }

        // crtc side
        let mode_blob = match commit.kernel_mode.as_ref() {
            Some(mode) => blobs.create_mode_blob(mode)?,
            None => crtc.mode_blob.ok_or(DrmError::ModeNotSuitable(conn.handle))?,
        };
        req.add_crtc(crtc.handle, "MODE_ID", property::Value::Unknown(mode_blob));
        req.add_crtc(crtc.handle, "ACTIVE", property::Value::Boolean(true));

        if let Some(lut) = &commit.state.gamma_lut {
            let gamma_blob = blobs.create_gamma_blob(lut)?;
            req.add_crtc_opt(crtc.handle, "GAMMA_LUT", property::Value::Unknown(gamma_blob));
        }
        if let Some(vrr) = commit.state.adaptive_sync_enabled {
            if conn.vrr_capable {
                req.add_crtc_opt(crtc.handle, "VRR_ENABLED", property::Value::Boolean(vrr));
            }
        }

        // primary plane
        if let Some(fb) = primary.pending_fb.as_ref() {
            let size = commit
                .kernel_mode
                .map(|mode| {
                    let (width, height) = mode.size();
                    (width as u64, height as u64)
                })
                .unwrap_or_else(|| {
                    let buffer = fb.buffer();
                    (buffer.width() as u64, buffer.height() as u64)
                });
            set_plane_props(&mut req, primary.handle, crtc.handle, fb.handle(), size);

            if let Some(damage) = &commit.state.damage {
                if device.props.has_plane_prop(primary.handle, "FB_DAMAGE_CLIPS") && !damage.is_empty() {
                    let damage_blob = blobs.create_damage_blob(damage)?;
                    req.add_plane_opt(
                        primary.handle,
                        "FB_DAMAGE_CLIPS",
                        property::Value::Unknown(damage_blob),
                    );
                }
            }
        }

        // overlay planes staged by the planner
        let crtc_bit = 1u32 << crtc_index;
        for plane in &res.planes {
            if plane.ty != drm::control::PlaneType::Overlay || plane.possible_crtcs & crtc_bit == 0 {
                continue;
            }
            let Some(fb) = plane.pending_fb.as_ref() else {
                continue;
            };
            let src = plane.pending_src;
            let dst = plane.pending_dst;
            req.add_plane(plane.handle, "CRTC_ID", property::Value::CRTC(Some(crtc.handle)));
            req.add_plane(plane.handle, "FB_ID", property::Value::Framebuffer(Some(fb.handle())));
            req.add_plane(
                plane.handle,
                "SRC_X",
                property::Value::UnsignedRange((src.loc.x * 65536.0) as u64),
            );
            req.add_plane(
                plane.handle,
                "SRC_Y",
                property::Value::UnsignedRange((src.loc.y * 65536.0) as u64),
            );
            req.add_plane(
                plane.handle,
                "SRC_W",
                property::Value::UnsignedRange((src.size.w * 65536.0) as u64),
            );
            req.add_plane(
                plane.handle,
                "SRC_H",
                property::Value::UnsignedRange((src.size.h * 65536.0) as u64),
            );
            req.add_plane(plane.handle, "CRTC_X", property::Value::SignedRange(dst.loc.x as i64));
            req.add_plane(plane.handle, "CRTC_Y", property::Value::SignedRange(dst.loc.y as i64));
            req.add_plane(plane.handle, "CRTC_W", property::Value::UnsignedRange(dst.size.w as u64));
            req.add_plane(plane.handle, "CRTC_H", property::Value::UnsignedRange(dst.size.h as u64));
        }

        // cursor plane, from the immediately-committed cursor state
        if let Some(cursor_index) = crtc.cursor_plane {
            let cursor_plane = &res.planes[cursor_index];
            let cursor_fb = cursor_plane.pending_fb.as_ref().or(cursor_plane.current_fb.as_ref());
            match (conn.cursor_enabled, cursor_fb) {
                (true, Some(fb)) => set_cursor_plane_props(
                    &mut req,
                    cursor_plane.handle,
                    crtc.handle,
                    conn.cursor_position,
                    conn.cursor_hotspot,
                    fb,
                ),
                _ => clear_plane_props(&mut req, cursor_plane.handle),
            }
        }

        Ok(req)
    }

    /// Issue a bare cursor update outside a full frame
    pub(crate) fn commit_cursor(
        &mut self,
        res: &mut DrmResources,
        conn_index: usize,
    ) -> Result<(), DrmError> {
        let conn = &res.connectors[conn_index];
        let Some(crtc_index) = conn.crtc else {
            return Err(DrmError::NoCrtc(conn.handle));
        };
        let crtc = &res.crtcs[crtc_index];
        let Some(cursor_index) = crtc.cursor_plane else {
            return Err(DrmError::MissingCapability("cursor plane"));
        };
        let cursor_plane = &res.planes[cursor_index];

        let mut req = AtomicReq::new(&res.device);
        let cursor_fb = cursor_plane.pending_fb.as_ref().or(cursor_plane.current_fb.as_ref());
        match (conn.cursor_enabled, cursor_fb) {
            (true, Some(fb)) => set_cursor_plane_props(
                &mut req,
                cursor_plane.handle,
                crtc.handle,
                conn.cursor_position,
                conn.cursor_hotspot,
                fb,
            ),
            _ => clear_plane_props(&mut req, cursor_plane.handle),
        }

        let req = req.finish()?;
        res.device
            .fd
            .atomic_commit(AtomicCommitFlags::NONBLOCK, req)
            .map_err(|source| DrmError::Access {
                errmsg: "commit cursor plane",
                source: source.into(),
            })?;

        let plane = &mut res.planes[cursor_index];
        plane.commit_pending();
        plane.promote_queued();
        Ok(())
    }
}

impl DrmInterface for AtomicIface {
    fn init(&mut self, res: &mut DrmResources) -> Result<(), DrmError> {
        debug!(parent: &res.device.span, "Atomic interface ready");
        Ok(())
    }

    fn finish(&mut self, res: &mut DrmResources) {
        for crtc in &mut res.crtcs {
            if let Some(blob) = crtc.mode_blob.take() {
                res.device.destroy_blob(blob);
            }
            if let Some(blob) = crtc.gamma_blob.take() {
                res.device.destroy_blob(blob);
            }
        }
    }

    fn crtc_commit(
        &mut self,
        res: &mut DrmResources,
        commit: &CrtcCommit<'_>,
        flags: CommitFlags,
    ) -> Result<(), DrmError> {
        let mut blobs = PendingBlobs::new(&res.device);
        let req = match Self::build_request(&res.device, res, commit, &mut blobs) {
            Ok(req) => req,
            Err(err) => {
                blobs.rollback();
                return Err(err);
            }
        };
        let req = match req.finish() {
            Ok(req) => req,
            Err(err) => {
                blobs.rollback();
                return Err(err);
            }
        };

        trace!(parent: &res.device.span, "Atomic commit ({:?}): {:?}", flags, req);
        let result = res.device.fd.atomic_commit(atomic_flags(flags), req);

        let test_only = flags.contains(CommitFlags::TEST_ONLY);
        match result {
            Ok(()) if test_only => {
                blobs.rollback();
                Ok(())
            }
            Ok(()) => {
                let conn = &res.connectors[commit.conn];
                let crtc_index = conn.crtc.expect("validated above");
                blobs.commit(&mut res.crtcs[crtc_index]);

                let crtc = &mut res.crtcs[crtc_index];
                crtc.active = commit.enable;
                if let Some(vrr) = commit.state.adaptive_sync_enabled {
                    crtc.vrr_enabled = vrr && res.connectors[commit.conn].vrr_capable;
                }

                let primary_index = res.crtcs[crtc_index].primary_plane;
                res.planes[primary_index].commit_pending();
                if let Some(cursor_index) = res.crtcs[crtc_index].cursor_plane {
                    res.planes[cursor_index].commit_pending();
                }
                let crtc_bit = 1u32 << crtc_index;
                for plane in &mut res.planes {
                    if plane.ty == drm::control::PlaneType::Overlay && plane.possible_crtcs & crtc_bit != 0 {
                        plane.commit_pending();
                    }
                }

                // layers whose buffer did not land on an overlay plane are
                // composited by the renderer
                if let Some(layers) = commit.layers {
                    for layer in layers {
                        let offloaded = match layer.buffer.as_ref() {
                            None => true,
                            Some(buffer) => res.planes.iter().any(|plane| {
                                plane.ty == drm::control::PlaneType::Overlay
                                    && plane
                                        .queued_fb
                                        .as_ref()
                                        .map(|fb| fb.buffer() == *buffer)
                                        .unwrap_or(false)
                            }),
                        };
                        if !offloaded {
                            layer.layer.set_accepted(false);
                        }
                    }
                }

                res.connectors[commit.conn].pending_flip = flags.contains(CommitFlags::PAGE_FLIP_EVENT);
                Ok(())
            }
            Err(source) => {
                blobs.rollback();
                // staged framebuffers are dropped by the caller
                if test_only {
                    let conn = &res.connectors[commit.conn];
                    let crtc_index = conn.crtc.expect("checked during request build");
                    Err(DrmError::TestFailed(res.crtcs[crtc_index].handle))
                } else {
                    Err(DrmError::Access {
                        errmsg: "atomic commit",
                        source: source.into(),
                    })
                }
            }
        }
    }
}
