//! Legacy (pre-atomic) implementation of the commit interface
//!
//! Modesets go through `SetCrtc`, frames through `PageFlip`, the cursor
//! through `SetCursor2`/`MoveCursor` and gamma through `CrtcSetGamma`.
//! There is no test facility; tests succeed whenever the arguments are
//! structurally valid, and the real verdict only arrives with the commit.

use drm::control::{Device as ControlDevice, PageFlipFlags};
use tracing::{debug, trace};

use super::error::DrmError;
use super::iface::{CommitFlags, CrtcCommit, DrmInterface};
use super::resources::DrmResources;

/// The legacy commit path
#[derive(Debug, Default)]
pub(crate) struct LegacyIface;

impl DrmInterface for LegacyIface {
    fn init(&mut self, res: &mut DrmResources) -> Result<(), DrmError> {
        debug!(parent: &res.device.span, "Legacy interface ready");
        Ok(())
    }

    fn finish(&mut self, _res: &mut DrmResources) {}

    fn crtc_commit(
        &mut self,
        res: &mut DrmResources,
        commit: &CrtcCommit<'_>,
        flags: CommitFlags,
    ) -> Result<(), DrmError> {
        let conn = &res.connectors[commit.conn];
        let crtc_index = conn.crtc.ok_or(DrmError::NoCrtc(conn.handle))?;
        let crtc_handle = res.crtcs[crtc_index].handle;
        let primary_index = res.crtcs[crtc_index].primary_plane;

        if flags.contains(CommitFlags::ASYNC) && !res.device.async_page_flip {
            return Err(DrmError::MissingCapability("ASYNC_PAGE_FLIP"));
        }

        if flags.contains(CommitFlags::TEST_ONLY) {
            // the legacy interface cannot test; reject only what is
            // structurally impossible
            if commit.enable && commit.kernel_mode.is_none() && !res.crtcs[crtc_index].active {
                return Err(DrmError::ModeNotSuitable(conn.handle));
            }
            if flags.contains(CommitFlags::ASYNC) && commit.kernel_mode.is_some() {
                return Err(DrmError::TestFailed(crtc_handle));
            }
            return Ok(());
        }

        if !commit.enable {
            res.device
                .fd
                .set_crtc(crtc_handle, None, (0, 0), &[], None)
                .map_err(|source| DrmError::Access {
                    errmsg: "disable crtc",
                    source: source.into(),
                })?;
            res.crtcs[crtc_index].active = false;
            res.planes[primary_index].pending_fb = None;
            res.planes[primary_index].queued_fb = None;
            res.planes[primary_index].current_fb = None;
            return Ok(());
        }

        if let Some(lut) = &commit.state.gamma_lut {
            res.device
                .fd
                .set_gamma(crtc_handle, &lut.red, &lut.green, &lut.blue)
                .map_err(|source| DrmError::Access {
                    errmsg: "set gamma ramps",
                    source: source.into(),
                })?;
        }

        let fb = res.planes[primary_index]
            .pending_fb
            .as_ref()
            .map(|fb| fb.handle());

        if let Some(mode) = commit.kernel_mode {
            let fb = fb.ok_or(DrmError::UnsupportedBuffer)?;
            trace!(parent: &res.device.span, "SetCrtc {:?} with {:?}", crtc_handle, mode.name());
            res.device
                .fd
                .set_crtc(crtc_handle, Some(fb), (0, 0), &[conn.handle], Some(mode))
                .map_err(|source| DrmError::Access {
                    errmsg: "set crtc",
                    source: source.into(),
                })?;
            res.crtcs[crtc_index].active = true;
            // SetCrtc completes synchronously; the frame is on screen
            let plane = &mut res.planes[primary_index];
            plane.commit_pending();
            plane.promote_queued();
            if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
                // queue a flip of the same fb to get a timing event
                let _ = ControlDevice::page_flip(&res.device.fd, crtc_handle, fb, PageFlipFlags::EVENT, None);
                res.connectors[commit.conn].pending_flip = true;
            }
            return Ok(());
        }

        if let Some(fb) = fb {
            let mut page_flags = PageFlipFlags::empty();
            if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
                page_flags |= PageFlipFlags::EVENT;
            }
            if flags.contains(CommitFlags::ASYNC) {
                page_flags |= PageFlipFlags::ASYNC;
            }
            trace!(parent: &res.device.span, "PageFlip on {:?}", crtc_handle);
            ControlDevice::page_flip(&res.device.fd, crtc_handle, fb, page_flags, None).map_err(
                |source| DrmError::Access {
                    errmsg: "page flip",
                    source: source.into(),
                },
            )?;
            res.planes[primary_index].commit_pending();
            res.connectors[commit.conn].pending_flip = flags.contains(CommitFlags::PAGE_FLIP_EVENT);
        }

        Ok(())
    }
}
