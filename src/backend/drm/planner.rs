//! Overlay-plane planning on top of the atomic interface
//!
//! The `DRM_FORCE_LIBLIFTOFF` path: before committing, layers are walked
//! top to bottom and offered to unclaimed overlay planes. Every candidate
//! assignment is probed with an atomic test-only commit; layers no plane
//! accepts are reported back as needing composition, together with the
//! formats that would make them scan-out capable next frame.

use drm::control::PlaneType;
use tracing::{debug, trace};

use crate::output::{LayerFeedback, LayerState};

use super::atomic::AtomicIface;
use super::error::DrmError;
use super::framebuffer::DrmFramebuffer;
use super::iface::{CommitFlags, CrtcCommit, DrmInterface};
use super::resources::DrmResources;

/// Atomic commits with overlay-plane assignment
#[derive(Debug, Default)]
pub(crate) struct PlannerIface {
    atomic: AtomicIface,
}

impl PlannerIface {
    /// The underlying atomic interface, for cursor-only commits
    pub(crate) fn atomic_mut(&mut self) -> &mut AtomicIface {
        &mut self.atomic
    }

    /// Offer each layer to the overlay planes of the commit's CRTC
    ///
    /// Claimed planes end up with staged framebuffers; refused layers get
    /// `accepted = false` and format feedback.
    fn assign_layers(
        &mut self,
        res: &mut DrmResources,
        commit: &CrtcCommit<'_>,
        layers: &[LayerState],
        flags: CommitFlags,
    ) -> Result<(), DrmError> {
        let crtc_index = res.connectors[commit.conn]
            .crtc
            .ok_or(DrmError::NoCrtc(res.connectors[commit.conn].handle))?;
        let crtc_bit = 1u32 << crtc_index;

        let mut claimed: Vec<usize> = Vec::new();

        // top-most layers get first pick of the planes
        for layer in layers.iter().rev() {
            let Some(buffer) = &layer.buffer else {
                layer.layer.set_accepted(true);
                continue;
            };
            let Some(format) = buffer.dmabuf().map(|dmabuf| dmabuf.format()) else {
                layer.layer.set_accepted(false);
                continue;
            };

            let mut assigned = false;
            let mut candidate_formats = crate::backend::allocator::FormatSet::new();

            let candidates: Vec<usize> = res
                .planes
                .iter()
                .enumerate()
                .filter(|(index, plane)| {
                    plane.ty == PlaneType::Overlay
                        && plane.possible_crtcs & crtc_bit != 0
                        && !claimed.contains(index)
                })
                .map(|(index, _)| index)
                .collect();

            for plane_index in candidates {
                candidate_formats = candidate_formats.union(&res.planes[plane_index].formats);
                if !res.planes[plane_index].formats.contains(&format) {
                    continue;
                }

                let fb = match DrmFramebuffer::create(&res.device, buffer) {
                    Ok(fb) => fb,
                    Err(err) => {
                        trace!(parent: &res.device.span, "Layer buffer rejected: {}", err);
                        break;
                    }
                };
                {
                    let plane = &mut res.planes[plane_index];
                    plane.pending_fb = Some(fb);
                    plane.pending_src = layer.src;
                    plane.pending_dst = layer.dst;
                }

                let probe = self.atomic.crtc_commit(
                    res,
                    commit,
                    flags | CommitFlags::TEST_ONLY | CommitFlags::ALLOW_MODESET,
                );
                if probe.is_ok() {
                    debug!(
                        parent: &res.device.span,
                        "Layer assigned to overlay plane {:?}",
                        res.planes[plane_index].handle
                    );
                    claimed.push(plane_index);
                    assigned = true;
                    break;
                }
                // the driver said no, unstage and try the next plane
                let plane = &mut res.planes[plane_index];
                plane.pending_fb = None;
                plane.pending_src = Default::default();
                plane.pending_dst = Default::default();
            }

            layer.layer.set_accepted(assigned);
            if !assigned {
                layer.layer.send_feedback(LayerFeedback {
                    formats: candidate_formats.remove_implicit(),
                });
            }
        }

        Ok(())
    }

    fn unstage_overlays(&self, res: &mut DrmResources) {
        for plane in &mut res.planes {
            if plane.ty == PlaneType::Overlay {
                plane.pending_fb = None;
                plane.pending_src = Default::default();
                plane.pending_dst = Default::default();
            }
        }
    }
}

impl DrmInterface for PlannerIface {
    fn init(&mut self, res: &mut DrmResources) -> Result<(), DrmError> {
        debug!(parent: &res.device.span, "Overlay planner enabled");
        self.atomic.init(res)
    }

    fn finish(&mut self, res: &mut DrmResources) {
        self.unstage_overlays(res);
        self.atomic.finish(res);
    }

    fn crtc_commit(
        &mut self,
        res: &mut DrmResources,
        commit: &CrtcCommit<'_>,
        flags: CommitFlags,
    ) -> Result<(), DrmError> {
        let Some(layers) = commit.layers.filter(|layers| !layers.is_empty()) else {
            return self.atomic.crtc_commit(res, commit, flags);
        };
        if flags.contains(CommitFlags::TEST_ONLY) {
            // plane assignment has side effects; tests probe the state
            // without layers offloaded
            return self.atomic.crtc_commit(res, commit, flags);
        }

        self.assign_layers(res, commit, layers, flags)?;
        let result = self.atomic.crtc_commit(res, commit, flags);
        if result.is_err() {
            self.unstage_overlays(res);
        }
        result
    }
}
