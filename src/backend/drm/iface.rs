//! The commit interface between connector state and the kernel
//!
//! Three implementations exist: [`legacy`](super::legacy) for pre-atomic
//! kernels, [`atomic`](super::atomic) for atomic modesetting, and
//! [`planner`](super::planner), which drives the atomic interface but lets
//! an overlay-plane solver assign layers to hardware planes first.

use drm::control::Mode;

use crate::output::{LayerState, OutputState};

use super::atomic::AtomicIface;
use super::error::DrmError;
use super::legacy::LegacyIface;
use super::planner::PlannerIface;
use super::resources::DrmResources;

bitflags::bitflags! {
    /// Flags of one CRTC commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CommitFlags: u32 {
        /// Request a page-flip completion event
        const PAGE_FLIP_EVENT = 1 << 0;
        /// Flip immediately instead of waiting for vblank (tearing)
        const ASYNC = 1 << 1;
        /// Only check the configuration, never touch the hardware
        const TEST_ONLY = 1 << 2;
        /// Do not block for the commit to be applied
        const NONBLOCK = 1 << 3;
        /// The commit may perform a full modeset
        const ALLOW_MODESET = 1 << 4;
    }
}

/// Everything one CRTC commit operates on
pub(crate) struct CrtcCommit<'a> {
    /// Connector arena index
    pub conn: usize,
    /// The validated pending state
    pub state: &'a OutputState,
    /// Kernel mode resolved from `state.mode`, set iff this is a modeset
    pub kernel_mode: Option<Mode>,
    /// Whether the connector should be enabled after this commit
    pub enable: bool,
    /// Layer states from `state.layers`, in bottom-to-top order
    pub layers: Option<&'a [LayerState]>,
}

/// Uniform commit interface of the three KMS paths
pub(crate) trait DrmInterface {
    /// One-time per-device setup
    fn init(&mut self, res: &mut DrmResources) -> Result<(), DrmError>;

    /// Per-device teardown; must leave no blobs behind
    fn finish(&mut self, res: &mut DrmResources);

    /// Apply or test a per-connector output state on its current CRTC
    ///
    /// Framebuffers for the commit are staged in the planes' `pending_fb`
    /// slots beforehand; on success (and not `TEST_ONLY`) the
    /// implementation moves them to `queued_fb`.
    fn crtc_commit(
        &mut self,
        res: &mut DrmResources,
        commit: &CrtcCommit<'_>,
        flags: CommitFlags,
    ) -> Result<(), DrmError>;
}

/// Dispatch over the concrete interface implementations
pub(crate) enum DrmIface {
    Legacy(LegacyIface),
    Atomic(AtomicIface),
    Planner(PlannerIface),
}

impl DrmIface {
    pub(crate) fn as_dyn(&mut self) -> &mut dyn DrmInterface {
        match self {
            DrmIface::Legacy(iface) => iface,
            DrmIface::Atomic(iface) => iface,
            DrmIface::Planner(iface) => iface,
        }
    }
}

impl std::fmt::Debug for DrmIface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrmIface::Legacy(_) => f.write_str("DrmIface::Legacy"),
            DrmIface::Atomic(_) => f.write_str("DrmIface::Atomic"),
            DrmIface::Planner(_) => f.write_str("DrmIface::Planner"),
        }
    }
}
