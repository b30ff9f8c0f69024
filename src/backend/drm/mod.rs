//! DRM/KMS output pipeline
//!
//! This backend drives real display hardware through the kernel's Direct
//! Rendering Manager. The module is layered as follows:
//!
//! - [`device`] opens the device, asserts required capabilities and
//!   dispatches page-flip events;
//! - [`resources`] models connectors, CRTCs and planes;
//! - [`iface`] is the commit interface with three implementations:
//!   [`atomic`], [`legacy`] and the overlay-[`planner`] assisted atomic
//!   path;
//! - [`solver`] assigns CRTCs to connectors;
//! - [`lease`] hands whole connectors to DRM lease clients;
//! - [`mgpu`] copies frames between GPUs in multi-GPU setups;
//! - [`backend`] ties everything into the [`Backend`](super::Backend) and
//!   [`OutputBackend`](crate::output::OutputBackend) contracts.

use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    sync::Arc,
};

pub(crate) mod atomic;
mod backend;
pub(crate) mod device;
mod error;
pub(crate) mod framebuffer;
pub(crate) mod iface;
pub(crate) mod legacy;
pub mod lease;
pub(crate) mod mgpu;
pub(crate) mod modes;
pub(crate) mod planner;
pub(crate) mod resources;
pub(crate) mod solver;

pub use backend::DrmBackend;
pub use error::DrmError;
pub use lease::DrmLease;

/// Shared handle to an open DRM device node
///
/// Implements the `drm` crate's device traits, so all KMS calls go through
/// values of this type.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<OwnedFd>);

impl DrmDeviceFd {
    /// Wrap an open DRM device fd
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        DrmDeviceFd(Arc::new(fd))
    }
}

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl drm::Device for DrmDeviceFd {}
impl drm::control::Device for DrmDeviceFd {}
