//! DRM leases
//!
//! A lease hands a set of connectors, their CRTCs and planes to another DRM
//! client (a VR compositor, typically) as a non-master lessee fd. Leased
//! objects are off-limits to this library until the lease ends.

use std::{collections::HashSet, num::NonZeroU32, os::unix::io::OwnedFd};

use drm::control::{Device as ControlDevice, RawResourceHandle};
use rustix::fs::OFlags;
use tracing::{debug, info, warn};

use super::{error::DrmError, resources::DrmResources, DrmDeviceFd};

/// An active DRM lease
///
/// Obtained from [`DrmBackend::lease_outputs`](super::DrmBackend::lease_outputs);
/// dropping the value revokes the lease.
#[derive(Debug)]
pub struct DrmLease {
    device: DrmDeviceFd,
    lessee_id: NonZeroU32,
    fd: Option<OwnedFd>,
    connectors: HashSet<u32>,
    revoked: bool,
}

impl DrmLease {
    /// The lessee id assigned by the kernel
    pub fn lessee_id(&self) -> u32 {
        self.lessee_id.get()
    }

    /// Take the lease fd to pass to the lessee
    ///
    /// The fd is a non-master duplicate restricted to the leased objects;
    /// it can only be taken once.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Revoke the lease
    ///
    /// Also happens automatically on drop.
    pub fn revoke(&mut self) {
        if self.revoked {
            return;
        }
        self.revoked = true;
        debug!("Revoking lease {}", self.lessee_id);
        if let Err(err) = self.device.revoke_lease(self.lessee_id) {
            warn!("Failed to revoke lease {}: {}", self.lessee_id, err);
        }
    }

    pub(crate) fn leased_connector_ids(&self) -> &HashSet<u32> {
        &self.connectors
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.revoked
    }
}

impl Drop for DrmLease {
    fn drop(&mut self) {
        self.revoke();
    }
}

/// Package the given connectors (with their CRTCs and planes) into a lease
///
/// Every connector must currently hold a CRTC; the CRTC's primary plane and
/// cursor plane (if any) ride along.
pub(crate) fn create_lease(res: &mut DrmResources, conn_indices: &[usize]) -> Result<DrmLease, DrmError> {
    let mut objects: Vec<RawResourceHandle> = Vec::new();
    let mut connector_ids = HashSet::new();

    for &conn_index in conn_indices {
        let conn = &res.connectors[conn_index];
        if conn.lease.is_some() {
            return Err(DrmError::Leased(conn.handle));
        }
        let crtc_index = conn.crtc.ok_or(DrmError::NoCrtc(conn.handle))?;
        let crtc = &res.crtcs[crtc_index];

        objects.push(conn.handle.into());
        objects.push(crtc.handle.into());
        objects.push(res.planes[crtc.primary_plane].handle.into());
        if let Some(cursor_index) = crtc.cursor_plane {
            objects.push(res.planes[cursor_index].handle.into());
        }
        connector_ids.insert(u32::from(RawResourceHandle::from(conn.handle)));
    }

    let (lessee_id, fd) = res
        .device
        .fd
        .create_lease(&objects, OFlags::CLOEXEC.bits())
        .map_err(|source| DrmError::Access {
            errmsg: "create lease",
            source: source.into(),
        })?;

    info!(parent: &res.device.span, "Created lease {} over {} objects", lessee_id, objects.len());

    for &conn_index in conn_indices {
        let crtc_index = res.connectors[conn_index].crtc.expect("checked above");
        res.connectors[conn_index].lease = Some(lessee_id.get());
        res.crtcs[crtc_index].lease = Some(lessee_id.get());
    }

    Ok(DrmLease {
        device: res.device.fd.clone(),
        lessee_id,
        fd: Some(fd),
        connectors: connector_ids,
        revoked: false,
    })
}

/// Drop lease markers for a lessee that is gone
///
/// Called when the kernel reports a lease change; dangling markers would
/// keep connectors off-limits forever.
pub(crate) fn clear_lease(res: &mut DrmResources, lessee_id: u32) {
    for conn in &mut res.connectors {
        if conn.lease == Some(lessee_id) {
            conn.lease = None;
        }
    }
    for crtc in &mut res.crtcs {
        if crtc.lease == Some(lessee_id) {
            crtc.lease = None;
        }
    }
}

/// Query the kernel for currently active lessees
pub(crate) fn active_lessees(device: &DrmDeviceFd) -> Result<Vec<u32>, DrmError> {
    // DRM_IOCTL_MODE_LIST_LESSEES
    #[repr(C)]
    struct ListLessees {
        count_lessees: u64,
        pad: u64,
        lessees_ptr: u64,
    }

    use std::os::unix::io::AsRawFd;

    let mut arg = ListLessees {
        count_lessees: 0,
        pad: 0,
        lessees_ptr: 0,
    };
    // SAFETY: arg matches struct drm_mode_list_lessees
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), DRM_IOCTL_MODE_LIST_LESSEES, &mut arg) };
    if ret != 0 {
        return Err(DrmError::Access {
            errmsg: "list lessees",
            source: std::io::Error::last_os_error(),
        });
    }

    let mut ids = vec![0u32; arg.count_lessees as usize];
    if !ids.is_empty() {
        arg.lessees_ptr = ids.as_mut_ptr() as u64;
        // SAFETY: ids has room for count_lessees entries
        let ret = unsafe { libc::ioctl(device.as_raw_fd(), DRM_IOCTL_MODE_LIST_LESSEES, &mut arg) };
        if ret != 0 {
            return Err(DrmError::Access {
                errmsg: "list lessees",
                source: std::io::Error::last_os_error(),
            });
        }
        ids.truncate(arg.count_lessees as usize);
    }
    Ok(ids)
}

const DRM_IOCTL_MODE_LIST_LESSEES: libc::c_ulong = {
    // _IOWR('d', 0xC1, struct drm_mode_list_lessees)
    (3 << 30) | (24 << 16) | ((b'd' as libc::c_ulong) << 8) | 0xC1
};
