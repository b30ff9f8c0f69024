//! DRM device bring-up and event dispatch

use std::{
    collections::HashMap,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use drm::control::{connector, crtc, plane, property, Device as ControlDevice, Event, PlaneType};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use tracing::{debug, info, info_span, warn};

use crate::utils::{env, Physical, Size};

use super::{error::DrmError, DrmDeviceFd};

const DRM_PRIME_CAP_IMPORT: u64 = 1 << 0;
const DRM_PRIME_CAP_EXPORT: u64 = 1 << 1;

/// Which commit interface the device ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterfaceKind {
    /// Legacy SetCrtc/PageFlip
    Legacy,
    /// Atomic modesetting
    Atomic,
    /// Atomic with the overlay planner deciding plane assignment
    Planner,
}

/// Property name to handle tables for every KMS object
#[derive(Debug, Default)]
pub(crate) struct PropMapping {
    connectors: HashMap<connector::Handle, HashMap<String, property::Handle>>,
    crtcs: HashMap<crtc::Handle, HashMap<String, property::Handle>>,
    planes: HashMap<plane::Handle, HashMap<String, property::Handle>>,
}

impl PropMapping {
    pub(crate) fn connector_prop(
        &self,
        handle: connector::Handle,
        name: &str,
    ) -> Result<property::Handle, DrmError> {
        self.connectors
            .get(&handle)
            .and_then(|props| props.get(name))
            .copied()
            .ok_or(DrmError::Access {
                errmsg: "look up connector property",
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    pub(crate) fn crtc_prop(&self, handle: crtc::Handle, name: &str) -> Result<property::Handle, DrmError> {
        self.crtcs
            .get(&handle)
            .and_then(|props| props.get(name))
            .copied()
            .ok_or(DrmError::Access {
                errmsg: "look up crtc property",
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    pub(crate) fn plane_prop(&self, handle: plane::Handle, name: &str) -> Result<property::Handle, DrmError> {
        self.planes
            .get(&handle)
            .and_then(|props| props.get(name))
            .copied()
            .ok_or(DrmError::Access {
                errmsg: "look up plane property",
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    pub(crate) fn has_plane_prop(&self, handle: plane::Handle, name: &str) -> bool {
        self.plane_prop(handle, name).is_ok()
    }

    pub(crate) fn has_connector_prop(&self, handle: connector::Handle, name: &str) -> bool {
        self.connector_prop(handle, name).is_ok()
    }
}

/// One open DRM device with its negotiated capabilities
pub(crate) struct DrmDevice {
    pub(crate) fd: DrmDeviceFd,
    pub(crate) path: PathBuf,
    pub(crate) iface_kind: InterfaceKind,
    pub(crate) addfb2_modifiers: bool,
    pub(crate) async_page_flip: bool,
    pub(crate) cursor_size: Size<i32, Physical>,
    pub(crate) props: PropMapping,
    pub(crate) span: tracing::Span,
}

impl std::fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDevice")
            .field("path", &self.path)
            .field("iface_kind", &self.iface_kind)
            .field("addfb2_modifiers", &self.addfb2_modifiers)
            .finish()
    }
}

impl DrmDevice {
    /// Open and probe a device
    ///
    /// Asserts the capabilities the pipeline cannot work without and
    /// negotiates the commit interface, honoring `DRM_NO_ATOMIC`,
    /// `DRM_FORCE_LIBLIFTOFF` and `DRM_NO_MODIFIERS`.
    pub(crate) fn new(fd: DrmDeviceFd, path: &Path, is_secondary: bool) -> Result<DrmDevice, DrmError> {
        let span = info_span!("backend_drm", device = ?path);
        let _guard = span.enter();
        info!("Probing DRM device");

        let prime = fd
            .get_driver_capability(DriverCapability::Prime)
            .map_err(|source| DrmError::Access {
                errmsg: "query PRIME capability",
                source: source.into(),
            })?;
        if prime & DRM_PRIME_CAP_IMPORT == 0 {
            return Err(DrmError::MissingCapability("PRIME import"));
        }
        if is_secondary && prime & DRM_PRIME_CAP_EXPORT == 0 {
            return Err(DrmError::MissingCapability("PRIME export"));
        }

        fd.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|_| DrmError::MissingCapability("UNIVERSAL_PLANES"))?;

        if fd
            .get_driver_capability(DriverCapability::CRTCInVBlankEvent)
            .map(|value| value == 0)
            .unwrap_or(true)
        {
            return Err(DrmError::MissingCapability("CRTC_IN_VBLANK_EVENT"));
        }
        if fd
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .map(|value| value == 0)
            .unwrap_or(true)
        {
            return Err(DrmError::MissingCapability("TIMESTAMP_MONOTONIC"));
        }

        let addfb2_modifiers = if env::bool_env("DRM_NO_MODIFIERS") {
            info!("Format modifiers disabled by DRM_NO_MODIFIERS");
            false
        } else {
            matches!(fd.get_driver_capability(DriverCapability::AddFB2Modifiers), Ok(1))
        };

        let force_legacy = env::bool_env("DRM_NO_ATOMIC");
        let force_planner = env::bool_env("DRM_FORCE_LIBLIFTOFF");
        let atomic = !force_legacy && fd.set_client_capability(ClientCapability::Atomic, true).is_ok();
        let iface_kind = if atomic && force_planner {
            info!("Using the overlay planner on top of atomic modesetting");
            InterfaceKind::Planner
        } else if atomic {
            info!("Using atomic modesetting");
            InterfaceKind::Atomic
        } else {
            info!("Atomic modesetting unavailable, falling back to legacy");
            InterfaceKind::Legacy
        };

        let async_page_flip = matches!(fd.get_driver_capability(DriverCapability::ASyncPageFlip), Ok(1));

        let cursor_width = fd
            .get_driver_capability(DriverCapability::CursorWidth)
            .unwrap_or(64);
        let cursor_height = fd
            .get_driver_capability(DriverCapability::CursorHeight)
            .unwrap_or(64);
        debug!("Cursor plane size: {}x{}", cursor_width, cursor_height);

        drop(_guard);
        let mut device = DrmDevice {
            fd,
            path: path.to_path_buf(),
            iface_kind,
            addfb2_modifiers,
            async_page_flip,
            cursor_size: (cursor_width as i32, cursor_height as i32).into(),
            props: PropMapping::default(),
            span,
        };
        device.rescan_properties()?;
        Ok(device)
    }

    pub(crate) fn is_atomic(&self) -> bool {
        self.iface_kind != InterfaceKind::Legacy
    }

    /// Rebuild the property tables for every connector, CRTC and plane
    pub(crate) fn rescan_properties(&mut self) -> Result<(), DrmError> {
        let resources = self.fd.resource_handles().map_err(|source| DrmError::Access {
            errmsg: "load resource handles",
            source: source.into(),
        })?;

        let mut props = PropMapping::default();
        for &handle in resources.connectors() {
            props.connectors.insert(handle, self.object_props(handle)?);
        }
        for &handle in resources.crtcs() {
            props.crtcs.insert(handle, self.object_props(handle)?);
        }
        let planes = self.fd.plane_handles().map_err(|source| DrmError::Access {
            errmsg: "load plane handles",
            source: source.into(),
        })?;
        for handle in planes {
            props.planes.insert(handle, self.object_props(handle)?);
        }
        self.props = props;
        Ok(())
    }

    fn object_props<T>(&self, handle: T) -> Result<HashMap<String, property::Handle>, DrmError>
    where
        T: drm::control::ResourceHandle,
    {
        let set = self.fd.get_properties(handle).map_err(|source| DrmError::Access {
            errmsg: "query object properties",
            source: source.into(),
        })?;
        let (handles, _) = set.as_props_and_values();
        let mut table = HashMap::with_capacity(handles.len());
        for &prop in handles {
            let Ok(info) = self.fd.get_property(prop) else {
                continue;
            };
            if let Ok(name) = info.name().to_str() {
                table.insert(name.to_owned(), prop);
            }
        }
        Ok(table)
    }

    /// Read the current raw value of a property on an object
    pub(crate) fn read_prop<T>(&self, handle: T, name: &str) -> Option<u64>
    where
        T: drm::control::ResourceHandle,
    {
        let set = self.fd.get_properties(handle).ok()?;
        let (handles, values) = set.as_props_and_values();
        for (&prop, &value) in handles.iter().zip(values.iter()) {
            let info = self.fd.get_property(prop).ok()?;
            if info.name().to_str() == Ok(name) {
                return Some(value);
            }
        }
        None
    }

    /// The type of a plane, read from its `type` property
    pub(crate) fn plane_type(&self, handle: plane::Handle) -> Result<PlaneType, DrmError> {
        let value = self.read_prop(handle, "type").ok_or(DrmError::Access {
            errmsg: "read plane type",
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        Ok(match value {
            value if value == PlaneType::Primary as u64 => PlaneType::Primary,
            value if value == PlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        })
    }

    /// Create a property blob from raw bytes, returning its id
    pub(crate) fn create_blob(&self, data: &[u8]) -> Result<u64, DrmError> {
        #[repr(C)]
        struct CreateBlob {
            data: u64,
            length: u32,
            blob_id: u32,
        }

        let mut arg = CreateBlob {
            data: data.as_ptr() as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        // SAFETY: arg matches struct drm_mode_create_blob
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), DRM_IOCTL_MODE_CREATEPROPBLOB, &mut arg) };
        if ret != 0 {
            return Err(DrmError::Access {
                errmsg: "create property blob",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(arg.blob_id as u64)
    }

    /// Destroy a property blob previously created by this process
    pub(crate) fn destroy_blob(&self, blob_id: u64) {
        #[repr(C)]
        struct DestroyBlob {
            blob_id: u32,
        }

        let arg = DestroyBlob {
            blob_id: blob_id as u32,
        };
        // SAFETY: arg matches struct drm_mode_destroy_blob
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), DRM_IOCTL_MODE_DESTROYPROPBLOB, &arg) };
        if ret != 0 {
            warn!(
                parent: &self.span,
                "Failed to destroy property blob {}: {}",
                blob_id,
                std::io::Error::last_os_error()
            );
        }
    }
}

const fn _iowr(ty: libc::c_ulong, nr: libc::c_ulong, size: libc::c_ulong) -> libc::c_ulong {
    (3 << 30) | (size << 16) | (ty << 8) | nr
}

const DRM_IOCTL_MODE_CREATEPROPBLOB: libc::c_ulong = _iowr(b'd' as libc::c_ulong, 0xBD, 16);
const DRM_IOCTL_MODE_DESTROYPROPBLOB: libc::c_ulong = _iowr(b'd' as libc::c_ulong, 0xBE, 4);

/// A page-flip completion on one CRTC
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageFlip {
    pub crtc: crtc::Handle,
    /// Presentation time reported by the kernel
    pub tv_sec: u64,
    pub tv_usec: u64,
    /// Hardware frame counter
    pub sequence: u32,
}

/// Drain pending DRM events from the fd
///
/// Call when the fd polls readable; page-flip completions are handed to the
/// callback, everything else is dropped after logging.
pub(crate) fn dispatch_events(
    device: &DrmDevice,
    mut on_flip: impl FnMut(PageFlip),
) -> Result<(), DrmError> {
    let events = device.fd.receive_events().map_err(|source| DrmError::Access {
        errmsg: "read drm events",
        source: source.into(),
    })?;
    for event in events {
        match event {
            Event::PageFlip(flip) => {
                on_flip(PageFlip {
                    crtc: flip.crtc,
                    tv_sec: flip.duration.as_secs(),
                    tv_usec: flip.duration.subsec_micros() as u64,
                    sequence: flip.frame,
                });
            }
            Event::Vblank(_) => {}
            _ => {
                debug!(parent: &device.span, "Unknown event on drm fd");
            }
        }
    }
    Ok(())
}
