//! Connector, CRTC and plane model
//!
//! The kernel objects are mirrored into plain arenas indexed by position.
//! All cross references between them are indices, never pointers, so
//! hotplug rescans can rebuild relations without chasing ownership.

use drm::control::{connector, crtc, plane, Device as ControlDevice, Mode, PlaneType};
use tracing::{debug, trace, warn};

use crate::backend::allocator::{Format, FormatSet, Fourcc, Modifier};
use crate::output::{OutputMode, Subpixel, WeakOutput};
use crate::utils::{Raw, Size};

use super::device::DrmDevice;
use super::error::DrmError;
use super::framebuffer::DrmFramebuffer;
use super::modes;

/// The state a connector should be brought (back) into
///
/// Tracked so that session resume and hotplug rescans can re-commit what
/// the compositor asked for last.
#[derive(Debug, Default, Clone)]
pub(crate) struct DesiredState {
    pub enabled: bool,
    pub mode: Option<Mode>,
    pub vrr: bool,
}

/// Mirror of one kernel connector
pub(crate) struct DrmConnector {
    pub handle: connector::Handle,
    pub name: String,
    pub connected: bool,
    pub non_desktop: bool,
    pub vrr_capable: bool,
    /// Bitmask over CRTC arena indices this connector can be driven by
    pub possible_crtcs: u32,
    /// CRTC arena index currently assigned
    pub crtc: Option<usize>,
    /// Lessee id while the connector is handed to a DRM lease client
    pub lease: Option<u32>,
    pub output: Option<WeakOutput>,
    pub modes: Vec<(OutputMode, Mode)>,
    pub physical_size: Size<i32, Raw>,
    pub subpixel: Subpixel,
    pub make: String,
    pub model: String,
    pub serial: String,
    pub desired: DesiredState,
    /// A page-flip was submitted and its event has not arrived yet
    pub pending_flip: bool,
    pub max_bpc_range: Option<(u64, u64)>,
    /// Cursor state, committed immediately and outside the frame machinery
    pub cursor_enabled: bool,
    pub cursor_position: (i32, i32),
    pub cursor_hotspot: (i32, i32),
}

impl std::fmt::Debug for DrmConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmConnector")
            .field("name", &self.name)
            .field("connected", &self.connected)
            .field("crtc", &self.crtc)
            .field("lease", &self.lease)
            .finish()
    }
}

/// Mirror of one kernel CRTC
#[derive(Debug)]
pub(crate) struct DrmCrtc {
    pub handle: crtc::Handle,
    /// Plane arena index of the primary plane
    pub primary_plane: usize,
    /// Plane arena index of the cursor plane, if one exists
    pub cursor_plane: Option<usize>,
    pub gamma_size: u32,
    /// Blob id of the currently applied mode, owned by this process
    pub mode_blob: Option<u64>,
    /// Blob id of the currently applied gamma LUT
    pub gamma_blob: Option<u64>,
    pub lease: Option<u32>,
    pub active: bool,
    pub vrr_enabled: bool,
}

/// Mirror of one kernel plane
#[derive(Debug)]
pub(crate) struct DrmPlane {
    pub handle: plane::Handle,
    pub ty: PlaneType,
    pub formats: FormatSet,
    /// Bitmask over CRTC arena indices
    pub possible_crtcs: u32,
    /// What is on screen right now
    pub current_fb: Option<DrmFramebuffer>,
    /// Submitted, waiting for the flip event
    pub queued_fb: Option<DrmFramebuffer>,
    /// Staged by an in-progress commit
    pub pending_fb: Option<DrmFramebuffer>,
    /// Geometry staged together with `pending_fb` for overlay planes
    pub pending_src: crate::utils::Rectangle<f64, crate::utils::BufferCoords>,
    pub pending_dst: crate::utils::Rectangle<i32, crate::utils::Physical>,
}

impl DrmPlane {
    /// A successful commit moves the staged framebuffer into the queue;
    /// the flip event later promotes it to current.
    pub(crate) fn commit_pending(&mut self) {
        if let Some(fb) = self.pending_fb.take() {
            self.queued_fb = Some(fb);
        }
    }

    pub(crate) fn promote_queued(&mut self) {
        if let Some(fb) = self.queued_fb.take() {
            self.current_fb = Some(fb);
        }
    }
}

/// All KMS objects of one device
pub(crate) struct DrmResources {
    pub device: DrmDevice,
    pub connectors: Vec<DrmConnector>,
    pub crtcs: Vec<DrmCrtc>,
    pub planes: Vec<DrmPlane>,
}

impl std::fmt::Debug for DrmResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmResources")
            .field("device", &self.device)
            .field("connectors", &self.connectors.len())
            .field("crtcs", &self.crtcs.len())
            .field("planes", &self.planes.len())
            .finish()
    }
}

impl DrmResources {
    /// Scan the device into fresh arenas
    pub(crate) fn scan(device: DrmDevice) -> Result<DrmResources, DrmError> {
        let mut resources = DrmResources {
            device,
            connectors: Vec::new(),
            crtcs: Vec::new(),
            planes: Vec::new(),
        };
        resources.scan_planes()?;
        resources.scan_crtcs()?;
        resources.rescan_connectors()?;
        Ok(resources)
    }

    fn scan_planes(&mut self) -> Result<(), DrmError> {
        let resources = self.device.fd.resource_handles().map_err(|source| DrmError::Access {
            errmsg: "load resource handles",
            source: source.into(),
        })?;
        let handles = self.device.fd.plane_handles().map_err(|source| DrmError::Access {
            errmsg: "load plane handles",
            source: source.into(),
        })?;

        for handle in handles {
            let info = self.device.fd.get_plane(handle).map_err(|source| DrmError::Access {
                errmsg: "load plane info",
                source: source.into(),
            })?;
            let ty = self.device.plane_type(handle)?;
            let formats = self.plane_formats(handle, &info, ty)?;

            // express the kernel's crtc filter as a mask over arena indices,
            // which follow the resource list order
            let mut possible_crtcs = 0u32;
            for crtc in resources.filter_crtcs(info.possible_crtcs()) {
                if let Some(position) = resources.crtcs().iter().position(|&handle| handle == crtc) {
                    possible_crtcs |= 1 << position;
                }
            }

            self.planes.push(DrmPlane {
                handle,
                ty,
                formats,
                possible_crtcs,
                current_fb: None,
                queued_fb: None,
                pending_fb: None,
                pending_src: Default::default(),
                pending_dst: Default::default(),
            });
        }
        Ok(())
    }

    fn plane_formats(
        &self,
        handle: plane::Handle,
        info: &plane::Info,
        ty: PlaneType,
    ) -> Result<FormatSet, DrmError> {
        let mut formats = FormatSet::new();
        for code in info.formats().iter().flat_map(|&raw| Fourcc::try_from(raw).ok()) {
            formats.add(Format {
                code,
                modifier: Modifier::Invalid,
            });
        }

        if self.device.addfb2_modifiers {
            if let Some(in_formats) = self.read_in_formats(handle)? {
                formats = formats.union(&in_formats);
            }
        } else if ty == PlaneType::Cursor {
            // without modifier support the cursor is effectively linear
            for format in formats.clone().iter() {
                formats.add(Format {
                    code: format.code,
                    modifier: Modifier::Linear,
                });
            }
        }

        trace!(parent: &self.device.span, "Plane {:?} formats: {:?}", handle, formats);
        Ok(formats)
    }

    fn read_in_formats(&self, handle: plane::Handle) -> Result<Option<FormatSet>, DrmError> {
        let Ok(prop) = self.device.props.plane_prop(handle, "IN_FORMATS") else {
            return Ok(None);
        };
        let prop_info = self.device.fd.get_property(prop).map_err(|source| DrmError::Access {
            errmsg: "query IN_FORMATS property",
            source: source.into(),
        })?;
        let Some(raw_value) = self.device.read_prop(handle, "IN_FORMATS") else {
            return Ok(None);
        };
        let drm::control::property::Value::Blob(blob) = prop_info.value_type().convert_value(raw_value)
        else {
            return Ok(None);
        };
        let data = self
            .device
            .fd
            .get_property_blob(blob)
            .map_err(|source| DrmError::Access {
                errmsg: "read IN_FORMATS blob",
                source: source.into(),
            })?;

        let mut formats = FormatSet::new();
        // the blob has no alignment guarantees, every access reads unaligned
        unsafe {
            let blob_ptr = data.as_ptr() as *const drm_ffi::drm_format_modifier_blob;
            let header = blob_ptr.read_unaligned();

            let formats_ptr = (blob_ptr as *const u8).offset(header.formats_offset as isize) as *const u32;
            let modifiers_ptr = (blob_ptr as *const u8).offset(header.modifiers_offset as isize)
                as *const drm_ffi::drm_format_modifier;

            for i in 0..header.count_modifiers {
                let entry = modifiers_ptr.offset(i as isize).read_unaligned();
                for bit in 0..64u64 {
                    if entry.formats & (1 << bit) == 0 {
                        continue;
                    }
                    let raw_code = formats_ptr.offset((bit + entry.offset as u64) as isize).read_unaligned();
                    if let Ok(code) = Fourcc::try_from(raw_code) {
                        formats.add(Format {
                            code,
                            modifier: Modifier::from(entry.modifier),
                        });
                    }
                }
            }
        }
        Ok(Some(formats))
    }

    fn scan_crtcs(&mut self) -> Result<(), DrmError> {
        let handles = self.device.fd.resource_handles().map_err(|source| DrmError::Access {
            errmsg: "load resource handles",
            source: source.into(),
        })?;

        for (index, &handle) in handles.crtcs().iter().enumerate() {
            let info = self.device.fd.get_crtc(handle).map_err(|source| DrmError::Access {
                errmsg: "load crtc info",
                source: source.into(),
            })?;

            let crtc_bit = 1u32 << index;
            let primary_plane = self
                .planes
                .iter()
                .position(|plane| plane.ty == PlaneType::Primary && plane.possible_crtcs & crtc_bit != 0)
                .ok_or(DrmError::MissingCapability("primary plane per crtc"))?;
            let cursor_plane = self
                .planes
                .iter()
                .position(|plane| plane.ty == PlaneType::Cursor && plane.possible_crtcs & crtc_bit != 0);

            self.crtcs.push(DrmCrtc {
                handle,
                primary_plane,
                cursor_plane,
                gamma_size: info.gamma_length(),
                mode_blob: None,
                gamma_blob: None,
                lease: None,
                active: info.mode().is_some(),
                vrr_enabled: false,
            });
        }
        Ok(())
    }

    /// Refresh connector state after a hotplug event
    ///
    /// Existing entries keep their arena slot (and thereby their CRTC and
    /// lease associations); connectors new to the device are appended.
    /// Returns the indices whose connection status changed.
    pub(crate) fn rescan_connectors(&mut self) -> Result<Vec<usize>, DrmError> {
        let handles = self.device.fd.resource_handles().map_err(|source| DrmError::Access {
            errmsg: "load resource handles",
            source: source.into(),
        })?;

        let mut changed = Vec::new();
        for &handle in handles.connectors() {
            let info = self
                .device
                .fd
                .get_connector(handle, false)
                .map_err(|source| DrmError::Access {
                    errmsg: "load connector info",
                    source: source.into(),
                })?;
            let connected = info.state() == connector::State::Connected;

            if let Some(index) = self.connectors.iter().position(|conn| conn.handle == handle) {
                if self.connectors[index].connected != connected {
                    debug!(
                        parent: &self.device.span,
                        "Connector {} is now {}",
                        self.connectors[index].name,
                        if connected { "connected" } else { "disconnected" }
                    );
                    self.refresh_connector(index, &info)?;
                    changed.push(index);
                }
                continue;
            }

            let index = self.connectors.len();
            self.connectors.push(self.new_connector(handle, &info)?);
            if connected {
                changed.push(index);
            }
        }
        Ok(changed)
    }

    fn new_connector(
        &self,
        handle: connector::Handle,
        info: &connector::Info,
    ) -> Result<DrmConnector, DrmError> {
        let name = format!("{}-{}", interface_prefix(info.interface()), info.interface_id());
        debug!(parent: &self.device.span, "Found connector {}", name);

        let mut conn = DrmConnector {
            handle,
            name,
            connected: false,
            non_desktop: false,
            vrr_capable: false,
            possible_crtcs: 0,
            crtc: None,
            lease: None,
            output: None,
            modes: Vec::new(),
            physical_size: (0, 0).into(),
            subpixel: Subpixel::Unknown,
            make: String::new(),
            model: String::new(),
            serial: String::new(),
            desired: DesiredState::default(),
            pending_flip: false,
            max_bpc_range: None,
            cursor_enabled: false,
            cursor_position: (0, 0),
            cursor_hotspot: (0, 0),
        };
        if info.state() == connector::State::Connected {
            self.fill_connector(&mut conn, info)?;
            conn.connected = true;
        }
        Ok(conn)
    }

    fn refresh_connector(&mut self, index: usize, info: &connector::Info) -> Result<(), DrmError> {
        if info.state() == connector::State::Connected {
            let mut refreshed = self.new_connector(info.handle(), info)?;
            // the slot keeps its associations across the refresh
            if self.connectors[index].crtc.is_some() {
                refreshed.crtc = self.connectors[index].crtc;
            }
            refreshed.lease = self.connectors[index].lease;
            self.connectors[index] = refreshed;
        } else {
            let conn = &mut self.connectors[index];
            conn.connected = false;
            conn.modes.clear();
            conn.output = None;
            conn.desired = DesiredState::default();
        }
        Ok(())
    }

    fn fill_connector(&self, conn: &mut DrmConnector, info: &connector::Info) -> Result<(), DrmError> {
        conn.modes = info
            .modes()
            .iter()
            .map(|mode| (modes::output_mode(mode), *mode))
            .collect();

        let (width_mm, height_mm) = info.size().unwrap_or((0, 0));
        conn.physical_size = (width_mm as i32, height_mm as i32).into();
        conn.subpixel = subpixel(info);

        conn.possible_crtcs = self.possible_crtcs_mask(info);
        conn.vrr_capable = self
            .device
            .read_prop(conn.handle, "vrr_capable")
            .map(|value| value != 0)
            .unwrap_or(false);
        conn.non_desktop = self
            .device
            .read_prop(conn.handle, "non-desktop")
            .map(|value| value != 0)
            .unwrap_or(false);
        conn.max_bpc_range = self.max_bpc_range(conn.handle);

        if let Some((make, model, serial)) = read_edid(&self.device, info) {
            conn.make = make;
            conn.model = model;
            conn.serial = serial;
        }

        // recover an existing connector-crtc association left by the
        // previous KMS client
        if conn.crtc.is_none() {
            if let Some(encoder) = info.current_encoder() {
                if let Ok(encoder_info) = self.device.fd.get_encoder(encoder) {
                    conn.crtc = encoder_info
                        .crtc()
                        .and_then(|crtc| self.crtc_index(crtc));
                }
            }
        }

        Ok(())
    }

    fn max_bpc_range(&self, handle: connector::Handle) -> Option<(u64, u64)> {
        let prop = self.device.props.connector_prop(handle, "max bpc").ok()?;
        let info = self.device.fd.get_property(prop).ok()?;
        if let drm::control::property::ValueType::UnsignedRange(min, max) = info.value_type() {
            Some((min, max))
        } else {
            None
        }
    }

    fn possible_crtcs_mask(&self, info: &connector::Info) -> u32 {
        let resources = match self.device.fd.resource_handles() {
            Ok(resources) => resources,
            Err(err) => {
                warn!(parent: &self.device.span, "Failed to load resources: {}", err);
                return 0;
            }
        };
        let mut mask = 0;
        for &encoder in info.encoders() {
            if let Ok(encoder_info) = self.device.fd.get_encoder(encoder) {
                for crtc in resources.filter_crtcs(encoder_info.possible_crtcs()) {
                    if let Some(index) = self.crtc_index(crtc) {
                        mask |= 1 << index;
                    }
                }
            }
        }
        mask
    }

    pub(crate) fn crtc_index(&self, handle: crtc::Handle) -> Option<usize> {
        self.crtcs.iter().position(|crtc| crtc.handle == handle)
    }

    pub(crate) fn connector_index(&self, handle: connector::Handle) -> Option<usize> {
        self.connectors.iter().position(|conn| conn.handle == handle)
    }

    /// The formats the primary plane of the connector's CRTC accepts
    pub(crate) fn primary_plane_formats(&self, conn_index: usize) -> FormatSet {
        let Some(crtc_index) = self.connectors[conn_index].crtc else {
            return FormatSet::new();
        };
        self.planes[self.crtcs[crtc_index].primary_plane].formats.clone()
    }
}

fn subpixel(info: &connector::Info) -> Subpixel {
    use drm::control::connector::SubPixel;
    match info.subpixel() {
        SubPixel::Unknown => Subpixel::Unknown,
        SubPixel::None => Subpixel::None,
        SubPixel::HorizontalRgb => Subpixel::HorizontalRgb,
        SubPixel::HorizontalBgr => Subpixel::HorizontalBgr,
        SubPixel::VerticalRgb => Subpixel::VerticalRgb,
        SubPixel::VerticalBgr => Subpixel::VerticalBgr,
        _ => Subpixel::Unknown,
    }
}

fn interface_prefix(interface: connector::Interface) -> &'static str {
    use drm::control::connector::Interface;
    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Writeback => "Writeback",
        _ => "Unknown",
    }
}

/// Extract make, model and serial from the connector's EDID blob
fn read_edid(device: &DrmDevice, info: &connector::Info) -> Option<(String, String, String)> {
    let props = device.fd.get_properties(info.handle()).ok()?;
    let (handles, values) = props.as_props_and_values();

    let mut blob = None;
    for (&prop, &value) in handles.iter().zip(values.iter()) {
        let prop_info = device.fd.get_property(prop).ok()?;
        if prop_info.name().to_str() == Ok("EDID") {
            if let drm::control::property::Value::Blob(id) = prop_info.value_type().convert_value(value) {
                blob = Some(id);
            }
            break;
        }
    }
    let data = device.fd.get_property_blob(blob?).ok()?;

    let mut reader = std::io::Cursor::new(data);
    let edid = edid_rs::parse(&mut reader).ok()?;

    let make = {
        let id = edid.product.manufacturer_id;
        format!("{}{}{}", id.0, id.1, id.2)
    };
    let mut model = format!("0x{:04X}", edid.product.product_code);
    let mut serial = format!("0x{:08X}", edid.product.serial_number);
    for descriptor in &edid.descriptors.0 {
        match descriptor {
            edid_rs::MonitorDescriptor::MonitorName(name) => {
                model = name.trim().to_owned();
            }
            edid_rs::MonitorDescriptor::SerialNumber(value) => {
                serial = value.trim().to_owned();
            }
            _ => {}
        }
    }

    Some((make, model, serial))
}
