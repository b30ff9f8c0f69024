//! GPU discovery and hotplug monitoring through udev
//!
//! Enumerates the DRM primary nodes of a seat and watches for GPUs coming,
//! changing (connector hotplug) and going. Setting `DRM_DEVICES` to an
//! explicit list of device paths disables the monitor.

use std::path::{Path, PathBuf};

use calloop::{generic::Generic, Interest, LoopHandle, Mode, PostAction};
use tracing::{debug, info, warn};

use crate::utils::{env, signal::Signal};

use super::BackendError;

/// Events reported for GPUs on the seat
#[derive(Debug, Clone)]
pub enum GpuEvent {
    /// A new GPU appeared
    Added(PathBuf),
    /// Something about the GPU changed, usually a connector hotplug or a
    /// lease coming back
    Changed(PathBuf),
    /// The GPU was removed
    Removed(PathBuf),
}

/// Returns the DRM primary nodes of the given seat, primary GPU first
///
/// `DRM_DEVICES` overrides detection with an explicit, ordered list.
pub fn discover_gpus(seat: &str) -> Result<Vec<PathBuf>, BackendError> {
    if let Some(paths) = env::list_env("DRM_DEVICES") {
        return Ok(paths.into_iter().map(PathBuf::from).collect());
    }

    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut boot_vga = None;
    let mut others = Vec::new();
    for device in enumerator.scan_devices()? {
        let Some(devnode) = device.devnode().map(Path::to_path_buf) else {
            continue;
        };
        if device_seat(&device) != seat {
            continue;
        }
        if is_boot_vga(&device) && boot_vga.is_none() {
            boot_vga = Some(devnode);
        } else {
            others.push(devnode);
        }
    }

    let mut gpus = Vec::new();
    if let Some(primary) = boot_vga {
        info!("Primary GPU: {:?}", primary);
        gpus.push(primary);
    }
    gpus.extend(others);
    Ok(gpus)
}

fn device_seat(device: &udev::Device) -> String {
    device
        .property_value("ID_SEAT")
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_else(|| "seat0".to_owned())
}

fn is_boot_vga(device: &udev::Device) -> bool {
    device
        .parent()
        .and_then(|parent| {
            parent
                .attribute_value("boot_vga")
                .map(|value| value == "1")
        })
        .unwrap_or(false)
}

/// Watch the seat for GPU hotplug
///
/// Returns a signal carrying [`GpuEvent`]s, or `None` if `DRM_DEVICES`
/// pinned the device list (in which case hotplug is intentionally off).
pub fn monitor_gpus(
    seat: &str,
    handle: &LoopHandle<'static, ()>,
) -> Result<Option<Signal<GpuEvent>>, BackendError> {
    if std::env::var("DRM_DEVICES").is_ok() {
        debug!("DRM_DEVICES is set, GPU hotplug monitor disabled");
        return Ok(None);
    }

    let monitor = udev::MonitorBuilder::new()?
        .match_subsystem("drm")?
        .listen()?;

    let signal: Signal<GpuEvent> = Signal::new();
    let seat = seat.to_owned();
    let event_signal = signal.clone();

    let source = Generic::new(monitor, Interest::READ, Mode::Level);
    handle
        .insert_source(source, move |_, monitor, _| {
            // SAFETY: the fd stays valid while the socket is registered
            let monitor = unsafe { monitor.get_mut() };
            for event in monitor.iter() {
                let device = event.device();
                if !device.sysname().to_string_lossy().starts_with("card") {
                    continue;
                }
                if device_seat(&device) != seat {
                    continue;
                }
                let Some(devnode) = device.devnode().map(Path::to_path_buf) else {
                    continue;
                };
                match event.event_type() {
                    udev::EventType::Add => event_signal.emit(GpuEvent::Added(devnode)),
                    udev::EventType::Change => event_signal.emit(GpuEvent::Changed(devnode)),
                    udev::EventType::Remove => event_signal.emit(GpuEvent::Removed(devnode)),
                    other => {
                        warn!("Unhandled udev event type: {:?}", other);
                    }
                }
            }
            Ok(PostAction::Continue)
        })
        .map_err(|err| BackendError::StartFailed(err.to_string()))?;

    Ok(Some(signal))
}
