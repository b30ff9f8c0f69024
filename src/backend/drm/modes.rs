//! Kernel mode descriptors and their compositor-facing view

use drm::control::{Mode, ModeTypeFlags};
use tracing::debug;

use crate::output::{OutputMode, PictureAspectRatio};

// picture aspect ratio bits of drm_mode_modeinfo.flags
const PIC_AR_SHIFT: u32 = 19;
const PIC_AR_MASK: u32 = 0xF << PIC_AR_SHIFT;
const PIC_AR_NONE: u32 = 0;
const PIC_AR_4_3: u32 = 1;
const PIC_AR_16_9: u32 = 2;
const PIC_AR_64_27: u32 = 3;
const PIC_AR_256_135: u32 = 4;

/// Millihertz refresh rate of a kernel mode
///
/// Computed from the pixel clock rather than taken from `vrefresh`, which
/// only has integer precision.
pub(crate) fn mode_refresh_mhz(mode: &Mode) -> i32 {
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return 0;
    }

    let mut refresh = (mode.clock() as u64 * 1_000_000 + htotal * vtotal / 2) / (htotal * vtotal);

    let flags = mode.flags().bits();
    if flags & drm::control::ModeFlags::INTERLACE.bits() != 0 {
        refresh *= 2;
    }
    if flags & drm::control::ModeFlags::DBLSCAN.bits() != 0 {
        refresh /= 2;
    }
    if mode.vscan() > 1 {
        refresh /= mode.vscan() as u64;
    }

    refresh as i32
}

/// The aspect-ratio bits of a kernel mode
///
/// The kernel does not document the value range as exhaustive, so
/// unrecognised values are reported as [`PictureAspectRatio::Unknown`]
/// instead of being guessed at.
pub(crate) fn mode_aspect_ratio(mode: &Mode) -> PictureAspectRatio {
    match (mode.flags().bits() & PIC_AR_MASK) >> PIC_AR_SHIFT {
        PIC_AR_NONE => PictureAspectRatio::None,
        PIC_AR_4_3 => PictureAspectRatio::Ratio4_3,
        PIC_AR_16_9 => PictureAspectRatio::Ratio16_9,
        PIC_AR_64_27 => PictureAspectRatio::Ratio64_27,
        PIC_AR_256_135 => PictureAspectRatio::Ratio256_135,
        other => {
            debug!("Unknown aspect-ratio bits in mode flags: {}", other);
            PictureAspectRatio::Unknown
        }
    }
}

/// Compositor-facing view of a kernel mode
pub(crate) fn output_mode(mode: &Mode) -> OutputMode {
    let (width, height) = mode.size();
    OutputMode {
        size: (width as i32, height as i32).into(),
        refresh: mode_refresh_mhz(mode),
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        aspect_ratio: mode_aspect_ratio(mode),
    }
}

/// Find the kernel mode matching a compositor-facing one
pub(crate) fn find_kernel_mode(modes: &[(OutputMode, Mode)], wanted: &OutputMode) -> Option<Mode> {
    modes
        .iter()
        .find(|(mode, _)| mode.size == wanted.size && mode.refresh == wanted.refresh)
        .map(|(_, kernel)| *kernel)
}

/// Pick a kernel mode for a custom width/height/refresh request
///
/// Prefers an advertised mode with the exact resolution (and refresh, when
/// one was given); without one the request fails, as synthesising untested
/// timings would risk driving the display out of range.
pub(crate) fn find_custom_mode(
    modes: &[(OutputMode, Mode)],
    width: i32,
    height: i32,
    refresh: i32,
) -> Option<Mode> {
    let mut candidates = modes
        .iter()
        .filter(|(mode, _)| mode.size.w == width && mode.size.h == height);

    if refresh == 0 {
        return candidates.next().map(|(_, kernel)| *kernel);
    }
    candidates
        .min_by_key(|(mode, _)| (mode.refresh - refresh).abs())
        .map(|(_, kernel)| *kernel)
}
