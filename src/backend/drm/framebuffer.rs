//! Framebuffer objects for scan-out buffers
//!
//! A [`DrmFramebuffer`] wraps a kernel framebuffer created for one
//! [`Buffer`]. It keeps the buffer locked for as long as any plane might
//! scan it out and releases the kernel objects (framebuffer and imported
//! GEM handles) when the last reference goes away.

use std::{fmt, os::unix::io::AsRawFd, rc::Rc};

use drm::buffer::Handle as GemHandle;
use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};
use drm::Device as BasicDevice;
use tracing::trace;

use crate::backend::allocator::{format::get_bpp, format::get_depth, Fourcc, Modifier};
use crate::buffer::{Buffer, BufferLock};

use super::{device::DrmDevice, error::DrmError, DrmDeviceFd};

struct FramebufferInner {
    device: DrmDeviceFd,
    fb: framebuffer::Handle,
    gem_handles: Vec<GemHandle>,
    _lock: BufferLock,
}

impl Drop for FramebufferInner {
    fn drop(&mut self) {
        let _ = self.device.destroy_framebuffer(self.fb);
        let mut closed: Vec<u32> = Vec::with_capacity(self.gem_handles.len());
        for &handle in &self.gem_handles {
            let raw: u32 = handle.into();
            if closed.contains(&raw) {
                continue;
            }
            closed.push(raw);
            gem_close(&self.device, raw);
        }
    }
}

/// Shared handle to a kernel framebuffer backed by a [`Buffer`]
#[derive(Clone)]
pub(crate) struct DrmFramebuffer(Rc<FramebufferInner>);

impl DrmFramebuffer {
    /// Create a framebuffer for the dmabuf view of a buffer
    pub(crate) fn create(device: &DrmDevice, buffer: &Buffer) -> Result<DrmFramebuffer, DrmError> {
        let dmabuf = buffer.dmabuf().ok_or(DrmError::UnsupportedBuffer)?;

        let mut gem_handles = Vec::with_capacity(dmabuf.num_planes());
        for fd in dmabuf.handles() {
            let handle = device
                .fd
                .prime_fd_to_buffer(fd)
                .map_err(|source| DrmError::AddFramebuffer(source.into()))?;
            gem_handles.push(handle);
        }

        let format = dmabuf.format();
        let mut pitches = [0u32; 4];
        let mut offsets = [0u32; 4];
        let mut handles = [None; 4];
        for (index, ((stride, offset), &gem)) in dmabuf
            .strides()
            .zip(dmabuf.offsets())
            .zip(gem_handles.iter())
            .enumerate()
        {
            pitches[index] = stride;
            offsets[index] = offset;
            handles[index] = Some(gem);
        }

        let use_modifiers = device.addfb2_modifiers && format.modifier != Modifier::Invalid;
        let planar = PlanarDmabuf {
            size: (dmabuf.width(), dmabuf.height()),
            format: format.code,
            modifier: use_modifiers.then_some(format.modifier),
            pitches,
            offsets,
            handles,
        };

        let flags = if use_modifiers {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = match device.fd.add_planar_framebuffer(&planar, flags) {
            Ok(fb) => fb,
            Err(err) => {
                // old drivers only know the legacy single-plane call
                if dmabuf.num_planes() == 1 && !use_modifiers {
                    let (depth, bpp) = legacy_depth_bpp(format.code)
                        .ok_or_else(|| DrmError::AddFramebuffer(err.into()))?;
                    add_legacy_framebuffer(device, &planar, depth, bpp).map_err(|source| {
                        for &handle in &gem_handles {
                            gem_close(&device.fd, handle.into());
                        }
                        DrmError::AddFramebuffer(source)
                    })?
                } else {
                    for &handle in &gem_handles {
                        gem_close(&device.fd, handle.into());
                    }
                    return Err(DrmError::AddFramebuffer(err.into()));
                }
            }
        };

        trace!(parent: &device.span, "Created framebuffer {:?} for {:?}", fb, buffer);
        Ok(DrmFramebuffer(Rc::new(FramebufferInner {
            device: device.fd.clone(),
            fb,
            gem_handles,
            _lock: buffer.lock(),
        })))
    }

    /// The kernel framebuffer handle
    pub(crate) fn handle(&self) -> framebuffer::Handle {
        self.0.fb
    }

    /// The buffer behind this framebuffer
    pub(crate) fn buffer(&self) -> Buffer {
        self.0._lock.buffer().clone()
    }
}

impl PartialEq for DrmFramebuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DrmFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmFramebuffer").field("fb", &self.0.fb).finish()
    }
}

struct PlanarDmabuf {
    size: (u32, u32),
    format: Fourcc,
    modifier: Option<Modifier>,
    pitches: [u32; 4],
    offsets: [u32; 4],
    handles: [Option<GemHandle>; 4],
}

impl drm::buffer::PlanarBuffer for PlanarDmabuf {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<Modifier> {
        self.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<GemHandle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

fn legacy_depth_bpp(fourcc: Fourcc) -> Option<(u32, u32)> {
    Some((get_depth(fourcc)? as u32, get_bpp(fourcc)? as u32))
}

fn add_legacy_framebuffer(
    device: &DrmDevice,
    planar: &PlanarDmabuf,
    depth: u32,
    bpp: u32,
) -> Result<framebuffer::Handle, std::io::Error> {
    // the drm crate's legacy add_framebuffer wants a (non-planar) Buffer
    struct Legacy<'a>(&'a PlanarDmabuf);
    impl drm::buffer::Buffer for Legacy<'_> {
        fn size(&self) -> (u32, u32) {
            self.0.size
        }
        fn format(&self) -> Fourcc {
            self.0.format
        }
        fn pitch(&self) -> u32 {
            self.0.pitches[0]
        }
        fn handle(&self) -> GemHandle {
            self.0.handles[0].expect("single-plane buffer")
        }
    }

    device
        .fd
        .add_framebuffer(&Legacy(planar), depth, bpp)
        .map_err(Into::into)
}

fn gem_close(device: &DrmDeviceFd, handle: u32) {
    #[repr(C)]
    struct GemClose {
        handle: u32,
        pad: u32,
    }
    let arg = GemClose { handle, pad: 0 };
    // SAFETY: arg matches struct drm_gem_close
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), DRM_IOCTL_GEM_CLOSE, &arg) };
    if ret != 0 {
        tracing::warn!("Failed to close GEM handle {}: {}", handle, std::io::Error::last_os_error());
    }
}

const DRM_IOCTL_GEM_CLOSE: libc::c_ulong = {
    // _IOW('d', 0x09, struct drm_gem_close)
    (1 << 30) | (8 << 16) | ((b'd' as libc::c_ulong) << 8) | 0x09
};
