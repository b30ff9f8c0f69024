use drm::control::{connector, crtc, plane};

/// Errors of the DRM backend
#[derive(Debug, thiserror::Error)]
pub enum DrmError {
    /// The device lacks a capability this backend cannot work without
    #[error("Device is missing the {0} capability")]
    MissingCapability(&'static str),
    /// An ioctl against the device failed
    #[error("Failed to {errmsg}: {source}")]
    Access {
        /// What was attempted
        errmsg: &'static str,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The driver rejected a test commit for this configuration
    #[error("Test commit failed on crtc {0:?}")]
    TestFailed(crtc::Handle),
    /// A commit was attempted while the session is paused
    #[error("The session is paused")]
    DeviceInactive,
    /// A non-blocking commit raced with an in-flight page-flip
    #[error("A page-flip is still pending on connector {0:?}")]
    FlipPending(connector::Handle),
    /// No CRTC could be allocated for the connector
    #[error("No crtc available for connector {0:?}")]
    NoCrtc(connector::Handle),
    /// The connector is leased to a client and off-limits
    #[error("Connector {0:?} is leased")]
    Leased(connector::Handle),
    /// The requested mode is not supported by the connector
    #[error("Mode not suitable for connector {0:?}")]
    ModeNotSuitable(connector::Handle),
    /// No compatible format between display and renderer
    #[error("No common format between plane {0:?} and the renderer")]
    NoSupportedFormat(plane::Handle),
    /// Creating a framebuffer for a buffer failed
    #[error("Failed to create framebuffer: {0}")]
    AddFramebuffer(#[source] std::io::Error),
    /// The buffer cannot be scanned out on this device
    #[error("Buffer is not suitable for scan-out")]
    UnsupportedBuffer,
    /// The device disappeared
    #[error("The DRM device is gone")]
    DeviceGone,
}
