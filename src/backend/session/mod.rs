//! Device session abstraction
//!
//! A session grants access to privileged display and input devices and
//! reports when that access is paused and resumed, typically across virtual
//! terminal switches. Unprivileged compositors obtain their DRM and evdev
//! file descriptors exclusively through a [`Session`].

use std::{os::unix::io::OwnedFd, path::Path};

use rustix::fs::OFlags;

#[cfg(feature = "backend_session_libseat")]
pub mod libseat;

/// General session interface
///
/// Provides a way to open and close devices and change the active vt.
pub trait Session {
    /// Error type of the implementation
    type Error: std::error::Error;

    /// Opens a device at the given path with the given flags
    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error>;
    /// Close a previously opened file descriptor
    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error>;

    /// Change the currently active virtual terminal
    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error>;

    /// Check if this session is currently active
    fn is_active(&self) -> bool;
    /// Which seat this session is on
    fn seat(&self) -> String;
}

/// Events generated by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session has been paused; devices are inaccessible until the next
    /// [`SessionEvent::Activate`]
    Pause,
    /// The session is active again
    Activate,
}
