//! Cursor handling for outputs
//!
//! The cursor is deliberately not part of the double-buffered
//! [`OutputState`](super::OutputState): cursor changes commit immediately
//! and are not rolled back by a failed output commit, so a refused frame
//! can never strand an enabled cursor plane without a framebuffer.
//!
//! Placement prefers the hardware cursor plane. If the host forbids it
//! (`NO_HARDWARE_CURSORS`), a consumer holds a software-cursor lock, or the
//! plane rejects the buffer, the cursor degrades to a software cursor that
//! the scene composites like any other content.

use tracing::debug;

use crate::buffer::Buffer;
use crate::utils::{env, Logical, Point};

use super::{Output, OutputError};

/// Mutable cursor state of one output
pub struct CursorState {
    buffer: Option<Buffer>,
    hotspot: Point<i32, Logical>,
    position: Point<f64, Logical>,
    enabled: bool,
    hardware: bool,
    software_locks: u32,
    no_hardware_cursors: bool,
}

impl CursorState {
    pub(crate) fn new() -> CursorState {
        CursorState {
            buffer: None,
            hotspot: Default::default(),
            position: Default::default(),
            enabled: false,
            hardware: false,
            software_locks: 0,
            no_hardware_cursors: env::bool_env("NO_HARDWARE_CURSORS"),
        }
    }

    fn hardware_allowed(&self) -> bool {
        !self.no_hardware_cursors && self.software_locks == 0
    }
}

impl std::fmt::Debug for CursorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorState")
            .field("enabled", &self.enabled)
            .field("hardware", &self.hardware)
            .field("software_locks", &self.software_locks)
            .finish()
    }
}

impl Output {
    /// Set the cursor image
    ///
    /// `hotspot` is the point of the buffer, in logical coordinates, that
    /// is placed at the cursor position. Passing `None` hides the cursor.
    ///
    /// Returns `true` if the cursor ended up on the hardware cursor plane;
    /// `false` means the scene must composite it.
    pub fn set_cursor(&self, buffer: Option<&Buffer>, hotspot: Point<i32, Logical>) -> bool {
        let scale = self.scale();
        let try_hardware = {
            let mut inner = self.inner.borrow_mut();
            inner.cursor.buffer = buffer.cloned();
            inner.cursor.hotspot = hotspot;
            inner.cursor.enabled = buffer.is_some();
            inner.cursor.hardware_allowed()
        };

        let was_hardware = self.inner.borrow().cursor.hardware;

        let hardware = if try_hardware {
            let hotspot_physical = hotspot.to_physical(scale);
            let placed = self
                .with_backend(|backend, output| {
                    backend.set_hardware_cursor(output, buffer, hotspot_physical)
                })
                .map(|result| result.is_ok())
                .unwrap_or(false);
            if !placed && buffer.is_some() {
                debug!("Hardware cursor rejected, falling back to software");
            }
            placed
        } else {
            // make sure a previously shown hardware cursor disappears
            if was_hardware {
                let _ = self.with_backend(|backend, output| {
                    backend.set_hardware_cursor(output, None, Default::default())
                });
            }
            false
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.cursor.hardware = hardware && buffer.is_some();
        }

        if !hardware {
            // the scene has to redraw the cursor area
            self.set_needs_frame();
        }

        hardware && buffer.is_some()
    }

    /// Move the cursor to a position in logical output coordinates
    ///
    /// Returns `true` if the hardware plane follows the new position;
    /// `false` when a software cursor needs a repaint instead.
    pub fn move_cursor(&self, x: f64, y: f64) -> bool {
        let (hardware, scale) = {
            let mut inner = self.inner.borrow_mut();
            inner.cursor.position = (x, y).into();
            (inner.cursor.hardware, inner.scale)
        };

        if hardware {
            let position = Point::<f64, Logical>::from((x, y)).to_physical(scale).to_i32_round();
            let moved = self
                .with_backend(|backend, output| backend.move_hardware_cursor(output, position))
                .map(|result: Result<(), OutputError>| result.is_ok())
                .unwrap_or(false);
            if moved {
                return true;
            }
            // the plane refused the position, degrade
            self.inner.borrow_mut().cursor.hardware = false;
        }

        self.set_needs_frame();
        false
    }

    /// Forbid (or re-allow) the hardware cursor plane
    ///
    /// Lock calls nest; the cursor returns to hardware placement when the
    /// last lock is released and the next [`set_cursor`](Output::set_cursor)
    /// happens.
    pub fn lock_software_cursors(&self, lock: bool) {
        let disable_hardware = {
            let mut inner = self.inner.borrow_mut();
            if lock {
                inner.cursor.software_locks += 1;
            } else {
                debug_assert!(inner.cursor.software_locks > 0);
                inner.cursor.software_locks = inner.cursor.software_locks.saturating_sub(1);
            }
            inner.cursor.software_locks > 0 && inner.cursor.hardware
        };

        if disable_hardware {
            let _ = self.with_backend(|backend, output| {
                backend.set_hardware_cursor(output, None, Default::default())
            });
            self.inner.borrow_mut().cursor.hardware = false;
            self.set_needs_frame();
        }
    }

    /// The current cursor buffer, if the cursor is shown
    pub fn cursor_buffer(&self) -> Option<Buffer> {
        let inner = self.inner.borrow();
        inner.cursor.enabled.then(|| inner.cursor.buffer.clone()).flatten()
    }

    /// The cursor position in logical coordinates
    pub fn cursor_position(&self) -> Point<f64, Logical> {
        self.inner.borrow().cursor.position
    }

    /// The cursor hotspot in logical coordinates
    pub fn cursor_hotspot(&self) -> Point<i32, Logical> {
        self.inner.borrow().cursor.hotspot
    }

    /// Returns true while the cursor sits on the hardware plane
    ///
    /// A software cursor (`false` with a buffer set) is drawn by the scene.
    pub fn cursor_is_hardware(&self) -> bool {
        self.inner.borrow().cursor.hardware
    }
}
