//! [`Session`] implementation through libseat
//!
//! libseat negotiates device access with seatd or logind, falling back to
//! direct tty handling where neither is present.

use std::{
    cell::RefCell,
    collections::HashMap,
    os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
    rc::{Rc, Weak},
};

use calloop::{
    channel::{self, Channel},
    EventSource, Poll, PostAction, Readiness, Token, TokenFactory,
};
use libseat::{Seat, SeatEvent};
use rustix::{fs::OFlags, io::Errno};
use tracing::{debug, info_span, instrument};

use super::{Session, SessionEvent};

/// Errors of the libseat session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to open the seat
    #[error("Failed to open session: {0}")]
    FailedToOpenSession(Errno),
    /// Failed to open a device
    #[error("Failed to open device: {0}")]
    FailedToOpenDevice(Errno),
    /// Failed to close a device
    #[error("Failed to close device: {0}")]
    FailedToCloseDevice(Errno),
    /// Failed to switch session
    #[error("Failed to change vt: {0}")]
    FailedToChangeVt(Errno),
    /// The seat was closed
    #[error("Session is already closed")]
    SessionLost,
}

#[derive(Debug)]
struct Inner {
    seat: RefCell<Seat>,
    active: std::cell::Cell<bool>,
    devices: RefCell<HashMap<RawFd, libseat::Device>>,
}

/// A session backed by libseat
#[derive(Debug, Clone)]
pub struct LibSeatSession {
    inner: Weak<Inner>,
    seat_name: String,
    span: tracing::Span,
}

/// Event source delivering pause/activate notifications for a [`LibSeatSession`]
#[derive(Debug)]
pub struct LibSeatSessionNotifier {
    inner: Rc<Inner>,
    rx: Channel<SeatEvent>,
    token: Option<Token>,
    span: tracing::Span,
}

impl LibSeatSession {
    /// Open the seat
    ///
    /// Returns the session handle and the notifier to insert into the event
    /// loop.
    pub fn new() -> Result<(LibSeatSession, LibSeatSessionNotifier), Error> {
        let span = info_span!("backend_session", seat = tracing::field::Empty);
        let _guard = span.enter();

        let (tx, rx) = channel::channel();
        let seat = Seat::open(move |_seat, event| {
            debug!(?event, "libseat event");
            let _ = tx.send(event);
        })
        .map_err(|err| Error::FailedToOpenSession(Errno::from_raw_os_error(err.into())))?;

        drop(_guard);

        let mut seat = seat;
        let seat_name = seat.name().to_owned();
        span.record("seat", seat_name.as_str());

        // an enable event may already be queued right after opening
        let _ = seat.dispatch(0);
        let active = matches!(rx.try_recv(), Ok(SeatEvent::Enable));

        let inner = Rc::new(Inner {
            seat: RefCell::new(seat),
            active: std::cell::Cell::new(active),
            devices: RefCell::new(HashMap::new()),
        });

        let session = LibSeatSession {
            inner: Rc::downgrade(&inner),
            seat_name,
            span: span.clone(),
        };
        let notifier = LibSeatSessionNotifier {
            inner,
            rx,
            token: None,
            span,
        };
        Ok((session, notifier))
    }
}

impl Session for LibSeatSession {
    type Error = Error;

    #[instrument(level = "debug", parent = &self.span, skip(self, _flags))]
    fn open(&mut self, path: &Path, _flags: OFlags) -> Result<OwnedFd, Error> {
        let inner = self.inner.upgrade().ok_or(Error::SessionLost)?;

        let device = inner
            .seat
            .borrow_mut()
            .open_device(&path)
            .map_err(|err| Error::FailedToOpenDevice(Errno::from_raw_os_error(err.into())))?;

        let raw_fd = device.as_fd().as_raw_fd();
        inner.devices.borrow_mut().insert(raw_fd, device);

        // SAFETY: libseat::Device does not close the fd on drop
        Ok(unsafe { OwnedFd::from_raw_fd(raw_fd) })
    }

    #[instrument(level = "debug", parent = &self.span, skip(self))]
    fn close(&mut self, fd: OwnedFd) -> Result<(), Error> {
        let inner = self.inner.upgrade().ok_or(Error::SessionLost)?;

        let device = inner.devices.borrow_mut().remove(&fd.as_fd().as_raw_fd());
        match device {
            Some(device) => inner
                .seat
                .borrow_mut()
                .close_device(device)
                .map_err(|err| Error::FailedToCloseDevice(Errno::from_raw_os_error(err.into()))),
            None => Ok(()),
        }
        // fd is closed on drop
    }

    #[instrument(level = "debug", parent = &self.span, skip(self))]
    fn change_vt(&mut self, vt: i32) -> Result<(), Error> {
        let inner = self.inner.upgrade().ok_or(Error::SessionLost)?;
        inner
            .seat
            .borrow_mut()
            .switch_session(vt)
            .map_err(|err| Error::FailedToChangeVt(Errno::from_raw_os_error(err.into())))
    }

    fn is_active(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.active.get())
            .unwrap_or(false)
    }

    fn seat(&self) -> String {
        self.seat_name.clone()
    }
}

impl LibSeatSessionNotifier {
    /// Create another session handle tied to this notifier
    pub fn session(&self) -> LibSeatSession {
        LibSeatSession {
            inner: Rc::downgrade(&self.inner),
            seat_name: self.inner.seat.borrow_mut().name().to_owned(),
            span: self.span.clone(),
        }
    }
}

impl EventSource for LibSeatSessionNotifier {
    type Event = SessionEvent;
    type Metadata = ();
    type Ret = ();
    type Error = Error;

    #[profiling::function]
    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> Result<PostAction, Error>
    where
        F: FnMut(SessionEvent, &mut ()),
    {
        if Some(token) == self.token {
            let _ = self.inner.seat.borrow_mut().dispatch(0);
        }

        let inner = &self.inner;
        self.rx
            .process_events(readiness, token, |event, _| {
                if let channel::Event::Msg(event) = event {
                    match event {
                        SeatEvent::Enable => {
                            inner.active.set(true);
                            callback(SessionEvent::Activate, &mut ());
                        }
                        SeatEvent::Disable => {
                            inner.active.set(false);
                            let _ = inner.seat.borrow_mut().disable();
                            callback(SessionEvent::Pause, &mut ());
                        }
                    }
                }
            })
            .map_err(|_| Error::SessionLost)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.rx.register(poll, factory)?;

        self.token = Some(factory.token());
        let mut seat = self.inner.seat.borrow_mut();
        // SAFETY: the seat fd lives as long as this source stays registered
        unsafe {
            poll.register(
                seat.get_fd().unwrap(),
                calloop::Interest::READ,
                calloop::Mode::Level,
                self.token.unwrap(),
            )
        }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.rx.reregister(poll, factory)?;

        self.token = Some(factory.token());
        let mut seat = self.inner.seat.borrow_mut();
        poll.reregister(
            seat.get_fd().unwrap(),
            calloop::Interest::READ,
            calloop::Mode::Level,
            self.token.unwrap(),
        )
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.rx.unregister(poll)?;

        self.token = None;
        let mut seat = self.inner.seat.borrow_mut();
        poll.unregister(seat.get_fd().unwrap())
    }
}
