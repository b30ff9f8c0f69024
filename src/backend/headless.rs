//! Headless backend
//!
//! Outputs without any display hardware behind them. Frames are accepted,
//! timed to the nominal refresh rate and immediately reported presented.
//! Useful for tests, CI and compositors rendering for remote consumption.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use calloop::{timer::TimeoutAction, timer::Timer, LoopHandle};
use tracing::{debug, info, info_span};

use crate::backend::allocator::{shm::ShmAllocator, Allocator, FormatSet, Fourcc, Modifier};
use crate::buffer::BufferCaps;
use crate::output::{
    Output, OutputBackend, OutputError, OutputMode, OutputState, PhysicalProperties,
    PictureAspectRatio, PresentEvent, PresentFlags, Subpixel,
};
use crate::utils::env;

use super::{Backend, BackendError, BackendEvents};

const DEFAULT_WIDTH: i32 = 1280;
const DEFAULT_HEIGHT: i32 = 720;
const DEFAULT_REFRESH: i32 = 60_000;

/// A backend driving virtual outputs
#[derive(Debug)]
pub struct HeadlessBackend {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Debug)]
struct Inner {
    handle: LoopHandle<'static, ()>,
    events: BackendEvents,
    outputs: Vec<Output>,
    output_counter: usize,
    started: bool,
    destroyed: bool,
    span: tracing::Span,
}

impl HeadlessBackend {
    /// Create a new headless backend
    ///
    /// The initial output count is taken from `HEADLESS_OUTPUTS` when
    /// [`start`](Backend::start)ed, defaulting to one.
    pub fn new(handle: LoopHandle<'static, ()>) -> HeadlessBackend {
        let span = info_span!("backend_headless");
        info!(parent: &span, "Creating headless backend");
        HeadlessBackend {
            inner: Rc::new(RefCell::new(Inner {
                handle,
                events: BackendEvents::new(),
                outputs: Vec::new(),
                output_counter: 0,
                started: false,
                destroyed: false,
                span,
            })),
        }
    }

    /// Add one more virtual output with the given mode
    pub fn add_output(&self, width: i32, height: i32, refresh: i32) -> Output {
        let (output, events) = {
            let mut inner = self.inner.borrow_mut();
            inner.output_counter += 1;
            let name = format!("HEADLESS-{}", inner.output_counter);
            debug!(parent: &inner.span, name, "New headless output");

            let mode = OutputMode {
                size: (width, height).into(),
                refresh,
                preferred: true,
                aspect_ratio: PictureAspectRatio::None,
            };
            let output = Output::new(
                name.clone(),
                Box::new(HeadlessOutput {
                    inner: Rc::downgrade(&self.inner),
                }),
                PhysicalProperties {
                    size: (0, 0).into(),
                    subpixel: Subpixel::Unknown,
                    make: "Headless".into(),
                    model: "Virtual".into(),
                    serial: String::new(),
                },
                vec![mode],
                Some(mode),
                Fourcc::Xrgb8888,
            );
            inner.outputs.push(output.clone());
            (output, inner.events.clone())
        };
        events.new_output.emit(output.clone());
        output
    }
}

impl Backend for HeadlessBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.started || inner.destroyed {
                return Ok(());
            }
            inner.started = true;
        }

        let count = env::count_env("HEADLESS_OUTPUTS", 1);
        for _ in 0..count {
            self.add_output(DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_REFRESH);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        let (events, outputs) = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            (inner.events.clone(), std::mem::take(&mut inner.outputs))
        };
        for output in outputs {
            output.destroy();
        }
        events.destroy.emit(());
    }

    fn events(&self) -> BackendEvents {
        self.inner.borrow().events.clone()
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DATA_PTR
    }
}

/// Per-output backend state
#[derive(Debug)]
struct HeadlessOutput {
    inner: Weak<RefCell<Inner>>,
}

impl HeadlessOutput {
    fn refresh_interval(output: &Output) -> Duration {
        let refresh = output
            .current_mode()
            .map(|mode| mode.refresh)
            .filter(|&refresh| refresh > 0)
            .unwrap_or(DEFAULT_REFRESH);
        Duration::from_secs_f64(1000.0 / refresh as f64)
    }
}

impl OutputBackend for HeadlessOutput {
    fn test(&mut self, _output: &Output, _state: &OutputState) -> Result<(), OutputError> {
        // anything the common validation allowed is fine here
        Ok(())
    }

    fn commit(&mut self, output: &Output, state: &OutputState) -> Result<(), OutputError> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(OutputError::BackendGone);
        };
        let inner = inner.borrow();

        if state.buffer.is_some() {
            let commit_seq = output.commit_seq().wrapping_add(1);
            let refresh = Self::refresh_interval(output);
            let timer_output = output.clone();
            inner
                .handle
                .insert_source(Timer::from_duration(refresh), move |_, _, _| {
                    timer_output.send_present(&PresentEvent {
                        commit_seq,
                        when: crate::utils::clock::Clock::<crate::utils::clock::Monotonic>::new().now(),
                        refresh: refresh.as_nanos() as u64,
                        flags: PresentFlags::VSYNC,
                    });
                    timer_output.send_frame();
                    TimeoutAction::Drop
                })
                .map_err(|_| OutputError::BackendGone)?;
        }

        Ok(())
    }

    fn schedule_frame(&mut self, output: &Output) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let output = output.clone();
        let _ = inner.borrow().handle.insert_source(
            Timer::from_duration(Duration::ZERO),
            move |_, _, _| {
                output.send_frame();
                TimeoutAction::Drop
            },
        );
    }

    fn primary_formats(&self, caps: BufferCaps) -> FormatSet {
        if !caps.contains(BufferCaps::DATA_PTR) {
            return FormatSet::new();
        }
        [Fourcc::Xrgb8888, Fourcc::Argb8888]
            .into_iter()
            .map(|code| crate::backend::allocator::Format {
                code,
                modifier: Modifier::Linear,
            })
            .collect()
    }

    fn create_allocator(&self) -> Box<dyn Allocator> {
        Box::new(ShmAllocator::new())
    }
}
