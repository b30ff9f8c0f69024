//! Output lifecycle against the headless backend

use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use calloop::EventLoop;
use waylight::backend::allocator::{Allocator, Fourcc, Modifier};
use waylight::backend::headless::HeadlessBackend;
use waylight::backend::{Backend, BackendEvents};
use waylight::output::{Output, OutputError, OutputState, PresentEvent};
use waylight::utils::Transform;

fn dispatch_until(
    event_loop: &mut EventLoop<'static, ()>,
    deadline: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > deadline {
            return false;
        }
        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut ())
            .expect("dispatch failed");
    }
    true
}

fn boot_one_output(event_loop: &mut EventLoop<'static, ()>) -> (HeadlessBackend, Output) {
    let mut backend = HeadlessBackend::new(event_loop.handle());
    let outputs: Rc<RefCell<Vec<Output>>> = Rc::new(RefCell::new(Vec::new()));

    let events: BackendEvents = backend.events();
    let sink = outputs.clone();
    let _observer = events.new_output.observe(move |output| {
        sink.borrow_mut().push(output.clone());
    });

    backend.start().expect("headless backend failed to start");

    let output = outputs.borrow().first().cloned().expect("no output announced");
    (backend, output)
}

fn blue_buffer(width: u32, height: u32) -> waylight::buffer::Buffer {
    let buffer = waylight::backend::allocator::shm::ShmAllocator::new()
        .alloc_buffer(width, height, Fourcc::Xrgb8888, &[Modifier::Linear])
        .expect("shm allocation failed");
    buffer
        .with_shm(|shm| {
            let bytes = unsafe { shm.as_mut_slice() };
            for pixel in bytes.chunks_exact_mut(4) {
                pixel.copy_from_slice(&0xff0000ffu32.to_le_bytes());
            }
        })
        .unwrap();
    buffer
}

#[test]
fn single_output_boot() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_one_output(&mut event_loop);

    assert_eq!(output.name(), "HEADLESS-1");
    assert_eq!(output.width(), 1280);
    assert_eq!(output.height(), 720);
    assert!(output.is_enabled());

    let presents: Rc<RefCell<Vec<PresentEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = presents.clone();
    let _observer = output.events().present.observe(move |event| {
        sink.borrow_mut().push(event.clone());
    });

    let mut state = OutputState::new();
    state.set_buffer(&blue_buffer(1280, 720));
    output.commit_state(&state).expect("commit failed");

    assert!(
        dispatch_until(&mut event_loop, Duration::from_secs(1), || {
            !presents.borrow().is_empty()
        }),
        "no present event arrived"
    );
    let present = presents.borrow()[0].clone();
    assert_eq!(present.commit_seq, output.commit_seq());
}

#[test]
fn state_round_trip_after_test() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_one_output(&mut event_loop);

    let mut state = OutputState::new();
    state
        .set_scale(2.0)
        .set_transform(Transform::_180)
        .set_adaptive_sync_enabled(true);

    output.test_state(&state).expect("test refused a valid state");
    output.commit_state(&state).expect("commit failed");

    assert_eq!(output.scale(), 2.0);
    assert_eq!(output.transform(), Transform::_180);
    assert!(output.adaptive_sync_enabled());
    // untouched fields keep their values
    assert_eq!(output.width(), 1280);
    assert_eq!(output.refresh(), 60_000);
}

#[test]
fn commit_seq_is_monotonic() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_one_output(&mut event_loop);

    let mut first = OutputState::new();
    first.set_scale(2.0);
    output.commit_state(&first).unwrap();
    let seq_after_first = output.commit_seq();

    let mut second = OutputState::new();
    second.set_scale(3.0);
    output.commit_state(&second).unwrap();
    assert!(output.commit_seq() > seq_after_first);
}

#[test]
fn mode_switch_requires_reconfiguration() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_one_output(&mut event_loop);

    let seq_before = output.commit_seq();

    let mut switch = OutputState::new();
    switch.set_custom_mode(2560, 1440, 60_000);
    switch.allow_reconfiguration = true;
    switch.set_buffer(&blue_buffer(2560, 1440));
    output.commit_state(&switch).expect("mode switch failed");

    assert_eq!(output.commit_seq(), seq_before + 1);
    assert_eq!(output.width(), 2560);
    assert_eq!(output.height(), 1440);
    assert_eq!(output.refresh(), 60_000);

    // going back without permission to reconfigure is refused
    let mut back = OutputState::new();
    back.set_custom_mode(1280, 720, 60_000);
    assert!(matches!(
        output.commit_state(&back),
        Err(OutputError::InvalidState(_))
    ));
}

#[test]
fn disabled_output_accepts_no_content() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_one_output(&mut event_loop);

    let mut off = OutputState::new();
    off.set_enabled(false);
    output.commit_state(&off).unwrap();
    assert!(!output.is_enabled());

    let mut frame = OutputState::new();
    frame.set_buffer(&blue_buffer(1280, 720));
    assert!(matches!(
        output.commit_state(&frame),
        Err(OutputError::InvalidState(_))
    ));
}

#[test]
fn destroyed_output_refuses_commits() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_one_output(&mut event_loop);

    let destroyed = Rc::new(RefCell::new(false));
    let sink = destroyed.clone();
    let _observer = output.events().destroy.observe(move |_| {
        *sink.borrow_mut() = true;
    });

    output.destroy();
    assert!(*destroyed.borrow());

    let mut state = OutputState::new();
    state.set_scale(2.0);
    assert!(output.commit_state(&state).is_err());
}
