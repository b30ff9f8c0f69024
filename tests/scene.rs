//! Scene graph presentation against the headless backend and the pixman
//! renderer

use std::{cell::RefCell, rc::Rc};

use calloop::EventLoop;
use waylight::backend::allocator::{Allocator, Fourcc, Modifier};
use waylight::backend::headless::HeadlessBackend;
use waylight::backend::renderer::pixman::PixmanRenderer;
use waylight::backend::Backend;
use waylight::buffer::Buffer;
use waylight::output::Output;
use waylight::scene::{Scene, SceneBuffer, SceneOutput};

fn boot_output(event_loop: &mut EventLoop<'static, ()>) -> (HeadlessBackend, Output) {
    let mut backend = HeadlessBackend::new(event_loop.handle());
    let outputs: Rc<RefCell<Vec<Output>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = outputs.clone();
    let _observer = backend.events().new_output.observe(move |output| {
        sink.borrow_mut().push(output.clone());
    });
    backend.start().unwrap();
    let output = outputs.borrow()[0].clone();
    (backend, output)
}

fn solid_buffer(width: u32, height: u32, pixel: u32) -> Buffer {
    let buffer = waylight::backend::allocator::shm::ShmAllocator::new()
        .alloc_buffer(width, height, Fourcc::Xrgb8888, &[Modifier::Linear])
        .unwrap();
    buffer
        .with_shm(|shm| {
            let bytes = unsafe { shm.as_mut_slice() };
            for chunk in bytes.chunks_exact_mut(4) {
                chunk.copy_from_slice(&pixel.to_le_bytes());
            }
        })
        .unwrap();
    buffer
}

fn pixel_at(buffer: &Buffer, x: usize, y: usize) -> u32 {
    buffer
        .with_shm(|shm| {
            let stride = shm.stride() as usize;
            let bytes = unsafe { shm.as_slice() };
            let offset = y * stride + x * 4;
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
        })
        .unwrap()
}

/// Watch which buffers reach the output
fn committed_buffers(output: &Output) -> (Rc<RefCell<Vec<Buffer>>>, waylight::utils::signal::Observer) {
    let log: Rc<RefCell<Vec<Buffer>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let observer = output.events().commit.observe(move |event| {
        if let Some(buffer) = &event.state.buffer {
            sink.borrow_mut().push(buffer.clone());
        }
    });
    (log, observer)
}

#[test]
fn fullscreen_buffer_is_scanned_out_directly() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_output(&mut event_loop);

    let scene = Scene::new();
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    let client_buffer = solid_buffer(1280, 720, 0xff0000ff);
    let _node = SceneBuffer::create(&scene.tree(), Some(&client_buffer));

    let (commits, _observer) = committed_buffers(&output);

    let mut renderer = PixmanRenderer::new();
    assert!(scene_output.commit(&mut renderer).unwrap());

    // the client buffer itself was committed, untouched
    let committed = commits.borrow();
    assert_eq!(committed.len(), 1);
    assert!(committed[0] == client_buffer);
}

#[test]
fn undersized_buffer_is_composited() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_output(&mut event_loop);

    let scene = Scene::new();
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    // one pixel short of the mode width
    let client_buffer = solid_buffer(1279, 720, 0xff0000ff);
    let _node = SceneBuffer::create(&scene.tree(), Some(&client_buffer));

    let (commits, _observer) = committed_buffers(&output);

    let mut renderer = PixmanRenderer::new();
    assert!(scene_output.commit(&mut renderer).unwrap());

    let committed = commits.borrow();
    assert_eq!(committed.len(), 1);
    // a composited back buffer was used, not the client buffer
    assert!(committed[0] != client_buffer);
    assert_eq!(committed[0].width(), 1280);

    // the client content landed in the frame, the uncovered strip is black
    assert_eq!(pixel_at(&committed[0], 100, 100) & 0x00ffffff, 0x0000ff);
    assert_eq!(pixel_at(&committed[0], 1279, 100) & 0x00ffffff, 0x000000);
}

#[test]
fn scanout_and_composition_show_the_same_pixels() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_output(&mut event_loop);

    let scene = Scene::new();
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    let client_buffer = solid_buffer(1280, 720, 0xff2060a0);
    let _node = SceneBuffer::create(&scene.tree(), Some(&client_buffer));

    let (commits, _observer) = committed_buffers(&output);
    let mut renderer = PixmanRenderer::new();

    // first frame goes out by direct scan-out
    assert!(scene_output.commit(&mut renderer).unwrap());
    assert!(commits.borrow()[0] == client_buffer);

    // with scan-out vetoed the same content is composited
    output.lock_attach_render(true);
    scene_output.damage_whole();
    assert!(scene_output.commit(&mut renderer).unwrap());
    output.lock_attach_render(false);

    let committed = commits.borrow();
    assert_eq!(committed.len(), 2);
    assert!(committed[1] != client_buffer);

    for (x, y) in [(0, 0), (640, 360), (1279, 719)] {
        assert_eq!(
            pixel_at(&committed[0], x, y) & 0x00ffffff,
            pixel_at(&committed[1], x, y) & 0x00ffffff,
            "pixel mismatch at {x},{y}"
        );
    }
}

#[test]
fn software_cursor_is_composited() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_output(&mut event_loop);

    let scene = Scene::new();
    let scene_output = SceneOutput::create(&scene, &output).unwrap();

    let client_buffer = solid_buffer(1280, 720, 0xff000000);
    let _node = SceneBuffer::create(&scene.tree(), Some(&client_buffer));

    // the headless backend has no cursor plane, so this degrades to a
    // software cursor
    let cursor = solid_buffer(16, 16, 0xffff0000);
    output.lock_software_cursors(true);
    assert!(!output.set_cursor(Some(&cursor), (0, 0).into()));
    assert!(!output.cursor_is_hardware());
    output.move_cursor(100.0, 100.0);

    let (commits, _observer) = committed_buffers(&output);
    let mut renderer = PixmanRenderer::new();
    assert!(scene_output.commit(&mut renderer).unwrap());

    let committed = commits.borrow();
    let frame = &committed[0];
    // cursor pixels on top of the black content
    assert_eq!(pixel_at(frame, 105, 105) & 0x00ffffff, 0xff0000);
    // outside of the cursor the content shows
    assert_eq!(pixel_at(frame, 400, 400) & 0x00ffffff, 0x000000);
}

#[test]
fn buffer_nodes_track_their_outputs() {
    let mut event_loop = EventLoop::try_new().unwrap();
    let (_backend, output) = boot_output(&mut event_loop);

    let scene = Scene::new();
    let scene_output = SceneOutput::create(&scene, &output).unwrap();
    let index = scene_output.index();

    let buffer = solid_buffer(100, 100, 0xffffffff);
    let node = SceneBuffer::create(&scene.tree(), Some(&buffer));

    assert_eq!(node.active_outputs() & (1 << index), 1 << index);
    assert_eq!(node.primary_output(), Some(index));

    // moving the node off the output leaves it
    node.node().set_position(5000, 5000);
    assert_eq!(node.active_outputs(), 0);
    assert_eq!(node.primary_output(), None);
}
