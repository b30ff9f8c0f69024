#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # Waylight: driving displays for wayland compositors
//!
//! This crate is the output stack of a wayland compositor: it owns the path
//! from a retained scene graph down to pixels on a monitor, whether that
//! monitor sits behind the kernel's DRM/KMS interface, behind a window of a
//! host Wayland or X11 server, or nowhere at all (headless).
//!
//! ## Structure of the crate
//!
//! [`backend`] acquires displays and input devices: a session
//! ([`backend::session`]) grants device access, [`backend::drm`] drives real
//! hardware, [`backend::wayland`]/[`backend::x11`]/[`backend::headless`]
//! cover nested and virtual setups, and [`backend::multi`] aggregates
//! several of them. [`backend::autocreate`] picks the right combination for
//! the environment.
//!
//! [`output`] is the compositor-facing handle for one display with its
//! double-buffered, test-then-commit configuration machinery. [`scene`] is
//! a retained node tree that computes visibility and damage per output and
//! decides each frame between direct scan-out and a render pass through the
//! [`backend::renderer`] contracts.
//!
//! ## The event loop
//!
//! Everything is built around [`calloop`]: backends insert their fd sources
//! into the compositor's loop and deliver device events, page-flips and
//! session changes as callbacks on the loop thread. There are no internal
//! threads and no internal locks; all types expect single-threaded use from
//! that loop.
//!
//! ## Configuration
//!
//! Process-wide switches are read from the environment: `BACKENDS`,
//! `WL_OUTPUTS`, `X11_OUTPUTS`, `HEADLESS_OUTPUTS`, `LIBINPUT_NO_DEVICES`,
//! `DRM_DEVICES`, `DRM_NO_ATOMIC`, `DRM_FORCE_LIBLIFTOFF`,
//! `DRM_NO_MODIFIERS`, `RENDERER`, `RENDER_DRM_DEVICE`,
//! `NO_HARDWARE_CURSORS`, `SCENE_DISABLE_DIRECT_SCANOUT`,
//! `SCENE_DISABLE_VISIBILITY` and `SCENE_DEBUG_DAMAGE`.

pub mod backend;
pub mod buffer;
pub mod output;
pub mod scene;
pub mod utils;

pub mod reexports;
