//! Core volume-scanning and defragmentation engine for VolShift.
//!
//! This crate has no UI, logging-sink, or CLI dependencies of its own — it
//! exposes the run-defrag entry point (`api::run_defrag`) and the
//! collaborator contracts (`platform::VolumeIo`) an embedding application
//! wires up to a real volume, a progress display, and a log sink.

pub mod api;
pub mod error;
pub mod gap;
pub mod index;
pub mod model;
pub mod move_engine;
pub mod phases;
pub mod platform;
pub mod scanner;
pub mod throttle;
pub mod wildcard;
pub mod zone;
