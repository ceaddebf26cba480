//! `cua-computer` – The platform abstraction ("the computer").
//!
//! The core loop never touches OS FFI directly; it talks to a [`Computer`]
//! capability set. Platform backends (macOS, Windows) implement the trait and
//! own their screen-capture, HID-injection, accessibility, browser, and
//! clipboard drivers internally.
//!
//! # Modules
//!
//! - [`adapter`] – [`Computer`][adapter::Computer]: the contract the core
//!   consumes. One long-lived adapter per process, shared by reference; no
//!   component may mutate its internal drivers.
//! - [`loader`] – [`load_computer`][loader::load_computer]: resolves a
//!   concrete adapter by explicit name, then the `CUA_ADAPTER` environment
//!   variable, then the platform default. Unknown names are unrecoverable
//!   errors surfaced to the CLI.
//! - [`sim`] – [`SimComputer`][sim::SimComputer]: a deterministic, scriptable
//!   adapter so the full stack runs in headless tests and CI pipelines
//!   without a real desktop.

pub mod adapter;
pub mod loader;
pub mod sim;

pub use adapter::Computer;
pub use loader::load_computer;
pub use sim::SimComputer;
