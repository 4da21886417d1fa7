//! Workspace umbrella crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates. Host applications can depend on `bookmarks-workspace` and
//! enable `desktop-shims` to get the reqwest/SQLite bridges wired into
//! `core-service` without listing each crate themselves.

#[cfg(feature = "desktop-shims")]
pub use core_service;
