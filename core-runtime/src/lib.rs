//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the bookmarks client core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! Other crates depend on this one for their configuration, their logging
//! conventions and the broadcast channel that carries session events (including
//! the logout signal) to the UI.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
