//! Shared configuration library for filedex.
//!
//! Loads [`FiledexConfig`] from a file, inline JSON or the environment and
//! fills every gap with platform defaults, so the binary and embedders agree
//! on where the index lives and which directories are watched.

#![allow(missing_docs)]

pub mod models;
pub mod util;

pub use models::{ConfigSource, FiledexConfig};
