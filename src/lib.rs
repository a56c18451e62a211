//! vpa-graceful-drain: hold VPA-evicted pods until their traffic has drained
//!
//! The controller guards eligible pods with a finalizer and, once deletion is
//! requested, keeps them around until they stop serving traffic or a drain
//! timeout expires.

pub mod controller;
pub mod error;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
