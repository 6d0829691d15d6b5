// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod config;
pub mod guest;
pub mod host;
pub mod item;
pub mod keep;
pub mod platform;

mod error;

pub use error::Error;
pub use keep::Keep;

/// Result type returned by this crate
pub type Result<T> = core::result::Result<T, Error>;
