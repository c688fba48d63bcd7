#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod catalog;
pub mod config;
pub mod error;
pub mod host;
pub mod patch;
pub mod plugin;

pub use error::{Error, Result};
