//! # mountkit-common
//!
//! Shared types for the mountkit engine:
//! - Error taxonomy
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{MountError, MountResult};
pub use paths::MountPaths;
