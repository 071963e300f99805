//! # mountkit
//!
//! A mount context engine for Linux: describe one mount or unmount
//! operation, let the engine complete it from the filesystem tables, run
//! the kernel call or a `mount.<type>` helper, keep the userspace mount
//! table up to date and turn the outcome into a mount(8)-style exit code.
//!
//! ## Usage
//!
//! ```no_run
//! use mountkit::context::Context;
//!
//! # fn example() -> mountkit_common::MountResult<()> {
//! let mut cxt = Context::new();
//! cxt.set_source(Some("/dev/sdb1"));
//! cxt.set_target(Some("/mnt/data"));
//! cxt.set_options(Some("noatime"))?;
//!
//! let result = cxt.mount();
//! let excode = cxt.get_excode(&result);
//! if let Some(message) = excode.message {
//!     eprintln!("mount: {message}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod events;
pub mod exec;
pub mod identity;
pub mod namespace;
pub mod options;
pub mod tab;
pub mod update;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use context::{Action, Context};
