//! Mount option maps and option lists.

pub mod list;
pub mod map;

pub use list::{Filter, Opt, OptSource, OptionList, match_options, split_optstr};
pub use map::{MapId, ms, user};
