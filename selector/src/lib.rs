//! Fair request selection for a storage node.
//!
//! A [`SelectionTree`] holds pending work items grouped by client. Each call to
//! [`SelectionTree::remove_random`] picks one runnable item, giving every client
//! under a sector the same chance regardless of how much it has queued, skipping
//! items in cooldown or excluded by the caller, and caching "nothing before T"
//! bounds so idle subtrees are skipped cheaply.
//!
//! ```text
//! sector (per priority)
//!  ├── client A ── leaf [item, item, ...]
//!  └── client B ── sector
//!                   ├── request 1 ── leaf [...]
//!                   └── request 2 ── leaf [...]
//! ```

mod blocks;
mod cooldown;
mod leaf;
mod sector;

pub mod config;
pub mod error;
pub mod item;
pub mod tree;

pub use config::SelectorConfig;
pub use error::TreeError;
pub use item::{ExclusionCheck, NoExclusion, OwnerSlot, Readiness, Schedulable, Selection, Timestamp};
pub use tree::{NodeId, SelectionTree, SharedTree};
