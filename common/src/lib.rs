//! Process plumbing shared by the workspace binaries.

pub mod logger;
pub mod time;
