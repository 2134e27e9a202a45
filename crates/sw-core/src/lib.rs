//! Durable state for swarmyard: configuration, the worktree lifecycle
//! manager, and the session registry.

pub mod config;
pub mod session_registry;
pub mod slug;
pub mod store;
pub mod worktree;
