//! Clients for the collaborators the orchestrator drives: the agent runtime,
//! the issue tracker and the task store, plus the subprocess plumbing they
//! share.

pub mod opencode;
pub mod process;
pub mod raw_event;
pub mod retry;
pub mod runtime;
pub mod tasks;
pub mod tracker;
