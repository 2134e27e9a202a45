//! Orchestration of agent sessions over git worktrees: the setup pipeline,
//! swarm lifecycle, progress computation and the swarm watch projector.

pub mod events;
pub mod lifecycle;
pub mod pipeline;
pub mod progress;
pub mod projector;
pub mod watch;
