//! conductor — a local orchestrator for a fleet of autonomous AI coding
//! agents, each working a distinct GitHub issue inside its own git
//! worktree and terminal multiplexer session.
//!
//! This crate implements the agent workflow engine: the subsystem that
//! allocates the compound per-agent resource (worktree, multiplexer
//! session, tool-server process, AI process), enforces its lifecycle
//! state machine across parent and review agents, guarantees cleanup on
//! any failure path, and persists a canonical view of all instances and
//! their events to an embedded store. The terminal UI, the GitHub API
//! client, and the tool-server process itself are external collaborators
//! consumed only through the capability interfaces in [`capabilities`].

pub mod allocator;
pub mod capabilities;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod workflow;
