//! Capability interfaces: the narrow contracts the workflow engine and
//! resource allocator consume for every external effect. All I/O flows
//! through these traits; the engine never reaches the OS directly.
//!
//! Each capability is `async_trait`-based, mirroring the `SessionWrapper`
//! trait the teacher codebase uses for its tmux wrapper, generalized here
//! to cover worktrees, the multiplexer, the AI launcher, and the tool
//! server spawner.

pub mod ai_launcher;
pub mod multiplexer;
pub mod tool_server;
pub mod worktree;

pub use ai_launcher::{
    AiLauncherCapability, AiLaunchSpec, AiSession, FakeAiLauncherCapability, ProcessAiLauncher,
};
pub use multiplexer::{
    FakeMultiplexerCapability, MultiplexerCapability, MultiplexerOptions, MultiplexerSession,
    SystemTmuxCapability,
};
pub use tool_server::{
    FakeToolServerHandle, FakeToolServerSpawner, ProcessToolServerSpawner, ToolServerHandle,
    ToolServerSpawner, ToolServerSpec,
};
pub use worktree::{
    FakeWorktreeCapability, GitCliWorktreeCapability, WorktreeCapability, WorktreeHandle,
    WorktreeSpec,
};

use crate::error::ErrorCode;

/// Umbrella error composing every capability's sub-kind so the allocator
/// can match on a single type while each capability still expresses its own
/// `thiserror` enum.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error(transparent)]
    Worktree(#[from] worktree::WorktreeError),

    #[error(transparent)]
    Multiplexer(#[from] multiplexer::MultiplexerError),

    #[error(transparent)]
    AiLauncher(#[from] ai_launcher::AiLauncherError),

    #[error(transparent)]
    ToolServer(#[from] tool_server::ToolServerError),
}

impl ErrorCode for CapabilityError {
    fn code(&self) -> &'static str {
        match self {
            CapabilityError::Worktree(e) => e.code(),
            CapabilityError::Multiplexer(e) => e.code(),
            CapabilityError::AiLauncher(e) => e.code(),
            CapabilityError::ToolServer(e) => e.code(),
        }
    }
}
