//! Crate-wide error taxonomy.
//!
//! Each layer (capabilities, store, workflow) defines its own `thiserror`
//! enum with a stable string code via [`ErrorCode::code`]. This module
//! composes them into a single [`EngineError`] so callers that cross layer
//! boundaries (the allocator, the CLI) have one type to match on.

use crate::capabilities::CapabilityError;
use crate::store::StoreError;
use crate::workflow::WorkflowError;

/// Accessor implemented by every error enum in the crate so automation can
/// branch on a stable code instead of parsing `Display` output.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            EngineError::Store(e) => e.code(),
            EngineError::Capability(e) => e.code(),
            EngineError::Workflow(e) => e.code(),
            EngineError::Validation(_) => "VALIDATION_FAILED",
        }
    }
}
