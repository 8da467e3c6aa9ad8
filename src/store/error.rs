use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("insert failed: {0}")]
    InsertFailed(String),
    #[error("update failed: {0}")]
    UpdateFailed(String),
    #[error("delete failed: {0}")]
    DeleteFailed(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            StoreError::InsertFailed(_) => "DATABASE_INSERT_FAILED",
            StoreError::UpdateFailed(_) => "DATABASE_UPDATE_FAILED",
            StoreError::DeleteFailed(_) => "DATABASE_DELETE_FAILED",
            StoreError::OperationFailed(_) => "DATABASE_OPERATION_FAILED",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::OperationFailed(err.to_string())
    }
}
