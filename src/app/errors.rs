use crate::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("row not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => AppError::NotFound,
            err => AppError::Store(err),
        }
    }
}
