use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Common result alias for cursor operations.
pub type CursorResult<T> = Result<T, CursorError>;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cursor contents `{0}` are not a block height")]
    Corrupt(String),
}

/// Durable pointer to the last fully processed block height.
///
/// `save` must not return before the height is durable; callers advance their
/// in-memory position only after it succeeds.
#[async_trait]
pub trait BlockCursor: Send + Sync {
    async fn load(&self) -> CursorResult<Option<u64>>;
    async fn save(&self, height: u64) -> CursorResult<()>;
}

#[async_trait]
impl<T: BlockCursor + ?Sized> BlockCursor for Arc<T> {
    async fn load(&self) -> CursorResult<Option<u64>> {
        (**self).load().await
    }

    async fn save(&self, height: u64) -> CursorResult<()> {
        (**self).save(height).await
    }
}
