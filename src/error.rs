use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TriggerFlowError>;

/// TriggerFlow 错误类型
#[derive(Debug, Error)]
pub enum TriggerFlowError {
    #[error("get result timed out after {0:?}")]
    ResultTimeout(Duration),
    #[error("get result channel closed: {0}")]
    ResultCancelled(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
