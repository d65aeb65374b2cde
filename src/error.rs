use thiserror::Error;

use crate::data::NewsId;

#[derive(Debug, Error)]
pub enum RecError {
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("impression {impression_id} has no candidates")]
    EmptyCandidateSet { impression_id: u64 },

    #[error("news {0} not found in corpus")]
    UnknownNews(NewsId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RecError>;
