//! Content-based news recommendation with multi-view news encoding.
//!
//! A news article is encoded by fusing its title, abstract and
//! category views through CNN + additive attention; a user is encoded
//! by attending over the encodings of their clicked history; a
//! candidate's click score is the dot product of the two vectors.
//! Training pairs each click with sampled same-impression negatives
//! under a softmax cross-entropy objective, and evaluation reports
//! macro-averaged AUC, MRR and nDCG per impression.

pub mod algorithms;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod training;
pub mod utils;

pub use config::{Config, EvaluationConfig, ModelConfig, TrainingConfig};
pub use data::{
    BehaviorLog, Candidate, Corpus, History, Impression, InMemoryBehaviorLog, InMemoryCorpus,
    News, NewsId,
};
pub use error::{RecError, Result};
pub use evaluation::{EvalReport, Evaluator, ImpressionMetrics};
pub use model::NewsRecModel;
pub use training::{NegativeSampler, TrainingInstance, TrainingSession};

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber, honouring `RUST_LOG`. Safe
/// to call more than once.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}
