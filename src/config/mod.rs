use serde::{Deserialize, Serialize};

use crate::error::{RecError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub word_embed_dim: usize,
    /// When set, word embeddings are projected down to this working
    /// dimension by a learnable linear layer before the CNN.
    pub reduced_embed_dim: Option<usize>,
    pub pad_token_id: u32,
    pub num_categories: usize,
    pub category_embed_dim: usize,
    pub category_pad_id: u32,
    pub use_sapo: bool,
    pub use_category: bool,
    pub num_cnn_filters: usize,
    pub window_size: usize,
    pub query_dim: usize,
    pub dropout: f32,
    pub max_title_length: usize,
    pub max_sapo_length: usize,
    pub his_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub npratio: usize,
    pub gradient_accumulation_steps: usize,
    pub max_grad_norm: f32,
    pub warmup_ratio: f64,
    pub total_steps: usize,
    pub weight_decay: f32,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub ndcg_k: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 20000,
            word_embed_dim: 300,
            reduced_embed_dim: None,
            pad_token_id: 0,
            num_categories: 20,
            category_embed_dim: 100,
            category_pad_id: 0,
            use_sapo: true,
            use_category: true,
            num_cnn_filters: 256,
            window_size: 3,
            query_dim: 200,
            dropout: 0.2,
            max_title_length: 32,
            max_sapo_length: 64,
            his_length: 50,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            npratio: 4,
            gradient_accumulation_steps: 8,
            max_grad_norm: 1.0,
            warmup_ratio: 0.1,
            total_steps: 10000,
            weight_decay: 0.01,
            seed: 42,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { ndcg_k: vec![5, 10] }
    }
}

impl ModelConfig {
    /// Number of active views per news item for this configuration.
    pub fn num_views(&self) -> usize {
        1 + self.use_sapo as usize + self.use_category as usize
    }

    /// Working word-embedding width after the optional reduction.
    pub fn embed_dim(&self) -> usize {
        self.reduced_embed_dim.unwrap_or(self.word_embed_dim)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0
            || self.word_embed_dim == 0
            || self.num_cnn_filters == 0
            || self.window_size == 0
            || self.query_dim == 0
            || self.max_title_length == 0
            || self.his_length == 0
        {
            return Err(RecError::InvalidConfig(
                "model dimensions must be positive".to_string(),
            ));
        }
        if self.use_sapo && self.max_sapo_length == 0 {
            return Err(RecError::InvalidConfig(
                "max_sapo_length must be positive when use_sapo is set".to_string(),
            ));
        }
        if self.use_category && (self.num_categories == 0 || self.category_embed_dim == 0) {
            return Err(RecError::InvalidConfig(
                "category dimensions must be positive when use_category is set".to_string(),
            ));
        }
        if self.reduced_embed_dim == Some(0) {
            return Err(RecError::InvalidConfig(
                "reduced_embed_dim must be positive when set".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(RecError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("NEWSREC"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
