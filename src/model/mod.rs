pub mod attention;
pub mod layers;
pub mod news_encoder;
pub mod user_encoder;

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::algorithms::Optimizer;
use crate::config::ModelConfig;
use crate::data::{Corpus, History, News, NewsId};
use crate::error::{RecError, Result};
use crate::utils;

pub use news_encoder::{NewsEncoder, NewsEncoderGrads};
pub use user_encoder::{UserEncoder, UserEncoderGrads};

/// The full click-prediction model: one shared news encoder applied to
/// history items and candidates alike, a user encoder pooling history
/// vectors, and a dot-product scorer.
#[derive(Debug, Clone)]
pub struct NewsRecModel {
    pub news_encoder: NewsEncoder,
    pub user_encoder: UserEncoder,
}

#[derive(Debug, Clone)]
pub struct ModelGradients {
    pub news: NewsEncoderGrads,
    pub user: UserEncoderGrads,
}

impl NewsRecModel {
    pub fn new(config: &ModelConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let news_encoder = NewsEncoder::new(config, &mut rng)?;
        let user_encoder =
            UserEncoder::new(&mut rng, config.query_dim, config.num_cnn_filters);
        Ok(Self {
            news_encoder,
            user_encoder,
        })
    }

    /// Build with pretrained word/category embedding tables. Tables
    /// remain trainable.
    pub fn with_pretrained_embeddings(
        config: &ModelConfig,
        word_embedding: Array2<f32>,
        category_embedding: Option<Array2<f32>>,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let news_encoder =
            NewsEncoder::with_tables(config, word_embedding, category_embedding, &mut rng)?;
        let user_encoder =
            UserEncoder::new(&mut rng, config.query_dim, config.num_cnn_filters);
        Ok(Self {
            news_encoder,
            user_encoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        self.news_encoder.config()
    }

    pub fn news_dim(&self) -> usize {
        self.news_encoder.output_dim()
    }

    /// Inference-mode news encoding (dropout off, deterministic).
    pub fn encode_news(&self, news: &News) -> Result<Array1<f32>> {
        self.news_encoder.encode(news)
    }

    /// Resolve a history's ids through the corpus and encode each real
    /// click; padding slots become zero rows with the mask off.
    pub fn encode_history(&self, corpus: &dyn Corpus, history: &History) -> Result<(Array2<f32>, Vec<bool>)> {
        let his_length = self.config().his_length;
        if history.len() != his_length {
            return Err(RecError::ShapeMismatch {
                what: "history length",
                expected: his_length,
                actual: history.len(),
            });
        }

        let mask = history.mask();
        let mut vectors = Array2::zeros((his_length, self.news_dim()));
        for (i, &id) in history.ids().iter().enumerate() {
            if !mask[i] {
                continue;
            }
            let news = corpus.require(id)?;
            let vector = self.encode_news(news)?;
            vectors.row_mut(i).assign(&vector);
        }
        Ok((vectors, mask))
    }

    /// Inference-mode user encoding over pre-encoded history vectors.
    pub fn encode_user(&self, history_vectors: &Array2<f32>, mask: &[bool]) -> Result<Array1<f32>> {
        let his_length = self.config().his_length;
        if history_vectors.nrows() != his_length {
            return Err(RecError::ShapeMismatch {
                what: "history vector rows",
                expected: his_length,
                actual: history_vectors.nrows(),
            });
        }
        Ok(self.user_encoder.encode(history_vectors.view(), mask))
    }

    /// Raw click logit: the dot product of user and news vectors. No
    /// learned parameters live here; discrimination comes entirely
    /// from the encoders.
    pub fn score(user_vector: ArrayView1<f32>, news_vector: ArrayView1<f32>) -> f32 {
        user_vector.dot(&news_vector)
    }

    /// Serving-time probability; training stays on raw logits.
    pub fn click_probability(user_vector: ArrayView1<f32>, news_vector: ArrayView1<f32>) -> f32 {
        utils::sigmoid(Self::score(user_vector, news_vector))
    }

    pub fn zero_grads(&self) -> ModelGradients {
        ModelGradients {
            news: self.news_encoder.zero_grads(),
            user: self.user_encoder.zero_grads(),
        }
    }

    /// One training instance: `candidate_ids[0]` is the clicked
    /// candidate, the rest are sampled negatives. Returns the
    /// (npratio+1)-way softmax cross-entropy loss and its gradient
    /// w.r.t. every model parameter. Dropout is active; `rng` drives
    /// it, so a fixed seed reproduces the loss exactly.
    pub fn training_loss(
        &self,
        corpus: &dyn Corpus,
        history: &History,
        candidate_ids: &[NewsId],
        rng: &mut StdRng,
    ) -> Result<(f32, ModelGradients)> {
        if candidate_ids.is_empty() {
            return Err(RecError::ShapeMismatch {
                what: "training candidate set",
                expected: 1,
                actual: 0,
            });
        }
        let his_length = self.config().his_length;
        if history.len() != his_length {
            return Err(RecError::ShapeMismatch {
                what: "history length",
                expected: his_length,
                actual: history.len(),
            });
        }

        // Encode history (training mode: dropout on)
        let mask = history.mask();
        let mut history_vectors = Array2::zeros((his_length, self.news_dim()));
        let mut history_caches = Vec::with_capacity(his_length);
        for (i, &id) in history.ids().iter().enumerate() {
            if !mask[i] {
                history_caches.push(None);
                continue;
            }
            let news = corpus.require(id)?;
            let (vector, cache) = self.news_encoder.forward(news, Some(rng))?;
            history_vectors.row_mut(i).assign(&vector);
            history_caches.push(Some(cache));
        }

        let (user_vector, user_cache) =
            self.user_encoder.forward(history_vectors.view(), &mask);

        // Encode candidates, positive first
        let mut candidate_vectors = Vec::with_capacity(candidate_ids.len());
        let mut candidate_caches = Vec::with_capacity(candidate_ids.len());
        for &id in candidate_ids {
            let news = corpus.require(id)?;
            let (vector, cache) = self.news_encoder.forward(news, Some(rng))?;
            candidate_vectors.push(vector);
            candidate_caches.push(cache);
        }

        let logits: Vec<f32> = candidate_vectors
            .iter()
            .map(|v| Self::score(user_vector.view(), v.view()))
            .collect();
        let probs = utils::softmax(&logits);
        let loss = -probs[0].max(1e-12).ln();

        // d loss / d logit_k = p_k - [k == 0]
        let mut grads = self.zero_grads();
        let mut d_user = Array1::zeros(user_vector.len());
        for (k, vector) in candidate_vectors.iter().enumerate() {
            let d_logit = probs[k] - if k == 0 { 1.0 } else { 0.0 };
            d_user.scaled_add(d_logit, vector);
            let d_candidate = user_vector.mapv(|x| x * d_logit);
            self.news_encoder
                .backward(&candidate_caches[k], d_candidate.view(), &mut grads.news);
        }

        let d_history =
            self.user_encoder
                .backward(&user_cache, d_user.view(), &mut grads.user);
        for (i, cache) in history_caches.iter().enumerate() {
            if let Some(cache) = cache {
                self.news_encoder
                    .backward(cache, d_history.row(i), &mut grads.news);
            }
        }

        Ok((loss, grads))
    }

    /// One optimizer step over accumulated gradients. Decayed tensors
    /// exclude biases and embedding rows.
    pub fn apply_update(
        &mut self,
        optimizer: &mut dyn Optimizer,
        grads: &ModelGradients,
        weight_decay: f32,
    ) {
        let news = &mut self.news_encoder;

        for (&row, grad) in &grads.news.word_embedding {
            let mut param = news.word_embedding.row_mut(row);
            let slice = param.as_slice_mut().expect("contiguous embedding row");
            optimizer.update(&format!("news.word_embedding.{row}"), slice, grad_slice(grad));
        }

        if let (Some(reduce), Some(grad)) = (news.reduce.as_mut(), grads.news.reduce.as_ref()) {
            update_decayed(optimizer, "news.reduce.weight", &mut reduce.weight, &grad.weight, weight_decay);
            update_plain(optimizer, "news.reduce.bias", &mut reduce.bias, &grad.bias);
        }

        update_decayed_slice(
            optimizer,
            "news.title_conv.kernel",
            news.title_conv.kernel.as_slice_mut().expect("contiguous kernel"),
            grads.news.title_conv.kernel.as_slice().expect("contiguous kernel grad"),
            weight_decay,
        );
        update_plain(optimizer, "news.title_conv.bias", &mut news.title_conv.bias, &grads.news.title_conv.bias);
        update_attention(optimizer, "news.title_attn", &mut news.title_attn, &grads.news.title_attn, weight_decay);

        if let (Some(conv), Some(grad)) = (news.sapo_conv.as_mut(), grads.news.sapo_conv.as_ref()) {
            update_decayed_slice(
                optimizer,
                "news.sapo_conv.kernel",
                conv.kernel.as_slice_mut().expect("contiguous kernel"),
                grad.kernel.as_slice().expect("contiguous kernel grad"),
                weight_decay,
            );
            update_plain(optimizer, "news.sapo_conv.bias", &mut conv.bias, &grad.bias);
        }
        if let (Some(attn), Some(grad)) = (news.sapo_attn.as_mut(), grads.news.sapo_attn.as_ref()) {
            update_attention(optimizer, "news.sapo_attn", attn, grad, weight_decay);
        }

        if let Some(table) = news.category_embedding.as_mut() {
            for (&row, grad) in &grads.news.category_embedding {
                let mut param = table.row_mut(row);
                let slice = param.as_slice_mut().expect("contiguous embedding row");
                optimizer.update(&format!("news.category_embedding.{row}"), slice, grad_slice(grad));
            }
        }
        if let (Some(dense), Some(grad)) =
            (news.category_dense.as_mut(), grads.news.category_dense.as_ref())
        {
            update_decayed(optimizer, "news.category_dense.weight", &mut dense.weight, &grad.weight, weight_decay);
            update_plain(optimizer, "news.category_dense.bias", &mut dense.bias, &grad.bias);
        }

        if let (Some(attn), Some(grad)) = (news.view_attn.as_mut(), grads.news.view_attn.as_ref()) {
            update_attention(optimizer, "news.view_attn", attn, grad, weight_decay);
        }

        update_attention(
            optimizer,
            "user.attn",
            &mut self.user_encoder.attn,
            &grads.user,
            weight_decay,
        );
    }
}

fn grad_slice(grad: &Array1<f32>) -> &[f32] {
    grad.as_slice().expect("contiguous gradient")
}

fn update_plain(
    optimizer: &mut dyn Optimizer,
    key: &str,
    param: &mut Array1<f32>,
    grad: &Array1<f32>,
) {
    optimizer.update(
        key,
        param.as_slice_mut().expect("contiguous parameter"),
        grad_slice(grad),
    );
}

fn update_decayed(
    optimizer: &mut dyn Optimizer,
    key: &str,
    param: &mut Array2<f32>,
    grad: &Array2<f32>,
    weight_decay: f32,
) {
    update_decayed_slice(
        optimizer,
        key,
        param.as_slice_mut().expect("contiguous parameter"),
        grad.as_slice().expect("contiguous gradient"),
        weight_decay,
    );
}

fn update_decayed_slice(
    optimizer: &mut dyn Optimizer,
    key: &str,
    param: &mut [f32],
    grad: &[f32],
    weight_decay: f32,
) {
    if weight_decay == 0.0 {
        optimizer.update(key, param, grad);
        return;
    }
    let decayed: Vec<f32> = param
        .iter()
        .zip(grad)
        .map(|(&p, &g)| g + weight_decay * p)
        .collect();
    optimizer.update(key, param, &decayed);
}

fn update_attention(
    optimizer: &mut dyn Optimizer,
    prefix: &str,
    attn: &mut attention::AdditiveAttention,
    grads: &attention::AttentionGrads,
    weight_decay: f32,
) {
    update_decayed(optimizer, &format!("{prefix}.proj"), &mut attn.proj, &grads.proj, weight_decay);
    update_plain(optimizer, &format!("{prefix}.bias"), &mut attn.bias, &grads.bias);
    update_plain(optimizer, &format!("{prefix}.query"), &mut attn.query, &grads.query);
}

impl ModelGradients {
    pub fn add_assign(&mut self, other: &ModelGradients) {
        self.news.add_assign(&other.news);
        self.user.add_assign(&other.user);
    }

    pub fn scale(&mut self, factor: f32) {
        self.news.scale(factor);
        self.user.scale(factor);
    }

    pub fn global_norm(&self) -> f32 {
        (self.news.squared_norm() + self.user.squared_norm()).sqrt()
    }

    /// Scale gradients down so the global norm does not exceed
    /// `max_norm`. No-op when already within bounds.
    pub fn clip_global_norm(&mut self, max_norm: f32) {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
    }
}
