use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use std::collections::HashMap;

use crate::algorithms::initializer;
use crate::config::ModelConfig;
use crate::data::News;
use crate::error::{RecError, Result};
use crate::model::attention::{AdditiveAttention, AttentionCache, AttentionGrads};
use crate::model::layers::{apply_mask, dropout_mask, Conv1d, ConvCache, ConvGrads, Dense, DenseGrads};

/// Encodes one news item into a `num_cnn_filters`-wide vector by
/// fusing its active views (title, sapo, category) with view-level
/// additive attention. The same encoder instance serves history items
/// and candidates; sharing its parameters across both roles is a
/// correctness requirement, not an optimization.
#[derive(Debug, Clone)]
pub struct NewsEncoder {
    pub word_embedding: Array2<f32>, // vocab_size x word_embed_dim
    pub reduce: Option<Dense>,       // word_embed_dim -> reduced_embed_dim, linear
    pub title_conv: Conv1d,
    pub title_attn: AdditiveAttention,
    pub sapo_conv: Option<Conv1d>,
    pub sapo_attn: Option<AdditiveAttention>,
    pub category_embedding: Option<Array2<f32>>, // num_categories x category_embed_dim
    pub category_dense: Option<Dense>,
    /// Absent for the title-only variant: a single view needs no pooling.
    pub view_attn: Option<AdditiveAttention>,
    config: ModelConfig,
}

#[derive(Debug, Clone)]
struct TextCache {
    token_ids: Vec<usize>,
    /// Pre-reduction embeddings; kept only when the reduce layer exists.
    raw_embed: Option<Array2<f32>>,
    embed_mask: Option<Array2<f32>>,
    conv: ConvCache,
    context_mask: Option<Array2<f32>>,
    attn: AttentionCache,
}

#[derive(Debug, Clone)]
struct CategoryCache {
    id: usize,
    dense: crate::model::layers::DenseCache,
}

#[derive(Debug, Clone)]
pub struct NewsCache {
    title: TextCache,
    sapo: Option<TextCache>,
    category: Option<CategoryCache>,
    views: Option<AttentionCache>,
}

#[derive(Debug, Clone)]
pub struct NewsEncoderGrads {
    pub word_embedding: HashMap<usize, Array1<f32>>,
    pub reduce: Option<DenseGrads>,
    pub title_conv: ConvGrads,
    pub title_attn: AttentionGrads,
    pub sapo_conv: Option<ConvGrads>,
    pub sapo_attn: Option<AttentionGrads>,
    pub category_embedding: HashMap<usize, Array1<f32>>,
    pub category_dense: Option<DenseGrads>,
    pub view_attn: Option<AttentionGrads>,
}

impl NewsEncoder {
    pub fn new(config: &ModelConfig, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;

        let word_embedding =
            initializer::embedding_table(rng, config.vocab_size, config.word_embed_dim);
        Self::with_tables(config, word_embedding, None, rng)
    }

    /// Build with pretrained embedding tables; both stay trainable.
    pub fn with_tables(
        config: &ModelConfig,
        word_embedding: Array2<f32>,
        category_embedding: Option<Array2<f32>>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        config.validate()?;
        if word_embedding.dim() != (config.vocab_size, config.word_embed_dim) {
            return Err(RecError::ShapeMismatch {
                what: "word embedding table rows",
                expected: config.vocab_size,
                actual: word_embedding.nrows(),
            });
        }

        let embed_dim = config.embed_dim();
        let filters = config.num_cnn_filters;

        let reduce = config
            .reduced_embed_dim
            .map(|d| Dense::new(rng, d, config.word_embed_dim, false));

        let title_conv = Conv1d::new(rng, filters, config.window_size, embed_dim);
        let title_attn = AdditiveAttention::new(rng, config.query_dim, filters);

        let (sapo_conv, sapo_attn) = if config.use_sapo {
            (
                Some(Conv1d::new(rng, filters, config.window_size, embed_dim)),
                Some(AdditiveAttention::new(rng, config.query_dim, filters)),
            )
        } else {
            (None, None)
        };

        let (category_embedding, category_dense) = if config.use_category {
            let table = match category_embedding {
                Some(table) => {
                    if table.dim() != (config.num_categories, config.category_embed_dim) {
                        return Err(RecError::ShapeMismatch {
                            what: "category embedding table rows",
                            expected: config.num_categories,
                            actual: table.nrows(),
                        });
                    }
                    table
                }
                None => initializer::embedding_table(
                    rng,
                    config.num_categories,
                    config.category_embed_dim,
                ),
            };
            (
                Some(table),
                Some(Dense::new(rng, filters, config.category_embed_dim, true)),
            )
        } else {
            (None, None)
        };

        let view_attn = if config.num_views() > 1 {
            Some(AdditiveAttention::new(rng, config.query_dim, filters))
        } else {
            None
        };

        Ok(Self {
            word_embedding,
            reduce,
            title_conv,
            title_attn,
            sapo_conv,
            sapo_attn,
            category_embedding,
            category_dense,
            view_attn,
            config: config.clone(),
        })
    }

    pub fn output_dim(&self) -> usize {
        self.config.num_cnn_filters
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn zero_grads(&self) -> NewsEncoderGrads {
        NewsEncoderGrads {
            word_embedding: HashMap::new(),
            reduce: self.reduce.as_ref().map(Dense::zero_grads),
            title_conv: self.title_conv.zero_grads(),
            title_attn: self.title_attn.zero_grads(),
            sapo_conv: self.sapo_conv.as_ref().map(Conv1d::zero_grads),
            sapo_attn: self.sapo_attn.as_ref().map(AdditiveAttention::zero_grads),
            category_embedding: HashMap::new(),
            category_dense: self.category_dense.as_ref().map(Dense::zero_grads),
            view_attn: self.view_attn.as_ref().map(AdditiveAttention::zero_grads),
        }
    }

    /// Inference-mode encoding: dropout off, no caches retained.
    pub fn encode(&self, news: &News) -> Result<Array1<f32>> {
        self.forward(news, None).map(|(vector, _)| vector)
    }

    /// Full forward pass. `dropout_rng` being `Some` switches the
    /// encoder into training mode; inference is deterministic.
    pub fn forward(
        &self,
        news: &News,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array1<f32>, NewsCache)> {
        let (title_vec, title_cache) = self.text_forward(
            &news.title,
            self.config.max_title_length,
            "title token sequence",
            &self.title_conv,
            &self.title_attn,
            dropout_rng.as_deref_mut(),
        )?;

        let mut view_vectors = vec![title_vec];

        let sapo_cache = if let (Some(conv), Some(attn)) = (&self.sapo_conv, &self.sapo_attn) {
            let (sapo_vec, cache) = self.text_forward(
                &news.sapo,
                self.config.max_sapo_length,
                "sapo token sequence",
                conv,
                attn,
                dropout_rng.as_deref_mut(),
            )?;
            view_vectors.push(sapo_vec);
            Some(cache)
        } else {
            None
        };

        let category_cache =
            if let (Some(table), Some(dense)) = (&self.category_embedding, &self.category_dense) {
                let id = news.category as usize;
                if id >= table.nrows() {
                    return Err(RecError::ShapeMismatch {
                        what: "category id",
                        expected: table.nrows(),
                        actual: id,
                    });
                }
                let (cat_vec, dense_cache) = dense.forward(table.row(id));
                view_vectors.push(cat_vec);
                Some(CategoryCache {
                    id,
                    dense: dense_cache,
                })
            } else {
                None
            };

        let (news_vector, views_cache) = match &self.view_attn {
            Some(attn) => {
                let filters = self.config.num_cnn_filters;
                let mut views = Array2::zeros((view_vectors.len(), filters));
                for (i, v) in view_vectors.iter().enumerate() {
                    views.row_mut(i).assign(v);
                }
                let mask = vec![true; view_vectors.len()];
                let (pooled, cache) = attn.forward(views.view(), &mask);
                (pooled, Some(cache))
            }
            None => (view_vectors.pop().expect("title view always present"), None),
        };

        Ok((
            news_vector,
            NewsCache {
                title: title_cache,
                sapo: sapo_cache,
                category: category_cache,
                views: views_cache,
            },
        ))
    }

    fn text_forward(
        &self,
        token_ids: &[u32],
        expected_len: usize,
        what: &'static str,
        conv: &Conv1d,
        attn: &AdditiveAttention,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array1<f32>, TextCache)> {
        if token_ids.len() != expected_len {
            return Err(RecError::ShapeMismatch {
                what,
                expected: expected_len,
                actual: token_ids.len(),
            });
        }

        let mut ids = Vec::with_capacity(expected_len);
        let mut mask = Vec::with_capacity(expected_len);
        for &token in token_ids {
            let id = token as usize;
            if id >= self.word_embedding.nrows() {
                return Err(RecError::ShapeMismatch {
                    what: "token id",
                    expected: self.word_embedding.nrows(),
                    actual: id,
                });
            }
            ids.push(id);
            mask.push(token != self.config.pad_token_id);
        }

        // Embed, then optionally project down to the working dimension
        let mut embedded = Array2::zeros((expected_len, self.config.word_embed_dim));
        for (i, &id) in ids.iter().enumerate() {
            embedded.row_mut(i).assign(&self.word_embedding.row(id));
        }

        let (mut conv_input, raw_embed) = match &self.reduce {
            Some(reduce) => {
                let reduced = embedded.dot(&reduce.weight.t()) + &reduce.bias;
                (reduced, Some(embedded))
            }
            None => (embedded, None),
        };

        let embed_mask = dropout_rng
            .as_deref_mut()
            .and_then(|rng| dropout_mask(rng, conv_input.dim(), self.config.dropout));
        apply_mask(&mut conv_input, &embed_mask);

        let (mut context, conv_cache) = conv.forward(conv_input.view());

        let context_mask = dropout_rng
            .as_deref_mut()
            .and_then(|rng| dropout_mask(rng, context.dim(), self.config.dropout));
        apply_mask(&mut context, &context_mask);

        let (view_vector, attn_cache) = attn.forward(context.view(), &mask);

        Ok((
            view_vector,
            TextCache {
                token_ids: ids,
                raw_embed,
                embed_mask,
                conv: conv_cache,
                context_mask,
                attn: attn_cache,
            },
        ))
    }

    pub fn backward(
        &self,
        cache: &NewsCache,
        d_news: ArrayView1<f32>,
        grads: &mut NewsEncoderGrads,
    ) {
        // Split the gradient across views
        let (d_title, d_sapo, d_category) = match (&self.view_attn, &cache.views) {
            (Some(attn), Some(views_cache)) => {
                let view_grads = grads.view_attn.as_mut().expect("view attention grads");
                let d_views = attn.backward(views_cache, d_news, view_grads);
                let mut rows = d_views.axis_iter(Axis(0));
                let d_title = rows.next().expect("title row").to_owned();
                let d_sapo = cache.sapo.as_ref().map(|_| rows.next().expect("sapo row").to_owned());
                let d_category = cache
                    .category
                    .as_ref()
                    .map(|_| rows.next().expect("category row").to_owned());
                (d_title, d_sapo, d_category)
            }
            _ => (d_news.to_owned(), None, None),
        };

        self.text_backward(
            &cache.title,
            &self.title_conv,
            &self.title_attn,
            d_title.view(),
            TextGradSlots::Title,
            grads,
        );

        if let (Some(cache), Some(d_sapo)) = (&cache.sapo, d_sapo) {
            let conv = self.sapo_conv.as_ref().expect("sapo conv");
            let attn = self.sapo_attn.as_ref().expect("sapo attention");
            self.text_backward(cache, conv, attn, d_sapo.view(), TextGradSlots::Sapo, grads);
        }

        if let (Some(cat_cache), Some(d_category)) = (&cache.category, d_category) {
            let dense = self.category_dense.as_ref().expect("category dense");
            let dense_grads = grads.category_dense.as_mut().expect("category dense grads");
            let d_embed = dense.backward(&cat_cache.dense, d_category.view(), dense_grads);

            // Category pad row stays frozen, like torch's padding_idx
            if cat_cache.id != self.config.category_pad_id as usize {
                let dim = self.config.category_embed_dim;
                grads
                    .category_embedding
                    .entry(cat_cache.id)
                    .or_insert_with(|| Array1::zeros(dim))
                    .scaled_add(1.0, &d_embed);
            }
        }
    }

    fn text_backward(
        &self,
        cache: &TextCache,
        conv: &Conv1d,
        attn: &AdditiveAttention,
        d_view: ArrayView1<f32>,
        slot: TextGradSlots,
        grads: &mut NewsEncoderGrads,
    ) {
        let attn_grads = match slot {
            TextGradSlots::Title => &mut grads.title_attn,
            TextGradSlots::Sapo => grads.sapo_attn.as_mut().expect("sapo attention grads"),
        };
        let mut d_context = attn.backward(&cache.attn, d_view, attn_grads);
        apply_mask(&mut d_context, &cache.context_mask);

        let conv_grads = match slot {
            TextGradSlots::Title => &mut grads.title_conv,
            TextGradSlots::Sapo => grads.sapo_conv.as_mut().expect("sapo conv grads"),
        };
        let mut d_conv_input = conv.backward(&cache.conv, d_context.view(), conv_grads);
        apply_mask(&mut d_conv_input, &cache.embed_mask);

        let d_embedded = match (&self.reduce, &cache.raw_embed) {
            (Some(reduce), Some(raw_embed)) => {
                let reduce_grads = grads.reduce.as_mut().expect("reduce grads");
                reduce_grads.weight += &d_conv_input.t().dot(raw_embed);
                reduce_grads.bias += &d_conv_input.sum_axis(Axis(0));
                d_conv_input.dot(&reduce.weight)
            }
            _ => d_conv_input,
        };

        // Scatter token gradients into the sparse embedding grad map;
        // the pad row stays frozen.
        let pad = self.config.pad_token_id as usize;
        let dim = self.config.word_embed_dim;
        for (i, &id) in cache.token_ids.iter().enumerate() {
            if id == pad {
                continue;
            }
            grads
                .word_embedding
                .entry(id)
                .or_insert_with(|| Array1::zeros(dim))
                .scaled_add(1.0, &d_embedded.row(i));
        }
    }
}

#[derive(Clone, Copy)]
enum TextGradSlots {
    Title,
    Sapo,
}

fn merge_embedding_grads(
    into: &mut HashMap<usize, Array1<f32>>,
    from: &HashMap<usize, Array1<f32>>,
) {
    for (&row, grad) in from {
        match into.get_mut(&row) {
            Some(acc) => *acc += grad,
            None => {
                into.insert(row, grad.clone());
            }
        }
    }
}

impl NewsEncoderGrads {
    pub fn add_assign(&mut self, other: &NewsEncoderGrads) {
        merge_embedding_grads(&mut self.word_embedding, &other.word_embedding);
        if let (Some(a), Some(b)) = (self.reduce.as_mut(), other.reduce.as_ref()) {
            a.add_assign(b);
        }
        self.title_conv.add_assign(&other.title_conv);
        self.title_attn.add_assign(&other.title_attn);
        if let (Some(a), Some(b)) = (self.sapo_conv.as_mut(), other.sapo_conv.as_ref()) {
            a.add_assign(b);
        }
        if let (Some(a), Some(b)) = (self.sapo_attn.as_mut(), other.sapo_attn.as_ref()) {
            a.add_assign(b);
        }
        merge_embedding_grads(&mut self.category_embedding, &other.category_embedding);
        if let (Some(a), Some(b)) = (self.category_dense.as_mut(), other.category_dense.as_ref()) {
            a.add_assign(b);
        }
        if let (Some(a), Some(b)) = (self.view_attn.as_mut(), other.view_attn.as_ref()) {
            a.add_assign(b);
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for grad in self.word_embedding.values_mut() {
            *grad *= factor;
        }
        if let Some(g) = self.reduce.as_mut() {
            g.scale(factor);
        }
        self.title_conv.scale(factor);
        self.title_attn.scale(factor);
        if let Some(g) = self.sapo_conv.as_mut() {
            g.scale(factor);
        }
        if let Some(g) = self.sapo_attn.as_mut() {
            g.scale(factor);
        }
        for grad in self.category_embedding.values_mut() {
            *grad *= factor;
        }
        if let Some(g) = self.category_dense.as_mut() {
            g.scale(factor);
        }
        if let Some(g) = self.view_attn.as_mut() {
            g.scale(factor);
        }
    }

    pub fn squared_norm(&self) -> f32 {
        let mut total = 0.0;
        for grad in self.word_embedding.values() {
            total += grad.iter().map(|g| g * g).sum::<f32>();
        }
        if let Some(g) = &self.reduce {
            total += g.squared_norm();
        }
        total += self.title_conv.squared_norm();
        total += self.title_attn.squared_norm();
        if let Some(g) = &self.sapo_conv {
            total += g.squared_norm();
        }
        if let Some(g) = &self.sapo_attn {
            total += g.squared_norm();
        }
        for grad in self.category_embedding.values() {
            total += grad.iter().map(|g| g * g).sum::<f32>();
        }
        if let Some(g) = &self.category_dense {
            total += g.squared_norm();
        }
        if let Some(g) = &self.view_attn {
            total += g.squared_norm();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 12,
            word_embed_dim: 6,
            reduced_embed_dim: None,
            pad_token_id: 0,
            num_categories: 4,
            category_embed_dim: 5,
            category_pad_id: 0,
            use_sapo: true,
            use_category: true,
            num_cnn_filters: 8,
            window_size: 3,
            query_dim: 7,
            dropout: 0.0,
            max_title_length: 4,
            max_sapo_length: 6,
            his_length: 3,
        }
    }

    fn sample_news() -> News {
        News::new(1, vec![3, 4, 5, 0], vec![6, 7, 8, 9, 0, 0], 2)
    }

    #[test]
    fn test_encode_output_width() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let vector = encoder.encode(&sample_news()).unwrap();
        assert_eq!(vector.len(), config.num_cnn_filters);
    }

    #[test]
    fn test_view_attention_weights_normalized() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let (_, cache) = encoder.forward(&sample_news(), None).unwrap();

        let views = cache.views.expect("three active views");
        assert_eq!(views.weights.len(), 3);
        let sum: f32 = views.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(views.weights.iter().all(|&w| (0.0..=1.0).contains(&w)));
    }

    #[test]
    fn test_title_only_variant_has_no_view_attention() {
        let mut config = tiny_config();
        config.use_sapo = false;
        config.use_category = false;
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        assert!(encoder.view_attn.is_none());
        assert!(encoder.sapo_conv.is_none());

        let vector = encoder.encode(&sample_news()).unwrap();
        assert_eq!(vector.len(), config.num_cnn_filters);
    }

    #[test]
    fn test_pad_tokens_carry_zero_word_attention() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let (_, cache) = encoder.forward(&sample_news(), None).unwrap();

        // Title [3, 4, 5, 0]: the trailing pad slot gets no weight,
        // the real tokens split the full mass.
        let weights = &cache.title.attn.weights;
        assert_eq!(weights[3], 0.0);
        let sum: f32 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_inference_is_idempotent() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let news = sample_news();
        let a = encoder.encode(&news).unwrap();
        let b = encoder.encode(&news).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_title_length_rejected() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let bad = News::new(1, vec![3, 4], vec![6, 7, 8, 9, 0, 0], 2);
        assert!(matches!(
            encoder.encode(&bad),
            Err(RecError::ShapeMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn test_reduce_dim_path() {
        let mut config = tiny_config();
        config.reduced_embed_dim = Some(3);
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        assert!(encoder.reduce.is_some());
        let vector = encoder.encode(&sample_news()).unwrap();
        assert_eq!(vector.len(), config.num_cnn_filters);
    }

    #[test]
    fn test_backward_populates_touched_rows_only() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(21);
        let encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let news = sample_news();
        let (vector, cache) = encoder.forward(&news, None).unwrap();

        let mut grads = encoder.zero_grads();
        let d_news = Array1::ones(vector.len());
        encoder.backward(&cache, d_news.view(), &mut grads);

        // Pad token row 0 must stay untouched; real tokens must appear
        assert!(!grads.word_embedding.contains_key(&0));
        for id in [3usize, 4, 5, 6, 7, 8, 9] {
            assert!(grads.word_embedding.contains_key(&id), "missing token {id}");
        }
        assert!(grads.category_embedding.contains_key(&2));
    }

    // Finite-difference check through the full encoder (dropout off).
    #[test]
    fn test_encoder_gradient_check() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(33);
        let mut encoder = NewsEncoder::new(&config, &mut rng).unwrap();
        let news = sample_news();

        let (vector, cache) = encoder.forward(&news, None).unwrap();
        let mut grads = encoder.zero_grads();
        let d_news = Array1::ones(vector.len());
        encoder.backward(&cache, d_news.view(), &mut grads);

        let eps = 1e-3;

        // Word embedding row of token 4
        for j in 0..config.word_embed_dim {
            let orig = encoder.word_embedding[[4, j]];
            encoder.word_embedding[[4, j]] = orig + eps;
            let plus = encoder.encode(&news).unwrap().sum();
            encoder.word_embedding[[4, j]] = orig - eps;
            let minus = encoder.encode(&news).unwrap().sum();
            encoder.word_embedding[[4, j]] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            let analytic = grads.word_embedding[&4][j];
            assert!(
                (numeric - analytic).abs() < 2e-2,
                "word_embedding[4,{j}]: numeric {numeric} vs analytic {analytic}"
            );
        }

        // Title conv bias
        for o in 0..config.num_cnn_filters {
            let orig = encoder.title_conv.bias[o];
            encoder.title_conv.bias[o] = orig + eps;
            let plus = encoder.encode(&news).unwrap().sum();
            encoder.title_conv.bias[o] = orig - eps;
            let minus = encoder.encode(&news).unwrap().sum();
            encoder.title_conv.bias[o] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            let analytic = grads.title_conv.bias[o];
            assert!(
                (numeric - analytic).abs() < 2e-2,
                "title_conv.bias[{o}]: numeric {numeric} vs analytic {analytic}"
            );
        }
    }
}
