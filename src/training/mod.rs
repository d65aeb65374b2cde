use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::algorithms::{Adam, Optimizer};
use crate::config::TrainingConfig;
use crate::data::{Corpus, History, Impression, NewsId};
use crate::error::{RecError, Result};
use crate::model::{ModelGradients, NewsRecModel};

/// One sampled training instance: the clicked candidate sits at index
/// 0 of `candidates`, followed by exactly `npratio` negatives.
#[derive(Debug, Clone)]
pub struct TrainingInstance {
    pub impression_id: u64,
    pub history: History,
    pub candidates: Vec<NewsId>,
}

/// Draws `npratio` same-impression negatives per clicked candidate.
///
/// Fallback policy, fixed and seed-reproducible: when an impression
/// holds fewer non-clicked candidates than `npratio`, negatives are
/// drawn with replacement from the ones available; an impression with
/// no non-clicked candidate at all yields no instance for that click.
#[derive(Debug)]
pub struct NegativeSampler {
    npratio: usize,
    rng: StdRng,
}

impl NegativeSampler {
    pub fn new(npratio: usize, seed: u64) -> Self {
        Self {
            npratio,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn draw(&mut self, impression: &Impression) -> Result<Vec<TrainingInstance>> {
        if impression.candidates.is_empty() {
            return Err(RecError::EmptyCandidateSet {
                impression_id: impression.id,
            });
        }

        let negatives: Vec<NewsId> = impression
            .non_clicked_candidates()
            .map(|c| c.news_id)
            .collect();

        let mut instances = Vec::new();
        for positive in impression.clicked_candidates() {
            if negatives.is_empty() {
                warn!(
                    impression_id = impression.id,
                    "no negatives available, skipping clicked candidate"
                );
                continue;
            }

            let mut candidates = Vec::with_capacity(self.npratio + 1);
            candidates.push(positive.news_id);
            if negatives.len() >= self.npratio {
                candidates.extend(
                    negatives
                        .choose_multiple(&mut self.rng, self.npratio)
                        .copied(),
                );
            } else {
                // With-replacement fallback
                for _ in 0..self.npratio {
                    let idx = self.rng.gen_range(0..negatives.len());
                    candidates.push(negatives[idx]);
                }
            }

            instances.push(TrainingInstance {
                impression_id: impression.id,
                history: impression.history.clone(),
                candidates,
            });
        }

        Ok(instances)
    }
}

/// Linear warmup over the first `warmup_steps`, then linear decay to
/// zero at `total_steps`.
#[derive(Debug, Clone)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup_steps = (warmup_ratio * total_steps as f64).round() as usize;
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    pub fn learning_rate(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        if step >= self.total_steps {
            return 0.0;
        }
        let remaining = (self.total_steps - step) as f64;
        let decay_span = (self.total_steps - self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / decay_span).min(1.0)
    }
}

/// Explicit training-session context: optimizer state, sampler state,
/// dropout RNG, schedule position, accumulated gradients and the step
/// counter all live here, so independent runs never interfere.
///
/// One impression is one micro-batch; after
/// `gradient_accumulation_steps` micro-batches the accumulated
/// gradient is averaged, clipped and applied in a single optimizer
/// step, so no partial update is ever observable.
pub struct TrainingSession {
    config: TrainingConfig,
    optimizer: Adam,
    sampler: NegativeSampler,
    schedule: LinearSchedule,
    dropout_rng: StdRng,
    accumulated: Option<ModelGradients>,
    micro_batches: usize,
    step: usize,
}

impl TrainingSession {
    pub fn new(config: TrainingConfig) -> Self {
        let optimizer = Adam::default();
        let sampler = NegativeSampler::new(config.npratio, config.seed);
        let schedule =
            LinearSchedule::new(config.learning_rate, config.warmup_ratio, config.total_steps);
        let dropout_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        Self {
            config,
            optimizer,
            sampler,
            schedule,
            dropout_rng,
            accumulated: None,
            micro_batches: 0,
            step: 0,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn current_learning_rate(&self) -> f64 {
        self.schedule.learning_rate(self.step)
    }

    /// Process one impression as a micro-batch. Returns the mean
    /// instance loss, or `None` when the impression yielded no usable
    /// training instance (no clicks, or no negatives).
    pub fn train_impression(
        &mut self,
        model: &mut NewsRecModel,
        corpus: &dyn Corpus,
        impression: &Impression,
    ) -> Result<Option<f32>> {
        let instances = self.sampler.draw(impression)?;
        if instances.is_empty() {
            warn!(impression_id = impression.id, "impression yielded no training instance");
            return Ok(None);
        }

        let mut batch_grads = model.zero_grads();
        let mut total_loss = 0.0;
        for instance in &instances {
            let (loss, grads) = model.training_loss(
                corpus,
                &instance.history,
                &instance.candidates,
                &mut self.dropout_rng,
            )?;
            total_loss += loss;
            batch_grads.add_assign(&grads);
        }
        batch_grads.scale(1.0 / instances.len() as f32);
        let mean_loss = total_loss / instances.len() as f32;

        match self.accumulated.as_mut() {
            Some(acc) => acc.add_assign(&batch_grads),
            None => self.accumulated = Some(batch_grads),
        }
        self.micro_batches += 1;

        if self.micro_batches >= self.config.gradient_accumulation_steps {
            self.apply_accumulated(model);
        }

        Ok(Some(mean_loss))
    }

    /// Force an optimizer step over any trailing partial accumulation,
    /// e.g. at epoch end.
    pub fn flush(&mut self, model: &mut NewsRecModel) {
        if self.micro_batches > 0 {
            self.apply_accumulated(model);
        }
    }

    fn apply_accumulated(&mut self, model: &mut NewsRecModel) {
        let Some(mut grads) = self.accumulated.take() else {
            self.micro_batches = 0;
            return;
        };

        grads.scale(1.0 / self.micro_batches as f32);
        grads.clip_global_norm(self.config.max_grad_norm);

        let lr = self.schedule.learning_rate(self.step);
        self.optimizer.set_learning_rate(lr);
        model.apply_update(&mut self.optimizer, &grads, self.config.weight_decay);

        self.step += 1;
        self.micro_batches = 0;
        debug!(step = self.step, learning_rate = lr, "optimizer step applied");
        if self.step % 100 == 0 {
            info!(step = self.step, learning_rate = lr, "training progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::{Candidate, InMemoryCorpus, News};

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
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
            his_length: 5,
        }
    }

    fn tiny_corpus() -> InMemoryCorpus {
        let mut corpus = InMemoryCorpus::new();
        for id in 1..=6u32 {
            let base = id + 2;
            corpus.insert(News::new(
                id,
                vec![base, base + 1, base + 2, 0],
                vec![base, base + 3, base + 4, base + 5, 0, 0],
                (id % 4) as u32,
            ));
        }
        corpus
    }

    fn impression(candidates: Vec<Candidate>) -> Impression {
        Impression::new(7, 1, History::new(&[1, 2], 5), candidates)
    }

    #[test]
    fn test_sampler_is_deterministic_under_seed() {
        let imp = impression(vec![
            Candidate::new(3, true),
            Candidate::new(4, false),
            Candidate::new(5, false),
            Candidate::new(6, false),
        ]);

        let a = NegativeSampler::new(2, 42).draw(&imp).unwrap();
        let b = NegativeSampler::new(2, 42).draw(&imp).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].candidates, b[0].candidates);
        assert_eq!(a[0].candidates[0], 3);
        assert_eq!(a[0].candidates.len(), 3);
    }

    #[test]
    fn test_sampler_with_replacement_fallback() {
        let imp = impression(vec![Candidate::new(3, true), Candidate::new(4, false)]);

        let instances = NegativeSampler::new(4, 42).draw(&imp).unwrap();
        assert_eq!(instances.len(), 1);
        let candidates = &instances[0].candidates;
        assert_eq!(candidates.len(), 5);
        // Only one negative exists, so every negative slot repeats it
        assert!(candidates[1..].iter().all(|&id| id == 4));
    }

    #[test]
    fn test_sampler_empty_candidates_is_error() {
        let imp = impression(vec![]);
        assert!(matches!(
            NegativeSampler::new(4, 42).draw(&imp),
            Err(RecError::EmptyCandidateSet { impression_id: 7 })
        ));
    }

    #[test]
    fn test_sampler_skips_click_without_negatives() {
        let imp = impression(vec![Candidate::new(3, true)]);
        let instances = NegativeSampler::new(4, 42).draw(&imp).unwrap();
        assert!(instances.is_empty());
    }

    #[test]
    fn test_schedule_warmup_and_decay() {
        let schedule = LinearSchedule::new(1.0, 0.1, 100);
        assert!(schedule.learning_rate(0) < schedule.learning_rate(5));
        assert!((schedule.learning_rate(9) - 1.0).abs() < 1e-9);
        assert!(schedule.learning_rate(50) < 1.0);
        assert!(schedule.learning_rate(99) > 0.0);
        assert_eq!(schedule.learning_rate(100), 0.0);
    }

    #[test]
    fn test_session_accumulates_before_stepping() {
        let model_config = tiny_config();
        let mut model = NewsRecModel::new(&model_config, 3).unwrap();
        let corpus = tiny_corpus();
        let training_config = TrainingConfig {
            npratio: 2,
            gradient_accumulation_steps: 2,
            total_steps: 100,
            ..TrainingConfig::default()
        };
        let mut session = TrainingSession::new(training_config);

        let imp = impression(vec![
            Candidate::new(3, true),
            Candidate::new(4, false),
            Candidate::new(5, false),
        ]);

        let loss = session.train_impression(&mut model, &corpus, &imp).unwrap();
        assert!(loss.is_some());
        assert_eq!(session.step(), 0);

        session.train_impression(&mut model, &corpus, &imp).unwrap();
        assert_eq!(session.step(), 1);
    }

    #[test]
    fn test_flush_applies_partial_accumulation() {
        let model_config = tiny_config();
        let mut model = NewsRecModel::new(&model_config, 3).unwrap();
        let corpus = tiny_corpus();
        let training_config = TrainingConfig {
            npratio: 2,
            gradient_accumulation_steps: 8,
            total_steps: 100,
            ..TrainingConfig::default()
        };
        let mut session = TrainingSession::new(training_config);

        let imp = impression(vec![
            Candidate::new(3, true),
            Candidate::new(4, false),
            Candidate::new(5, false),
        ]);
        session.train_impression(&mut model, &corpus, &imp).unwrap();
        assert_eq!(session.step(), 0);
        session.flush(&mut model);
        assert_eq!(session.step(), 1);
        // Flushing again without new micro-batches is a no-op
        session.flush(&mut model);
        assert_eq!(session.step(), 1);
    }

    #[test]
    fn test_training_reduces_loss() {
        let model_config = tiny_config();
        let mut model = NewsRecModel::new(&model_config, 3).unwrap();
        let corpus = tiny_corpus();
        let training_config = TrainingConfig {
            learning_rate: 0.01,
            npratio: 2,
            gradient_accumulation_steps: 1,
            warmup_ratio: 0.0,
            total_steps: 1000,
            weight_decay: 0.0,
            ..TrainingConfig::default()
        };
        let mut session = TrainingSession::new(training_config);

        let imp = impression(vec![
            Candidate::new(3, true),
            Candidate::new(4, false),
            Candidate::new(5, false),
        ]);

        let first = session
            .train_impression(&mut model, &corpus, &imp)
            .unwrap()
            .unwrap();
        let mut last = first;
        for _ in 0..40 {
            last = session
                .train_impression(&mut model, &corpus, &imp)
                .unwrap()
                .unwrap();
        }
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }
}
