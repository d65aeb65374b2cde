use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::EvaluationConfig;
use crate::data::{Corpus, Impression};
use crate::error::{RecError, Result};
use crate::model::NewsRecModel;
use crate::utils::metrics::{auc_score, mrr_score, ndcg_score};

/// Ranking metrics for a single impression. `auc` is `None` when the
/// impression's labels are single-class and the metric is undefined.
#[derive(Debug, Clone)]
pub struct ImpressionMetrics {
    pub impression_id: u64,
    pub auc: Option<f64>,
    pub mrr: Option<f64>,
    /// Paired with the evaluator's `ndcg_ks`, in order. `None` entries
    /// mean the impression had no clicked candidate.
    pub ndcg: Vec<Option<f64>>,
}

/// Macro-averaged report over a set of impressions. Each impression
/// contributes one ranking and one unit of weight; scores are never
/// pooled across impressions.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub auc: f64,
    pub mrr: f64,
    pub ndcg_ks: Vec<usize>,
    pub ndcg: Vec<f64>,
    pub num_impressions: usize,
    /// Impressions excluded from every average because all their
    /// labels were identical.
    pub num_skipped: usize,
}

pub struct Evaluator {
    ndcg_ks: Vec<usize>,
}

impl Evaluator {
    pub fn new(config: &EvaluationConfig) -> Self {
        Self {
            ndcg_ks: config.ndcg_k.clone(),
        }
    }

    pub fn with_ndcg_ks(ndcg_ks: Vec<usize>) -> Self {
        Self { ndcg_ks }
    }

    /// Score every candidate of one impression in inference mode and
    /// compute its per-impression metrics.
    pub fn evaluate_impression(
        &self,
        model: &NewsRecModel,
        corpus: &dyn Corpus,
        impression: &Impression,
    ) -> Result<ImpressionMetrics> {
        if impression.candidates.is_empty() {
            return Err(RecError::EmptyCandidateSet {
                impression_id: impression.id,
            });
        }

        let (history_vectors, mask) = model.encode_history(corpus, &impression.history)?;
        let user_vector = model.encode_user(&history_vectors, &mask)?;

        let mut scores = Vec::with_capacity(impression.candidates.len());
        let mut labels = Vec::with_capacity(impression.candidates.len());
        for candidate in &impression.candidates {
            let news = corpus.require(candidate.news_id)?;
            let news_vector = model.encode_news(news)?;
            scores.push(NewsRecModel::score(user_vector.view(), news_vector.view()));
            labels.push(candidate.clicked);
        }

        let auc = auc_score(&scores, &labels);
        let mrr = mrr_score(&scores, &labels);
        let ndcg = self
            .ndcg_ks
            .iter()
            .map(|&k| ndcg_score(&scores, &labels, k))
            .collect();

        Ok(ImpressionMetrics {
            impression_id: impression.id,
            auc,
            mrr,
            ndcg,
        })
    }

    /// Evaluate a full impression set, macro-averaging over the
    /// impressions whose metrics are defined. Impressions are
    /// independent rankings, so scoring fans out across threads.
    pub fn evaluate(
        &self,
        model: &NewsRecModel,
        corpus: &dyn Corpus,
        impressions: &[Impression],
    ) -> Result<EvalReport> {
        let per_impression: Vec<ImpressionMetrics> = impressions
            .par_iter()
            .map(|impression| self.evaluate_impression(model, corpus, impression))
            .collect::<Result<_>>()?;

        let mut auc_sum = 0.0;
        let mut mrr_sum = 0.0;
        let mut ndcg_sums = vec![0.0; self.ndcg_ks.len()];
        let mut counted = 0usize;
        for metrics in &per_impression {
            let Some(auc) = metrics.auc else {
                warn!(
                    impression_id = metrics.impression_id,
                    "single-class impression skipped"
                );
                continue;
            };
            // A defined AUC implies at least one click, so MRR and
            // nDCG are defined too.
            auc_sum += auc;
            mrr_sum += metrics.mrr.unwrap_or(0.0);
            for (sum, value) in ndcg_sums.iter_mut().zip(&metrics.ndcg) {
                *sum += value.unwrap_or(0.0);
            }
            counted += 1;
        }

        let num_skipped = per_impression.len() - counted;
        let denom = counted.max(1) as f64;
        let report = EvalReport {
            auc: auc_sum / denom,
            mrr: mrr_sum / denom,
            ndcg_ks: self.ndcg_ks.clone(),
            ndcg: ndcg_sums.into_iter().map(|s| s / denom).collect(),
            num_impressions: counted,
            num_skipped,
        };
        info!(
            auc = report.auc,
            mrr = report.mrr,
            impressions = report.num_impressions,
            skipped = report.num_skipped,
            "evaluation finished"
        );
        Ok(report)
    }
}
