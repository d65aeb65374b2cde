//! Ranking metrics over one impression's (scores, labels) pair.
//!
//! All functions return `None` when the metric is undefined for the
//! input (no positives, or no negatives for AUC) so callers can count
//! skipped impressions instead of averaging in a placeholder.

use crate::utils::rank_by_score;

/// Pairwise AUC: probability a random clicked candidate outranks a
/// random non-clicked one; ties count 0.5.
pub fn auc_score(scores: &[f32], labels: &[bool]) -> Option<f64> {
    let num_pos = labels.iter().filter(|&&l| l).count();
    let num_neg = labels.len() - num_pos;
    if num_pos == 0 || num_neg == 0 {
        return None;
    }

    let mut wins = 0.0f64;
    for (i, &label_i) in labels.iter().enumerate() {
        if !label_i {
            continue;
        }
        for (j, &label_j) in labels.iter().enumerate() {
            if label_j {
                continue;
            }
            if scores[i] > scores[j] {
                wins += 1.0;
            } else if scores[i] == scores[j] {
                wins += 0.5;
            }
        }
    }

    Some(wins / (num_pos * num_neg) as f64)
}

/// Reciprocal rank of the first clicked candidate in the descending
/// score ranking.
pub fn mrr_score(scores: &[f32], labels: &[bool]) -> Option<f64> {
    let ranking = rank_by_score(scores);
    ranking
        .iter()
        .position(|&idx| labels[idx])
        .map(|pos| 1.0 / (pos + 1) as f64)
}

fn dcg_at_k(ranked_labels: &[bool], k: usize) -> f64 {
    ranked_labels
        .iter()
        .take(k)
        .enumerate()
        .map(|(i, &rel)| {
            if rel {
                1.0 / ((i + 2) as f64).log2()
            } else {
                0.0
            }
        })
        .sum()
}

/// Binary-relevance nDCG@k against the ideal ranking.
pub fn ndcg_score(scores: &[f32], labels: &[bool], k: usize) -> Option<f64> {
    let num_pos = labels.iter().filter(|&&l| l).count();
    if num_pos == 0 {
        return None;
    }

    let ranked: Vec<bool> = rank_by_score(scores).into_iter().map(|i| labels[i]).collect();
    let mut ideal = labels.to_vec();
    ideal.sort_by(|a, b| b.cmp(a));

    let idcg = dcg_at_k(&ideal, k);
    if idcg == 0.0 {
        return None;
    }

    Some(dcg_at_k(&ranked, k) / idcg)
}
