pub mod metrics;

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Numerically stable softmax; positions scored `-inf` get zero mass.
/// If every position is `-inf` the result is all zeros.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max_score = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max_score == f32::NEG_INFINITY {
        return vec![0.0; scores.len()];
    }
    let exp_scores: Vec<f32> = scores.iter().map(|&x| (x - max_score).exp()).collect();
    let sum_exp: f32 = exp_scores.iter().sum();

    exp_scores.iter().map(|&x| x / sum_exp).collect()
}

pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indexed_scores: Vec<(usize, f32)> = scores
        .iter()
        .enumerate()
        .map(|(i, &score)| (i, score))
        .collect();

    indexed_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    indexed_scores.into_iter().take(k).map(|(i, _)| i).collect()
}

/// Indices sorted by descending score (full ranking, not truncated).
pub fn rank_by_score(scores: &[f32]) -> Vec<usize> {
    top_k_indices(scores, scores.len())
}
