//! Next-token score processors applied between the model forward pass and
//! candidate selection. All functions work on one row of scores (one beam).

use anyhow::{anyhow, Result};
use ndarray::{Array1, ArrayBase, DataMut, Ix1};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

pub fn log_softmax_inplace<S>(row: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let log_sum = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
    row.mapv_inplace(|x| x - log_sum);
}

/// Scores below zero are multiplied by the penalty, others divided, so any
/// penalty above 1.0 pushes already-seen tokens down.
pub fn apply_repetition_penalty<S>(row: &mut ArrayBase<S, Ix1>, tokens: &[u32], penalty: f32)
where
    S: DataMut<Elem = f32>,
{
    if penalty == 1.0 {
        return;
    }
    for &token in tokens {
        let idx = token as usize;
        if idx < row.len() {
            let score = row[idx];
            row[idx] = if score < 0.0 {
                score * penalty
            } else {
                score / penalty
            };
        }
    }
}

/// Bans every token that would complete an n-gram already present in `tokens`.
pub fn ban_repeated_ngrams<S>(row: &mut ArrayBase<S, Ix1>, tokens: &[u32], ngram_size: usize)
where
    S: DataMut<Elem = f32>,
{
    let n = ngram_size;
    if n == 0 || tokens.len() + 1 < n {
        return;
    }

    let prefix = &tokens[tokens.len() + 1 - n..];
    for window in tokens.windows(n) {
        if &window[..n - 1] == prefix {
            let banned = window[n - 1] as usize;
            if banned < row.len() {
                row[banned] = f32::NEG_INFINITY;
            }
        }
    }
}

pub fn suppress_token<S>(row: &mut ArrayBase<S, Ix1>, token: u32)
where
    S: DataMut<Elem = f32>,
{
    if let Some(score) = row.get_mut(token as usize) {
        *score = f32::NEG_INFINITY;
    }
}

/// Temperature, then top-k, then top-p. Filtered entries become -inf; the best
/// entry always survives.
pub fn warp(mut scores: Array1<f32>, temperature: f32, top_k: usize, top_p: f32) -> Array1<f32> {
    if temperature != 1.0 {
        scores.mapv_inplace(|x| x / temperature);
    }
    if top_k > 0 && top_k < scores.len() {
        scores = top_k_filtering(scores, top_k);
    }
    if top_p < 1.0 {
        scores = top_p_filtering(scores, top_p);
    }
    scores
}

fn top_k_filtering(mut scores: Array1<f32>, k: usize) -> Array1<f32> {
    let mut sorted = scores.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    scores.mapv_inplace(|x| if x < threshold { f32::NEG_INFINITY } else { x });
    scores
}

fn top_p_filtering(mut scores: Array1<f32>, p: f32) -> Array1<f32> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_unstable_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let probs = softmax(&scores);
    let mut cumulative = 0.0;
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > p {
            for &dropped in &order[rank + 1..] {
                scores[dropped] = f32::NEG_INFINITY;
            }
            break;
        }
    }
    scores
}

pub fn softmax(scores: &Array1<f32>) -> Array1<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Array1::zeros(scores.len());
    }
    let exps = scores.mapv(|x| (x - max).exp());
    let sum = exps.sum();
    exps / sum
}

/// Highest `k` finite entries as `(index, score)`, best first.
pub fn top_k_entries(scores: impl IntoIterator<Item = f32>, k: usize) -> Vec<(usize, f32)> {
    let mut entries: Vec<(usize, f32)> = scores
        .into_iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .collect();
    entries.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    entries.truncate(k);
    entries
}

/// Draws up to `k` distinct indices proportionally to `probs`. Returns fewer
/// when the distribution runs out of non-zero entries.
pub fn sample_without_replacement<R: Rng>(probs: &[f32], k: usize, rng: &mut R) -> Result<Vec<usize>> {
    let mut weights = probs.to_vec();
    let mut picked = Vec::with_capacity(k);

    for _ in 0..k {
        if !weights.iter().any(|&w| w > 0.0) {
            break;
        }
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| anyhow!("invalid sampling distribution: {e}"))?;
        let idx = dist.sample(rng);
        weights[idx] = 0.0;
        picked.push(idx);
    }

    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn log_softmax_normalizes() {
        let mut row = array![1.0f32, 2.0, 3.0];
        log_softmax_inplace(&mut row);
        let total: f32 = row.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(row[2] > row[1] && row[1] > row[0]);
    }

    #[test]
    fn repetition_penalty_pushes_seen_tokens_down() {
        let mut row = array![2.0f32, -2.0, 1.0];
        apply_repetition_penalty(&mut row, &[0, 1], 2.0);
        assert_eq!(row, array![1.0, -4.0, 1.0]);
    }

    #[test]
    fn bans_completion_of_seen_bigram() {
        let mut row = Array1::<f32>::zeros(6);
        // bigram (3, 4) already seen, sequence now ends with 3
        ban_repeated_ngrams(&mut row, &[0, 3, 4, 5, 3], 2);
        assert_eq!(row[4], f32::NEG_INFINITY);
        assert_eq!(row.iter().filter(|x| x.is_infinite()).count(), 1);
    }

    #[test]
    fn ngram_ban_needs_enough_history() {
        let mut row = Array1::<f32>::zeros(4);
        ban_repeated_ngrams(&mut row, &[1], 3);
        assert!(row.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn top_k_keeps_k_best() {
        let warped = warp(array![0.1f32, 0.5, 0.3, 0.9], 1.0, 2, 1.0);
        assert!(warped[1].is_finite() && warped[3].is_finite());
        assert!(warped[0].is_infinite() && warped[2].is_infinite());
    }

    #[test]
    fn top_p_keeps_at_least_the_best_token() {
        let warped = warp(array![10.0f32, 0.0, 0.0], 1.0, 0, 0.5);
        assert!(warped[0].is_finite());
        assert!(warped[1].is_infinite() && warped[2].is_infinite());
    }

    #[test]
    fn sampling_without_replacement_is_distinct() {
        let mut rng = StdRng::seed_from_u64(7);
        let picked = sample_without_replacement(&[0.25, 0.25, 0.5, 0.0], 4, &mut rng).unwrap();
        assert_eq!(picked.len(), 3);
        let mut sorted = picked.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
        assert!(!picked.contains(&3));
    }

    #[test]
    fn top_k_entries_skips_banned() {
        let entries = top_k_entries([f32::NEG_INFINITY, -1.0, -0.5], 3);
        assert_eq!(entries, vec![(2, -0.5), (1, -1.0)]);
    }
}
