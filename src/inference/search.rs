//! Beam search and beam sampling over an encoder-decoder's next-token logits.
//!
//! Lengths count decoder tokens including the decoder start token, and the
//! finished hypotheses are ranked by `score / len ^ length_penalty`, matching
//! the conventions the pretrained checkpoints were tuned with.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2};
use rand::{rngs::StdRng, SeedableRng};
use tracing::debug;

use super::generation::GenerationConfig;
use super::logits::{
    apply_repetition_penalty, ban_repeated_ngrams, log_softmax_inplace, sample_without_replacement,
    softmax, suppress_token, top_k_entries, warp,
};

/// Produces raw next-token logits for a batch of decoder prefixes.
pub trait NextTokenScores {
    /// Returns one row per prefix, in order. All prefixes share a length.
    fn next_token_logits(&mut self, prefixes: &[Vec<u32>]) -> Result<Array2<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub decoder_start: u32,
    pub eos: u32,
}

/// Runs the configured search and returns `num_return_sequences` token
/// sequences without the decoder start token or EOS.
pub fn generate<S>(
    scorer: &mut S,
    special: SpecialTokens,
    config: &GenerationConfig,
) -> Result<Vec<Vec<u32>>>
where
    S: NextTokenScores + ?Sized,
{
    config.validate()?;

    if config.sampling_enabled {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        (0..config.num_return_sequences)
            .map(|_| {
                let finished = beam_search(scorer, special, config, Some(&mut rng))?;
                Ok(finished.into_best(1).into_iter().next().unwrap_or_default())
            })
            .collect()
    } else {
        let finished = beam_search(scorer, special, config, None)?;
        Ok(finished.into_best(config.num_return_sequences))
    }
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

impl Beam {
    fn normalized_score(&self, length_penalty: f32) -> f32 {
        self.score / (self.tokens.len() as f32).powf(length_penalty)
    }
}

struct Candidate {
    beam: usize,
    token: u32,
    score: f32,
}

struct FinishedHypotheses {
    hypotheses: Vec<Beam>,
    num_beams: usize,
    length_penalty: f32,
    worst_score: f32,
}

impl FinishedHypotheses {
    fn new(num_beams: usize, length_penalty: f32) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            worst_score: f32::INFINITY,
        }
    }

    fn add(&mut self, beam: Beam) {
        if !beam.score.is_finite() {
            return;
        }
        let score = beam.normalized_score(self.length_penalty);
        if self.hypotheses.len() < self.num_beams || score > self.worst_score {
            self.hypotheses.push(beam);
            let lp = self.length_penalty;
            self.hypotheses
                .sort_by(|a, b| b.normalized_score(lp).total_cmp(&a.normalized_score(lp)));
            self.hypotheses.truncate(self.num_beams);
            self.worst_score = self
                .hypotheses
                .last()
                .map(|h| h.normalized_score(lp))
                .unwrap_or(f32::INFINITY);
        }
    }

    /// No live beam of length `cur_len` can still beat the worst kept hypothesis.
    fn is_done(&self, best_live_score: f32, cur_len: usize) -> bool {
        if self.hypotheses.len() < self.num_beams {
            return false;
        }
        let attainable = best_live_score / (cur_len as f32).powf(self.length_penalty);
        self.worst_score >= attainable
    }

    fn into_best(self, n: usize) -> Vec<Vec<u32>> {
        self.hypotheses
            .into_iter()
            .take(n)
            .map(|h| h.tokens.into_iter().skip(1).collect())
            .collect()
    }
}

fn beam_search<S>(
    scorer: &mut S,
    special: SpecialTokens,
    config: &GenerationConfig,
    mut sampler: Option<&mut StdRng>,
) -> Result<FinishedHypotheses>
where
    S: NextTokenScores + ?Sized,
{
    let num_beams = config.num_beams;
    let mut finished = FinishedHypotheses::new(num_beams, config.length_penalty);
    let mut beams = vec![Beam {
        tokens: vec![special.decoder_start],
        score: 0.0,
    }];
    let mut cur_len = 1usize;
    let mut converged = false;

    while cur_len < config.max_length {
        let prefixes: Vec<Vec<u32>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let mut scores = scorer.next_token_logits(&prefixes)?;
        if scores.nrows() != beams.len() {
            bail!(
                "scorer returned {} rows for {} beams",
                scores.nrows(),
                beams.len()
            );
        }

        for (mut row, beam) in scores.outer_iter_mut().zip(&beams) {
            log_softmax_inplace(&mut row);
            apply_repetition_penalty(&mut row, &beam.tokens, config.repetition_penalty);
            ban_repeated_ngrams(&mut row, &beam.tokens, config.no_repeat_ngram_size);
            if cur_len < config.min_length {
                suppress_token(&mut row, special.eos);
            }
        }

        let candidates = match sampler.as_deref_mut() {
            Some(rng) => sampled_candidates(&scores, &beams, config, rng)?,
            None => best_candidates(&scores, &beams, 2 * num_beams),
        };

        let mut next = Vec::with_capacity(num_beams);
        for (rank, candidate) in candidates.into_iter().enumerate() {
            let source = &beams[candidate.beam];
            if candidate.token == special.eos {
                if rank < num_beams {
                    finished.add(Beam {
                        tokens: source.tokens.clone(),
                        score: candidate.score,
                    });
                }
                continue;
            }

            let mut tokens = source.tokens.clone();
            tokens.push(candidate.token);
            next.push(Beam {
                tokens,
                score: candidate.score,
            });
            if next.len() == num_beams {
                break;
            }
        }

        cur_len += 1;
        beams = next;

        let Some(best_live) = beams.first().map(|b| b.score) else {
            converged = true;
            break;
        };
        if finished.is_done(best_live, cur_len) {
            converged = true;
            break;
        }
    }

    if !converged {
        for beam in beams {
            finished.add(beam);
        }
    }

    debug!(
        hypotheses = finished.hypotheses.len(),
        steps = cur_len - 1,
        sampled = sampler.is_some(),
        "beam search finished"
    );

    Ok(finished)
}

fn best_candidates(scores: &Array2<f32>, beams: &[Beam], k: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = scores
        .outer_iter()
        .zip(beams)
        .enumerate()
        .flat_map(|(beam_idx, (row, beam))| {
            top_k_entries(row.iter().copied(), k)
                .into_iter()
                .map(move |(token, logprob)| Candidate {
                    beam: beam_idx,
                    token: token as u32,
                    score: beam.score + logprob,
                })
        })
        .collect();

    candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(k);
    candidates
}

/// Warps each beam's cumulative scores, then draws candidates from the joint
/// distribution over all beams. Candidates keep their unwarped scores.
fn sampled_candidates(
    scores: &Array2<f32>,
    beams: &[Beam],
    config: &GenerationConfig,
    rng: &mut StdRng,
) -> Result<Vec<Candidate>> {
    let vocab = scores.ncols();
    let mut cumulative = Vec::with_capacity(beams.len() * vocab);
    let mut warped = Vec::with_capacity(beams.len() * vocab);

    for (row, beam) in scores.outer_iter().zip(beams) {
        let total = row.mapv(|x| x + beam.score);
        let filtered = warp(total.clone(), config.temperature, config.top_k, config.top_p);
        cumulative.extend(total.iter().copied());
        warped.extend(filtered.iter().copied());
    }

    let probs = softmax(&Array1::from(warped));
    let draws = if config.num_beams == 1 {
        1
    } else {
        2 * config.num_beams
    };

    let mut candidates: Vec<Candidate> = sample_without_replacement(&probs.to_vec(), draws, rng)?
        .into_iter()
        .filter(|&idx| cumulative[idx].is_finite())
        .map(|idx| Candidate {
            beam: idx / vocab,
            token: (idx % vocab) as u32,
            score: cumulative[idx],
        })
        .collect();

    candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    const START: u32 = 0;
    const EOS: u32 = 1;
    const VOCAB: usize = 6;

    const SPECIAL: SpecialTokens = SpecialTokens {
        decoder_start: START,
        eos: EOS,
    };

    struct FnScorer<F> {
        logits: F,
        calls: usize,
    }

    impl<F> FnScorer<F>
    where
        F: FnMut(&[u32]) -> Vec<f32>,
    {
        fn new(logits: F) -> Self {
            Self { logits, calls: 0 }
        }
    }

    impl<F> NextTokenScores for FnScorer<F>
    where
        F: FnMut(&[u32]) -> Vec<f32>,
    {
        fn next_token_logits(&mut self, prefixes: &[Vec<u32>]) -> Result<Array2<f32>> {
            self.calls += 1;
            let mut out = Array2::zeros((prefixes.len(), VOCAB));
            for (i, prefix) in prefixes.iter().enumerate() {
                let row = (self.logits)(prefix);
                out.row_mut(i).assign(&Array1::from(row));
            }
            Ok(out)
        }
    }

    fn favour(token: u32) -> Vec<f32> {
        let mut row = vec![0.0; VOCAB];
        row[token as usize] = 5.0;
        row
    }

    /// 0 -> 2 -> 3 -> EOS is the only confident path.
    fn chain(prefix: &[u32]) -> Vec<f32> {
        match prefix.last() {
            Some(&START) => favour(2),
            Some(&2) => favour(3),
            _ => favour(EOS),
        }
    }

    fn plain_config() -> GenerationConfig {
        GenerationConfig {
            min_length: 0,
            max_length: 10,
            num_beams: 1,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            no_repeat_ngram_size: 0,
            use_cache: true,
            sampling_enabled: false,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            num_return_sequences: 1,
            seed: None,
        }
    }

    #[test]
    fn beam_search_follows_most_likely_path() {
        let cfg = GenerationConfig {
            num_beams: 3,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(chain);
        let out = generate(&mut scorer, SPECIAL, &cfg).unwrap();
        assert_eq!(out, vec![vec![2, 3]]);
    }

    #[test]
    fn min_length_suppresses_early_eos() {
        let cfg = GenerationConfig {
            min_length: 5,
            num_beams: 2,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(chain);
        let out = generate(&mut scorer, SPECIAL, &cfg).unwrap();
        assert!(out[0].len() >= 4, "got {:?}", out[0]);
        assert!(!out[0].contains(&EOS));
    }

    #[test]
    fn max_length_caps_output() {
        let cfg = GenerationConfig {
            max_length: 4,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(|_: &[u32]| {
            let mut row = favour(4);
            row[EOS as usize] = -10.0;
            row
        });
        let out = generate(&mut scorer, SPECIAL, &cfg).unwrap();
        assert_eq!(out[0].len(), 3);
        assert_eq!(scorer.calls, 3);
    }

    #[test]
    fn zero_length_budget_generates_nothing() {
        let cfg = GenerationConfig {
            max_length: 0,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(chain);
        let out = generate(&mut scorer, SPECIAL, &cfg).unwrap();
        assert_eq!(out, vec![Vec::<u32>::new()]);
        assert_eq!(scorer.calls, 0);
    }

    #[test]
    fn no_repeat_ngram_prevents_repeated_bigrams() {
        let cfg = GenerationConfig {
            max_length: 8,
            no_repeat_ngram_size: 2,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(|_: &[u32]| {
            let mut row = favour(2);
            row[EOS as usize] = -10.0;
            row
        });
        let out = generate(&mut scorer, SPECIAL, &cfg).unwrap();
        let mut seq = vec![START];
        seq.extend(&out[0]);
        let bigrams: Vec<_> = seq.windows(2).collect();
        for (i, a) in bigrams.iter().enumerate() {
            assert!(!bigrams[i + 1..].contains(a), "repeated bigram {a:?} in {seq:?}");
        }
    }

    #[test]
    fn repetition_penalty_moves_to_second_choice() {
        let cfg = GenerationConfig {
            max_length: 3,
            repetition_penalty: 10.0,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(|_: &[u32]| vec![0.0, -5.0, 2.0, 1.8, 0.0, 0.0]);
        let out = generate(&mut scorer, SPECIAL, &cfg).unwrap();
        assert_eq!(out[0], vec![2, 3]);
    }

    #[test]
    fn sampling_returns_requested_candidates_reproducibly() {
        let cfg = GenerationConfig {
            max_length: 6,
            num_beams: 2,
            sampling_enabled: true,
            num_return_sequences: 3,
            top_k: 4,
            top_p: 0.95,
            seed: Some(42),
            ..plain_config()
        };
        let flat = |_: &[u32]| vec![0.0, -1.0, 0.5, 0.4, 0.3, 0.2];

        let first = generate(&mut FnScorer::new(flat), SPECIAL, &cfg).unwrap();
        let second = generate(&mut FnScorer::new(flat), SPECIAL, &cfg).unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(first.iter().all(|seq| seq.len() <= 5));
    }

    #[test]
    fn scorer_errors_propagate() {
        struct Broken;
        impl NextTokenScores for Broken {
            fn next_token_logits(&mut self, _: &[Vec<u32>]) -> Result<Array2<f32>> {
                Err(anyhow!("out of memory"))
            }
        }

        let err = generate(&mut Broken, SPECIAL, &plain_config()).unwrap_err();
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn invalid_config_is_rejected_before_scoring() {
        let cfg = GenerationConfig {
            num_beams: 0,
            ..plain_config()
        };
        let mut scorer = FnScorer::new(chain);
        assert!(generate(&mut scorer, SPECIAL, &cfg).is_err());
        assert_eq!(scorer.calls, 0);
    }
}
