use std::cmp::Ordering;

use super::GenerationError;

/// Supplies next-token log-probabilities for one beam.
///
/// `State` is whatever the model needs to continue a sequence (a KV cache and
/// position); it is cloned when a beam forks.
pub trait BeamScorer {
    type State: Clone;

    /// Feeds `tokens` after everything already consumed by `state` and returns
    /// log-probabilities over the vocabulary for the following position.
    fn next_log_probs(
        &self,
        state: &mut Self::State,
        tokens: &[u32]
    ) -> Result<Vec<f32>, GenerationError>;
}

struct Beam<S> {
    tokens: Vec<u32>,
    score: f32,
    state: S,
    log_probs: Vec<f32>,
}

struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

fn normalized(score: f32, len: usize) -> f32 {
    score / (len.max(1) as f32)
}

fn top_k(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .map(|(i, lp)| (i as u32, *lp))
        .collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);
    indexed
}

/// Deterministic beam search over generated tokens only; the prompt is fed once.
/// Finished hypotheses are ranked by length-normalized log-probability.
pub fn beam_search<S: BeamScorer>(
    scorer: &S,
    initial: S::State,
    prompt: &[u32],
    num_beams: usize,
    max_new_tokens: usize,
    eos: &[u32]
) -> Result<Vec<u32>, GenerationError> {
    let num_beams = num_beams.max(1);
    let mut state = initial;
    let log_probs = scorer.next_log_probs(&mut state, prompt)?;
    let mut alive = vec![Beam { tokens: Vec::new(), score: 0.0, state, log_probs }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    for step in 0..max_new_tokens {
        let mut candidates: Vec<(usize, u32, f32)> = Vec::new();
        for (beam_idx, beam) in alive.iter().enumerate() {
            for (token, lp) in top_k(&beam.log_probs, 2 * num_beams) {
                candidates.push((beam_idx, token, beam.score + lp));
            }
        }
        candidates.sort_unstable_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let last_step = step + 1 == max_new_tokens;
        let mut next_alive = Vec::with_capacity(num_beams);
        let mut accepted = 0;
        for (beam_idx, token, score) in candidates {
            if accepted == num_beams {
                break;
            }
            let mut tokens = alive[beam_idx].tokens.clone();
            if eos.contains(&token) {
                finished.push(Hypothesis { score: normalized(score, tokens.len() + 1), tokens });
                continue;
            }
            tokens.push(token);
            accepted += 1;
            if last_step {
                finished.push(Hypothesis { score: normalized(score, tokens.len()), tokens });
                continue;
            }
            let mut state = alive[beam_idx].state.clone();
            let log_probs = scorer.next_log_probs(&mut state, &[token])?;
            next_alive.push(Beam { tokens, score, state, log_probs });
        }
        alive = next_alive;

        if alive.is_empty() {
            break;
        }
        if finished.len() >= num_beams {
            let best_finished = finished
                .iter()
                .map(|h| h.score)
                .fold(f32::NEG_INFINITY, f32::max);
            let best_alive = alive
                .iter()
                .map(|b| normalized(b.score, b.tokens.len()))
                .fold(f32::NEG_INFINITY, f32::max);
            if best_finished >= best_alive {
                break;
            }
        }
    }

    for beam in alive {
        let score = normalized(beam.score, beam.tokens.len());
        finished.push(Hypothesis { tokens: beam.tokens, score });
    }

    Ok(
        finished
            .into_iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
            .map(|h| h.tokens)
            .unwrap_or_default()
    )
}
