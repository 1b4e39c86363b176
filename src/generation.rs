//! Beam-search decoding
//!
//! Explores several partial output sequences in parallel, keeping the
//! top-scoring subset at each step. The decoder is abstracted behind
//! `DecoderStep` so the search is independent of the concrete model: the
//! model wrapper implements it over the candle T5 decoder, and tests drive it
//! with scripted logits. A beam count of 1 degenerates to greedy decoding.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor, D};

/// One decoding step over the active hypotheses.
pub trait DecoderStep {
    /// Next-token logits for each active hypothesis.
    ///
    /// `decoder_ids` is `[hypotheses, cur_len]` (U32); the result must be
    /// `[hypotheses, vocab]` logits, or `[hypotheses, cur_len, vocab]` from
    /// which the last position is taken.
    fn step(&mut self, decoder_ids: &Tensor) -> Result<Tensor>;
}

/// Beam-search parameters.
#[derive(Debug, Clone)]
pub struct BeamSearchConfig {
    /// Number of hypotheses kept per step.
    pub num_beams: usize,
    /// Maximum generated tokens (excluding the decoder start token).
    pub max_length: usize,
    /// Token the decoder sequence starts from.
    pub decoder_start_id: u32,
    /// Token that finishes a hypothesis.
    pub eos_id: u32,
    /// Exponent on the length normalization of finished scores.
    pub length_penalty: f64,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    /// Tokens including the start token.
    tokens: Vec<u32>,
    sum_logprob: f64,
}

impl Hypothesis {
    fn score(&self, length_penalty: f64) -> f64 {
        // Generated length excludes the start token.
        let len = (self.tokens.len() - 1).max(1) as f64;
        self.sum_logprob / len.powf(length_penalty)
    }
}

/// Run beam search for a single input, returning the best generated token
/// sequence (start token excluded, eos included when emitted).
pub fn beam_search(
    step: &mut dyn DecoderStep,
    device: &Device,
    config: &BeamSearchConfig,
) -> Result<Vec<u32>> {
    ensure!(config.num_beams > 0, "num_beams must be at least 1");

    let mut active = vec![Hypothesis {
        tokens: vec![config.decoder_start_id],
        sum_logprob: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    for _ in 0..config.max_length {
        if active.is_empty() || finished.len() >= config.num_beams {
            break;
        }

        let rows = active.len();
        let cur_len = active[0].tokens.len();
        let flat: Vec<u32> = active.iter().flat_map(|h| h.tokens.iter().copied()).collect();
        let decoder_ids = Tensor::from_vec(flat, (rows, cur_len), device)?;

        let logits = step.step(&decoder_ids)?;
        let logits = if logits.dims().len() == 3 {
            let len = logits.dim(1)?;
            logits.narrow(1, len - 1, 1)?.squeeze(1)?
        } else {
            logits
        };
        let logprobs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        let logprobs = logprobs.to_vec2::<f32>()?;

        // Expand each hypothesis by its best continuations; 2x the beam
        // count so eos candidates cannot starve the active set.
        let mut candidates: Vec<(usize, u32, f64)> = Vec::new();
        for (i, row) in logprobs.iter().enumerate() {
            let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (token, logprob) in indexed.into_iter().take(2 * config.num_beams) {
                candidates.push((i, token as u32, active[i].sum_logprob + logprob as f64));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut next_active = Vec::with_capacity(config.num_beams);
        for (rank, (source, token, sum_logprob)) in candidates.into_iter().enumerate() {
            if token == config.eos_id {
                // Eos may only finish a hypothesis that still ranks within
                // the beam; weaker eos candidates are discarded, not queued.
                if rank < config.num_beams && finished.len() < config.num_beams {
                    let mut tokens = active[source].tokens.clone();
                    tokens.push(config.eos_id);
                    finished.push(Hypothesis { tokens, sum_logprob });
                }
            } else if next_active.len() < config.num_beams {
                let mut tokens = active[source].tokens.clone();
                tokens.push(token);
                next_active.push(Hypothesis { tokens, sum_logprob });
            }
            // Any admissible eos has rank below num_beams and is seen before
            // the active set fills.
            if next_active.len() == config.num_beams {
                break;
            }
        }
        active = next_active;
    }

    let best = finished
        .into_iter()
        .chain(active)
        .max_by(|a, b| {
            a.score(config.length_penalty)
                .partial_cmp(&b.score(config.length_penalty))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|h| h.tokens[1..].to_vec())
        .unwrap_or_default();

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 5;
    const EOS: u32 = 4;

    /// Scripted decoder: next-token logits depend only on the last token of
    /// each hypothesis.
    struct Scripted {
        table: fn(last: u32) -> [f32; VOCAB],
    }

    impl DecoderStep for Scripted {
        fn step(&mut self, decoder_ids: &Tensor) -> Result<Tensor> {
            let rows = decoder_ids.to_vec2::<u32>()?;
            let mut flat = Vec::with_capacity(rows.len() * VOCAB);
            for row in &rows {
                flat.extend_from_slice(&(self.table)(*row.last().unwrap()));
            }
            Ok(Tensor::from_vec(
                flat,
                (rows.len(), VOCAB),
                decoder_ids.device(),
            )?)
        }
    }

    fn config(num_beams: usize) -> BeamSearchConfig {
        BeamSearchConfig {
            num_beams,
            max_length: 8,
            decoder_start_id: 0,
            eos_id: EOS,
            length_penalty: 1.0,
        }
    }

    #[test]
    fn test_greedy_follows_argmax() {
        // start -> 2 -> 3 -> eos
        fn table(last: u32) -> [f32; VOCAB] {
            match last {
                0 => [0.0, 1.0, 5.0, 0.0, 0.0],
                2 => [0.0, 0.0, 0.0, 5.0, 0.0],
                _ => [0.0, 0.0, 0.0, 0.0, 5.0],
            }
        }
        let mut step = Scripted { table };
        let tokens = beam_search(&mut step, &Device::Cpu, &config(1)).unwrap();
        assert_eq!(tokens, vec![2, 3, EOS]);
    }

    #[test]
    fn test_beam_recovers_delayed_reward_path() {
        // Greedy prefers token 1 first, but the path through token 2 earns a
        // much higher continuation probability.
        fn table(last: u32) -> [f32; VOCAB] {
            match last {
                0 => [0.0, 2.0, 1.8, 0.0, 0.0],
                1 => [1.0, 1.0, 1.0, 1.0, 1.2],
                2 => [0.0, 0.0, 0.0, 9.0, 0.0],
                3 => [0.0, 0.0, 0.0, 0.0, 9.0],
                _ => [0.0, 0.0, 0.0, 0.0, 9.0],
            }
        }
        let greedy = beam_search(&mut Scripted { table }, &Device::Cpu, &config(1)).unwrap();
        assert_eq!(greedy[0], 1);

        let beamed = beam_search(&mut Scripted { table }, &Device::Cpu, &config(3)).unwrap();
        assert_eq!(beamed, vec![2, 3, EOS]);
    }

    #[test]
    fn test_weak_early_eos_does_not_end_search() {
        // Eos is scored below the surviving beams at every early step; it
        // must not fill the finished quota and cut the search short of the
        // path that finishes properly through token 3.
        fn table(last: u32) -> [f32; VOCAB] {
            match last {
                0 => [0.0, 2.0, 1.5, 0.0, 1.0],
                1 => [0.0, 0.0, 0.0, 3.0, 1.0],
                2 => [0.0, 0.0, 0.0, 2.0, 1.0],
                _ => [0.0, 0.0, 0.0, 0.0, 7.0],
            }
        }
        let mut step = Scripted { table };
        let tokens = beam_search(&mut step, &Device::Cpu, &config(2)).unwrap();
        assert_eq!(tokens, vec![1, 3, EOS]);
    }

    #[test]
    fn test_max_length_caps_generation() {
        // Never emits eos.
        fn table(_last: u32) -> [f32; VOCAB] {
            [0.0, 5.0, 0.0, 0.0, 0.0]
        }
        let mut step = Scripted { table };
        let tokens = beam_search(&mut step, &Device::Cpu, &config(2)).unwrap();
        assert_eq!(tokens.len(), 8);
        assert!(tokens.iter().all(|&t| t == 1));
    }

    #[test]
    fn test_zero_beams_rejected() {
        fn table(_last: u32) -> [f32; VOCAB] {
            [0.0; VOCAB]
        }
        let mut step = Scripted { table };
        let mut cfg = config(1);
        cfg.num_beams = 0;
        assert!(beam_search(&mut step, &Device::Cpu, &cfg).is_err());
    }
}
