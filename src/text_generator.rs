use std::collections::{HashMap, VecDeque};

use log::debug;
use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::common::softmax;
use crate::config::GenerationConfig;
use crate::model::{GrowingNetwork, CONTEXT_WINDOW};

/// Most recent characters kept as generation context.
pub const MAX_CONTEXT: usize = 20;
/// Sentence punctuation only ends generation once this many characters are out.
pub const SENTENCE_STOP_AFTER: usize = 20;
/// A space only ends generation once this many characters are out.
pub const SPACE_STOP_AFTER: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Seeded,
    Emitting,
    Stopped,
}

/// Lazily sampled continuation of a seed. Each call to `next` runs one
/// forward pass over the last [`CONTEXT_WINDOW`] context characters.
pub struct Generation<'a> {
    net: &'a mut GrowingNetwork,
    config: GenerationConfig,
    context: VecDeque<usize>,
    counts: HashMap<usize, usize>,
    emitted: usize,
    state: GenerationState,
}

impl<'a> Generation<'a> {
    pub fn new(net: &'a mut GrowingNetwork, seed: &str, config: GenerationConfig) -> Self {
        let encoded = net.vocab().encode(seed);
        let mut context: VecDeque<usize> = encoded
            .iter()
            .skip(encoded.len().saturating_sub(MAX_CONTEXT))
            .copied()
            .collect();

        let mut state = GenerationState::Seeded;
        if context.is_empty() {
            let vocab_size = net.vocab_size();
            if vocab_size == 0 {
                state = GenerationState::Stopped;
            } else {
                context.push_back(net.rng.gen_range(0..vocab_size));
            }
        }
        if config.max_length == 0 {
            state = GenerationState::Stopped;
        }

        Self {
            net,
            config,
            context,
            counts: HashMap::new(),
            emitted: 0,
            state,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    fn sample_next(&mut self) -> Option<usize> {
        let window: Vec<usize> = self
            .context
            .iter()
            .skip(self.context.len().saturating_sub(CONTEXT_WINDOW))
            .copied()
            .collect();
        let probs = self.net.forward(&window);
        let last_row = probs.nrows().checked_sub(1)?;
        let next_probs = probs.row(last_row).to_owned();

        let epsilon = self.net.optimizer().epsilon;
        let dist = sampling_distribution(&next_probs, &self.counts, &self.config, epsilon);
        Some(sample_index(&dist, &mut self.net.rng))
    }

    fn should_stop(&self, c: char) -> bool {
        c == '\n'
            || (matches!(c, '.' | '!' | '?') && self.emitted > SENTENCE_STOP_AFTER)
            || (c == ' ' && self.emitted > SPACE_STOP_AFTER)
            || self.emitted >= self.config.max_length
    }
}

impl Iterator for Generation<'_> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        if self.state == GenerationState::Stopped {
            return None;
        }
        self.state = GenerationState::Emitting;

        let Some(idx) = self.sample_next() else {
            self.state = GenerationState::Stopped;
            return None;
        };
        let Some(c) = self.net.vocab().char_at(idx) else {
            self.state = GenerationState::Stopped;
            return None;
        };

        self.emitted += 1;
        *self.counts.entry(idx).or_insert(0) += 1;
        self.context.push_back(idx);
        while self.context.len() > MAX_CONTEXT {
            self.context.pop_front();
        }

        if self.should_stop(c) {
            self.state = GenerationState::Stopped;
        }
        Some(c)
    }
}

impl GrowingNetwork {
    /// Starts a lazy generation from `seed`. Unknown seed characters are
    /// dropped; if none remain a random vocabulary character seeds the context.
    pub fn generation(&mut self, seed: &str, config: GenerationConfig) -> Generation<'_> {
        Generation::new(self, seed, config)
    }

    pub fn generate(&mut self, seed: &str, config: &GenerationConfig) -> String {
        let text: String = self.generation(seed, *config).collect();
        debug!("generated {} characters from seed {:?}", text.chars().count(), seed);
        text
    }
}

/// Turns raw next-character probabilities into the distribution actually
/// sampled from: temperature in log space, repetition penalty on characters
/// already emitted, softmax, then the nucleus (top-p) cut.
pub fn sampling_distribution(
    probs: &Array1<f32>,
    counts: &HashMap<usize, usize>,
    config: &GenerationConfig,
    epsilon: f32,
) -> Array1<f32> {
    let temperature = config.temperature.max(1e-6);
    let mut logits = probs.mapv(|p| (p + epsilon).ln() / temperature);

    if config.repetition_penalty > 1.0 {
        for (&idx, &count) in counts {
            if idx >= logits.len() {
                continue;
            }
            let factor = config.repetition_penalty * count as f32;
            let logit = logits[idx];
            logits[idx] = if logit > 0.0 { logit / factor } else { logit * factor };
        }
    }

    let mut dist = softmax(&logits, epsilon);
    nucleus_filter(&mut dist, config.top_p);
    dist
}

/// Keeps the smallest set of most-probable entries whose mass exceeds
/// `top_p` (always at least one), zeroes the rest and renormalizes.
pub fn nucleus_filter(dist: &mut Array1<f32>, top_p: f32) {
    if dist.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..dist.len()).collect();
    order.sort_by(|&a, &b| dist[b].total_cmp(&dist[a]));

    let mut keep = vec![false; dist.len()];
    let mut cumulative = 0.0;
    for &idx in &order {
        keep[idx] = true;
        cumulative += dist[idx];
        if cumulative > top_p {
            break;
        }
    }

    for (p, kept) in dist.iter_mut().zip(&keep) {
        if !kept {
            *p = 0.0;
        }
    }
    let total = dist.sum();
    if total > 0.0 {
        dist.mapv_inplace(|p| p / total);
    }
}

/// Draws an index from `dist`, falling back to the argmax when the weights
/// cannot form a distribution.
pub fn sample_index<R: Rng + ?Sized>(dist: &Array1<f32>, rng: &mut R) -> usize {
    match WeightedIndex::new(dist.iter()) {
        Ok(weighted) => weighted.sample(rng),
        Err(_) => argmax(dist),
    }
}

fn argmax(data: &Array1<f32>) -> usize {
    let mut max_val = f32::NEG_INFINITY;
    let mut max_idx = 0;
    for (i, &val) in data.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = i;
        }
    }
    max_idx
}
