use std::fmt;

use log::debug;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::common::{causal_mean_pool, causal_mean_unpool, positional_encoding, softmax_rows, swish, swish_grad};
use crate::config::NetConfig;
use crate::params::ParameterStore;
use crate::tokenizer::CharVocab;
use crate::training::{cross_entropy_grad, cross_entropy_loss, AdamOptimizer, Gradients};

/// Width of the causal averaging window.
pub const CONTEXT_WINDOW: usize = 10;

/// Called with the new hidden width after every hidden-layer expansion.
pub type GrowthHook = Box<dyn FnMut(usize) + Send>;

/// Intermediate values of one forward pass, kept for the backward pass.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    pub pre_activation: Array2<f32>,
    pub hidden: Array2<f32>,
    pub probs: Array2<f32>,
}

/// A character-level network that learns online and widens itself as it reads.
///
/// Methods here take `&mut self` and do no locking; [`crate::brain::Brain`]
/// is the shareable, lock-guarded handle.
pub struct GrowingNetwork {
    pub(crate) vocab: CharVocab,
    pub(crate) params: ParameterStore,
    pub(crate) optimizer: AdamOptimizer,
    pub(crate) step: u64,
    pub(crate) interactions: u64,
    pub(crate) characters_total: u64,
    pub(crate) rng: StdRng,
    pub(crate) growth_hook: Option<GrowthHook>,
}

impl fmt::Debug for GrowingNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowingNetwork")
            .field("vocab_size", &self.vocab.len())
            .field("hidden_size", &self.params.hidden_size())
            .field("step", &self.step)
            .field("interactions", &self.interactions)
            .field("characters_total", &self.characters_total)
            .field("learning_rate", &self.optimizer.learning_rate)
            .finish()
    }
}

impl GrowingNetwork {
    pub fn new(vocabulary: &str, hidden_size: usize) -> Self {
        Self::with_config(vocabulary, hidden_size, &NetConfig::default())
    }

    pub fn with_config(vocabulary: &str, hidden_size: usize, config: &NetConfig) -> Self {
        Self::from_rng(vocabulary, hidden_size, config, StdRng::from_entropy())
    }

    /// Deterministic construction for tests and reproducible runs.
    pub fn seeded(vocabulary: &str, hidden_size: usize, seed: u64) -> Self {
        Self::from_rng(vocabulary, hidden_size, &NetConfig::default(), StdRng::seed_from_u64(seed))
    }

    /// Panics if `hidden_size` is zero.
    pub fn from_rng(vocabulary: &str, hidden_size: usize, config: &NetConfig, mut rng: StdRng) -> Self {
        assert!(hidden_size > 0, "hidden_size must be at least 1");
        let vocab = CharVocab::from_text(vocabulary);
        let params = ParameterStore::new(vocab.len(), hidden_size, &mut rng);
        Self {
            vocab,
            params,
            optimizer: AdamOptimizer::from_config(config),
            step: 0,
            interactions: 0,
            characters_total: 0,
            rng,
            growth_hook: None,
        }
    }

    pub fn vocab(&self) -> &CharVocab {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.params.hidden_size()
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn interactions(&self) -> u64 {
        self.interactions
    }

    pub fn characters_total(&self) -> u64 {
        self.characters_total
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate
    }

    pub fn optimizer(&self) -> &AdamOptimizer {
        &self.optimizer
    }

    pub fn set_growth_hook(&mut self, hook: GrowthHook) {
        self.growth_hook = Some(hook);
    }

    pub fn clear_growth_hook(&mut self) {
        self.growth_hook = None;
    }

    /// Reseeds the sampling/initialisation RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Next-character distribution for every position of `indices`, `L × V`;
    /// row `i` belongs to `indices[i]`.
    ///
    /// Panics if an index is outside the vocabulary.
    pub fn forward(&self, indices: &[usize]) -> Array2<f32> {
        let vocab_size = self.vocab_size();
        if let Some(&bad) = indices.iter().find(|&&i| i >= vocab_size) {
            panic!("index {} out of range for vocabulary of {}", bad, vocab_size);
        }
        self.forward_trace(indices).probs
    }

    pub(crate) fn forward_trace(&self, indices: &[usize]) -> ForwardTrace {
        let len = indices.len();
        let hidden_size = self.hidden_size();

        let embedded = self.params.w_embed.select(Axis(0), indices);
        let pooled = causal_mean_pool(&embedded, CONTEXT_WINDOW);
        let pre_activation = pooled + positional_encoding(len, hidden_size) + &self.params.b_hidden;
        let hidden = pre_activation.mapv(swish);
        let logits = hidden.dot(&self.params.w_out) + &self.params.b_out;
        let probs = softmax_rows(&logits, self.optimizer.epsilon);

        ForwardTrace {
            pre_activation,
            hidden,
            probs,
        }
    }

    /// Loss and gradients for predicting `targets[i]` from `inputs[..=i]`.
    pub fn gradients(&self, inputs: &[usize], targets: &[usize]) -> (f32, Gradients) {
        let trace = self.forward_trace(inputs);
        let loss = cross_entropy_loss(&trace.probs, targets, self.optimizer.epsilon);

        let d_logits = cross_entropy_grad(&trace.probs, targets);
        let w_out = trace.hidden.t().dot(&d_logits);
        let b_out = d_logits.sum_axis(Axis(0)).insert_axis(Axis(0));

        let d_hidden = d_logits.dot(&self.params.w_out.t());
        let d_pre = d_hidden * trace.pre_activation.mapv(swish_grad);
        let b_hidden = d_pre.sum_axis(Axis(0)).insert_axis(Axis(0));

        let d_embedded = causal_mean_unpool(&d_pre, CONTEXT_WINDOW);
        let mut w_embed = Array2::<f32>::zeros(self.params.w_embed.dim());
        for (row, &idx) in d_embedded.axis_iter(Axis(0)).zip(inputs) {
            w_embed.row_mut(idx).scaled_add(1.0, &row);
        }

        (
            loss,
            Gradients {
                w_embed,
                w_out,
                b_hidden,
                b_out,
            },
        )
    }

    /// Trains on `text` for `epochs` passes. New characters are added to the
    /// vocabulary first; texts with fewer than two characters only count as an
    /// interaction. A given `learning_rate` replaces the stored one.
    /// Returns the loss of the last epoch, if any training happened.
    pub fn learn(&mut self, text: &str, epochs: usize, learning_rate: Option<f32>) -> Option<f32> {
        if let Some(lr) = learning_rate {
            self.optimizer.learning_rate = lr;
        }
        self.interactions += 1;
        self.absorb_vocabulary(text);

        let indices = self.vocab.encode(text);
        if indices.len() < 2 {
            return None;
        }
        let inputs = &indices[..indices.len() - 1];
        let targets = &indices[1..];

        let mut last_loss = None;
        for _ in 0..epochs {
            self.step += 1;
            let (loss, grads) = self.gradients(inputs, targets);
            self.optimizer.step(&mut self.params, &grads, self.step);
            last_loss = Some(loss);
        }
        debug!(
            "learned {} positions x {} epochs (step {}, loss {:?})",
            inputs.len(),
            epochs,
            self.step,
            last_loss
        );

        if epochs > 0 {
            self.advance_character_count(inputs.len());
        }
        last_loss
    }

    /// Mean probability the network assigns to each actual next character of
    /// `text`. 0.0 for empty text, 0.5 when there is nothing to predict.
    pub fn confidence(&self, text: &str) -> f32 {
        if text.is_empty() {
            return 0.0;
        }
        let indices = self.vocab.encode(text);
        if indices.len() < 2 {
            return 0.5;
        }
        let probs = self.forward(&indices[..indices.len() - 1]);
        let total: f32 = indices[1..]
            .iter()
            .enumerate()
            .map(|(row, &next)| probs[[row, next]])
            .sum();
        total / (indices.len() - 1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn loss_of(net: &GrowingNetwork, inputs: &[usize], targets: &[usize]) -> f64 {
        let probs = net.forward(inputs);
        let total: f64 = targets
            .iter()
            .enumerate()
            .map(|(row, &t)| -((probs[[row, t]] + 1e-8) as f64).ln())
            .sum();
        total / targets.len() as f64
    }

    #[test]
    fn test_forward_rows_are_distributions() {
        let net = GrowingNetwork::seeded("abc. ", 8, 11);
        let probs = net.forward(&[0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1]);
        assert_eq!(probs.dim(), (12, 5));
        for row in probs.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn test_forward_is_causal() {
        let net = GrowingNetwork::seeded("abcd", 6, 12);
        let short = net.forward(&[0, 1, 2]);
        let long = net.forward(&[0, 1, 2, 3, 3]);
        for i in 0..3 {
            for j in 0..4 {
                assert_abs_diff_eq!(short[[i, j]], long[[i, j]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut net = GrowingNetwork::seeded("abc", 4, 5);
        net.params.b_hidden[[0, 1]] = 0.3;
        net.params.b_out[[0, 2]] = -0.2;
        let sequence = [0usize, 1, 2, 2, 0, 1, 1, 0, 2, 1, 0, 0, 2];
        let inputs = &sequence[..12];
        let targets = &sequence[1..];
        let (_, grads) = net.gradients(inputs, targets);

        let h = 5e-3f32;
        let check = |analytic: f32, plus: f64, minus: f64| {
            let numeric = ((plus - minus) / (2.0 * h as f64)) as f32;
            let tolerance = 2e-3 + 0.05 * numeric.abs();
            assert!(
                (analytic - numeric).abs() < tolerance,
                "analytic {} vs numeric {}",
                analytic,
                numeric
            );
        };

        for &(r, c) in &[(0, 0), (1, 3), (2, 2)] {
            let original = net.params.w_embed[[r, c]];
            net.params.w_embed[[r, c]] = original + h;
            let plus = loss_of(&net, inputs, targets);
            net.params.w_embed[[r, c]] = original - h;
            let minus = loss_of(&net, inputs, targets);
            net.params.w_embed[[r, c]] = original;
            check(grads.w_embed[[r, c]], plus, minus);
        }
        for &(r, c) in &[(0, 1), (3, 2)] {
            let original = net.params.w_out[[r, c]];
            net.params.w_out[[r, c]] = original + h;
            let plus = loss_of(&net, inputs, targets);
            net.params.w_out[[r, c]] = original - h;
            let minus = loss_of(&net, inputs, targets);
            net.params.w_out[[r, c]] = original;
            check(grads.w_out[[r, c]], plus, minus);
        }
        for c in 0..4 {
            let original = net.params.b_hidden[[0, c]];
            net.params.b_hidden[[0, c]] = original + h;
            let plus = loss_of(&net, inputs, targets);
            net.params.b_hidden[[0, c]] = original - h;
            let minus = loss_of(&net, inputs, targets);
            net.params.b_hidden[[0, c]] = original;
            check(grads.b_hidden[[0, c]], plus, minus);
        }
        for c in 0..3 {
            let original = net.params.b_out[[0, c]];
            net.params.b_out[[0, c]] = original + h;
            let plus = loss_of(&net, inputs, targets);
            net.params.b_out[[0, c]] = original - h;
            let minus = loss_of(&net, inputs, targets);
            net.params.b_out[[0, c]] = original;
            check(grads.b_out[[0, c]], plus, minus);
        }
    }

    #[test]
    fn test_learning_reduces_loss() {
        let mut net = GrowingNetwork::seeded("ab", 16, 21);
        let text = "abababababababab";
        let first = net.learn(text, 1, Some(0.01));
        let mut last = first;
        for _ in 0..30 {
            last = net.learn(text, 1, None);
        }
        assert!(last.unwrap_or(f32::MAX) < first.unwrap_or(0.0));
        assert_abs_diff_eq!(net.learning_rate(), 0.01);
    }

    #[test]
    fn test_learn_counts_and_step() {
        let mut net = GrowingNetwork::seeded(" abc.", 8, 1);
        net.learn("abc.", 3, None);
        assert_eq!(net.step(), 3);
        assert_eq!(net.interactions(), 1);
        assert_eq!(net.characters_total(), 3);
    }

    #[test]
    fn test_degenerate_text_is_a_counted_noop() {
        let mut net = GrowingNetwork::seeded("ab", 4, 2);
        let before = net.params.clone();
        assert!(net.learn("a", 5, None).is_none());
        assert!(net.learn("", 5, None).is_none());
        assert_eq!(net.params, before);
        assert_eq!(net.step(), 0);
        assert_eq!(net.interactions(), 2);
        assert_eq!(net.characters_total(), 0);
    }

    #[test]
    fn test_forward_keeps_one_row_per_index() {
        let net = GrowingNetwork::seeded("abc", 4, 14);
        assert_eq!(net.forward(&[0, 2, 1]).nrows(), 3);
        assert_eq!(net.forward(&[]).nrows(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_forward_rejects_unknown_index() {
        let net = GrowingNetwork::seeded("abc", 4, 15);
        net.forward(&[0, 7, 1]);
    }

    #[test]
    #[should_panic(expected = "hidden_size must be at least 1")]
    fn test_zero_hidden_size_is_rejected() {
        GrowingNetwork::seeded("ab", 0, 16);
    }

    #[test]
    fn test_zero_epochs_counts_nothing() {
        let mut net = GrowingNetwork::seeded("x", 8, 17);
        assert!(net.learn(&"x".repeat(501), 0, None).is_none());
        assert_eq!(net.characters_total(), 0);
        assert_eq!(net.hidden_size(), 8);
        assert_eq!(net.step(), 0);
        assert_eq!(net.interactions(), 1);
    }

    #[test]
    fn test_confidence_edge_cases() {
        let net = GrowingNetwork::seeded("ab", 4, 3);
        assert_eq!(net.confidence(""), 0.0);
        assert_eq!(net.confidence("a"), 0.5);
        assert_eq!(net.confidence("zz"), 0.5);
        let c = net.confidence("abab");
        assert!(c > 0.0 && c < 1.0);
    }
}
