use log::info;

use crate::model::GrowingNetwork;

/// Training positions between two hidden-layer expansions.
pub const GROWTH_BLOCK_CHARS: u64 = 500;
/// Hidden width beyond which the network stops growing.
pub const MAX_HIDDEN_SIZE: usize = 1_000_000;
pub const MIN_GROWTH_INCREMENT: usize = 8;

/// Neurons added by one expansion at hidden width `hidden_size`:
/// `max(8, round(128 / (1 + ln(1 + H/128))))`. Shrinks slowly as the layer widens.
pub fn growth_increment(hidden_size: usize) -> usize {
    let h = hidden_size as f64;
    let raw = (128.0 / (1.0 + (1.0 + h / 128.0).ln())).round() as usize;
    raw.max(MIN_GROWTH_INCREMENT)
}

/// Number of multiples of [`GROWTH_BLOCK_CHARS`] crossed going from `before` to `after`.
pub fn block_crossings(before: u64, after: u64) -> u64 {
    after / GROWTH_BLOCK_CHARS - before / GROWTH_BLOCK_CHARS
}

impl GrowingNetwork {
    /// Appends every unseen character of `text` to the vocabulary, resizing
    /// the parameter store one entry at a time. Returns how many were added.
    pub(crate) fn absorb_vocabulary(&mut self, text: &str) -> usize {
        let unseen = self.vocab.unseen_in(text);
        for &c in &unseen {
            self.vocab.insert(c);
            self.params.push_vocab_entry(&mut self.rng);
        }
        if !unseen.is_empty() {
            info!(
                "vocabulary grew by {} to {} characters",
                unseen.len(),
                self.vocab.len()
            );
        }
        unseen.len()
    }

    /// Adds `positions` to the running character count and expands the
    /// hidden layer once per block boundary crossed. Returns the number of
    /// expansions performed.
    pub(crate) fn advance_character_count(&mut self, positions: usize) -> usize {
        let before = self.characters_total;
        self.characters_total += positions as u64;
        let due = block_crossings(before, self.characters_total);

        let mut performed = 0;
        for _ in 0..due {
            if self.expand_hidden().is_some() {
                performed += 1;
            }
        }
        performed
    }

    /// Widens the hidden layer by [`growth_increment`] and notifies the growth
    /// hook with the new width. Does nothing at or above [`MAX_HIDDEN_SIZE`].
    pub fn expand_hidden(&mut self) -> Option<usize> {
        let current = self.params.hidden_size();
        if current >= MAX_HIDDEN_SIZE {
            return None;
        }
        let increment = growth_increment(current);
        self.params.grow_hidden(increment, &mut self.rng);
        let new_size = self.params.hidden_size();
        info!(
            "hidden layer expanded {} -> {} (+{}) after {} characters",
            current, new_size, increment, self.characters_total
        );
        if let Some(hook) = self.growth_hook.as_mut() {
            hook(new_size);
        }
        Some(new_size)
    }
}
