use std::collections::HashMap;

/// Append-only character vocabulary. Index order is insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharVocab {
    chars: Vec<char>,
    index: HashMap<char, usize>,
}

impl CharVocab {
    /// Builds a vocabulary from `chars`, keeping the first occurrence of each.
    /// Indices follow that order; the input is not sorted.
    pub fn new<I: IntoIterator<Item = char>>(chars: I) -> Self {
        let mut vocab = Self::default();
        for c in chars {
            vocab.insert(c);
        }
        vocab
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(text.chars())
    }

    /// Appends `c` if unseen. Returns its index and whether it was new.
    pub fn insert(&mut self, c: char) -> (usize, bool) {
        if let Some(&idx) = self.index.get(&c) {
            return (idx, false);
        }
        let idx = self.chars.len();
        self.chars.push(c);
        self.index.insert(c, idx);
        (idx, true)
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn contains(&self, c: char) -> bool {
        self.index.contains_key(&c)
    }

    pub fn index_of(&self, c: char) -> Option<usize> {
        self.index.get(&c).copied()
    }

    pub fn char_at(&self, idx: usize) -> Option<char> {
        self.chars.get(idx).copied()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    /// Maps known characters to indices, silently dropping the rest.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.chars().filter_map(|c| self.index_of(c)).collect()
    }

    pub fn decode(&self, indices: &[usize]) -> String {
        indices.iter().filter_map(|&i| self.char_at(i)).collect()
    }

    /// Characters of `text` not yet in the vocabulary, in first-seen order.
    pub fn unseen_in(&self, text: &str) -> Vec<char> {
        let mut pending = CharVocab::default();
        for c in text.chars() {
            if !self.contains(c) {
                pending.insert(c);
            }
        }
        pending.chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_keep_first_position() {
        let vocab = CharVocab::from_text("abca b");
        assert_eq!(vocab.chars(), &['a', 'b', 'c', ' ']);
        assert_eq!(vocab.index_of('c'), Some(2));
    }

    #[test]
    fn test_encode_drops_unknown_characters() {
        let vocab = CharVocab::from_text("ab");
        assert_eq!(vocab.encode("abzba"), vec![0, 1, 1, 0]);
        assert_eq!(vocab.decode(&[1, 0, 9]), "ba");
    }

    #[test]
    fn test_insert_is_append_only() {
        let mut vocab = CharVocab::from_text("xy");
        assert_eq!(vocab.insert('ñ'), (2, true));
        assert_eq!(vocab.insert('x'), (0, false));
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.char_at(2), Some('ñ'));
    }

    #[test]
    fn test_unseen_in_is_deduplicated() {
        let vocab = CharVocab::from_text("abc");
        assert_eq!(vocab.unseen_in("cabbage!!"), vec!['g', 'e', '!']);
    }
}
