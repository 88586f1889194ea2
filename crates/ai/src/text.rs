//! Text normalization for feedback.
//!
//! Turns free text into the bag-of-tokens representation used by the
//! classifier and the word-frequency aggregator:
//! - lowercase the whole input
//! - split on every non-alphabetic character (punctuation, digits, emoji, spaces)
//! - drop tokens shorter than `min_token_len` characters and stopwords
//!
//! Normalization never fails; degenerate input yields an empty sequence.

use std::collections::HashSet;

use crate::stopwords;

/// Lowercasing tokenizer with a fixed stopword list.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    stopwords: HashSet<String>,
    min_token_len: usize,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextNormalizer {
    /// Normalizer with the Portuguese + English reference lists and a
    /// minimum token length of 2.
    pub fn new() -> Self {
        let stopwords = stopwords::PORTUGUESE
            .iter()
            .chain(stopwords::ENGLISH)
            .map(|w| (*w).to_string())
            .collect();
        Self {
            stopwords,
            min_token_len: 2,
        }
    }

    pub fn with_min_token_len(mut self, min_token_len: usize) -> Self {
        self.min_token_len = min_token_len.max(1);
        self
    }

    /// Add domain-specific stopwords (lowercased before insertion).
    pub fn with_extra_stopwords<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.stopwords
            .extend(words.into_iter().map(|w| w.as_ref().to_lowercase()));
        self
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(token)
    }

    /// Normalize raw text into an ordered token sequence.
    pub fn normalize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        lowered
            .split(|c: char| !c.is_alphabetic())
            .filter(|token| token.chars().count() >= self.min_token_len)
            .filter(|token| !self.is_stopword(token))
            .map(str::to_string)
            .collect()
    }

    /// Re-normalize a token sequence (idempotent on normalizer output).
    pub fn normalize_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<String> {
        let joined = tokens
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        self.normalize(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        let n = TextNormalizer::new();
        assert!(n.normalize("").is_empty());
        assert!(n.normalize("   \t\n ").is_empty());
        assert!(n.normalize("!!! ... ???").is_empty());
    }

    #[test]
    fn lowercases_and_strips_punctuation_and_stopwords() {
        let n = TextNormalizer::new();
        let tokens = n.normalize("Adorei o treino hoje! O instrutor foi super atencioso.");
        assert_eq!(
            tokens,
            vec!["adorei", "treino", "hoje", "instrutor", "super", "atencioso"]
        );
    }

    #[test]
    fn keeps_negations() {
        let n = TextNormalizer::new();
        assert_eq!(n.normalize("Não recomendo"), vec!["não", "recomendo"]);
        assert_eq!(n.normalize("I would not come back"), vec!["would", "not", "come", "back"]);
        assert_eq!(n.normalize("No towels, never clean"), vec!["no", "towels", "never", "clean"]);
        assert_eq!(n.normalize("Nunca mais, nem pensar"), vec!["nunca", "nem", "pensar"]);
        assert_eq!(n.normalize("Don't go"), vec!["don", "go"]);
    }

    #[test]
    fn mixed_language_and_digits() {
        let n = TextNormalizer::new();
        let tokens = n.normalize("Anilhas de 5kg: great value, ótimo preço");
        assert_eq!(tokens, vec!["anilhas", "kg", "great", "value", "ótimo", "preço"]);
    }

    #[test]
    fn extra_stopwords_and_min_len() {
        let n = TextNormalizer::new()
            .with_extra_stopwords(["Academia"])
            .with_min_token_len(4);
        assert_eq!(n.normalize("a academia tem ar bom e limpa"), vec!["limpa"]);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(text in any::<String>()) {
            let n = TextNormalizer::new();
            let once = n.normalize(&text);
            let twice = n.normalize_tokens(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn output_tokens_are_clean(text in "[a-zA-ZÀ-ÿ0-9 ,.!?]{0,80}") {
            let n = TextNormalizer::new();
            for token in n.normalize(&text) {
                prop_assert!(token.chars().all(char::is_alphabetic));
                prop_assert!(!n.is_stopword(&token));
                prop_assert_eq!(token.to_lowercase(), token.clone());
            }
        }
    }
}
