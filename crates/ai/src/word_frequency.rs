//! Per-sentiment word frequency over classified feedback.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use fitpulse_core::{FeedbackRecord, SentimentLabel};

use crate::text::TextNormalizer;

/// A word and how many times it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordCount {
    pub word: String,
    pub count: u64,
}

/// Aggregated counts for one run of the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WordFrequencies {
    counts: BTreeMap<SentimentLabel, HashMap<String, u64>>,
    records: BTreeMap<SentimentLabel, u64>,
}

impl WordFrequencies {
    /// Number of records that contributed to `label`.
    pub fn record_count(&self, label: SentimentLabel) -> u64 {
        self.records.get(&label).copied().unwrap_or(0)
    }

    pub fn total_records(&self) -> u64 {
        self.records.values().sum()
    }

    pub fn count_of(&self, label: SentimentLabel, word: &str) -> u64 {
        self.counts
            .get(&label)
            .and_then(|words| words.get(word))
            .copied()
            .unwrap_or(0)
    }

    /// Words for `label` by descending count, ties alphabetical.
    /// `limit = None` returns every word.
    pub fn top(&self, label: SentimentLabel, limit: Option<usize>) -> Vec<WordCount> {
        let Some(words) = self.counts.get(&label) else {
            return Vec::new();
        };
        let mut ranked: Vec<WordCount> = words
            .iter()
            .map(|(word, count)| WordCount {
                word: word.clone(),
                count: *count,
            })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        ranked
    }

    fn add(&mut self, label: SentimentLabel, tokens: Vec<String>) {
        *self.records.entry(label).or_insert(0) += 1;
        let words = self.counts.entry(label).or_default();
        for token in tokens {
            *words.entry(token).or_insert(0) += 1;
        }
    }
}

/// Counts normalized tokens per sentiment label. Unclassified records are
/// counted but contribute no tokens.
#[derive(Debug, Clone, Default)]
pub struct WordFrequencyAggregator {
    normalizer: TextNormalizer,
}

impl WordFrequencyAggregator {
    pub fn new(normalizer: TextNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn aggregate<'a, I>(&self, records: I) -> WordFrequencies
    where
        I: IntoIterator<Item = &'a FeedbackRecord>,
    {
        let mut frequencies = WordFrequencies::default();
        for record in records {
            let tokens = if record.is_classified() {
                self.normalizer.normalize(&record.raw_text)
            } else {
                Vec::new()
            };
            frequencies.add(record.sentiment_label, tokens);
        }
        frequencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(text: &str, label: SentimentLabel) -> FeedbackRecord {
        let mut r = FeedbackRecord::new(text, Utc::now());
        if label.is_classified() {
            r.classify(label, 0.9).unwrap();
        }
        r
    }

    #[test]
    fn counts_per_label_and_ignores_unclassified_tokens() {
        let records = vec![
            record("Ótimo treino, ótimo ambiente", SentimentLabel::Positive),
            record("Treino excelente", SentimentLabel::Positive),
            record("Vestiário sujo", SentimentLabel::Negative),
            record("ainda sem rótulo", SentimentLabel::Unclassified),
        ];
        let freq = WordFrequencyAggregator::default().aggregate(&records);

        assert_eq!(freq.record_count(SentimentLabel::Positive), 2);
        assert_eq!(freq.record_count(SentimentLabel::Unclassified), 1);
        assert_eq!(freq.total_records(), 4);
        assert_eq!(freq.count_of(SentimentLabel::Positive, "ótimo"), 2);
        assert_eq!(freq.count_of(SentimentLabel::Negative, "ótimo"), 0);
        assert_eq!(freq.count_of(SentimentLabel::Unclassified, "rótulo"), 0);
    }

    #[test]
    fn top_sorts_by_count_then_word() {
        let records = vec![
            record("treino ótimo", SentimentLabel::Positive),
            record("treino ótimo", SentimentLabel::Positive),
            record("ambiente bom", SentimentLabel::Positive),
        ];
        let freq = WordFrequencyAggregator::default().aggregate(&records);
        let top = freq.top(SentimentLabel::Positive, Some(3));
        let words: Vec<_> = top.iter().map(|w| w.word.as_str()).collect();
        assert_eq!(words, vec!["treino", "ótimo", "ambiente"]);
        assert_eq!(top[0].count, 2);

        assert_eq!(freq.top(SentimentLabel::Positive, None).len(), 4);
        assert!(freq.top(SentimentLabel::Neutral, Some(10)).is_empty());
        assert!(freq.top(SentimentLabel::Unclassified, None).is_empty());
    }
}
