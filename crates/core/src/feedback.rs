//! Feedback records and sentiment labels.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::FeedbackId;

/// Sentiment assigned to a feedback record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
    Unclassified,
}

impl SentimentLabel {
    /// The three classifier classes, in tie-break priority order.
    pub const CLASSES: [SentimentLabel; 3] = [
        SentimentLabel::Positive,
        SentimentLabel::Neutral,
        SentimentLabel::Negative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Unclassified => "unclassified",
        }
    }

    pub fn is_classified(&self) -> bool {
        !matches!(self, SentimentLabel::Unclassified)
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = DomainError;

    /// Lenient: labels coming out of training CSVs are sometimes quoted or
    /// capitalized, and legacy rows use `no_analyzed` for unclassified.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().trim_matches('"').trim().to_lowercase();
        match normalized.as_str() {
            "positive" => Ok(SentimentLabel::Positive),
            "neutral" => Ok(SentimentLabel::Neutral),
            "negative" => Ok(SentimentLabel::Negative),
            "unclassified" | "no_analyzed" => Ok(SentimentLabel::Unclassified),
            _ => Err(DomainError::validation(format!("unknown sentiment label: {s:?}"))),
        }
    }
}

/// A piece of user feedback and its (eventual) sentiment classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: FeedbackId,
    pub raw_text: String,
    pub created_at: DateTime<Utc>,
    pub sentiment_label: SentimentLabel,
    /// Probability of `sentiment_label` in \[0, 1\]; `None` until classified.
    pub sentiment_confidence: Option<f64>,
}

impl FeedbackRecord {
    /// A freshly submitted, unclassified record.
    pub fn new(raw_text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: FeedbackId::new(),
            raw_text: raw_text.into(),
            created_at,
            sentiment_label: SentimentLabel::Unclassified,
            sentiment_confidence: None,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.sentiment_label.is_classified()
    }

    /// Assign a classification.
    pub fn classify(&mut self, label: SentimentLabel, confidence: f64) -> DomainResult<()> {
        if !label.is_classified() {
            return Err(DomainError::invariant(
                "a classification must assign positive, neutral or negative",
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(DomainError::validation(format!(
                "confidence must be in [0, 1], got {confidence}"
            )));
        }
        self.sentiment_label = label;
        self.sentiment_confidence = Some(confidence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lenient_labels() {
        assert_eq!("Positive".parse::<SentimentLabel>().unwrap(), SentimentLabel::Positive);
        assert_eq!("\"negative\"".parse::<SentimentLabel>().unwrap(), SentimentLabel::Negative);
        assert_eq!(
            "no_analyzed".parse::<SentimentLabel>().unwrap(),
            SentimentLabel::Unclassified
        );
        assert!("meh".parse::<SentimentLabel>().is_err());
    }

    #[test]
    fn new_records_are_unclassified() {
        let record = FeedbackRecord::new("ótimo treino", Utc::now());
        assert_eq!(record.sentiment_label, SentimentLabel::Unclassified);
        assert!(record.sentiment_confidence.is_none());
    }

    #[test]
    fn classify_validates_inputs() {
        let mut record = FeedbackRecord::new("ok", Utc::now());
        assert!(record.classify(SentimentLabel::Unclassified, 0.5).is_err());
        assert!(record.classify(SentimentLabel::Neutral, 1.5).is_err());
        record.classify(SentimentLabel::Neutral, 0.4).unwrap();
        assert!(record.is_classified());
        assert_eq!(record.sentiment_confidence, Some(0.4));
    }
}
