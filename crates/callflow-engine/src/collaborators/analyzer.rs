//! Regex-based utterance analysis.
//!
//! Labels an utterance with the highest-confidence intent from a fixed
//! lexicon, a coarse sentiment, and the keywords that fired.

use async_trait::async_trait;
use regex::Regex;

use callflow_core::types::Analysis;

use super::UtteranceAnalyzer;
use crate::error::AnalysisError;

struct IntentPattern {
    regex: Regex,
    intent: &'static str,
    confidence: f32,
}

/// Lexicon-driven [`UtteranceAnalyzer`], compiled once and reused.
pub struct KeywordAnalyzer {
    intents: Vec<IntentPattern>,
    positive: Regex,
    negative: Regex,
}

impl Default for KeywordAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordAnalyzer {
    pub fn new() -> Self {
        let table: Vec<(&str, &'static str, f32)> = vec![
            // Opt-out outranks everything else.
            (r"(?i)\b(?:stop\s+calling|do\s+not\s+call|don'?t\s+call|remove\s+me|unsubscribe)\b", "opt_out", 0.98),
            (r"(?i)\b(?:call\s+(?:me\s+)?back|call\s+later|not\s+a\s+good\s+time|busy\s+right\s+now)\b", "callback", 0.92),
            (r"(?i)\b(?:not\s+interested|no\s+thanks|no\s+thank\s+you)\b", "negative", 0.90),
            (r"(?i)\b(?:no|nope|nah|never)\b", "negative", 0.75),
            (r"(?i)\b(?:yes|yeah|yep|yup|sure|absolutely|definitely|of\s+course|sounds\s+good)\b", "affirmative", 0.80),
            (r"(?i)\b(?:ok|okay|alright|fine)\b", "affirmative", 0.60),
            (r"(?i)\b(?:what|who|why|how|when|where)\b.*\?|\?\s*$", "question", 0.55),
        ];

        let intents = table
            .into_iter()
            .map(|(pattern, intent, confidence)| IntentPattern {
                regex: Regex::new(pattern).expect("Invalid intent regex"),
                intent,
                confidence,
            })
            .collect();

        Self {
            intents,
            positive: Regex::new(
                r"(?i)\b(?:great|good|love|interested|perfect|thanks|thank\s+you|happy|excellent)\b",
            )
            .expect("Invalid positive regex"),
            negative: Regex::new(
                r"(?i)\b(?:bad|hate|annoying|angry|scam|terrible|waste|stop)\b",
            )
            .expect("Invalid negative regex"),
        }
    }

    /// Synchronous analysis used by the async trait impl.
    pub fn analyze_text(&self, text: &str) -> Analysis {
        let mut best: Option<&IntentPattern> = None;
        let mut keywords = Vec::new();

        for pattern in &self.intents {
            if let Some(m) = pattern.regex.find(text) {
                let word = m.as_str().trim().to_lowercase();
                if !word.is_empty() && !keywords.contains(&word) {
                    keywords.push(word);
                }
                let better = match best {
                    Some(b) => pattern.confidence > b.confidence,
                    None => true,
                };
                if better {
                    best = Some(pattern);
                }
            }
        }

        let positive = self.positive.find_iter(text).count();
        let negative = self.negative.find_iter(text).count();
        let sentiment = match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => "positive",
            std::cmp::Ordering::Less => "negative",
            std::cmp::Ordering::Equal => "neutral",
        };

        Analysis {
            matched_intent: best.map(|p| p.intent.to_string()),
            sentiment: Some(sentiment.to_string()),
            keywords,
        }
    }
}

#[async_trait]
impl UtteranceAnalyzer for KeywordAnalyzer {
    async fn analyze(&self, text: &str) -> Result<Analysis, AnalysisError> {
        Ok(self.analyze_text(text))
    }
}
