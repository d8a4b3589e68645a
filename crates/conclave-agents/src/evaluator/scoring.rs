//! Answer quality scores

/// Scores an answer on three axes, each in `[0, 1]`
pub trait Scorer: Send + Sync {
    /// How well the answer addresses the query
    fn relevance(&self, answer: &str, query: &str, context: &str) -> f64;

    /// How much of the answer is supported by the context
    fn faithfulness(&self, answer: &str, context: &str) -> f64;

    /// How complete the answer is, against `ground_truth` when given
    fn completeness(&self, answer: &str, ground_truth: Option<&str>) -> f64;
}

/// Word-overlap heuristics; no model required
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalScorer;

impl Scorer for LexicalScorer {
    fn relevance(&self, answer: &str, query: &str, _context: &str) -> f64 {
        let query_words = lowercase_words(query);
        if answer.is_empty() || query_words.is_empty() {
            return 0.0;
        }
        let answer_words = lowercase_words(answer);
        let overlap = query_words.intersection(&answer_words).count();
        let score = (overlap as f64 / query_words.len() as f64).min(1.0);

        let word_count = answer.split_whitespace().count();
        let length_factor = if word_count < 10 {
            0.8
        } else if word_count > 500 {
            0.9
        } else {
            1.0
        };
        score * length_factor
    }

    fn faithfulness(&self, answer: &str, context: &str) -> f64 {
        if answer.is_empty() || context.is_empty() {
            return 0.0;
        }
        let context = context.to_lowercase();

        let sentences: Vec<String> = answer
            .split('.')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if sentences.is_empty() {
            return 0.0;
        }

        let grounded = sentences
            .iter()
            .filter(|sentence| {
                let content: Vec<&str> = sentence
                    .split_whitespace()
                    .filter(|w| w.chars().count() > 3)
                    .collect();
                if content.is_empty() {
                    return false;
                }
                let found = content.iter().filter(|w| context.contains(**w)).count();
                found as f64 / content.len() as f64 > 0.5
            })
            .count();
        grounded as f64 / sentences.len() as f64
    }

    fn completeness(&self, answer: &str, ground_truth: Option<&str>) -> f64 {
        if answer.is_empty() {
            return 0.0;
        }

        if let Some(truth) = ground_truth.filter(|t| !t.is_empty()) {
            let truth_words = lowercase_words(truth);
            if truth_words.is_empty() {
                return 0.5;
            }
            let covered = truth_words.intersection(&lowercase_words(answer)).count();
            return (covered as f64 / truth_words.len() as f64).min(1.0);
        }

        let word_count = answer.split_whitespace().count();
        let mut score: f64 = match word_count {
            50..=500 => 0.5,
            20..=49 | 501..=1000 => 0.3,
            _ => 0.1,
        };

        let sentence_count = answer.split('.').filter(|s| !s.trim().is_empty()).count();
        score += match sentence_count {
            0 | 1 => 0.0,
            2 => 0.2,
            _ => 0.3,
        };

        let avg_sentence_length = word_count as f64 / sentence_count.max(1) as f64;
        if avg_sentence_length >= 10.0 {
            score += 0.2;
        }
        score.min(1.0)
    }
}

fn lowercase_words(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}
