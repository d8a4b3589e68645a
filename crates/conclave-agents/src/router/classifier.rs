//! Keyword-pattern query classification

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain a query belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    Technical,
    Code,
    Medical,
    Legal,
    General,
}

impl QueryCategory {
    /// Scored categories in tie-break order; `General` is the fallback
    pub const SCORED: [QueryCategory; 4] = [
        QueryCategory::Technical,
        QueryCategory::Code,
        QueryCategory::Medical,
        QueryCategory::Legal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::Technical => "technical",
            QueryCategory::Code => "code",
            QueryCategory::Medical => "medical",
            QueryCategory::Legal => "legal",
            QueryCategory::General => "general",
        }
    }

    fn patterns(&self) -> &'static [&'static str] {
        match self {
            QueryCategory::Technical => &[
                r"\b(api|code|function|class|method|algorithm|debug|error|exception)\b",
                r"\b(programming|software|development|implementation)\b",
                r"\b(python|java|javascript|typescript|c\+\+|rust|go)\b",
            ],
            QueryCategory::Code => &[
                r"\b(write|create|implement|build|develop)\s+(code|function|script|program)\b",
                r"\b(how to code|coding|snippet|example code)\b",
                r"```|\bdef\b|\bfunction\b|\bclass\b",
            ],
            QueryCategory::Medical => &[
                r"\b(patient|doctor|medical|disease|treatment|symptom|diagnosis)\b",
                r"\b(medicine|healthcare|clinical|hospital|pharmacy)\b",
            ],
            QueryCategory::Legal => &[
                r"\b(law|legal|court|judge|attorney|lawyer|contract|regulation)\b",
                r"\b(lawsuit|litigation|statute|compliance|jurisdiction)\b",
            ],
            QueryCategory::General => &[],
        }
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "technical" => Ok(Self::Technical),
            "code" => Ok(Self::Code),
            "medical" => Ok(Self::Medical),
            "legal" => Ok(Self::Legal),
            "general" => Ok(Self::General),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

/// Scores a query against each category's patterns
///
/// The score of a category is the total number of pattern matches in the
/// query. The strictly highest nonzero score wins; ties go to the category
/// declared first; a query matching nothing is `General`.
pub struct QueryClassifier {
    rules: Vec<(QueryCategory, Vec<Regex>)>,
}

impl QueryClassifier {
    pub fn new() -> Self {
        let rules = QueryCategory::SCORED
            .iter()
            .map(|category| {
                let patterns = category
                    .patterns()
                    .iter()
                    .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
                    .collect();
                (*category, patterns)
            })
            .collect();
        Self { rules }
    }

    /// Match count per scored category, in declaration order
    pub fn scores(&self, query: &str) -> Vec<(QueryCategory, usize)> {
        self.rules
            .iter()
            .map(|(category, patterns)| {
                let score = patterns.iter().map(|re| re.find_iter(query).count()).sum();
                (*category, score)
            })
            .collect()
    }

    pub fn classify(&self, query: &str) -> QueryCategory {
        let mut best = (QueryCategory::General, 0);
        for (category, score) in self.scores(query) {
            if score > best.1 {
                best = (category, score);
            }
        }
        best.0
    }
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new()
    }
}
