//! Load-balancing strategies for picking one expert among the eligible

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use super::registry::ExpertRecord;

/// How the router chooses among eligible experts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    /// Rotate through eligible experts, one cursor per category
    #[default]
    RoundRobin,
    /// Fewest in-flight queries; ties go to the earliest registered
    LeastLoaded,
    /// Lowest mean response time among experts that have answered
    PerformanceBased,
    /// Any other name: always the first eligible expert
    Unrecognized(String),
}

impl FromStr for LoadBalancingStrategy {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "round_robin" => Self::RoundRobin,
            "least_loaded" => Self::LeastLoaded,
            "performance_based" => Self::PerformanceBased,
            other => Self::Unrecognized(other.to_string()),
        })
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round_robin"),
            Self::LeastLoaded => f.write_str("least_loaded"),
            Self::PerformanceBased => f.write_str("performance_based"),
            Self::Unrecognized(name) => f.write_str(name),
        }
    }
}

/// Applies a strategy, keeping the round-robin cursors between calls
#[derive(Debug, Clone, Default)]
pub struct ExpertSelector {
    strategy: LoadBalancingStrategy,
    cursors: HashMap<String, usize>,
}

impl ExpertSelector {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            cursors: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> &LoadBalancingStrategy {
        &self.strategy
    }

    /// Pick one of `eligible` (in registration order) for `category`
    pub fn select<'a>(
        &mut self,
        category: &str,
        eligible: &[&'a ExpertRecord],
    ) -> Option<&'a ExpertRecord> {
        if eligible.is_empty() {
            return None;
        }

        match &self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let cursor = self.cursors.entry(category.to_string()).or_insert(0);
                let picked = eligible[*cursor % eligible.len()];
                *cursor = cursor.wrapping_add(1);
                Some(picked)
            }
            LoadBalancingStrategy::LeastLoaded => {
                eligible.iter().copied().min_by_key(|expert| expert.load)
            }
            LoadBalancingStrategy::PerformanceBased => eligible
                .iter()
                .copied()
                .filter(|expert| expert.responses > 0)
                .min_by(|a, b| a.avg_response_time.total_cmp(&b.avg_response_time))
                .or(Some(eligible[0])),
            LoadBalancingStrategy::Unrecognized(_) => Some(eligible[0]),
        }
    }
}
