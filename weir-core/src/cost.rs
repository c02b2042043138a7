//! Invocation cost model.
//!
//! Converts a processing-function invocation's timing measurements into a
//! numeric cost charged against that function's distributed token budget.
//!
//! Cost is computed per individual timing segment, never on the summed
//! duration: several cheap calls must not be misclassified as one expensive
//! one. A segment below its kind's lower bound costs nothing; above that the
//! charge grows linearly with duration and keeps growing past the upper
//! bound.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of timing segment reported by a function invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingKind {
    /// Time spent in the in-process interpreter
    Interp,

    /// Time spent waiting on external calls
    External,
}

impl TimingKind {
    fn as_str(&self) -> &'static str {
        match self {
            TimingKind::Interp => "interp",
            TimingKind::External => "external",
        }
    }
}

/// A single named timing segment
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timing {
    pub kind: TimingKind,
    pub duration_ms: u64,
}

/// The outcome of one processing-function invocation, as observed by the
/// health watcher.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    /// Id of the function that was invoked
    pub function_id: String,

    /// Timing segments recorded during the invocation
    pub timings: Vec<Timing>,
}

/// Cost bounds for one timing kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KindCost {
    /// Durations at or below this bound cost nothing (milliseconds)
    pub lower_ms: u64,

    /// Duration at which the full unit cost is charged (milliseconds)
    pub upper_ms: u64,

    /// Cost charged at exactly `upper_ms`
    pub cost: u64,
}

/// Cost model configuration, one entry per timing kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModelConfig {
    pub interp: KindCost,
    pub external: KindCost,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            interp: KindCost {
                lower_ms: 50,
                upper_ms: 550,
                cost: 100,
            },
            external: KindCost {
                lower_ms: 100,
                upper_ms: 5000,
                cost: 20,
            },
        }
    }
}

/// Validated cost model
#[derive(Debug, Clone)]
pub struct CostModel {
    costs: AHashMap<TimingKind, KindCost>,
}

impl CostModel {
    /// Build a cost model, validating that every kind's lower bound is
    /// strictly below its upper bound. Invalid bounds are a configuration
    /// error and fail before any traffic is accepted.
    pub fn new(config: &CostModelConfig) -> Result<Self, CostModelError> {
        let mut costs = AHashMap::new();
        costs.insert(TimingKind::Interp, config.interp);
        costs.insert(TimingKind::External, config.external);

        for (kind, bounds) in &costs {
            if bounds.lower_ms >= bounds.upper_ms {
                return Err(CostModelError::InvalidBounds {
                    kind: kind.as_str(),
                    lower_ms: bounds.lower_ms,
                    upper_ms: bounds.upper_ms,
                });
            }
        }

        Ok(Self { costs })
    }

    /// Cost of a single timing segment
    pub fn cost_for_timing(&self, timing: &Timing) -> u64 {
        let bounds = self.costs[&timing.kind];
        let over = timing.duration_ms.saturating_sub(bounds.lower_ms) as f64;
        let span = (bounds.upper_ms - bounds.lower_ms) as f64;
        (bounds.cost as f64 * over / span).round() as u64
    }

    /// Total cost of one invocation: the sum of its per-segment costs
    pub fn cost_for_invocation(&self, result: &InvocationResult) -> u64 {
        result
            .timings
            .iter()
            .map(|t| self.cost_for_timing(t))
            .sum()
    }
}

/// Cost model configuration errors
#[derive(Debug, Error)]
pub enum CostModelError {
    #[error("lower bound for kind {kind} of {lower_ms}ms must be lower than upper bound of {upper_ms}ms; this is a configuration error")]
    InvalidBounds {
        kind: &'static str,
        lower_ms: u64,
        upper_ms: u64,
    },
}
