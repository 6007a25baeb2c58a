//! Worker-count recommendations from backlog size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of the scaling ladder: more than `above` pending tasks asks for
/// `workers` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingTier {
    pub above: usize,
    pub workers: usize,
}

/// Monotonic backlog -> worker-count mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingTiers {
    /// Workers when no tier applies.
    pub min_workers: usize,
    pub tiers: Vec<ScalingTier>,
}

impl Default for ScalingTiers {
    fn default() -> Self {
        Self {
            min_workers: 1,
            tiers: vec![
                ScalingTier {
                    above: 100,
                    workers: 5,
                },
                ScalingTier {
                    above: 50,
                    workers: 3,
                },
                ScalingTier {
                    above: 10,
                    workers: 2,
                },
            ],
        }
    }
}

impl ScalingTiers {
    /// Worker count for `pending` tasks.
    ///
    /// The tier with the highest threshold that `pending` exceeds wins,
    /// regardless of configuration order. Never below `min_workers`.
    pub fn target_workers(&self, pending: usize) -> usize {
        self.tiers
            .iter()
            .filter(|tier| pending > tier.above)
            .max_by_key(|tier| tier.above)
            .map_or(self.min_workers, |tier| tier.workers.max(self.min_workers))
    }

    /// Thresholds must be distinct, and a higher threshold must not ask for
    /// fewer workers than a lower one.
    pub fn validate(&self) -> Result<(), String> {
        let mut sorted: Vec<&ScalingTier> = self.tiers.iter().collect();
        sorted.sort_by_key(|tier| tier.above);
        for pair in sorted.windows(2) {
            let (lower, higher) = (pair[0], pair[1]);
            if lower.above == higher.above {
                return Err(format!("two scaling tiers share threshold {}", lower.above));
            }
            if higher.workers < lower.workers {
                return Err(format!(
                    "tier above {} asks for {} workers, fewer than {} above {}",
                    higher.above, higher.workers, lower.workers, lower.above
                ));
            }
        }
        Ok(())
    }

    pub fn max_workers(&self) -> usize {
        self.tiers
            .iter()
            .map(|tier| tier.workers)
            .max()
            .unwrap_or(self.min_workers)
            .max(self.min_workers)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingRecommendation {
    pub queue: String,
    pub pending: usize,
    pub processing: usize,
    pub target_workers: usize,
    pub paused: bool,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}
