//! Admission priority levels for the queue manager.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Priority of a queued job. Within a pool, dispatch picks the highest
/// non-empty level; ties break FIFO on enqueue time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    #[display("critical")]
    Critical,
    #[display("high")]
    High,
    #[display("normal")]
    Normal,
    #[display("low")]
    Low,
}

impl JobPriority {
    /// All levels, highest first: the bucket scan order used by dispatch
    pub const LEVELS: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// Bucket index, 0 = highest priority
    pub fn bucket(self) -> usize {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_order_matches_levels() {
        for (i, level) in JobPriority::LEVELS.iter().enumerate() {
            assert_eq!(level.bucket(), i);
        }
    }

    #[test]
    fn test_default_is_normal() {
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobPriority::High).expect("serialize"),
            "\"high\""
        );
    }
}
