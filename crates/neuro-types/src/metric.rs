//! Left/right volume pairs and the derived asymmetry metric.

use crate::JobId;
use serde::{Deserialize, Serialize};

/// Default |asymmetry index| under which a region counts as symmetric.
pub const DEFAULT_LATERALITY_THRESHOLD: f64 = 0.05;

/// Named left/right volume pair produced by the extractor (mm³).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumePair {
    pub region: String,
    pub left_volume: f64,
    pub right_volume: f64,
}

impl VolumePair {
    pub fn new(region: impl Into<String>, left_volume: f64, right_volume: f64) -> Self {
        Self {
            region: region.into(),
            left_volume,
            right_volume,
        }
    }
}

/// (left - right) / (left + right); 0 when the sum is 0.
pub fn asymmetry_index(left: f64, right: f64) -> f64 {
    let total = left + right;
    if total == 0.0 {
        return 0.0;
    }
    (left - right) / total
}

/// Persisted metric row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub job_id: JobId,
    pub region: String,
    pub left_volume: f64,
    pub right_volume: f64,
    pub asymmetry_index: f64,
}

impl Metric {
    pub fn from_pair(job_id: JobId, pair: &VolumePair) -> Self {
        Self {
            job_id,
            region: pair.region.clone(),
            left_volume: pair.left_volume,
            right_volume: pair.right_volume,
            asymmetry_index: asymmetry_index(pair.left_volume, pair.right_volume),
        }
    }

    pub fn laterality(&self, threshold: f64) -> Laterality {
        Laterality::classify(self.asymmetry_index, threshold)
    }
}

/// Which hemisphere dominates a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Laterality {
    LeftDominant,
    RightDominant,
    Symmetric,
}

impl Laterality {
    pub fn classify(asymmetry_index: f64, threshold: f64) -> Self {
        if asymmetry_index > threshold {
            Laterality::LeftDominant
        } else if asymmetry_index < -threshold {
            Laterality::RightDominant
        } else {
            Laterality::Symmetric
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Laterality::LeftDominant => "Left > Right",
            Laterality::RightDominant => "Right > Left",
            Laterality::Symmetric => "Symmetric",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hippocampus_scenario() {
        let m = Metric::from_pair(JobId::new(), &VolumePair::new("Hippocampus", 1250.0, 1200.0));
        assert!((m.asymmetry_index - 0.0204).abs() < 1e-4);
        assert_eq!(m.laterality(DEFAULT_LATERALITY_THRESHOLD), Laterality::Symmetric);
    }

    #[test]
    fn index_is_antisymmetric_and_zero_safe() {
        for (l, r) in [(1.0, 2.0), (4000.5, 3999.0), (0.1, 900.0), (17.0, 17.0)] {
            assert!((asymmetry_index(l, r) + asymmetry_index(r, l)).abs() < 1e-12);
        }
        assert_eq!(asymmetry_index(0.0, 0.0), 0.0);
    }

    #[test]
    fn laterality_thresholds() {
        assert_eq!(Laterality::classify(0.10, 0.05).label(), "Left > Right");
        assert_eq!(Laterality::classify(-0.10, 0.05).label(), "Right > Left");
        assert_eq!(Laterality::classify(0.02, 0.05).label(), "Symmetric");
    }
}
