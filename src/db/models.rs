use crate::jumps::JumpCode;

/// One stored (track, code, weight) row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintEntry {
    pub track_row: i64,
    pub jump_code: JumpCode,
    pub weight: f64,
}

/// Inclusive weight range accepted by a code lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightBand {
    pub low: f64,
    pub high: f64,
}

impl WeightBand {
    /// `[w·(1−m), w·(1+m)]`, lower bound clamped at 0. A zero margin only
    /// accepts the exact weight.
    pub fn around(weight: f64, margin: f64) -> Self {
        Self {
            low: (weight * (1.0 - margin)).max(0.0),
            high: weight * (1.0 + margin),
        }
    }

    pub fn contains(&self, weight: f64) -> bool {
        self.low <= weight && weight <= self.high
    }
}

/// Summary counts for an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub shards: usize,
    pub entries: u64,
    pub tracks: u64,
    pub distinct_codes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_around_weight() {
        let b = WeightBand::around(2.0, 0.5);
        assert_eq!(b.low, 1.0);
        assert_eq!(b.high, 3.0);
        assert!(b.contains(1.0) && b.contains(3.0) && b.contains(2.2));
        assert!(!b.contains(0.99) && !b.contains(3.01));
    }

    #[test]
    fn test_band_lower_bound_clamped() {
        let b = WeightBand::around(2.0, 1.5);
        assert_eq!(b.low, 0.0);
        assert_eq!(b.high, 5.0);
    }

    #[test]
    fn test_zero_margin_is_exact() {
        let b = WeightBand::around(1.25, 0.0);
        assert!(b.contains(1.25));
        assert!(!b.contains(1.2500001));
    }
}
