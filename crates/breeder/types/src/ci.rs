use serde::{Deserialize, Serialize};

/// Bootstrap confidence triple over a per-sample score distribution.
///
/// Construction enforces `lower <= median <= upper`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    /// Build a triple, rejecting unordered or non-finite bounds.
    pub fn new(lower: f64, median: f64, upper: f64) -> Option<Self> {
        let finite = lower.is_finite() && median.is_finite() && upper.is_finite();
        if finite && lower <= median && median <= upper {
            Some(Self {
                lower,
                median,
                upper,
            })
        } else {
            None
        }
    }

    /// Degenerate interval around a single value.
    pub fn point(value: f64) -> Self {
        Self {
            lower: value,
            median: value,
            upper: value,
        }
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

impl std::fmt::Display for ConfidenceInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}% ({:.1}%, {:.1}%)",
            self.median * 100.0,
            self.lower * 100.0,
            self.upper * 100.0
        )
    }
}
