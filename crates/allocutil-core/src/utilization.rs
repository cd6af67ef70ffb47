//! Utilization math.

use serde::Serialize;

/// Raw numbers from one full replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UtilizationSample {
    pub peak_live_bytes: usize,
    pub peak_consumed_bytes: usize,
}

/// Measured utilization of one trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "ratio", rename_all = "lowercase")]
pub enum Utilization {
    /// Peak live bytes over peak consumed bytes.
    Valid(f64),
    /// No memory growth was observed, so there is no denominator.
    Invalid,
}

impl UtilizationSample {
    #[must_use]
    pub fn utilization(&self) -> Utilization {
        if self.peak_consumed_bytes == 0 {
            return Utilization::Invalid;
        }
        Utilization::Valid(self.peak_live_bytes as f64 / self.peak_consumed_bytes as f64)
    }
}

impl Utilization {
    #[must_use]
    pub fn ratio(self) -> Option<f64> {
        match self {
            Self::Valid(r) => Some(r),
            Self::Invalid => None,
        }
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

impl std::fmt::Display for Utilization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid(r) => write!(f, "{:.2}%", r * 100.0),
            Self::Invalid => f.write_str("invalid"),
        }
    }
}
