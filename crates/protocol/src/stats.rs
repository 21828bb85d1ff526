use serde::{Deserialize, Serialize};

/// Derived progress snapshot for one transfer. Recomputed periodically from
/// raw byte counters; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    /// Bytes moved so far.
    pub progress: u64,
    /// Bytes per second, smoothed over a sliding window of recent samples.
    pub average_speed: f64,
}

impl TransferStats {
    /// Fraction completed in `[0.0, 1.0]`, or `None` while total size is
    /// unknown.
    pub fn fraction(&self, total: Option<u64>) -> Option<f64> {
        match total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.progress as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}
