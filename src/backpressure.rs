// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure levels derived from orchestrator queue fill.
//!
//! Queues are bounded; the level tells embedders how close submitters are to
//! blocking (or, with a rejecting submitter, to being turned away).
//!
//! # Example
//!
//! ```
//! use index_sync::BackpressureLevel;
//!
//! // Normal operation
//! let level = BackpressureLevel::from_pressure(0.5);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_accept_writes());
//!
//! // Under pressure - throttle writes
//! let level = BackpressureLevel::from_pressure(0.85);
//! assert_eq!(level, BackpressureLevel::Throttle);
//! assert!(level.should_accept_writes());
//!
//! // Critical - queues are nearly full
//! let level = BackpressureLevel::from_pressure(0.92);
//! assert_eq!(level, BackpressureLevel::Critical);
//! assert!(!level.should_accept_writes());
//! ```

/// Backpressure level based on queue pressure.
///
/// Four-tier cascade:
/// - **Normal** (< 70%): Accept all work
/// - **Warn** (70-80%): Emit warnings
/// - **Throttle** (80-90%): Callers should slow down
/// - **Critical** (>= 90%): Rejecting submitters are about to be turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Warn = 1,
    Throttle = 2,
    Critical = 3,
}

impl BackpressureLevel {
    /// Calculate backpressure level from pressure ratio (0.0 → 1.0)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.80 => Self::Warn,
            p if p < 0.90 => Self::Throttle,
            _ => Self::Critical,
        }
    }

    /// Level for `depth` queued work sets out of `capacity`.
    #[must_use]
    pub fn from_queue(depth: usize, capacity: usize) -> Self {
        if capacity == 0 {
            return Self::Critical;
        }
        Self::from_pressure(depth as f64 / capacity as f64)
    }

    /// Check if new work should be submitted at this level
    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        matches!(self, Self::Normal | Self::Warn | Self::Throttle)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - queues filling up",
            Self::Throttle => "Throttling - submitters should slow down",
            Self::Critical => "Critical - queues nearly full",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_level_thresholds() {
        assert_eq!(BackpressureLevel::from_pressure(0.0), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_pressure(0.69), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_pressure(0.70), BackpressureLevel::Warn);
        assert_eq!(BackpressureLevel::from_pressure(0.80), BackpressureLevel::Throttle);
        assert_eq!(BackpressureLevel::from_pressure(0.90), BackpressureLevel::Critical);
        assert_eq!(BackpressureLevel::from_pressure(1.0), BackpressureLevel::Critical);
    }

    #[test]
    fn test_from_queue() {
        assert_eq!(BackpressureLevel::from_queue(0, 10), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_queue(8, 10), BackpressureLevel::Throttle);
        assert_eq!(BackpressureLevel::from_queue(10, 10), BackpressureLevel::Critical);
        assert_eq!(BackpressureLevel::from_queue(0, 0), BackpressureLevel::Critical);
    }

    #[test]
    fn test_should_accept_writes() {
        assert!(BackpressureLevel::Normal.should_accept_writes());
        assert!(BackpressureLevel::Throttle.should_accept_writes());
        assert!(!BackpressureLevel::Critical.should_accept_writes());
    }
}
