// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pressure levels for graceful degradation under load.
//!
//! The auto-optimizer classifies cache pressure into a small cascade and
//! reacts by shrinking the cache and slowing background work instead of
//! dropping data.
//!
//! # Example
//!
//! ```
//! use dualsync::PressureLevel;
//!
//! // Normal operation
//! let level = PressureLevel::from_pressure(0.5, 0.7, 0.9);
//! assert_eq!(level, PressureLevel::Normal);
//!
//! // Above the warn threshold - shrink the cache
//! let level = PressureLevel::from_pressure(0.8, 0.7, 0.9);
//! assert_eq!(level, PressureLevel::Warn);
//! assert!(level.cache_shrink_factor() < 1.0);
//!
//! // Critical - aggressive shrink
//! let level = PressureLevel::from_pressure(0.95, 0.7, 0.9);
//! assert_eq!(level, PressureLevel::Critical);
//! ```

/// Pressure level derived from the cache's memory usage ratio.
///
/// Three-tier cascade:
/// - **Normal** (below warn threshold): baseline configuration
/// - **Warn** (warn → critical): shrink memory and entry budgets, sweep more often
/// - **Critical** (above critical threshold): aggressive shrink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal = 0,
    Warn = 1,
    Critical = 2,
}

impl PressureLevel {
    /// Classify a pressure ratio (0.0 → 1.0+) against configured thresholds.
    #[must_use]
    pub fn from_pressure(pressure: f64, warn: f64, critical: f64) -> Self {
        if pressure >= critical {
            Self::Critical
        } else if pressure >= warn {
            Self::Warn
        } else {
            Self::Normal
        }
    }

    /// Multiplier applied to the cache memory and entry budgets at this
    /// level. TTL stays at baseline so hot entries remain servable while
    /// the budgets squeeze out cold ones.
    #[must_use]
    pub fn cache_shrink_factor(&self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Warn => 0.5,
            Self::Critical => 0.25,
        }
    }

    /// Divisor applied to the GC sweep interval (higher pressure = more
    /// frequent sweeps).
    #[must_use]
    pub fn gc_speedup(&self) -> u64 {
        match self {
            Self::Normal => 1,
            Self::Warn => 2,
            Self::Critical => 4,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - cache shrink active",
            Self::Critical => "Critical - aggressive cache shrink",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
