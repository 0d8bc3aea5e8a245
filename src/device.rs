//! Device-reported capabilities consumed by the memory manager and the
//! distributor's strategy selection. This is a pure data contract: the
//! engine never queries the GPU itself (see crate-level Non-goals).

use serde::{Deserialize, Serialize};

use crate::memory::Pressure;

/// Coarse device-class tiers driving worker-pool sizing and strategy
/// selection (`§4.3`, `§4.5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceTier {
    Low,
    Medium,
    High,
}

/// Halves `base`, rounding up, under `High`/`Critical` pressure; otherwise
/// returns `base` unchanged. Never drops below 1.
fn pressure_scaled(base: usize, pressure: Pressure) -> usize {
    match pressure {
        Pressure::High | Pressure::Critical => base.div_ceil(2).max(1),
        Pressure::Normal | Pressure::Low | Pressure::Medium => base,
    }
}

impl PerformanceTier {
    /// Max parallel atlas builds, before halving under `High` pressure.
    pub fn max_parallel_builds(self) -> usize {
        match self {
            PerformanceTier::Low => 1,
            PerformanceTier::Medium => 2,
            PerformanceTier::High => 4,
        }
    }

    /// Max parallel atlas builds, halved once pressure reaches `High` (§4.3).
    pub fn max_parallel_builds_under(self, pressure: Pressure) -> usize {
        pressure_scaled(self.max_parallel_builds(), pressure)
    }

    /// Worker cap for the photo processor, before halving under `High`
    /// pressure.
    pub fn processor_workers(self) -> usize {
        match self {
            PerformanceTier::Low => 2,
            PerformanceTier::Medium => 4,
            PerformanceTier::High => 6,
        }
    }

    /// Worker cap for the photo processor, halved once pressure reaches
    /// `High` (§4.5).
    pub fn processor_workers_under(self, pressure: Pressure) -> usize {
        pressure_scaled(self.processor_workers(), pressure)
    }
}

/// Capabilities reported by the host application for the current device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub memory_budget_bytes: u64,
    pub max_atlas_size: u32,
    pub recommended_atlas_sizes: Vec<u32>,
    pub performance_tier: PerformanceTier,
}

impl DeviceCapabilities {
    /// A conservative default for devices that haven't reported anything
    /// more specific: a single 2048² atlas budget on a low-tier device.
    pub fn conservative() -> Self {
        DeviceCapabilities {
            memory_budget_bytes: 256 * 1024 * 1024,
            max_atlas_size: 2048,
            recommended_atlas_sizes: vec![2048],
            performance_tier: PerformanceTier::Low,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tier_scaling() {
        assert_eq!(PerformanceTier::Low.max_parallel_builds(), 1);
        assert_eq!(PerformanceTier::Medium.max_parallel_builds(), 2);
        assert_eq!(PerformanceTier::High.max_parallel_builds(), 4);
        assert_eq!(PerformanceTier::High.processor_workers(), 6);
    }

    #[test]
    fn high_pressure_halves_worker_counts() {
        assert_eq!(PerformanceTier::High.max_parallel_builds_under(Pressure::Normal), 4);
        assert_eq!(PerformanceTier::High.max_parallel_builds_under(Pressure::High), 2);
        assert_eq!(PerformanceTier::High.processor_workers_under(Pressure::High), 3);
        // Never drops below 1, even for the low tier's already-small counts.
        assert_eq!(PerformanceTier::Low.max_parallel_builds_under(Pressure::Critical), 1);
    }
}
