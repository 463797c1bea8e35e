use serde::Serialize;

use crate::Destination;

/// Point-in-time view of one slot of a [`RecyclingPool`](super::RecyclingPool)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    /// Stable slot id
    pub id: usize,
    /// Handles this slot has retired so far
    pub recycles: u64,
    /// Requests completed on the current handle
    pub served: u64,
    /// Requests currently running on the current handle
    pub in_flight: usize,
    /// Lowest remaining quota reported for the current handle
    pub minimum_remaining: Option<u64>,
}

/// Point-in-time view of a whole pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Destination the pool serves
    pub destination: Destination,
    /// One entry per slot, ordered by id
    pub slots: Vec<SlotStats>,
}

impl PoolStats {
    /// Total number of recycles across all slots
    #[must_use]
    pub fn total_recycles(&self) -> u64 {
        self.slots.iter().map(|slot| slot.recycles).sum()
    }

    /// Total number of requests currently in flight
    #[must_use]
    pub fn total_in_flight(&self) -> usize {
        self.slots.iter().map(|slot| slot.in_flight).sum()
    }

    /// One human-readable line per slot
    #[must_use]
    pub fn summary(&self) -> String {
        self.slots
            .iter()
            .map(|slot| {
                let remaining = slot
                    .minimum_remaining
                    .map_or_else(|| "n/a".to_string(), |value| value.to_string());
                format!(
                    "{} slot {}: {} served, {} in flight, {} recycles, min remaining {}",
                    self.destination, slot.id, slot.served, slot.in_flight, slot.recycles, remaining
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
