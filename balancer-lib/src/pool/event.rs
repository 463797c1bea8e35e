use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked after every completed recycle
pub type RecycleObserver = Arc<dyn Fn(&RecycleEvent) + Send + Sync>;

/// Report about one retired connection handle.
///
/// Emitted after the handle has drained and its idle connections were
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecycleEvent {
    /// Slot that owned the handle (the handle id in a [`QueuePool`](super::QueuePool))
    pub slot_id: usize,
    /// Requests completed on the retired handle
    pub requests_served: u64,
    /// Time between opening and retiring the handle
    pub handle_age: Duration,
    /// Time spent waiting for in-flight requests after the swap
    pub drain_duration: Duration,
}

impl fmt::Display for RecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Recycled slot {} after {} requests (age {:.1?}, drained in {:.1?})",
            self.slot_id, self.requests_served, self.handle_age, self.drain_duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let event = RecycleEvent {
            slot_id: 3,
            requests_served: 42,
            handle_age: Duration::from_millis(1500),
            drain_duration: Duration::from_millis(20),
        };
        assert_eq!(
            event.to_string(),
            "Recycled slot 3 after 42 requests (age 1.5s, drained in 20.0ms)"
        );
    }
}
