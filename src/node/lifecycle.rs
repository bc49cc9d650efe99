//! Node lifecycle state machine

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LifecycleState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Atomic lifecycle. Every transition is a compare-and-swap, so concurrent
/// stop requests agree on a single winner.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Starting as u8))
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Move from `from` to `to`. Returns false if the state was not `from`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Stopping` from `Starting` or `Running`.
    pub fn begin_stop(&self) -> bool {
        self.transition(LifecycleState::Running, LifecycleState::Stopping)
            || self.transition(LifecycleState::Starting, LifecycleState::Stopping)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(!lifecycle.transition(LifecycleState::Running, LifecycleState::Stopping));
        assert!(lifecycle.transition(LifecycleState::Starting, LifecycleState::Running));
        assert!(lifecycle.is_running());

        assert!(lifecycle.begin_stop());
        // second stop loses the race
        assert!(!lifecycle.begin_stop());
        assert_eq!(lifecycle.state(), LifecycleState::Stopping);
        assert!(lifecycle.transition(LifecycleState::Stopping, LifecycleState::Stopped));
        assert_eq!(lifecycle.state().to_string(), "stopped");
    }

    #[test]
    fn test_stop_during_startup() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_stop());
        assert!(!lifecycle.transition(LifecycleState::Starting, LifecycleState::Running));
    }
}
