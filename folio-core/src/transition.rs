//! Page-turn sequencing.
//!
//! A navigation request moves the coordinator from idle to transitioning; the displayed
//! page only changes once the dwell interval has elapsed. Timers are never cancelled:
//! every transition carries a ticket and a completion whose ticket is no longer current is
//! discarded. A newer request pre-empts the one in flight and restarts the dwell.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DWELL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    Forward,
    Backward,
}

impl FlipDirection {
    pub fn between(from: usize, to: usize) -> Self {
        if to >= from {
            FlipDirection::Forward
        } else {
            FlipDirection::Backward
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    Idle,
    Transitioning {
        from: usize,
        to: usize,
        direction: FlipDirection,
        ticket: TransitionTicket,
    },
}

#[derive(Debug)]
pub struct TransitionCoordinator {
    dwell: Duration,
    phase: TransitionPhase,
    issued: u64,
}

impl TransitionCoordinator {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            phase: TransitionPhase::Idle,
            issued: 0,
        }
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    pub fn phase(&self) -> TransitionPhase {
        self.phase
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self.phase, TransitionPhase::Transitioning { .. })
    }

    pub fn target(&self) -> Option<usize> {
        match self.phase {
            TransitionPhase::Transitioning { to, .. } => Some(to),
            TransitionPhase::Idle => None,
        }
    }

    /// Enters (or re-enters) the transitioning state towards `to`.
    pub fn begin(&mut self, from: usize, to: usize) -> TransitionTicket {
        self.issued += 1;
        let ticket = TransitionTicket(self.issued);
        self.phase = TransitionPhase::Transitioning {
            from,
            to,
            direction: FlipDirection::between(from, to),
            ticket,
        };
        ticket
    }

    /// Applies an elapsed timer. Returns the committed page when `ticket` is current.
    pub fn complete(&mut self, ticket: TransitionTicket) -> Option<usize> {
        match self.phase {
            TransitionPhase::Transitioning {
                to, ticket: current, ..
            } if current == ticket => {
                self.phase = TransitionPhase::Idle;
                Some(to)
            }
            _ => None,
        }
    }

    /// Drops any in-flight transition; its timer will complete as stale.
    pub fn reset(&mut self) {
        self.phase = TransitionPhase::Idle;
    }
}

impl Default for TransitionCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_DWELL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_with_current_ticket() {
        let mut coordinator = TransitionCoordinator::default();
        let ticket = coordinator.begin(1, 2);
        assert!(coordinator.is_transitioning());
        assert_eq!(coordinator.target(), Some(2));
        assert_eq!(coordinator.complete(ticket), Some(2));
        assert_eq!(coordinator.phase(), TransitionPhase::Idle);
    }

    #[test]
    fn pre_empted_ticket_is_discarded() {
        let mut coordinator = TransitionCoordinator::default();
        let first = coordinator.begin(1, 2);
        let second = coordinator.begin(1, 7);
        assert_eq!(coordinator.complete(first), None);
        assert!(coordinator.is_transitioning());
        assert_eq!(coordinator.complete(second), Some(7));
    }

    #[test]
    fn reset_turns_pending_timer_stale() {
        let mut coordinator = TransitionCoordinator::default();
        let ticket = coordinator.begin(4, 3);
        coordinator.reset();
        assert_eq!(coordinator.complete(ticket), None);
        assert!(!coordinator.is_transitioning());
    }

    #[test]
    fn direction_follows_target() {
        let mut coordinator = TransitionCoordinator::default();
        coordinator.begin(5, 2);
        match coordinator.phase() {
            TransitionPhase::Transitioning { direction, .. } => {
                assert_eq!(direction, FlipDirection::Backward)
            }
            TransitionPhase::Idle => panic!("expected a transition"),
        }
    }
}
