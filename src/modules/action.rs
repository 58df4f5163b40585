//! Lifecycle of a long-running background action
//!
//! ```text
//!   Idle --arm--> Armed --tick--> InProgress --+--> Completed --clear--> Idle
//!                   |                          |
//!                   +-------stop (tick)--------+--> Faulted ----clear--> Idle
//! ```
//!
//! A command only arms the action; the transitions out of `Armed` happen in
//! the module's tick. A stop request is honoured at the next tick and always
//! lands in a terminal phase, never straight back in `Idle`.

use tracing::debug;

/// Phase of one unit's background action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionPhase {
    #[default]
    Idle,
    Armed,
    InProgress,
    Completed {
        /// True when the action ended because of a stop request
        stopped: bool,
    },
    Faulted,
}

impl ActionPhase {
    /// Wire code reported by `GET_STATE`
    pub fn code(&self) -> u8 {
        match self {
            ActionPhase::Idle => 0,
            ActionPhase::Armed => 1,
            ActionPhase::InProgress => 2,
            ActionPhase::Completed { stopped: false } => 3,
            ActionPhase::Completed { stopped: true } => 4,
            ActionPhase::Faulted => 5,
        }
    }

    /// Armed or running
    pub fn is_active(&self) -> bool {
        matches!(self, ActionPhase::Armed | ActionPhase::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionPhase::Completed { .. } | ActionPhase::Faulted)
    }
}

/// Phase plus a pending stop request
#[derive(Debug, Clone, Default)]
pub struct Action {
    phase: ActionPhase,
    stop_requested: bool,
}

impl Action {
    pub fn phase(&self) -> ActionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Arms a new action
    ///
    /// From `Idle` or a terminal phase this moves to `Armed`. An action that
    /// is already armed or running keeps its phase and picks up the new
    /// parameters, dropping any pending stop.
    pub fn arm(&mut self) {
        self.stop_requested = false;
        if !self.phase.is_active() {
            self.transition(ActionPhase::Armed);
        }
    }

    /// Requests a stop, returns false if nothing was running
    pub fn request_stop(&mut self) -> bool {
        if self.phase.is_active() {
            self.stop_requested = true;
        }
        self.stop_requested
    }

    /// `Armed` to `InProgress`, called from the tick
    pub fn begin(&mut self) {
        if self.phase == ActionPhase::Armed {
            self.transition(ActionPhase::InProgress);
        }
    }

    pub fn complete(&mut self, stopped: bool) {
        self.stop_requested = false;
        self.transition(ActionPhase::Completed { stopped });
    }

    pub fn fault(&mut self) {
        self.stop_requested = false;
        self.transition(ActionPhase::Faulted);
    }

    /// Acknowledges a terminal phase, returns false if the action is still active
    pub fn clear(&mut self) -> bool {
        if self.phase.is_active() {
            return false;
        }
        if self.phase != ActionPhase::Idle {
            self.transition(ActionPhase::Idle);
        }
        true
    }

    /// Back to `Idle` regardless of phase
    pub fn reset(&mut self) {
        self.stop_requested = false;
        self.phase = ActionPhase::Idle;
    }

    fn transition(&mut self, next: ActionPhase) {
        debug!("action {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut action = Action::default();
        assert_eq!(action.phase(), ActionPhase::Idle);

        action.arm();
        assert_eq!(action.phase(), ActionPhase::Armed);
        action.begin();
        assert_eq!(action.phase(), ActionPhase::InProgress);
        action.complete(false);
        assert_eq!(action.phase().code(), 3);

        assert!(action.clear());
        assert_eq!(action.phase(), ActionPhase::Idle);
    }

    #[test]
    fn test_stop_requires_active_action() {
        let mut action = Action::default();
        assert!(!action.request_stop());

        action.arm();
        assert!(action.request_stop());
        assert!(action.stop_requested());

        // Re-arming drops the stop request
        action.arm();
        assert!(!action.stop_requested());
        assert_eq!(action.phase(), ActionPhase::Armed);
    }

    #[test]
    fn test_clear_refused_while_active() {
        let mut action = Action::default();
        action.arm();
        action.begin();
        assert!(!action.clear());

        action.fault();
        assert_eq!(action.phase().code(), 5);
        assert!(action.clear());
    }

    #[test]
    fn test_rearm_from_terminal() {
        let mut action = Action::default();
        action.arm();
        action.begin();
        action.complete(true);
        assert_eq!(action.phase().code(), 4);

        action.arm();
        assert_eq!(action.phase(), ActionPhase::Armed);
    }
}
