//! Engine state machine for checkpoint and index-grow coordination.
//!
//! The engine is in exactly one `(action, phase, version)` state, packed
//! into one atomic word. Phase transitions happen inside epoch drain
//! actions, so a transition is only observable once every session has
//! refreshed past the epoch in which it was scheduled.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::Status;

/// Long-running engine action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    /// Normal operation.
    #[default]
    None = 0,
    /// Full checkpoint (index + log).
    CheckpointFull = 1,
    /// Index-only checkpoint.
    CheckpointIndex = 2,
    /// Log-only checkpoint.
    CheckpointLog = 3,
    /// Index doubling.
    GrowIndex = 4,
}

impl From<u8> for Action {
    fn from(v: u8) -> Self {
        match v {
            1 => Action::CheckpointFull,
            2 => Action::CheckpointIndex,
            3 => Action::CheckpointLog,
            4 => Action::GrowIndex,
            _ => Action::None,
        }
    }
}

/// Phase within the current action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// No action in progress.
    #[default]
    Rest = 0,
    /// Sessions are being frozen; serials publish at the next refresh.
    Prepare = 1,
    /// The cut has been taken; new appends carry the in-new-version mark.
    InProgress = 2,
    /// Waiting for sessions to drain pending operations.
    WaitPending = 3,
    /// Waiting for the log suffix to reach the checkpoint artifact.
    WaitFlush = 4,
    /// Per-session persistence callbacks fire.
    PersistenceCallback = 5,
    /// Grow: waiting for sessions to cross into the migration epoch.
    GrowPrepare = 6,
    /// Grow: chunks are being migrated.
    GrowInProgress = 7,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            1 => Phase::Prepare,
            2 => Phase::InProgress,
            3 => Phase::WaitPending,
            4 => Phase::WaitFlush,
            5 => Phase::PersistenceCallback,
            6 => Phase::GrowPrepare,
            7 => Phase::GrowInProgress,
            _ => Phase::Rest,
        }
    }
}

/// Packed `(action, phase, version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    /// The running action.
    pub action: Action,
    /// Phase within the action.
    pub phase: Phase,
    /// Checkpoint version; bumped when a checkpoint completes.
    pub version: u32,
}

impl SystemState {
    /// A state.
    pub const fn new(action: Action, phase: Phase, version: u32) -> Self {
        Self {
            action,
            phase,
            version,
        }
    }

    /// The quiescent state at `version`.
    pub const fn rest(version: u32) -> Self {
        Self::new(Action::None, Phase::Rest, version)
    }

    #[inline]
    const fn to_control(self) -> u64 {
        (self.action as u64) | ((self.phase as u64) << 8) | ((self.version as u64) << 16)
    }

    #[inline]
    fn from_control(control: u64) -> Self {
        Self {
            action: Action::from((control & 0xFF) as u8),
            phase: Phase::from(((control >> 8) & 0xFF) as u8),
            version: (control >> 16) as u32,
        }
    }

    /// The successor state within the current action's phase sequence.
    pub fn next(&self) -> Result<SystemState, Status> {
        use Action::*;
        use Phase::*;
        let next = match (self.action, self.phase) {
            (CheckpointFull | CheckpointLog, Rest) => (self.action, Prepare, self.version),
            (CheckpointFull | CheckpointLog, Prepare) => (self.action, InProgress, self.version),
            (CheckpointFull | CheckpointLog, InProgress) => {
                (self.action, WaitPending, self.version)
            }
            (CheckpointFull | CheckpointLog, WaitPending) => (self.action, WaitFlush, self.version),
            (CheckpointFull | CheckpointLog, WaitFlush) => {
                (self.action, PersistenceCallback, self.version)
            }
            (CheckpointFull | CheckpointLog, PersistenceCallback) => {
                (None, Rest, self.version + 1)
            }
            (CheckpointIndex, Rest) => (CheckpointIndex, InProgress, self.version),
            (CheckpointIndex, InProgress) => (None, Rest, self.version),
            (GrowIndex, Rest) => (GrowIndex, GrowPrepare, self.version),
            (GrowIndex, GrowPrepare) => (GrowIndex, GrowInProgress, self.version),
            (GrowIndex, GrowInProgress) => (None, Rest, self.version),
            _ => return Err(Status::InvalidOperation),
        };
        Ok(SystemState::new(next.0, next.1, next.2))
    }
}

/// Atomic cell holding a [`SystemState`].
pub struct AtomicSystemState {
    control: AtomicU64,
}

impl AtomicSystemState {
    /// Start at rest, version `version`.
    pub const fn new(version: u32) -> Self {
        Self {
            control: AtomicU64::new(SystemState::rest(version).to_control()),
        }
    }

    /// Load the state.
    #[inline]
    pub fn load(&self, ordering: Ordering) -> SystemState {
        SystemState::from_control(self.control.load(ordering))
    }

    /// Store a state.
    #[inline]
    pub fn store(&self, state: SystemState, ordering: Ordering) {
        self.control.store(state.to_control(), ordering);
    }

    /// CAS the state; used to claim an action from Rest.
    pub fn compare_exchange(
        &self,
        current: SystemState,
        new: SystemState,
    ) -> Result<SystemState, SystemState> {
        self.control
            .compare_exchange(
                current.to_control(),
                new.to_control(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(SystemState::from_control)
            .map_err(SystemState::from_control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let state = SystemState::new(Action::CheckpointFull, Phase::WaitFlush, 17);
        assert_eq!(SystemState::from_control(state.to_control()), state);
    }

    #[test]
    fn full_checkpoint_walks_all_phases() {
        let mut state = SystemState::new(Action::CheckpointFull, Phase::Rest, 3);
        let mut phases = vec![state.phase];
        while state.action != Action::None {
            state = state.next().unwrap();
            phases.push(state.phase);
        }
        assert_eq!(
            phases,
            vec![
                Phase::Rest,
                Phase::Prepare,
                Phase::InProgress,
                Phase::WaitPending,
                Phase::WaitFlush,
                Phase::PersistenceCallback,
                Phase::Rest,
            ]
        );
        assert_eq!(state.version, 4);
    }

    #[test]
    fn rest_has_no_successor() {
        assert!(SystemState::rest(0).next().is_err());
    }

    #[test]
    fn claim_via_cas() {
        let state = AtomicSystemState::new(0);
        let rest = SystemState::rest(0);
        let prepare = SystemState::new(Action::CheckpointFull, Phase::Prepare, 0);
        assert!(state.compare_exchange(rest, prepare).is_ok());
        // Second claim fails.
        assert!(state
            .compare_exchange(rest, SystemState::new(Action::GrowIndex, Phase::GrowPrepare, 0))
            .is_err());
    }
}
