//! # Kernel Lifecycle State
//!
//! The lifecycle phase of an entity belongs to an external lifecycle
//! manager. Links only consult it to decide whether to fetch, store, or skip
//! an operation; phase transitions are written back through
//! `EntityLink::update_kernel` by whoever owns them.

use crate::link::EntityLink;
use serde::{Deserialize, Serialize};

/// Lifecycle phase reported by the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LifecyclePhase {
    #[default]
    Unwired,
    Sketched,
    Prepared,
    Wired,
    NeedsFetch,
    Dirty,
    Remote,
    Deleting,
}

/// A state transition currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Fetching,
    Storing,
    Deleting,
}

/// Snapshot of an entity's kernel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelState {
    pub phase: LifecyclePhase,
    pub persistent: bool,
    pub transition: Option<Transition>,
}

impl KernelState {
    #[must_use]
    pub const fn new(phase: LifecyclePhase) -> Self {
        Self {
            phase,
            persistent: false,
            transition: None,
        }
    }

    #[must_use]
    pub const fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self.phase, LifecyclePhase::Remote)
    }

    #[must_use]
    pub const fn needs_fetch(&self) -> bool {
        matches!(self.phase, LifecyclePhase::NeedsFetch)
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        matches!(self.phase, LifecyclePhase::Dirty)
    }

    /// Sketched or any later phase short of deletion.
    #[must_use]
    pub const fn is_sketched(&self) -> bool {
        !matches!(
            self.phase,
            LifecyclePhase::Unwired | LifecyclePhase::Deleting
        )
    }

    #[must_use]
    pub fn is_in_transition(&self, transition: Transition) -> bool {
        self.transition == Some(transition)
    }
}

impl EntityLink {
    /// Current kernel state snapshot.
    #[must_use]
    pub fn kernel(&self) -> KernelState {
        self.state.lock().kernel
    }

    /// Apply a lifecycle manager update to the kernel state.
    pub fn update_kernel(&self, update: impl FnOnce(&mut KernelState)) {
        update(&mut self.state.lock().kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unwired_and_transient() {
        let k = KernelState::default();
        assert_eq!(k.phase, LifecyclePhase::Unwired);
        assert!(!k.persistent);
        assert!(!k.is_sketched());
    }

    #[test]
    fn phase_predicates() {
        assert!(KernelState::new(LifecyclePhase::Remote).is_remote());
        assert!(KernelState::new(LifecyclePhase::NeedsFetch).needs_fetch());
        assert!(KernelState::new(LifecyclePhase::Dirty).is_dirty());
        assert!(KernelState::new(LifecyclePhase::Wired).is_sketched());
        assert!(!KernelState::new(LifecyclePhase::Deleting).is_sketched());
    }

    #[test]
    fn transition_membership() {
        let mut k = KernelState::new(LifecyclePhase::Wired).persistent(true);
        assert!(!k.is_in_transition(Transition::Storing));
        k.transition = Some(Transition::Storing);
        assert!(k.is_in_transition(Transition::Storing));
        assert!(!k.is_in_transition(Transition::Fetching));
        assert!(k.persistent);
    }
}
