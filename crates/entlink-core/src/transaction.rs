//! # Transaction Contract
//!
//! The engine never commits anything itself. Work that must become visible
//! atomically is expressed as events enqueued into a `Mutation`, and a
//! `Transactor` commits the whole mutation or none of it.
//!
//! `InMemoryTransactor` is the in-process reference implementation: it keeps
//! a committed-event log and can be told to fail its next commit.

use crate::types::{ContainerId, LinkError, LinkId, LinkResult, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// =============================================================================
// EVENTS
// =============================================================================

/// A change notice about one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    /// The entity was removed from a container.
    Deleted,
    /// The entity's state was (re)loaded from its storage image.
    Fetched,
    /// A persistent container's contents changed and its image must be rewritten.
    ContentUpdated,
    /// An attribute value changed.
    AttributeUpdated {
        attribute: String,
        old: Option<Value>,
        new: Option<Value>,
    },
    /// Application-defined notice.
    Custom(String),
}

/// An event addressed to a link, optionally recorded against a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub link: LinkId,
    pub container: Option<ContainerId>,
    pub event: LinkEvent,
}

impl ScheduledEvent {
    #[must_use]
    pub fn new(link: LinkId, container: Option<ContainerId>, event: LinkEvent) -> Self {
        Self {
            link,
            container,
            event,
        }
    }
}

// =============================================================================
// MUTATION SCOPE
// =============================================================================

/// Events pending a single commit.
#[derive(Debug, Default, Clone)]
pub struct Mutation {
    events: Vec<ScheduledEvent>,
}

impl Mutation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event: ScheduledEvent) {
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[ScheduledEvent] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<ScheduledEvent> {
        self.events
    }
}

/// Runs work atomically: every event the work enqueues commits together, or none do.
pub trait Transactor: Send + Sync {
    fn run_atomically(
        &self,
        work: &mut dyn FnMut(&mut Mutation) -> LinkResult<()>,
    ) -> LinkResult<()>;

    /// Commit an already-populated mutation scope.
    fn commit(&self, mutation: Mutation) -> LinkResult<()> {
        let mut pending = Some(mutation);
        self.run_atomically(&mut |m| {
            if let Some(p) = pending.take() {
                for event in p.into_events() {
                    m.add_event(event);
                }
            }
            Ok(())
        })
    }
}

// =============================================================================
// IN-MEMORY TRANSACTOR
// =============================================================================

/// Reference transactor with a committed log.
#[derive(Debug, Default)]
pub struct InMemoryTransactor {
    committed: Mutex<Vec<ScheduledEvent>>,
    commits: AtomicUsize,
    fail_next: AtomicBool,
}

impl InMemoryTransactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail after its work has run.
    pub fn fail_next_commit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Snapshot of every committed event, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<ScheduledEvent> {
        self.committed.lock().clone()
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl Transactor for InMemoryTransactor {
    fn run_atomically(
        &self,
        work: &mut dyn FnMut(&mut Mutation) -> LinkResult<()>,
    ) -> LinkResult<()> {
        let mut mutation = Mutation::new();
        work(&mut mutation)?;

        if self.fail_next.swap(false, Ordering::SeqCst) {
            tracing::debug!(
                discarded = mutation.len(),
                "commit failed, discarding mutation"
            );
            return Err(LinkError::CommitFailed(
                "transaction aborted before commit".to_string(),
            ));
        }

        if !mutation.is_empty() {
            self.committed.lock().extend(mutation.into_events());
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted(link: u64, container: u64) -> ScheduledEvent {
        ScheduledEvent::new(
            LinkId(link),
            Some(ContainerId(container)),
            LinkEvent::Deleted,
        )
    }

    #[test]
    fn commits_all_events_together() {
        let tx = InMemoryTransactor::new();
        tx.run_atomically(&mut |m| {
            m.add_event(deleted(1, 10));
            m.add_event(deleted(1, 11));
            Ok(())
        })
        .expect("commit");

        assert_eq!(tx.committed().len(), 2);
        assert_eq!(tx.commit_count(), 1);
    }

    #[test]
    fn failing_work_discards_everything() {
        let tx = InMemoryTransactor::new();
        let result = tx.run_atomically(&mut |m| {
            m.add_event(deleted(1, 10));
            Err(LinkError::Unimplemented("test"))
        });

        assert!(result.is_err());
        assert!(tx.committed().is_empty());
        assert_eq!(tx.commit_count(), 0);
    }

    #[test]
    fn injected_commit_failure_is_one_shot() {
        let tx = InMemoryTransactor::new();
        tx.fail_next_commit();

        let first = tx.run_atomically(&mut |m| {
            m.add_event(deleted(1, 10));
            Ok(())
        });
        assert!(matches!(first, Err(LinkError::CommitFailed(_))));
        assert!(tx.committed().is_empty());

        tx.run_atomically(&mut |m| {
            m.add_event(deleted(2, 10));
            Ok(())
        })
        .expect("second commit");
        assert_eq!(tx.committed(), vec![deleted(2, 10)]);
    }

    #[test]
    fn commit_joined_scope() {
        let tx = InMemoryTransactor::new();
        let mut scope = Mutation::new();
        scope.add_event(deleted(3, 1));
        scope.add_event(deleted(3, 2));
        tx.commit(scope).expect("commit");
        assert_eq!(tx.committed().len(), 2);
    }
}
