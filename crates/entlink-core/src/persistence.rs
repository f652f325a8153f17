//! # Persistence Propagator
//!
//! Persistence is inherited from the next storage container on a link's
//! chain, and content changes walk upward through containers until one of
//! them is persistent storage.
//!
//! ```text
//! link ──next──▶ node in container C
//!                    │
//!          C persistent storage? ──yes──▶ schedule ContentUpdated (atomic)
//!                    │ no
//!                    ▼
//!          C.meta().note_contents_changed(depth + 1)
//! ```
//!
//! A link holding a `WriteLock` attachment is mid-write and swallows
//! notifications. The walk is bounded by `Services::max_propagation_depth`.

use crate::attachment::{Attachment, AttachmentKind, WriteLock};
use crate::distribution::Residence;
use crate::formats::LinkReference;
use crate::lifecycle::Transition;
use crate::link::{EntityLink, LinkState};
use crate::space::Space;
use crate::transaction::{LinkEvent, ScheduledEvent};
use crate::types::{LinkError, LinkResult};
use std::sync::Arc;

/// Holds a link's write lock. Released on drop, including on error paths.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    link: &'a EntityLink,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.link.state.lock();
        let released = match state.attachments.get_mut(AttachmentKind::WriteLock) {
            Some(Attachment::WriteLock(lock)) => {
                lock.depth = lock.depth.saturating_sub(1);
                lock.depth == 0
            }
            _ => false,
        };
        if released {
            state.attachments.detach(AttachmentKind::WriteLock);
        }
    }
}

/// What a content-change notice resolves to at one link.
enum Notice {
    Stop,
    Schedule(ScheduledEvent),
    Climb(Arc<Space>),
}

impl LinkState {
    /// Container of the node after the head.
    fn next_container(&self) -> Option<Option<Arc<Space>>> {
        self.head.next.as_ref().map(|n| n.container.clone())
    }
}

impl EntityLink {
    /// Inherit persistence from the next storage container.
    ///
    /// Returns whether the link became persistent.
    pub fn synchronize_persistence(&self) -> bool {
        let mut state = self.state.lock();
        let inherits = matches!(
            state.next_container(),
            Some(Some(space)) if space.is_storage() && space.is_persistent()
        );
        if inherits && !state.kernel.persistent {
            state.kernel.persistent = true;
            tracing::debug!(link = %self.id(), "persistence inherited from chain");
            return true;
        }
        false
    }

    /// Mark the link mid-write until the guard drops.
    pub fn begin_write(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock();
        match state.attachments.get_mut(AttachmentKind::WriteLock) {
            Some(Attachment::WriteLock(lock)) => lock.depth = lock.depth.saturating_add(1),
            _ => {
                state.attachments.attach(Attachment::WriteLock(WriteLock {
                    holder: std::thread::current().id(),
                    depth: 1,
                }));
            }
        }
        WriteGuard { link: self }
    }

    #[must_use]
    pub fn is_being_written(&self) -> bool {
        self.state.lock().attachments.contains(AttachmentKind::WriteLock)
    }

    /// Notify upward that this link's container contents changed.
    pub fn on_contents_changed(&self) -> LinkResult<()> {
        self.note_contents_changed(0)
    }

    fn note_contents_changed(&self, depth: usize) -> LinkResult<()> {
        let limit = self.services().max_propagation_depth();
        if depth >= limit {
            tracing::warn!(link = %self.id(), depth, "unexpected topology: content-change walk exceeded depth bound");
            return Ok(());
        }

        let notice = {
            let state = self.state.lock();
            match state.next_container() {
                None => Notice::Stop,
                Some(_) if state.attachments.contains(AttachmentKind::WriteLock) => {
                    tracing::trace!(link = %self.id(), "mid-write, notice swallowed");
                    Notice::Stop
                }
                Some(None) => {
                    tracing::warn!(
                        link = %self.id(),
                        "unexpected topology: chain node without a container"
                    );
                    Notice::Stop
                }
                Some(Some(space)) if state.kernel.persistent && space.is_storage() => {
                    Notice::Schedule(ScheduledEvent::new(
                        self.id(),
                        Some(space.id()),
                        LinkEvent::ContentUpdated,
                    ))
                }
                Some(Some(space)) => Notice::Climb(space),
            }
        };

        match notice {
            Notice::Stop => Ok(()),
            Notice::Schedule(event) => {
                tracing::debug!(link = %self.id(), container = ?event.container, "content update scheduled");
                self.services().transactor().run_atomically(&mut |m| {
                    m.add_event(event.clone());
                    Ok(())
                })
            }
            Notice::Climb(space) => match space.meta() {
                Some(meta) if std::ptr::eq(Arc::as_ptr(&meta), self) => Ok(()),
                Some(meta) => meta.note_contents_changed(depth + 1),
                None => {
                    tracing::trace!(container = %space.id(), "container has no meta link");
                    Ok(())
                }
            },
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle-driven operations
    // -------------------------------------------------------------------------

    /// Schedule a fetch when the kernel needs one and none is running.
    ///
    /// Returns whether a `Fetched` event was committed.
    pub fn read_state(&self) -> LinkResult<bool> {
        let event = {
            let state = self.state.lock();
            (state.kernel.needs_fetch() && !state.kernel.is_in_transition(Transition::Fetching))
                .then(|| {
                    ScheduledEvent::new(
                        self.id(),
                        state.head.container.as_ref().map(|s| s.id()),
                        LinkEvent::Fetched,
                    )
                })
        };
        let Some(event) = event else {
            return Ok(false);
        };
        self.services().transactor().run_atomically(&mut |m| {
            m.add_event(event.clone());
            Ok(())
        })?;
        Ok(true)
    }

    /// Bring the entity in line with its kernel state.
    ///
    /// Fetches like `read_state`; a dirty entity that is not already being
    /// stored has no defined handling.
    pub fn sync_kernel_state(&self) -> LinkResult<bool> {
        let kernel = self.kernel();
        if kernel.is_dirty() && !kernel.is_in_transition(Transition::Storing) {
            return Err(LinkError::Unimplemented("sync_kernel_state"));
        }
        self.read_state()
    }

    /// Fetch the stored image of this link from its residence.
    pub fn refresh_contents(&self) -> LinkResult<Option<LinkReference>> {
        let reference = {
            let mut state = self.state.lock();
            if state.residence.is_none() {
                state.residence = Some(Residence::at(self.services().local_site()));
            }
            self.reference_locked(&state)
        };
        self.services().storage().fetch(&reference)
    }
}

// =============================================================================
// TESTS
// =============================================================================
