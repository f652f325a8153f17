//! # Event Propagation
//!
//! Lightweight local fan-out of entity change notices to observers.
//!
//! A link's observers live in an `EventChannel` attachment. A single
//! observer is stored directly; the binding is widened to a fan-out channel
//! only when a second observer connects, and dropped entirely when the last
//! one disconnects.
//!
//! Sinks are compared by identity (`Arc::ptr_eq`), never by value.

use crate::attachment::{Attachment, AttachmentKind};
use crate::link::EntityLink;
use crate::transaction::LinkEvent;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// SINKS
// =============================================================================

/// Any observer of link events.
pub trait EventSink: Send + Sync {
    fn accept(&self, event: &LinkEvent);

    /// A stub sink means "no-op, do not bother connecting".
    fn is_stub(&self) -> bool {
        false
    }
}

/// Shared handle to a sink.
pub type SinkRef = Arc<dyn EventSink>;

/// The distinguished no-op sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubSink;

impl EventSink for StubSink {
    fn accept(&self, _event: &LinkEvent) {}

    fn is_stub(&self) -> bool {
        true
    }
}

/// Sink that keeps every event it receives, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    label: String,
    events: Mutex<Vec<LinkEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Snapshot of received events.
    #[must_use]
    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingSink {
    fn accept(&self, event: &LinkEvent) {
        self.events.lock().push(event.clone());
    }
}

// =============================================================================
// FAN-OUT CHANNEL
// =============================================================================

/// Broadcasts to its sinks in connection order.
#[derive(Default, Clone)]
pub struct EventChannel {
    sinks: Vec<SinkRef>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, sink: SinkRef) {
        self.sinks.push(sink);
    }

    /// Remove `sink`. Returns whether it was connected.
    pub fn disconnect(&mut self, sink: &SinkRef) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|s| !Arc::ptr_eq(s, sink));
        self.sinks.len() != before
    }

    /// Remove every sink.
    pub fn disconnect_all(&mut self) {
        self.sinks.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn sinks(&self) -> &[SinkRef] {
        &self.sinks
    }
}

impl EventSink for EventChannel {
    fn accept(&self, event: &LinkEvent) {
        for sink in &self.sinks {
            sink.accept(event);
        }
    }
}

/// Value of a link's event-channel attachment.
#[derive(Clone)]
pub enum EventChannelBinding {
    Single(SinkRef),
    FanOut(EventChannel),
}

impl fmt::Debug for EventChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Single(..)"),
            Self::FanOut(ch) => f.debug_tuple("FanOut").field(ch).finish(),
        }
    }
}

impl EventChannelBinding {
    /// Number of sinks reachable through this binding.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::FanOut(ch) => ch.len(),
        }
    }

    fn targets(&self) -> Vec<SinkRef> {
        match self {
            Self::Single(sink) => vec![Arc::clone(sink)],
            Self::FanOut(ch) => ch.sinks().to_vec(),
        }
    }
}

// =============================================================================
// LINK OPERATIONS
// =============================================================================

impl EntityLink {
    /// Connect an observer to this link.
    ///
    /// Stub sinks are ignored. The first observer is bound directly; a second
    /// one widens the binding into a fan-out channel.
    pub fn connect(&self, sink: SinkRef) {
        if sink.is_stub() {
            return;
        }
        let mut state = self.state.lock();
        let chain = &mut state.attachments;
        match chain.get_mut(AttachmentKind::EventChannel) {
            None => {
                chain.attach(Attachment::EventChannel(EventChannelBinding::Single(sink)));
            }
            Some(Attachment::EventChannel(binding)) => match binding {
                EventChannelBinding::Single(existing) => {
                    let mut fan_out = EventChannel::new();
                    fan_out.connect(Arc::clone(existing));
                    fan_out.connect(sink);
                    *binding = EventChannelBinding::FanOut(fan_out);
                }
                EventChannelBinding::FanOut(ch) => ch.connect(sink),
            },
            Some(_) => {}
        }
        tracing::trace!(link = %self.id(), "observer connected");
    }

    /// Disconnect an observer. Drops the binding when no observer remains.
    pub fn disconnect(&self, sink: &SinkRef) {
        let mut state = self.state.lock();
        let chain = &mut state.attachments;
        let now_empty = match chain.get_mut(AttachmentKind::EventChannel) {
            Some(Attachment::EventChannel(EventChannelBinding::Single(existing))) => {
                Arc::ptr_eq(existing, sink)
            }
            Some(Attachment::EventChannel(EventChannelBinding::FanOut(ch))) => {
                ch.disconnect(sink);
                ch.is_empty()
            }
            _ => false,
        };
        if now_empty {
            chain.detach(AttachmentKind::EventChannel);
        }
    }

    /// Deliver `event` to every connected observer.
    ///
    /// Forwarding with no observers is a silent no-op. Observers are invoked
    /// after the link lock is released, so they may call back into the link.
    pub fn forward(&self, event: &LinkEvent) {
        let targets = {
            let state = self.state.lock();
            match state.attachments.get(AttachmentKind::EventChannel) {
                Some(Attachment::EventChannel(binding)) => binding.targets(),
                _ => return,
            }
        };
        tracing::trace!(link = %self.id(), sinks = targets.len(), "forwarding event");
        for sink in targets {
            sink.accept(event);
        }
    }

    /// Number of connected observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        let state = self.state.lock();
        match state.attachments.get(AttachmentKind::EventChannel) {
            Some(Attachment::EventChannel(binding)) => binding.sink_count(),
            _ => 0,
        }
    }

    /// Detach the event binding and disconnect all of its sinks.
    pub(crate) fn disconnect_all(&self) {
        let detached = self
            .state
            .lock()
            .attachments
            .detach(AttachmentKind::EventChannel);
        if let Some(Attachment::EventChannel(EventChannelBinding::FanOut(mut ch))) = detached {
            ch.disconnect_all();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{int_type, services};

    fn sink(label: &str) -> Arc<RecordingSink> {
        Arc::new(RecordingSink::new(label))
    }

    #[test]
    fn stub_sink_is_not_connected() {
        let link = EntityLink::new(services().0, int_type());
        link.connect(Arc::new(StubSink));
        assert_eq!(link.observer_count(), 0);
        assert!(!link.has_attachment(AttachmentKind::EventChannel));
    }

    #[test]
    fn single_sink_binds_directly() {
        let link = EntityLink::new(services().0, int_type());
        let a = sink("a");
        link.connect(a.clone());

        assert_eq!(link.observer_count(), 1);
        link.forward(&LinkEvent::Custom("hello".into()));
        assert_eq!(a.events(), vec![LinkEvent::Custom("hello".into())]);
    }

    #[test]
    fn fan_out_widens_and_narrows() {
        let link = EntityLink::new(services().0, int_type());
        let a = sink("a");
        let b = sink("b");
        let a_ref: SinkRef = a.clone();
        let b_ref: SinkRef = b.clone();

        link.connect(a_ref.clone());
        link.connect(b_ref.clone());
        link.forward(&LinkEvent::ContentUpdated);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);

        link.disconnect(&b_ref);
        link.forward(&LinkEvent::Fetched);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);

        link.disconnect(&a_ref);
        assert!(!link.has_attachment(AttachmentKind::EventChannel));
        link.forward(&LinkEvent::Fetched);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn disconnect_unknown_sink_keeps_binding() {
        let link = EntityLink::new(services().0, int_type());
        let a: SinkRef = sink("a");
        let stranger: SinkRef = sink("x");
        link.connect(a);
        link.disconnect(&stranger);
        assert_eq!(link.observer_count(), 1);
    }

    #[test]
    fn forward_without_binding_is_noop() {
        let link = EntityLink::new(services().0, int_type());
        link.forward(&LinkEvent::Deleted);
        assert_eq!(link.observer_count(), 0);
    }

    #[test]
    fn channel_broadcast_in_connection_order() {
        struct Ordered(Arc<Mutex<Vec<&'static str>>>, &'static str);
        impl EventSink for Ordered {
            fn accept(&self, _event: &LinkEvent) {
                self.0.lock().push(self.1);
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ch = EventChannel::new();
        ch.connect(Arc::new(Ordered(log.clone(), "first")));
        ch.connect(Arc::new(Ordered(log.clone(), "second")));
        ch.accept(&LinkEvent::Fetched);

        assert_eq!(*log.lock(), vec!["first", "second"]);
    }
}
