//! Runtime dependency graph owned by one Context.
//!
//! Each declared quantity has a [`DependencyTracker`] keyed by its ticket.
//! An edge prerequisite → subscriber means "when the prerequisite changes,
//! the subscriber is stale". Edges normally stay inside one Context; a
//! composite System additionally links trackers across the Contexts of one
//! [`ContextTree`](crate::context::ContextTree), which is why an edge endpoint
//! is a [`TrackerLink`].

use crate::error::{Error, Result};
use crate::ticket::{CacheIndex, ContextIndex, DependencyTicket, BUILT_IN_TRACKERS};

/// Address of a tracker anywhere in a Context tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerRef {
    pub context: ContextIndex,
    pub ticket: DependencyTicket,
}

/// One end of a dependency edge, seen from the tracker that stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerLink {
    /// A tracker in the same Context.
    Local(DependencyTicket),
    /// A tracker in another Context of the same tree.
    Remote(TrackerRef),
}

impl TrackerLink {
    pub fn resolve(self, owner: ContextIndex) -> TrackerRef {
        match self {
            TrackerLink::Local(ticket) => TrackerRef {
                context: owner,
                ticket,
            },
            TrackerLink::Remote(target) => target,
        }
    }
}

#[derive(Debug)]
pub struct DependencyTracker {
    ticket: DependencyTicket,
    description: String,
    subscribers: Vec<TrackerLink>,
    prerequisites: Vec<TrackerLink>,
    cache_index: Option<CacheIndex>,
    change_count: u64,
    last_change_event: u64,
}

impl DependencyTracker {
    fn new(ticket: DependencyTicket, description: String) -> Self {
        Self {
            ticket,
            description,
            subscribers: Vec::new(),
            prerequisites: Vec::new(),
            cache_index: None,
            change_count: 0,
            last_change_event: 0,
        }
    }

    pub fn ticket(&self) -> DependencyTicket {
        self.ticket
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn subscribers(&self) -> &[TrackerLink] {
        &self.subscribers
    }

    pub fn prerequisites(&self) -> &[TrackerLink] {
        &self.prerequisites
    }

    /// The cache slot invalidated along with this tracker, if any.
    pub fn cache_index(&self) -> Option<CacheIndex> {
        self.cache_index
    }

    /// Generation stamp: how many change events reached this tracker.
    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// Records a change event. Returns false if `event` was already seen,
    /// which stops a sweep from visiting a tracker twice.
    pub(crate) fn note_change_event(&mut self, event: u64) -> bool {
        if self.last_change_event == event {
            return false;
        }
        self.last_change_event = event;
        self.change_count += 1;
        true
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: TrackerLink) {
        self.subscribers.push(subscriber);
    }

    pub(crate) fn add_prerequisite(&mut self, prerequisite: TrackerLink) {
        self.prerequisites.push(prerequisite);
    }
}

/// Trackers of one Context, indexed by ticket.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    trackers: Vec<Option<DependencyTracker>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph holding the built-in group trackers every Context starts with.
    pub fn with_built_in_trackers() -> Self {
        let mut graph = Self::new();
        for (ticket, description, prerequisites) in BUILT_IN_TRACKERS {
            graph.insert(DependencyTracker::new(*ticket, description.to_string()));
            for prerequisite in prerequisites.iter() {
                graph.link(*ticket, *prerequisite);
            }
        }
        graph
    }

    fn insert(&mut self, tracker: DependencyTracker) -> &mut DependencyTracker {
        let index = tracker.ticket.0;
        if self.trackers.len() <= index {
            self.trackers.resize_with(index + 1, || None);
        }
        self.trackers[index].insert(tracker)
    }

    /// Records both directions of an edge between existing trackers.
    fn link(&mut self, subscriber: DependencyTicket, prerequisite: DependencyTicket) {
        if let Some(tracker) = self.trackers.get_mut(prerequisite.0).and_then(Option::as_mut) {
            tracker.add_subscriber(TrackerLink::Local(subscriber));
        }
        if let Some(tracker) = self.trackers.get_mut(subscriber.0).and_then(Option::as_mut) {
            tracker.add_prerequisite(TrackerLink::Local(prerequisite));
        }
    }

    pub fn create_tracker(
        &mut self,
        ticket: DependencyTicket,
        description: impl Into<String>,
    ) -> Result<&mut DependencyTracker> {
        if self.has_tracker(ticket) {
            return Err(Error::PreconditionViolation(format!(
                "DependencyGraph::create_tracker(): a tracker for ticket {ticket} already exists"
            )));
        }
        Ok(self.insert(DependencyTracker::new(ticket, description.into())))
    }

    pub fn has_tracker(&self, ticket: DependencyTicket) -> bool {
        self.tracker(ticket).is_some()
    }

    pub fn tracker(&self, ticket: DependencyTicket) -> Option<&DependencyTracker> {
        self.trackers.get(ticket.0).and_then(Option::as_ref)
    }

    pub(crate) fn tracker_mut(&mut self, ticket: DependencyTicket) -> Result<&mut DependencyTracker> {
        self.trackers
            .get_mut(ticket.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| missing_tracker(ticket))
    }

    /// Makes `subscriber` stale whenever `prerequisite` changes. Both must
    /// live in this graph.
    pub fn subscribe(&mut self, subscriber: DependencyTicket, prerequisite: DependencyTicket) -> Result<()> {
        for ticket in [subscriber, prerequisite] {
            if !self.has_tracker(ticket) {
                return Err(missing_tracker(ticket));
            }
        }
        self.link(subscriber, prerequisite);
        Ok(())
    }

    pub(crate) fn attach_cache_value(&mut self, ticket: DependencyTicket, index: CacheIndex) -> Result<()> {
        self.tracker_mut(ticket)?.cache_index = Some(index);
        Ok(())
    }

    pub fn num_trackers(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_some()).count()
    }
}

fn missing_tracker(ticket: DependencyTicket) -> Error {
    Error::PreconditionViolation(format!(
        "DependencyGraph: there is no tracker for ticket {ticket}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn create_tracker_rejects_duplicates() {
        let mut graph = DependencyGraph::new();
        graph.create_tracker(DependencyTicket(3), "xc").expect("first");
        let err = graph
            .create_tracker(DependencyTicket(3), "xc again")
            .expect_err("duplicate ticket");
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
        assert_eq!(graph.num_trackers(), 1);
        assert!(!graph.has_tracker(DependencyTicket(2)));
    }

    #[test]
    fn subscribe_records_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.create_tracker(DependencyTicket(1), "t").expect("t");
        graph.create_tracker(DependencyTicket(20), "energy").expect("energy");
        graph
            .subscribe(DependencyTicket(20), DependencyTicket(1))
            .expect("subscribe");

        let time = graph.tracker(DependencyTicket(1)).expect("t");
        assert_eq!(time.subscribers(), &[TrackerLink::Local(DependencyTicket(20))]);
        let energy = graph.tracker(DependencyTicket(20)).expect("energy");
        assert_eq!(energy.prerequisites(), &[TrackerLink::Local(DependencyTicket(1))]);

        assert!(graph
            .subscribe(DependencyTicket(20), DependencyTicket(99))
            .is_err());
    }

    #[test]
    fn built_in_groups_subscribe_to_members() {
        use crate::ticket::{ALL_SOURCES_TICKET, X_TICKET, XD_TICKET};
        let graph = DependencyGraph::with_built_in_trackers();
        let xd = graph.tracker(XD_TICKET).expect("xd");
        assert_eq!(xd.subscribers(), &[TrackerLink::Local(X_TICKET)]);
        let all = graph.tracker(ALL_SOURCES_TICKET).expect("all sources");
        assert_eq!(all.prerequisites().len(), 2);
        assert_eq!(graph.num_trackers(), BUILT_IN_TRACKERS.len());
    }

    #[test]
    fn change_events_count_once() {
        let mut graph = DependencyGraph::new();
        let tracker = graph.create_tracker(DependencyTicket(5), "xa").expect("xa");
        assert!(tracker.note_change_event(1));
        assert!(!tracker.note_change_event(1));
        assert!(tracker.note_change_event(2));
        assert_eq!(tracker.change_count(), 2);
    }

    #[test]
    fn links_resolve_against_owner() {
        let local = TrackerLink::Local(DependencyTicket(7));
        assert_eq!(
            local.resolve(ContextIndex(2)),
            TrackerRef {
                context: ContextIndex(2),
                ticket: DependencyTicket(7)
            }
        );
        let remote = TrackerRef {
            context: ContextIndex(0),
            ticket: DependencyTicket(10),
        };
        assert_eq!(TrackerLink::Remote(remote).resolve(ContextIndex(4)), remote);
    }
}
