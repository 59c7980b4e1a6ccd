//! Identities shared between declarations and runtime state.
//!
//! A [`DependencyTicket`] is the only key that ties a System-side descriptor
//! to the tracker that mirrors it inside a Context. Tickets below
//! [`FIRST_FREE_TICKET`] are reserved for built-in trackers and well-known
//! cache entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable small-integer identity for a declared quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyTicket(pub usize);

impl fmt::Display for DependencyTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub const NOTHING_TICKET: DependencyTicket = DependencyTicket(0);
pub const TIME_TICKET: DependencyTicket = DependencyTicket(1);
pub const ACCURACY_TICKET: DependencyTicket = DependencyTicket(2);
/// All continuous state.
pub const XC_TICKET: DependencyTicket = DependencyTicket(3);
/// All discrete state groups.
pub const XD_TICKET: DependencyTicket = DependencyTicket(4);
/// All abstract state.
pub const XA_TICKET: DependencyTicket = DependencyTicket(5);
/// All state (xc, xd and xa).
pub const X_TICKET: DependencyTicket = DependencyTicket(6);
/// All numeric parameters.
pub const PN_TICKET: DependencyTicket = DependencyTicket(7);
/// All abstract parameters.
pub const PA_TICKET: DependencyTicket = DependencyTicket(8);
pub const ALL_PARAMETERS_TICKET: DependencyTicket = DependencyTicket(9);
pub const ALL_INPUT_PORTS_TICKET: DependencyTicket = DependencyTicket(10);
pub const ALL_SOURCES_EXCEPT_INPUT_PORTS_TICKET: DependencyTicket = DependencyTicket(11);
pub const ALL_SOURCES_TICKET: DependencyTicket = DependencyTicket(12);
/// Time derivatives of the continuous state. Reserved for a cache entry.
pub const XCDOT_TICKET: DependencyTicket = DependencyTicket(13);
/// Potential energy. Reserved for a cache entry.
pub const PE_TICKET: DependencyTicket = DependencyTicket(14);
/// Kinetic energy. Reserved for a cache entry.
pub const KE_TICKET: DependencyTicket = DependencyTicket(15);

/// First ticket handed out by a [`TicketAllocator`].
pub const FIRST_FREE_TICKET: DependencyTicket = DependencyTicket(16);

/// Built-in trackers present in every Context before initialization, with
/// the group trackers each one subscribes to.
///
/// Listed so that every prerequisite appears before its subscribers.
pub(crate) const BUILT_IN_TRACKERS: &[(DependencyTicket, &str, &[DependencyTicket])] = &[
    (NOTHING_TICKET, "nothing", &[]),
    (TIME_TICKET, "t", &[]),
    (ACCURACY_TICKET, "accuracy", &[]),
    (XC_TICKET, "xc", &[]),
    (XD_TICKET, "xd", &[]),
    (XA_TICKET, "xa", &[]),
    (X_TICKET, "x", &[XC_TICKET, XD_TICKET, XA_TICKET]),
    (PN_TICKET, "pn", &[]),
    (PA_TICKET, "pa", &[]),
    (ALL_PARAMETERS_TICKET, "p", &[PN_TICKET, PA_TICKET]),
    (ALL_INPUT_PORTS_TICKET, "u", &[]),
    (
        ALL_SOURCES_EXCEPT_INPUT_PORTS_TICKET,
        "all sources except input ports",
        &[TIME_TICKET, ACCURACY_TICKET, X_TICKET, ALL_PARAMETERS_TICKET],
    ),
    (
        ALL_SOURCES_TICKET,
        "all sources",
        &[ALL_SOURCES_EXCEPT_INPUT_PORTS_TICKET, ALL_INPUT_PORTS_TICKET],
    ),
];

/// Tickets that may be passed to
/// [`SystemBase::declare_cache_entry_with_known_ticket`](crate::system_base::SystemBase::declare_cache_entry_with_known_ticket)
/// without having been allocated.
pub(crate) const RESERVED_CACHE_TICKETS: &[DependencyTicket] = &[XCDOT_TICKET, PE_TICKET, KE_TICKET];

/// Hands out tickets in strictly ascending order. Tickets are never reused.
#[derive(Debug, Clone)]
pub struct TicketAllocator {
    next: usize,
}

impl Default for TicketAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketAllocator {
    pub fn new() -> Self {
        Self {
            next: FIRST_FREE_TICKET.0,
        }
    }

    pub fn allocate(&mut self) -> DependencyTicket {
        let ticket = DependencyTicket(self.next);
        self.next += 1;
        ticket
    }

    /// True if `ticket` is built in, reserved, or was already handed out.
    pub fn is_known(&self, ticket: DependencyTicket) -> bool {
        ticket.0 < self.next
    }

    pub fn next_ticket(&self) -> DependencyTicket {
        DependencyTicket(self.next)
    }
}

/// Process-unique identity of a System.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemId(pub u64);

impl SystemId {
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SystemId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0>16x}", self.0)
    }
}

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                $name(value)
            }
        }
    };
}

index_type!(
    /// Position of an input port among its System's input ports.
    InputPortIndex
);
index_type!(
    /// Position of an output port among its System's output ports.
    OutputPortIndex
);
index_type!(
    /// Position of a cache entry among its System's cache entries.
    CacheIndex
);
index_type!(SubsystemIndex);
index_type!(
    /// Position of a Context inside its [`ContextTree`](crate::context::ContextTree).
    ContextIndex
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_starts_after_reserved_tickets_and_ascends() {
        let mut allocator = TicketAllocator::new();
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_eq!(first, FIRST_FREE_TICKET);
        assert!(second > first);
        assert!(allocator.is_known(second));
        assert!(!allocator.is_known(allocator.next_ticket()));
    }

    #[test]
    fn built_in_trackers_list_prerequisites_first() {
        for (position, (_, _, prerequisites)) in BUILT_IN_TRACKERS.iter().enumerate() {
            for prerequisite in prerequisites.iter() {
                let found = BUILT_IN_TRACKERS[..position]
                    .iter()
                    .any(|(ticket, _, _)| ticket == prerequisite);
                assert!(found, "prerequisite {prerequisite} listed too late");
            }
        }
    }

    #[test]
    fn system_ids_are_unique() {
        let a = SystemId::next();
        let b = SystemId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{}", SystemId(255)), "00000000000000ff");
    }
}
