//! Per-Context memoization slots.
//!
//! A [`Cache`] holds one [`CacheEntryValue`] for each cache entry declared by
//! the Context's System. Slots are invalidated eagerly by the dependency
//! sweep in [`ContextTree::notify_changed`](crate::context::ContextTree::notify_changed)
//! and refilled lazily on the next read. Filling happens through a shared
//! reference to the Context, hence the `RefCell` per slot.

use crate::dependency::DependencyGraph;
use crate::error::{Error, Result};
use crate::ticket::{CacheIndex, DependencyTicket};
use crate::value::AbstractValue;
use std::cell::{Ref, RefCell};
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct CacheEntryValue {
    index: CacheIndex,
    ticket: DependencyTicket,
    description: String,
    value: AbstractValue,
    serial_number: u64,
    up_to_date: bool,
    caching_enabled: bool,
    calculating: bool,
}

impl CacheEntryValue {
    pub fn cache_index(&self) -> CacheIndex {
        self.index
    }

    pub fn ticket(&self) -> DependencyTicket {
        self.ticket
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The stored value, which is the allocate placeholder until the first
    /// calculation.
    pub fn value(&self) -> &AbstractValue {
        &self.value
    }

    /// Number of times a calculated value has been stored.
    pub fn serial_number(&self) -> u64 {
        self.serial_number
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    pub fn is_caching_enabled(&self) -> bool {
        self.caching_enabled
    }

    /// True if the stored value may be returned without recalculation.
    pub fn is_reusable(&self) -> bool {
        self.up_to_date && self.caching_enabled
    }

    /// Marks the start of a recalculation. Returns false if one is already
    /// running, i.e. the calculator re-entered its own entry.
    pub(crate) fn begin_calculation(&mut self) -> bool {
        !std::mem::replace(&mut self.calculating, true)
    }

    pub(crate) fn end_calculation(&mut self) {
        self.calculating = false;
    }

    pub(crate) fn set_value(&mut self, value: AbstractValue) {
        self.value = value;
        self.serial_number += 1;
        self.up_to_date = true;
    }

    pub(crate) fn mark_out_of_date(&mut self) {
        self.up_to_date = false;
    }

    pub(crate) fn set_caching_enabled(&mut self, enabled: bool) {
        self.caching_enabled = enabled;
    }
}

#[derive(Debug, Default)]
pub struct Cache {
    values: Vec<RefCell<CacheEntryValue>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the slot for cache entry `index` together with its tracker,
    /// subscribed to exactly `prerequisites`. Slots must be created in index
    /// order.
    pub(crate) fn create_entry_value(
        &mut self,
        index: CacheIndex,
        ticket: DependencyTicket,
        description: &str,
        prerequisites: &BTreeSet<DependencyTicket>,
        initial_value: AbstractValue,
        graph: &mut DependencyGraph,
    ) -> Result<()> {
        if index.0 != self.values.len() {
            return Err(Error::PreconditionViolation(format!(
                "Cache: entry '{description}' has index {index} but {} slots exist",
                self.values.len()
            )));
        }
        graph.create_tracker(ticket, description)?;
        for prerequisite in prerequisites {
            graph.subscribe(ticket, *prerequisite)?;
        }
        graph.attach_cache_value(ticket, index)?;
        self.values.push(RefCell::new(CacheEntryValue {
            index,
            ticket,
            description: description.to_string(),
            value: initial_value,
            serial_number: 0,
            up_to_date: false,
            caching_enabled: true,
            calculating: false,
        }));
        Ok(())
    }

    pub fn num_entries(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn slot(&self, index: CacheIndex) -> Result<&RefCell<CacheEntryValue>> {
        self.values
            .get(index.0)
            .ok_or_else(|| self.out_of_range(index))
    }

    /// Borrows a slot for inspection.
    pub fn entry_value(&self, index: CacheIndex) -> Result<Ref<'_, CacheEntryValue>> {
        let slot = self.slot(index)?;
        slot.try_borrow().map_err(|_| {
            Error::PreconditionViolation(format!(
                "Cache: entry {index} is being recalculated and cannot be inspected"
            ))
        })
    }

    pub(crate) fn entry_value_mut(&mut self, index: CacheIndex) -> Result<&mut CacheEntryValue> {
        let count = self.values.len();
        self.values
            .get_mut(index.0)
            .map(RefCell::get_mut)
            .ok_or_else(|| cache_out_of_range(index, count))
    }

    pub(crate) fn mark_out_of_date(&mut self, index: CacheIndex) -> Result<()> {
        self.entry_value_mut(index)?.mark_out_of_date();
        Ok(())
    }

    pub(crate) fn set_all_caching_enabled(&mut self, enabled: bool) {
        for slot in &mut self.values {
            let value = slot.get_mut();
            value.set_caching_enabled(enabled);
            value.mark_out_of_date();
        }
    }

    fn out_of_range(&self, index: CacheIndex) -> Error {
        cache_out_of_range(index, self.values.len())
    }
}

fn cache_out_of_range(index: CacheIndex, count: usize) -> Error {
    Error::OutOfRange(format!(
        "Cache: there is no cache entry with index {index} because there are only {count} cache entries"
    ))
}
