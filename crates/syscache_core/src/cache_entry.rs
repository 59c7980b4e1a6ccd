//! Cache-entry descriptors: the declaration side of a memoized quantity.

use crate::context::ContextRef;
use crate::error::{Error, Result};
use crate::ticket::{CacheIndex, DependencyTicket};
use crate::value::AbstractValue;
use std::collections::BTreeSet;
use std::fmt;

pub type AllocateFn = Box<dyn Fn() -> AbstractValue + Send + Sync>;
pub type CalculateFn = Box<dyn Fn(ContextRef<'_>) -> anyhow::Result<AbstractValue> + Send + Sync>;

/// Produces values for one cache entry.
///
/// `allocate` supplies the placeholder stored before the first calculation
/// and fixes the concrete type every later `calculate` result must have.
/// `calculate` must be deterministic given identical prerequisite values.
pub struct ValueProducer {
    allocate: AllocateFn,
    calculate: CalculateFn,
}

impl ValueProducer {
    pub fn new(
        allocate: impl Fn() -> AbstractValue + Send + Sync + 'static,
        calculate: impl Fn(ContextRef<'_>) -> anyhow::Result<AbstractValue> + Send + Sync + 'static,
    ) -> Self {
        Self {
            allocate: Box::new(allocate),
            calculate: Box::new(calculate),
        }
    }

    /// A producer whose placeholder is a clone of `model`.
    pub fn from_model(
        model: AbstractValue,
        calculate: impl Fn(ContextRef<'_>) -> anyhow::Result<AbstractValue> + Send + Sync + 'static,
    ) -> Self {
        Self::new(move || model.clone(), calculate)
    }

    pub fn allocate(&self) -> AbstractValue {
        (self.allocate)()
    }

    pub fn calculate(&self, context: ContextRef<'_>) -> anyhow::Result<AbstractValue> {
        (self.calculate)(context)
    }
}

impl fmt::Debug for ValueProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueProducer")
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    index: CacheIndex,
    ticket: DependencyTicket,
    description: String,
    producer: ValueProducer,
    prerequisites: BTreeSet<DependencyTicket>,
    disabled_by_default: bool,
}

impl CacheEntry {
    /// Fails if `prerequisites` is empty; use
    /// [`NOTHING_TICKET`](crate::ticket::NOTHING_TICKET) for a constant.
    pub(crate) fn new(
        index: CacheIndex,
        ticket: DependencyTicket,
        description: String,
        producer: ValueProducer,
        prerequisites: BTreeSet<DependencyTicket>,
        system_pathname: &str,
    ) -> Result<Self> {
        if prerequisites.is_empty() {
            return Err(Error::PreconditionViolation(format!(
                "System::declare_cache_entry(): cache entry '{description}' in system \
                 {system_pathname} has an empty prerequisites list. If it really has \
                 no dependencies, use NOTHING_TICKET as its only prerequisite."
            )));
        }
        Ok(Self {
            index,
            ticket,
            description,
            producer,
            prerequisites,
            disabled_by_default: false,
        })
    }

    pub fn cache_index(&self) -> CacheIndex {
        self.index
    }

    pub fn ticket(&self) -> DependencyTicket {
        self.ticket
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn prerequisites(&self) -> &BTreeSet<DependencyTicket> {
        &self.prerequisites
    }

    pub fn is_disabled_by_default(&self) -> bool {
        self.disabled_by_default
    }

    /// New Contexts will start with caching off for this entry.
    pub fn disable_caching_by_default(&mut self) {
        self.disabled_by_default = true;
    }

    pub fn allocate(&self) -> AbstractValue {
        self.producer.allocate()
    }

    pub(crate) fn calculate(&self, context: ContextRef<'_>) -> Result<AbstractValue> {
        self.producer
            .calculate(context)
            .map_err(|err| Error::from_calculation(&self.description, err))
    }
}
