//! Declarations and runtime entry points shared by every System kind.
//!
//! [`SystemBase`] owns the ordered port and cache-entry descriptors, the
//! state and parameter declarations, and the ticket allocator that ties them
//! to runtime trackers. It initializes Contexts from those declarations and
//! evaluates ports and cache entries against a Context, validating that the
//! Context was created for this System first.

use crate::cache::CacheEntryValue;
use crate::cache_entry::{CacheEntry, ValueProducer};
use crate::context::{Context, ContextRef, ContextTree, InitializationAccess};
use crate::diagnostics::{self, fmt_func, join_pathname, UNNAMED};
use crate::error::{Error, Result};
use crate::port::{InputPort, OutputPort, OutputSource, PortDirection, PortKind};
use crate::ticket::{
    CacheIndex, ContextIndex, DependencyTicket, InputPortIndex, OutputPortIndex, SubsystemIndex,
    SystemId, TicketAllocator, BUILT_IN_TRACKERS, FIRST_FREE_TICKET, PA_TICKET, PN_TICKET,
    RESERVED_CACHE_TICKETS, XA_TICKET, XC_TICKET, XD_TICKET,
};
use crate::traits::{InputPortLocator, OutputPortLocator};
use crate::value::AbstractValue;
use nalgebra::DVector;
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// One enclosing System, as remembered by its descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ancestor {
    pub id: SystemId,
    pub name: String,
}

/// Non-owning link from a subsystem to the compositions that contain it.
#[derive(Debug, Clone)]
pub struct ParentLink {
    index_in_parent: SubsystemIndex,
    ancestry: Vec<Ancestor>,
}

impl ParentLink {
    pub fn index_in_parent(&self) -> SubsystemIndex {
        self.index_in_parent
    }

    /// Enclosing Systems, root first.
    pub fn ancestry(&self) -> &[Ancestor] {
        &self.ancestry
    }
}

#[derive(Debug, Clone)]
struct DeclaredSource<T> {
    ticket: DependencyTicket,
    model: T,
}

#[derive(Debug)]
pub struct SystemBase {
    type_name: String,
    name: String,
    id: SystemId,
    parent: Option<ParentLink>,
    name_locked: bool,
    tickets: TicketAllocator,
    claimed: BTreeSet<DependencyTicket>,
    input_ports: Vec<InputPort>,
    output_ports: Vec<OutputPort>,
    cache_entries: Vec<CacheEntry>,
    continuous_state_size: usize,
    discrete_state: Vec<DeclaredSource<DVector<f64>>>,
    abstract_state: Vec<DeclaredSource<AbstractValue>>,
    numeric_parameters: Vec<DeclaredSource<DVector<f64>>>,
    abstract_parameters: Vec<DeclaredSource<AbstractValue>>,
}

impl SystemBase {
    /// `type_name` identifies the kind of System (e.g. `"Motor"`) and keys
    /// deprecation deduplication; `name` is this instance's display name.
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            id: SystemId::next(),
            parent: None,
            name_locked: false,
            tickets: TicketAllocator::new(),
            claimed: BTreeSet::new(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            cache_entries: Vec::new(),
            continuous_state_size: 0,
            discrete_state: Vec::new(),
            abstract_state: Vec::new(),
            numeric_parameters: Vec::new(),
            abstract_parameters: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames this System. Names are recorded by descendants and checked
    /// for uniqueness by the enclosing Diagram, so a System that has been
    /// composed in either direction keeps its name.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        if self.name_locked {
            return Err(Error::PreconditionViolation(format!(
                "{}: System {} cannot be renamed after it has been composed",
                fmt_func("set_name"),
                self.pathname()
            )));
        }
        self.name = name.into();
        Ok(())
    }

    /// Freezes the name once descendants or a parent have recorded it.
    pub(crate) fn lock_name(&mut self) {
        self.name_locked = true;
    }

    pub fn id(&self) -> SystemId {
        self.id
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    /// Identity of the outermost enclosing System, or our own if we are a
    /// root.
    pub fn root_id(&self) -> SystemId {
        self.parent
            .as_ref()
            .and_then(|link| link.ancestry.first())
            .map_or(self.id, |root| root.id)
    }

    pub(crate) fn attach_to_parent(&mut self, index_in_parent: SubsystemIndex, ancestry: &[Ancestor]) {
        self.parent = Some(ParentLink {
            index_in_parent,
            ancestry: ancestry.to_vec(),
        });
        self.name_locked = true;
    }

    /// The entry this System contributes to its descendants' ancestry.
    pub(crate) fn as_ancestor(&self) -> Ancestor {
        Ancestor {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Hierarchical name such as `::plant::arm::motor`.
    pub fn pathname(&self) -> String {
        let ancestry = self.parent.as_ref().map_or(&[][..], |link| &link.ancestry[..]);
        join_pathname(
            ancestry
                .iter()
                .map(|ancestor| ancestor.name.as_str())
                .chain(std::iter::once(self.name.as_str())),
        )
    }

    /// Name usable as a unique key in memory-object registries:
    /// the type name with `::` replaced by `/`, then `@` and the identity
    /// in 16 hex digits.
    pub fn memory_object_name(&self) -> String {
        let bare = self
            .type_name
            .split('<')
            .next()
            .unwrap_or(&self.type_name);
        let path = bare
            .split(':')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        format!("{path}@{}", self.id)
    }

    /// Message for a scalar type this System cannot be converted to.
    pub fn unsupported_scalar_conversion_message<Destination: ?Sized>(&self) -> String {
        format!(
            "System {} of type {} does not support scalar conversion to type {}",
            self.pathname(),
            self.type_name,
            type_name::<Destination>()
        )
    }

    pub fn allocate_ticket(&mut self) -> DependencyTicket {
        self.tickets.allocate()
    }

    /// Sets the size of the continuous state, which every Context stores
    /// under the built-in xc tracker.
    pub fn declare_continuous_state(&mut self, size: usize) -> DependencyTicket {
        self.continuous_state_size = size;
        XC_TICKET
    }

    pub fn declare_discrete_state(&mut self, model: DVector<f64>) -> DependencyTicket {
        let ticket = self.claim_new_ticket();
        self.discrete_state.push(DeclaredSource { ticket, model });
        ticket
    }

    pub fn declare_abstract_state(&mut self, model: AbstractValue) -> DependencyTicket {
        let ticket = self.claim_new_ticket();
        self.abstract_state.push(DeclaredSource { ticket, model });
        ticket
    }

    pub fn declare_numeric_parameter(&mut self, model: DVector<f64>) -> DependencyTicket {
        let ticket = self.claim_new_ticket();
        self.numeric_parameters.push(DeclaredSource { ticket, model });
        ticket
    }

    pub fn declare_abstract_parameter(&mut self, model: AbstractValue) -> DependencyTicket {
        let ticket = self.claim_new_ticket();
        self.abstract_parameters.push(DeclaredSource { ticket, model });
        ticket
    }

    fn claim_new_ticket(&mut self) -> DependencyTicket {
        let ticket = self.tickets.allocate();
        self.claimed.insert(ticket);
        ticket
    }

    pub fn declare_input_port(&mut self, name: impl Into<String>, kind: PortKind) -> Result<InputPortIndex> {
        let name = name.into();
        if self.input_ports.iter().any(|port| port.name() == name) {
            return Err(Error::PreconditionViolation(format!(
                "{}: System {} already has an input port named '{name}'",
                fmt_func("declare_input_port"),
                self.pathname()
            )));
        }
        let index = InputPortIndex(self.input_ports.len());
        let ticket = self.claim_new_ticket();
        self.input_ports.push(InputPort::new(index, ticket, name, kind));
        Ok(index)
    }

    pub fn declare_vector_input_port(&mut self, name: impl Into<String>, size: usize) -> Result<InputPortIndex> {
        self.declare_input_port(name, PortKind::Vector { size })
    }

    pub fn declare_abstract_input_port(&mut self, name: impl Into<String>, model: AbstractValue) -> Result<InputPortIndex> {
        self.declare_input_port(name, PortKind::Abstract { model })
    }

    pub(crate) fn declare_output_port(
        &mut self,
        name: impl Into<String>,
        kind: PortKind,
        source: OutputSource,
        prerequisite: Option<DependencyTicket>,
    ) -> Result<OutputPortIndex> {
        let name = name.into();
        self.check_output_port_name(&name)?;
        let index = OutputPortIndex(self.output_ports.len());
        let ticket = self.claim_new_ticket();
        self.output_ports
            .push(OutputPort::new(index, ticket, name, kind, source, prerequisite));
        Ok(index)
    }

    pub(crate) fn check_output_port_name(&self, name: &str) -> Result<()> {
        if self.output_ports.iter().any(|port| port.name() == name) {
            return Err(Error::PreconditionViolation(format!(
                "{}: System {} already has an output port named '{name}'",
                fmt_func("declare_output_port"),
                self.pathname()
            )));
        }
        Ok(())
    }

    /// Declares a memoized quantity recomputed whenever any of
    /// `prerequisites` changes.
    ///
    /// Prerequisites must be built-in tickets or tickets of sources and cache
    /// entries declared earlier; the set may not be empty.
    pub fn declare_cache_entry(
        &mut self,
        description: impl Into<String>,
        producer: ValueProducer,
        prerequisites: impl IntoIterator<Item = DependencyTicket>,
    ) -> Result<CacheIndex> {
        let entry = self.make_cache_entry(
            self.tickets.next_ticket(),
            description.into(),
            producer,
            prerequisites.into_iter().collect(),
        )?;
        self.tickets.allocate();
        Ok(self.push_cache_entry(entry))
    }

    /// Like [`declare_cache_entry`](Self::declare_cache_entry) but with a
    /// ticket chosen by the caller: one of the reserved well-known cache
    /// tickets, or one obtained from [`allocate_ticket`](Self::allocate_ticket)
    /// and not yet used.
    pub fn declare_cache_entry_with_known_ticket(
        &mut self,
        ticket: DependencyTicket,
        description: impl Into<String>,
        producer: ValueProducer,
        prerequisites: impl IntoIterator<Item = DependencyTicket>,
    ) -> Result<CacheIndex> {
        let description = description.into();
        let reserved = RESERVED_CACHE_TICKETS.contains(&ticket);
        let allocated = ticket >= FIRST_FREE_TICKET && self.tickets.is_known(ticket);
        if !(reserved || allocated) || self.claimed.contains(&ticket) {
            return Err(Error::PreconditionViolation(format!(
                "{}: ticket {ticket} for cache entry '{description}' in system {} \
                 is neither a reserved cache ticket nor an allocated unused one",
                fmt_func("declare_cache_entry_with_known_ticket"),
                self.pathname()
            )));
        }
        let entry = self.make_cache_entry(ticket, description, producer, prerequisites.into_iter().collect())?;
        Ok(self.push_cache_entry(entry))
    }

    fn make_cache_entry(
        &self,
        ticket: DependencyTicket,
        description: String,
        producer: ValueProducer,
        prerequisites: BTreeSet<DependencyTicket>,
    ) -> Result<CacheEntry> {
        let pathname = self.pathname();
        let index = CacheIndex(self.cache_entries.len());
        let entry = CacheEntry::new(index, ticket, description, producer, prerequisites, &pathname)?;
        if let Some(unknown) = entry
            .prerequisites()
            .iter()
            .find(|ticket| !self.is_prerequisite_candidate(**ticket))
        {
            return Err(Error::PreconditionViolation(format!(
                "{}: cache entry '{}' in system {pathname} lists prerequisite {unknown}, \
                 which is not a declared source or an earlier cache entry",
                fmt_func("declare_cache_entry"),
                entry.description()
            )));
        }
        Ok(entry)
    }

    fn push_cache_entry(&mut self, entry: CacheEntry) -> CacheIndex {
        let index = entry.cache_index();
        self.claimed.insert(entry.ticket());
        self.cache_entries.push(entry);
        index
    }

    /// Output trackers are created last during initialization, so nothing
    /// inside the System may depend on them.
    fn is_prerequisite_candidate(&self, ticket: DependencyTicket) -> bool {
        if BUILT_IN_TRACKERS.iter().any(|(built_in, _, _)| *built_in == ticket) {
            return true;
        }
        self.claimed.contains(&ticket) && !self.output_ports.iter().any(|port| port.ticket() == ticket)
    }

    pub fn num_input_ports(&self) -> usize {
        self.input_ports.len()
    }

    pub fn num_output_ports(&self) -> usize {
        self.output_ports.len()
    }

    pub fn num_cache_entries(&self) -> usize {
        self.cache_entries.len()
    }

    pub fn input_ports(&self) -> &[InputPort] {
        &self.input_ports
    }

    pub fn output_ports(&self) -> &[OutputPort] {
        &self.output_ports
    }

    pub fn input_port(&self, index: InputPortIndex) -> Result<&InputPort> {
        self.checked_input_port("input_port", index)
    }

    pub fn output_port(&self, index: OutputPortIndex) -> Result<&OutputPort> {
        self.checked_output_port("output_port", index)
    }

    pub fn cache_entry(&self, index: CacheIndex) -> Result<&CacheEntry> {
        self.cache_entries.get(index.0).ok_or_else(|| {
            Error::OutOfRange(format!(
                "{}: there is no cache entry with index {index} because there \
                 are only {} cache entries in system {}.",
                fmt_func("cache_entry"),
                self.cache_entries.len(),
                self.pathname()
            ))
        })
    }

    pub fn cache_entry_mut(&mut self, index: CacheIndex) -> Result<&mut CacheEntry> {
        self.cache_entry(index)?;
        Ok(&mut self.cache_entries[index.0])
    }

    /// Marks an input port deprecated. The first evaluation in the process
    /// logs `message` at warn level.
    pub fn deprecate_input_port(&mut self, index: InputPortIndex, message: impl Into<String>) -> Result<()> {
        self.checked_input_port("deprecate_input_port", index)?;
        self.input_ports[index.0].base_mut().set_deprecation(message.into());
        Ok(())
    }

    pub fn deprecate_output_port(&mut self, index: OutputPortIndex, message: impl Into<String>) -> Result<()> {
        self.checked_output_port("deprecate_output_port", index)?;
        self.output_ports[index.0].base_mut().set_deprecation(message.into());
        Ok(())
    }

    /// Converts a signed port index, rejecting negative and too-large values.
    pub fn input_port_index(&self, raw: i64) -> Result<InputPortIndex> {
        let index = InputPortIndex(self.non_negative_index("input_port_index", raw)?);
        self.checked_input_port("input_port_index", index)?;
        Ok(index)
    }

    pub fn output_port_index(&self, raw: i64) -> Result<OutputPortIndex> {
        let index = OutputPortIndex(self.non_negative_index("output_port_index", raw)?);
        self.checked_output_port("output_port_index", index)?;
        Ok(index)
    }

    fn non_negative_index(&self, func: &str, raw: i64) -> Result<usize> {
        usize::try_from(raw).map_err(|_| {
            Error::OutOfRange(format!(
                "{}: negative port index {raw} is illegal. (System {})",
                fmt_func(func),
                self.pathname()
            ))
        })
    }

    fn checked_input_port(&self, func: &str, index: InputPortIndex) -> Result<&InputPort> {
        self.input_ports.get(index.0).ok_or_else(|| {
            Error::OutOfRange(format!(
                "{}: there is no input port with index {index} because there \
                 are only {} input ports in system {}.",
                fmt_func(func),
                self.input_ports.len(),
                self.pathname()
            ))
        })
    }

    fn checked_output_port(&self, func: &str, index: OutputPortIndex) -> Result<&OutputPort> {
        self.output_ports.get(index.0).ok_or_else(|| {
            Error::OutOfRange(format!(
                "{}: there is no output port with index {index} because there \
                 are only {} output ports in system {}.",
                fmt_func(func),
                self.output_ports.len(),
                self.pathname()
            ))
        })
    }

    /// Populates a fresh Context so every declared quantity has a tracker and
    /// every cache entry a value slot.
    pub fn initialize_context(&self, context: &mut Context) -> Result<()> {
        if InitializationAccess::is_initialized(context) {
            return Err(Error::PreconditionViolation(format!(
                "{}: the Context passed for System {} has already been initialized",
                fmt_func("initialize_context"),
                self.pathname()
            )));
        }
        let pathname = self.pathname();

        context.set_system_name(if self.name.is_empty() { UNNAMED } else { self.name.as_str() });
        context.set_system_id(self.id);
        context.set_continuous_state(DVector::zeros(self.continuous_state_size));

        for (i, source) in self.discrete_state.iter().enumerate() {
            add_group_member(context, XD_TICKET, source.ticket, format!("xd{i}"))?;
            context.add_discrete_state(source.ticket, source.model.clone());
        }
        for (i, source) in self.abstract_state.iter().enumerate() {
            add_group_member(context, XA_TICKET, source.ticket, format!("xa{i}"))?;
            context.add_abstract_state(source.ticket, source.model.clone());
        }
        for (i, source) in self.numeric_parameters.iter().enumerate() {
            add_group_member(context, PN_TICKET, source.ticket, format!("pn{i}"))?;
            context.add_numeric_parameter(source.ticket, source.model.clone());
        }
        for (i, source) in self.abstract_parameters.iter().enumerate() {
            add_group_member(context, PA_TICKET, source.ticket, format!("pa{i}"))?;
            context.add_abstract_parameter(source.ticket, source.model.clone());
        }

        for port in &self.input_ports {
            context.add_input_port(port.index(), port.ticket(), port.make_type_checker(pathname.clone()))?;
        }

        for entry in &self.cache_entries {
            let (cache, graph) = context.cache_and_graph_mut();
            cache.create_entry_value(
                entry.cache_index(),
                entry.ticket(),
                entry.description(),
                entry.prerequisites(),
                entry.allocate(),
                graph,
            )?;
            if entry.is_disabled_by_default() {
                cache
                    .entry_value_mut(entry.cache_index())?
                    .set_caching_enabled(false);
            }
        }

        for port in &self.output_ports {
            context.add_output_port(port.index(), port.ticket(), port.prerequisite())?;
        }

        context.mark_initialized();
        debug!(
            system = %pathname,
            trackers = context.graph().num_trackers(),
            cache_entries = self.cache_entries.len(),
            "initialized context"
        );
        Ok(())
    }

    /// Fails unless `context` was created for this System.
    pub fn validate_context(&self, context: ContextRef<'_>) -> Result<()> {
        if context.system_id() == Some(self.id) {
            Ok(())
        } else {
            Err(diagnostics::context_mismatch(self, context))
        }
    }

    /// Current value of an input port: the fixed value if one is set,
    /// otherwise whatever the enclosing Diagram connects to it. `Ok(None)`
    /// means the port is unconnected.
    pub fn eval_input_port(&self, context: ContextRef<'_>, index: InputPortIndex) -> Result<Option<AbstractValue>> {
        self.validate_context(context)?;
        let port = self.checked_input_port("eval_input_port", index)?;
        diagnostics::warn_port_deprecation(self, PortDirection::Input, index.0, port.base());

        if let Some(fixed) = context.context().fixed_input_value(index) {
            return Ok(Some(fixed.clone()));
        }
        let Some(link) = &self.parent else {
            return Ok(None);
        };
        let Some(parent_context) = context.parent() else {
            return Ok(None);
        };
        let resolver = parent_context.system().hierarchy_resolver().ok_or_else(|| {
            Error::PreconditionViolation(format!(
                "{}: the parent Context of System {} belongs to {}, which cannot \
                 resolve subsystem input ports",
                fmt_func("eval_input_port"),
                self.pathname(),
                parent_context.pathname()
            ))
        })?;
        resolver.eval_connected_subsystem_input_port(
            parent_context,
            InputPortLocator {
                subsystem: link.index_in_parent,
                port: index,
            },
        )
    }

    pub fn eval_vector_input(&self, context: ContextRef<'_>, index: InputPortIndex) -> Result<Option<DVector<f64>>> {
        self.validate_context(context)?;
        let port = self.checked_input_port("eval_vector_input", index)?;
        if !port.kind().is_vector() {
            return Err(Error::TypeMismatch(format!(
                "{}: vector port required, but input port '{}' (index {index}) was \
                 declared abstract. Even if the actual value is a vector, use \
                 eval_input_value::<V>() for an abstract port containing a vector \
                 of type V. (System {})",
                fmt_func("eval_vector_input"),
                port.name(),
                self.pathname()
            )));
        }
        let Some(value) = self.eval_input_port(context, index)? else {
            return Ok(None);
        };
        value
            .as_vector()
            .cloned()
            .map(Some)
            .ok_or_else(|| self.wrong_input_type("eval_vector_input", index, "DVector<f64>", value.type_name()))
    }

    /// Evaluates an input port and downcasts its value to `T`.
    pub fn eval_input_value<T: Any + Clone>(&self, context: ContextRef<'_>, index: InputPortIndex) -> Result<Option<T>> {
        let Some(value) = self.eval_input_port(context, index)? else {
            return Ok(None);
        };
        value
            .get::<T>()
            .cloned()
            .map(Some)
            .ok_or_else(|| self.wrong_input_type("eval_input_value", index, type_name::<T>(), value.type_name()))
    }

    /// Like [`eval_input_port`](Self::eval_input_port) but an unconnected
    /// port is an error.
    pub fn eval_required_input(&self, context: ContextRef<'_>, index: InputPortIndex) -> Result<AbstractValue> {
        self.eval_input_port(context, index)?.ok_or_else(|| {
            let name = self.input_ports.get(index.0).map_or("", |port| port.name());
            Error::Unconnected(format!(
                "{}: input port '{name}' (index {index}) is neither connected nor \
                 fixed so cannot be evaluated. (System {})",
                fmt_func("eval_required_input"),
                self.pathname()
            ))
        })
    }

    fn wrong_input_type(&self, func: &str, index: InputPortIndex, expected: &str, actual: &str) -> Error {
        let name = self.input_ports.get(index.0).map_or("", |port| port.name());
        Error::TypeMismatch(format!(
            "{}: expected value of type {expected} for input port '{name}' \
             (index {index}) but the actual type was {actual}. (System {})",
            fmt_func(func),
            self.pathname()
        ))
    }

    pub fn eval_output_port(&self, context: ContextRef<'_>, index: OutputPortIndex) -> Result<AbstractValue> {
        self.validate_context(context)?;
        let port = self.checked_output_port("eval_output_port", index)?;
        diagnostics::warn_port_deprecation(self, PortDirection::Output, index.0, port.base());

        match port.source() {
            OutputSource::CacheEntry(cache_index) => self.get_cache_value(context, cache_index),
            OutputSource::Subsystem { subsystem, port } => {
                let resolver = context.system().hierarchy_resolver().ok_or_else(|| {
                    Error::PreconditionViolation(format!(
                        "{}: output port {index} of System {} forwards a subsystem \
                         port but the System has no subsystems",
                        fmt_func("eval_output_port"),
                        self.pathname()
                    ))
                })?;
                resolver.eval_subsystem_output_port(context, OutputPortLocator { subsystem, port })
            }
        }
    }

    /// Returns the memoized value of a cache entry, recalculating it first
    /// if a prerequisite changed since the last calculation or caching is
    /// disabled for it.
    pub fn get_cache_value(&self, context: ContextRef<'_>, index: CacheIndex) -> Result<AbstractValue> {
        self.validate_context(context)?;
        let entry = self.cache_entry(index)?;
        let slot = context.context().cache().slot(index)?;
        let busy = || {
            Error::PreconditionViolation(format!(
                "{}: cache entry '{}' of System {} is borrowed elsewhere",
                fmt_func("get_cache_value"),
                entry.description(),
                self.pathname()
            ))
        };

        {
            let mut value = slot.try_borrow_mut().map_err(|_| busy())?;
            if value.is_reusable() {
                return Ok(value.value().clone());
            }
            if !value.begin_calculation() {
                return Err(Error::PreconditionViolation(format!(
                    "{}: cache entry '{}' of System {} was requested again while \
                     it was being calculated; its calculator depends on itself",
                    fmt_func("get_cache_value"),
                    entry.description(),
                    self.pathname()
                )));
            }
        }

        trace!(system = %self.pathname(), entry = entry.description(), "recalculating cache entry");
        let guard = CalculationGuard { slot };
        let calculated = entry.calculate(context);
        drop(guard);

        let mut value = slot.try_borrow_mut().map_err(|_| busy())?;
        let calculated = calculated?;
        if calculated.value_type_id() != value.value().value_type_id() {
            return Err(Error::TypeMismatch(format!(
                "{}: cache entry '{}' of System {} calculated a value of type {} \
                 but its allocated type is {}",
                fmt_func("get_cache_value"),
                entry.description(),
                self.pathname(),
                calculated.type_name(),
                value.value().type_name()
            )));
        }
        if let (Some(allocated), Some(actual)) = (value.value().as_vector(), calculated.as_vector()) {
            if allocated.len() != actual.len() {
                return Err(Error::TypeMismatch(format!(
                    "{}: cache entry '{}' of System {} calculated a vector of size {} \
                     but its allocated size is {}",
                    fmt_func("get_cache_value"),
                    entry.description(),
                    self.pathname(),
                    actual.len(),
                    allocated.len()
                )));
            }
        }
        value.set_value(calculated.clone());
        Ok(calculated)
    }

    /// Fixes an input port of this System's Context at `context` and
    /// invalidates everything that depends on it.
    pub fn fix_input_port(
        &self,
        tree: &mut ContextTree<'_>,
        context: ContextIndex,
        index: InputPortIndex,
        value: AbstractValue,
    ) -> Result<()> {
        self.validate_context(tree.get(context)?)?;
        self.checked_input_port("fix_input_port", index)?;
        tree.fix_input_port(context, index, value)
    }

    /// Finds this System's Context inside the tree rooted at `root`.
    pub fn get_my_context_from_root<'a>(&self, root: ContextRef<'a>) -> Result<ContextRef<'a>> {
        if !root.is_root() {
            return Err(Error::PreconditionViolation(format!(
                "{}: the Context of {} passed for System {} is not a root Context",
                fmt_func("get_my_context_from_root"),
                root.pathname(),
                self.pathname()
            )));
        }
        if root.system_id() != Some(self.root_id()) {
            return Err(Error::ContextMismatch(format!(
                "{}: the root Context of {} does not belong to the root of System {}",
                fmt_func("get_my_context_from_root"),
                root.pathname(),
                self.pathname()
            )));
        }
        root.tree_contexts()
            .find(|candidate| candidate.system_id() == Some(self.id))
            .ok_or_else(|| {
                Error::ContextMismatch(format!(
                    "{}: no Context for System {} exists in the tree rooted at {}",
                    fmt_func("get_my_context_from_root"),
                    self.pathname(),
                    root.pathname()
                ))
            })
    }
}

/// Clears a slot's in-progress marker when a calculation ends, including
/// by unwinding out of a panicking calculator.
struct CalculationGuard<'a> {
    slot: &'a RefCell<CacheEntryValue>,
}

impl Drop for CalculationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut value) = self.slot.try_borrow_mut() {
            value.end_calculation();
        }
    }
}

fn add_group_member(
    context: &mut Context,
    group: DependencyTicket,
    ticket: DependencyTicket,
    description: String,
) -> Result<()> {
    let graph = context.graph_mut();
    graph.create_tracker(ticket, description)?;
    graph.subscribe(group, ticket)
}
