//! Runtime state containers.
//!
//! A [`Context`] mirrors one System's declarations: it owns a dependency
//! graph, a cache, and storage for time, state, parameters and fixed input
//! values. Contexts of a composite System live together in a
//! [`ContextTree`], an arena that owns every Context of one evaluation
//! instance. A Context refers to its parent only by [`ContextIndex`], so
//! parent and child never own each other.
//!
//! Read-side access goes through the copyable [`ContextRef`] handle, which
//! is also what cache calculators receive. Mutation (fixing inputs, writing
//! state, notifying changes) goes through `&mut ContextTree` and performs the
//! invalidation sweep across the whole tree.

use crate::cache::Cache;
use crate::dependency::{DependencyGraph, TrackerLink, TrackerRef};
use crate::error::{Error, Result};
use crate::port::TypeChecker;
use crate::diagnostics::join_pathname;
use crate::ticket::{
    CacheIndex, ContextIndex, DependencyTicket, InputPortIndex, OutputPortIndex, SystemId,
    ALL_INPUT_PORTS_TICKET, TIME_TICKET, XC_TICKET,
};
use crate::traits::System;
use crate::value::AbstractValue;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use tracing::trace;

/// Options applied when a [`ContextTree`] is created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextOptions {
    /// When false every cache entry in the tree starts with caching
    /// disabled, so each read recalculates. Useful for checking that
    /// declared prerequisites are complete.
    pub caching: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { caching: true }
    }
}

struct InputSlot {
    ticket: DependencyTicket,
    type_checker: TypeChecker,
    fixed: Option<AbstractValue>,
}

struct Source<T> {
    ticket: DependencyTicket,
    value: T,
}

/// Runtime mirror of one System's declarations.
pub struct Context {
    system_name: String,
    system_id: Option<SystemId>,
    initialized: bool,
    graph: DependencyGraph,
    cache: Cache,
    time: f64,
    continuous_state: DVector<f64>,
    discrete_state: Vec<Source<DVector<f64>>>,
    abstract_state: Vec<Source<AbstractValue>>,
    numeric_parameters: Vec<Source<DVector<f64>>>,
    abstract_parameters: Vec<Source<AbstractValue>>,
    input_ports: Vec<InputSlot>,
    output_ports: Vec<DependencyTicket>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// An uninitialized Context holding only the built-in trackers.
    pub fn new() -> Self {
        Self {
            system_name: String::new(),
            system_id: None,
            initialized: false,
            graph: DependencyGraph::with_built_in_trackers(),
            cache: Cache::new(),
            time: 0.0,
            continuous_state: DVector::zeros(0),
            discrete_state: Vec::new(),
            abstract_state: Vec::new(),
            numeric_parameters: Vec::new(),
            abstract_parameters: Vec::new(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
        }
    }

    pub fn system_name(&self) -> &str {
        &self.system_name
    }

    /// Identity of the System that initialized this Context.
    pub fn system_id(&self) -> Option<SystemId> {
        self.system_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn num_input_ports(&self) -> usize {
        self.input_ports.len()
    }

    pub fn num_output_ports(&self) -> usize {
        self.output_ports.len()
    }

    pub fn input_port_ticket(&self, index: InputPortIndex) -> Option<DependencyTicket> {
        self.input_ports.get(index.0).map(|slot| slot.ticket)
    }

    pub fn output_port_ticket(&self, index: OutputPortIndex) -> Option<DependencyTicket> {
        self.output_ports.get(index.0).copied()
    }

    pub fn fixed_input_value(&self, index: InputPortIndex) -> Option<&AbstractValue> {
        self.input_ports
            .get(index.0)
            .and_then(|slot| slot.fixed.as_ref())
    }
}

/// Mutators reserved for the Context initializer.
pub(crate) trait InitializationAccess {
    fn is_initialized(&self) -> bool;
    fn set_system_name(&mut self, name: &str);
    fn set_system_id(&mut self, id: SystemId);
    fn graph_mut(&mut self) -> &mut DependencyGraph;
    fn cache_and_graph_mut(&mut self) -> (&mut Cache, &mut DependencyGraph);
    fn set_continuous_state(&mut self, model: DVector<f64>);
    fn add_discrete_state(&mut self, ticket: DependencyTicket, model: DVector<f64>);
    fn add_abstract_state(&mut self, ticket: DependencyTicket, model: AbstractValue);
    fn add_numeric_parameter(&mut self, ticket: DependencyTicket, model: DVector<f64>);
    fn add_abstract_parameter(&mut self, ticket: DependencyTicket, model: AbstractValue);
    fn add_input_port(
        &mut self,
        index: InputPortIndex,
        ticket: DependencyTicket,
        type_checker: TypeChecker,
    ) -> Result<()>;
    fn add_output_port(
        &mut self,
        index: OutputPortIndex,
        ticket: DependencyTicket,
        prerequisite: Option<DependencyTicket>,
    ) -> Result<()>;
    fn mark_initialized(&mut self);
}

impl InitializationAccess for Context {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn set_system_name(&mut self, name: &str) {
        self.system_name = name.to_string();
    }

    fn set_system_id(&mut self, id: SystemId) {
        self.system_id = Some(id);
    }

    fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    fn cache_and_graph_mut(&mut self) -> (&mut Cache, &mut DependencyGraph) {
        (&mut self.cache, &mut self.graph)
    }

    fn set_continuous_state(&mut self, model: DVector<f64>) {
        self.continuous_state = model;
    }

    fn add_discrete_state(&mut self, ticket: DependencyTicket, model: DVector<f64>) {
        self.discrete_state.push(Source { ticket, value: model });
    }

    fn add_abstract_state(&mut self, ticket: DependencyTicket, model: AbstractValue) {
        self.abstract_state.push(Source { ticket, value: model });
    }

    fn add_numeric_parameter(&mut self, ticket: DependencyTicket, model: DVector<f64>) {
        self.numeric_parameters.push(Source { ticket, value: model });
    }

    fn add_abstract_parameter(&mut self, ticket: DependencyTicket, model: AbstractValue) {
        self.abstract_parameters.push(Source { ticket, value: model });
    }

    fn add_input_port(
        &mut self,
        index: InputPortIndex,
        ticket: DependencyTicket,
        type_checker: TypeChecker,
    ) -> Result<()> {
        debug_assert_eq!(index.0, self.input_ports.len());
        self.graph
            .create_tracker(ticket, format!("u{}", index.0))?;
        self.graph.subscribe(ALL_INPUT_PORTS_TICKET, ticket)?;
        self.input_ports.push(InputSlot {
            ticket,
            type_checker,
            fixed: None,
        });
        Ok(())
    }

    fn add_output_port(
        &mut self,
        index: OutputPortIndex,
        ticket: DependencyTicket,
        prerequisite: Option<DependencyTicket>,
    ) -> Result<()> {
        debug_assert_eq!(index.0, self.output_ports.len());
        self.graph
            .create_tracker(ticket, format!("y{}", index.0))?;
        if let Some(prerequisite) = prerequisite {
            self.graph.subscribe(ticket, prerequisite)?;
        }
        self.output_ports.push(ticket);
        Ok(())
    }

    fn mark_initialized(&mut self) {
        self.initialized = true;
    }
}

struct ContextNode<'s> {
    system: &'s dyn System,
    context: Context,
    parent: Option<ContextIndex>,
    children: Vec<ContextIndex>,
}

/// Arena owning every Context of one evaluation instance. Index 0 is the
/// root.
///
/// A tree borrows the Systems it was created from. It is `Send` but not
/// `Sync`: one thread at a time may evaluate or mutate it.
pub struct ContextTree<'s> {
    nodes: Vec<ContextNode<'s>>,
    change_event: u64,
}

impl<'s> ContextTree<'s> {
    /// Creates and initializes the Contexts for `system` and all of its
    /// subsystems.
    pub fn new(system: &'s dyn System) -> Result<Self> {
        Self::with_options(system, ContextOptions::default())
    }

    pub fn with_options(system: &'s dyn System, options: ContextOptions) -> Result<Self> {
        let mut tree = Self {
            nodes: Vec::new(),
            change_event: 0,
        };
        system.build_context(&mut tree, None)?;
        if tree.is_empty() {
            return Err(Error::PreconditionViolation(format!(
                "ContextTree::new(): System {} did not add a root Context",
                system.base().pathname()
            )));
        }
        if !options.caching {
            tree.disable_caching_all();
        }
        Ok(tree)
    }

    /// Adds an initialized Context. Called from
    /// [`System::build_context`] implementations.
    pub fn push(
        &mut self,
        system: &'s dyn System,
        context: Context,
        parent: Option<ContextIndex>,
    ) -> Result<ContextIndex> {
        if !context.is_initialized() {
            return Err(Error::PreconditionViolation(format!(
                "ContextTree::push(): the Context for system '{}' has not been initialized",
                system.base().name()
            )));
        }
        if context.system_id() != Some(system.base().id()) {
            return Err(Error::ContextMismatch(format!(
                "ContextTree::push(): the Context was initialized for '{}', not for System {}",
                context.system_name(),
                system.base().pathname()
            )));
        }
        if parent.is_none() && !self.nodes.is_empty() {
            return Err(Error::PreconditionViolation(
                "ContextTree::push(): the tree already has a root Context".into(),
            ));
        }
        let index = ContextIndex(self.nodes.len());
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.push(index);
        }
        self.nodes.push(ContextNode {
            system,
            context,
            parent,
            children: Vec::new(),
        });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> ContextRef<'_> {
        ContextRef {
            tree: self,
            index: ContextIndex(0),
        }
    }

    pub fn get(&self, index: ContextIndex) -> Result<ContextRef<'_>> {
        self.node(index)?;
        Ok(ContextRef { tree: self, index })
    }

    pub fn context(&self, index: ContextIndex) -> Result<&Context> {
        Ok(&self.node(index)?.context)
    }

    fn node(&self, index: ContextIndex) -> Result<&ContextNode<'s>> {
        self.nodes.get(index.0).ok_or_else(|| self.no_such_context(index))
    }

    fn node_mut(&mut self, index: ContextIndex) -> Result<&mut ContextNode<'s>> {
        let count = self.nodes.len();
        self.nodes
            .get_mut(index.0)
            .ok_or_else(|| no_such_context(index, count))
    }

    fn no_such_context(&self, index: ContextIndex) -> Error {
        no_such_context(index, self.nodes.len())
    }

    fn no_such_input(&self, func: &str, context: ContextIndex, index: InputPortIndex) -> Error {
        let count = self
            .context(context)
            .map_or(0, |context| context.num_input_ports());
        Error::OutOfRange(format!(
            "ContextTree::{func}(): there is no input port with index {index} \
             because there are only {count} input ports in system {}.",
            self.pathname(context)
        ))
    }

    fn pathname(&self, index: ContextIndex) -> String {
        match self.get(index) {
            Ok(context) => context.pathname(),
            Err(_) => format!("<context {index}>"),
        }
    }

    /// Links trackers that live in different Contexts of this tree.
    pub fn subscribe_across(&mut self, subscriber: TrackerRef, prerequisite: TrackerRef) -> Result<()> {
        for end in [subscriber, prerequisite] {
            if !self.context(end.context)?.graph().has_tracker(end.ticket) {
                return Err(Error::PreconditionViolation(format!(
                    "ContextTree::subscribe_across(): there is no tracker for ticket {} in {}",
                    end.ticket,
                    self.pathname(end.context)
                )));
            }
        }
        self.node_mut(prerequisite.context)?
            .context
            .graph
            .tracker_mut(prerequisite.ticket)?
            .add_subscriber(TrackerLink::Remote(subscriber));
        self.node_mut(subscriber.context)?
            .context
            .graph
            .tracker_mut(subscriber.ticket)?
            .add_prerequisite(TrackerLink::Remote(prerequisite));
        Ok(())
    }

    /// Reports a change to the quantity `ticket` of Context `context`. Every
    /// tracker reachable through subscriptions, in any Context of the tree,
    /// has its stamp advanced and its cache value marked out of date.
    pub fn notify_changed(&mut self, context: ContextIndex, ticket: DependencyTicket) -> Result<()> {
        if !self.context(context)?.graph().has_tracker(ticket) {
            return Err(Error::PreconditionViolation(format!(
                "ContextTree::notify_changed(): there is no tracker for ticket {ticket} in {}",
                self.pathname(context)
            )));
        }
        self.propagate(vec![TrackerRef { context, ticket }])
    }

    fn propagate(&mut self, start: Vec<TrackerRef>) -> Result<()> {
        self.change_event += 1;
        let event = self.change_event;
        let mut pending = start;
        let mut visited = 0usize;
        while let Some(target) = pending.pop() {
            let node = self.node_mut(target.context)?;
            let tracker = node.context.graph.tracker_mut(target.ticket)?;
            if !tracker.note_change_event(event) {
                continue;
            }
            visited += 1;
            let cache_index = tracker.cache_index();
            pending.extend(
                tracker
                    .subscribers()
                    .iter()
                    .map(|link| link.resolve(target.context)),
            );
            if let Some(cache_index) = cache_index {
                node.context.cache.mark_out_of_date(cache_index)?;
            }
        }
        trace!(event, visited, "invalidation sweep");
        Ok(())
    }

    /// Fixes the value of an input port, overriding any connection. The
    /// value is checked against the declared port type first.
    pub fn fix_input_port(
        &mut self,
        context: ContextIndex,
        index: InputPortIndex,
        value: AbstractValue,
    ) -> Result<()> {
        let node = self.node(context)?;
        let Some(slot) = node.context.input_ports.get(index.0) else {
            return Err(self.no_such_input("fix_input_port", context, index));
        };
        (slot.type_checker)(&value)?;
        let ticket = slot.ticket;
        self.node_mut(context)?.context.input_ports[index.0].fixed = Some(value);
        self.propagate(vec![TrackerRef { context, ticket }])
    }

    pub fn fix_vector_input(&mut self, context: ContextIndex, index: InputPortIndex, values: &[f64]) -> Result<()> {
        self.fix_input_port(context, index, AbstractValue::from_slice(values))
    }

    /// Removes a fixed value. Returns whether one was present.
    pub fn clear_fixed_input(&mut self, context: ContextIndex, index: InputPortIndex) -> Result<bool> {
        if index.0 >= self.context(context)?.num_input_ports() {
            return Err(self.no_such_input("clear_fixed_input", context, index));
        }
        let node = self.node_mut(context)?;
        let Some(slot) = node.context.input_ports.get_mut(index.0) else {
            return Ok(false);
        };
        if slot.fixed.take().is_none() {
            return Ok(false);
        }
        let ticket = slot.ticket;
        self.propagate(vec![TrackerRef { context, ticket }])?;
        Ok(true)
    }

    /// Sets time in every Context of the tree.
    pub fn set_time(&mut self, time: f64) -> Result<()> {
        let mut changed = Vec::with_capacity(self.nodes.len());
        for (position, node) in self.nodes.iter_mut().enumerate() {
            node.context.time = time;
            changed.push(TrackerRef {
                context: ContextIndex(position),
                ticket: TIME_TICKET,
            });
        }
        self.propagate(changed)
    }

    pub fn set_continuous_state(&mut self, context: ContextIndex, value: DVector<f64>) -> Result<()> {
        let current = &self.node(context)?.context.continuous_state;
        if current.len() != value.len() {
            return Err(Error::TypeMismatch(format!(
                "ContextTree::set_continuous_state(): expected {} values but got {} in {}",
                current.len(),
                value.len(),
                self.pathname(context)
            )));
        }
        self.node_mut(context)?.context.continuous_state = value;
        self.propagate(vec![TrackerRef {
            context,
            ticket: XC_TICKET,
        }])
    }

    pub fn set_discrete_state(&mut self, context: ContextIndex, group: usize, value: DVector<f64>) -> Result<()> {
        let pathname = self.pathname(context);
        let node = self.node_mut(context)?;
        let ticket = replace_vector(&mut node.context.discrete_state, group, value, "discrete state group", &pathname)?;
        self.propagate(vec![TrackerRef { context, ticket }])
    }

    pub fn set_numeric_parameter(&mut self, context: ContextIndex, index: usize, value: DVector<f64>) -> Result<()> {
        let pathname = self.pathname(context);
        let node = self.node_mut(context)?;
        let ticket = replace_vector(&mut node.context.numeric_parameters, index, value, "numeric parameter", &pathname)?;
        self.propagate(vec![TrackerRef { context, ticket }])
    }

    pub fn set_abstract_state(&mut self, context: ContextIndex, index: usize, value: AbstractValue) -> Result<()> {
        let pathname = self.pathname(context);
        let node = self.node_mut(context)?;
        let ticket = replace_abstract(&mut node.context.abstract_state, index, value, "abstract state", &pathname)?;
        self.propagate(vec![TrackerRef { context, ticket }])
    }

    pub fn set_abstract_parameter(&mut self, context: ContextIndex, index: usize, value: AbstractValue) -> Result<()> {
        let pathname = self.pathname(context);
        let node = self.node_mut(context)?;
        let ticket = replace_abstract(&mut node.context.abstract_parameters, index, value, "abstract parameter", &pathname)?;
        self.propagate(vec![TrackerRef { context, ticket }])
    }

    /// Forces recalculation of one cache entry on every read.
    pub fn disable_caching(&mut self, context: ContextIndex, index: CacheIndex) -> Result<()> {
        self.node_mut(context)?
            .context
            .cache
            .entry_value_mut(index)?
            .set_caching_enabled(false);
        Ok(())
    }

    /// Restores memoization for one cache entry. The next read recalculates.
    pub fn enable_caching(&mut self, context: ContextIndex, index: CacheIndex) -> Result<()> {
        let value = self.node_mut(context)?.context.cache.entry_value_mut(index)?;
        value.set_caching_enabled(true);
        value.mark_out_of_date();
        Ok(())
    }

    pub fn disable_caching_all(&mut self) {
        for node in &mut self.nodes {
            node.context.cache.set_all_caching_enabled(false);
        }
    }

    /// Re-enables every cache entry. All values are marked out of date.
    pub fn enable_caching_all(&mut self) {
        for node in &mut self.nodes {
            node.context.cache.set_all_caching_enabled(true);
        }
    }
}

impl fmt::Debug for ContextTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextTree")
            .field("contexts", &self.nodes.len())
            .field("change_event", &self.change_event)
            .finish()
    }
}

fn no_such_context(index: ContextIndex, count: usize) -> Error {
    Error::OutOfRange(format!(
        "ContextTree: there is no Context with index {index} because the tree holds only {count} Contexts"
    ))
}

fn replace_vector(
    sources: &mut [Source<DVector<f64>>],
    index: usize,
    value: DVector<f64>,
    what: &str,
    pathname: &str,
) -> Result<DependencyTicket> {
    let count = sources.len();
    let source = sources.get_mut(index).ok_or_else(|| {
        Error::OutOfRange(format!(
            "there is no {what} with index {index} because there are only {count} in {pathname}"
        ))
    })?;
    if source.value.len() != value.len() {
        return Err(Error::TypeMismatch(format!(
            "{what} {index} of {pathname} has size {} but the new value has size {}",
            source.value.len(),
            value.len()
        )));
    }
    source.value = value;
    Ok(source.ticket)
}

fn replace_abstract(
    sources: &mut [Source<AbstractValue>],
    index: usize,
    value: AbstractValue,
    what: &str,
    pathname: &str,
) -> Result<DependencyTicket> {
    let count = sources.len();
    let source = sources.get_mut(index).ok_or_else(|| {
        Error::OutOfRange(format!(
            "there is no {what} with index {index} because there are only {count} in {pathname}"
        ))
    })?;
    if source.value.value_type_id() != value.value_type_id() {
        return Err(Error::TypeMismatch(format!(
            "{what} {index} of {pathname} holds {} but the new value is {}",
            source.value.type_name(),
            value.type_name()
        )));
    }
    source.value = value;
    Ok(source.ticket)
}

/// Shared handle to one Context of a tree.
#[derive(Clone, Copy)]
pub struct ContextRef<'a> {
    tree: &'a ContextTree<'a>,
    index: ContextIndex,
}

impl<'a> ContextRef<'a> {
    fn node(&self) -> &'a ContextNode<'a> {
        &self.tree.nodes[self.index.0]
    }

    pub fn index(&self) -> ContextIndex {
        self.index
    }

    pub fn context(&self) -> &'a Context {
        &self.node().context
    }

    /// The System this Context was created for.
    pub fn system(&self) -> &'a dyn System {
        self.node().system
    }

    pub fn system_id(&self) -> Option<SystemId> {
        self.context().system_id()
    }

    pub fn is_root(&self) -> bool {
        self.node().parent.is_none()
    }

    pub fn parent(&self) -> Option<ContextRef<'a>> {
        self.node().parent.map(|index| ContextRef {
            tree: self.tree,
            index,
        })
    }

    pub fn root(&self) -> ContextRef<'a> {
        let mut current = *self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn num_subcontexts(&self) -> usize {
        self.node().children.len()
    }

    pub fn subcontext(&self, position: usize) -> Result<ContextRef<'a>> {
        let children = &self.node().children;
        let index = children.get(position).copied().ok_or_else(|| {
            Error::OutOfRange(format!(
                "Context {} has no subcontext {position} because it has only {}",
                self.pathname(),
                children.len()
            ))
        })?;
        Ok(ContextRef {
            tree: self.tree,
            index,
        })
    }

    /// All Contexts of the tree, in creation order.
    pub(crate) fn tree_contexts(&self) -> impl Iterator<Item = ContextRef<'a>> + 'a {
        let tree = self.tree;
        (0..tree.nodes.len()).map(move |position| ContextRef {
            tree,
            index: ContextIndex(position),
        })
    }

    /// Pathname built from the display names recorded in this Context and
    /// its ancestors.
    pub fn pathname(&self) -> String {
        let mut names = Vec::new();
        let mut current = Some(*self);
        while let Some(context) = current {
            names.push(context.context().system_name());
            current = context.parent();
        }
        join_pathname(names.into_iter().rev())
    }

    pub fn time(&self) -> f64 {
        self.context().time
    }

    pub fn continuous_state(&self) -> &'a DVector<f64> {
        &self.context().continuous_state
    }

    pub fn discrete_state(&self, group: usize) -> Result<&'a DVector<f64>> {
        lookup(&self.context().discrete_state, group, "discrete state group", self)
    }

    pub fn abstract_state(&self, index: usize) -> Result<&'a AbstractValue> {
        lookup(&self.context().abstract_state, index, "abstract state", self)
    }

    pub fn numeric_parameter(&self, index: usize) -> Result<&'a DVector<f64>> {
        lookup(&self.context().numeric_parameters, index, "numeric parameter", self)
    }

    pub fn abstract_parameter(&self, index: usize) -> Result<&'a AbstractValue> {
        lookup(&self.context().abstract_parameters, index, "abstract parameter", self)
    }

    pub fn eval_input_port(&self, index: impl Into<InputPortIndex>) -> Result<Option<AbstractValue>> {
        self.system().base().eval_input_port(*self, index.into())
    }

    pub fn eval_vector_input(&self, index: impl Into<InputPortIndex>) -> Result<Option<DVector<f64>>> {
        self.system().base().eval_vector_input(*self, index.into())
    }

    pub fn eval_input_value<T: Any + Clone>(&self, index: impl Into<InputPortIndex>) -> Result<Option<T>> {
        self.system().base().eval_input_value::<T>(*self, index.into())
    }

    pub fn eval_required_input(&self, index: impl Into<InputPortIndex>) -> Result<AbstractValue> {
        self.system().base().eval_required_input(*self, index.into())
    }

    pub fn eval_output_port(&self, index: impl Into<OutputPortIndex>) -> Result<AbstractValue> {
        self.system().base().eval_output_port(*self, index.into())
    }

    pub fn get_cache_value(&self, index: impl Into<CacheIndex>) -> Result<AbstractValue> {
        self.system().base().get_cache_value(*self, index.into())
    }
}

fn lookup<'a, T>(sources: &'a [Source<T>], index: usize, what: &str, context: &ContextRef<'_>) -> Result<&'a T> {
    sources.get(index).map(|source| &source.value).ok_or_else(|| {
        Error::OutOfRange(format!(
            "there is no {what} with index {index} because there are only {} in {}",
            sources.len(),
            context.pathname()
        ))
    })
}

impl fmt::Debug for ContextRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("index", &self.index)
            .field("pathname", &self.pathname())
            .finish()
    }
}
