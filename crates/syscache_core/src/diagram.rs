//! Composite Systems.
//!
//! A [`Diagram`] owns its subsystems and records, for every child input
//! port, where its value comes from: a sibling's output port or one of the
//! Diagram's own (exported) input ports. It answers its children's requests
//! through [`HierarchyResolver`], and when building a Context tree it links
//! the child trackers across Contexts so that a change anywhere reaches every
//! dependent cache entry.

use crate::context::{Context, ContextRef, ContextTree};
use crate::dependency::TrackerRef;
use crate::error::{Error, Result};
use crate::port::{InputPort, OutputPort, OutputSource, PortKind};
use crate::system_base::{Ancestor, SystemBase};
use crate::ticket::{
    ContextIndex, DependencyTicket, InputPortIndex, OutputPortIndex, SubsystemIndex,
    ACCURACY_TICKET, PA_TICKET, PN_TICKET, TIME_TICKET, XA_TICKET, XC_TICKET, XD_TICKET,
};
use crate::traits::{HierarchyResolver, InputPortLocator, OutputPortLocator, System};
use crate::value::AbstractValue;
use std::collections::BTreeMap;
use tracing::debug;

/// Groups whose Diagram tracker follows the same tracker of every child.
/// The composite trackers (x, all parameters, all sources) follow these
/// locally.
const CHILD_GROUP_TICKETS: [DependencyTicket; 5] = [XC_TICKET, XD_TICKET, XA_TICKET, PN_TICKET, PA_TICKET];

/// Trackers each child follows from the Diagram.
const PARENT_SHARED_TICKETS: [DependencyTicket; 2] = [TIME_TICKET, ACCURACY_TICKET];

/// Where a child input port gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Connected(OutputPortLocator),
    Exported(InputPortIndex),
}

fn kinds_compatible(a: &PortKind, b: &PortKind) -> bool {
    match (a, b) {
        (PortKind::Vector { size: left }, PortKind::Vector { size: right }) => left == right,
        (PortKind::Abstract { model: left }, PortKind::Abstract { model: right }) => {
            left.value_type_id() == right.value_type_id()
        }
        _ => false,
    }
}

/// Assembles a [`Diagram`] from subsystems and the wiring between them.
pub struct DiagramBuilder {
    name: String,
    systems: Vec<Box<dyn System>>,
    input_sources: BTreeMap<InputPortLocator, InputSource>,
    exported_inputs: Vec<(String, PortKind)>,
    exported_outputs: Vec<(String, OutputPortLocator)>,
}

impl DiagramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            systems: Vec::new(),
            input_sources: BTreeMap::new(),
            exported_inputs: Vec::new(),
            exported_outputs: Vec::new(),
        }
    }

    /// Takes ownership of a subsystem. Names must be unique within the
    /// Diagram.
    pub fn add_system(&mut self, system: impl System + 'static) -> Result<SubsystemIndex> {
        let base = system.base();
        if base.parent().is_some() {
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder::add_system(): System {} already belongs to a Diagram",
                base.pathname()
            )));
        }
        if base.name().is_empty() {
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder::add_system(): subsystems of Diagram '{}' must be named",
                self.name
            )));
        }
        if self.systems.iter().any(|other| other.base().name() == base.name()) {
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder::add_system(): Diagram '{}' already has a subsystem named '{}'",
                self.name,
                base.name()
            )));
        }
        self.systems.push(Box::new(system));
        Ok(SubsystemIndex(self.systems.len() - 1))
    }

    fn child(&self, subsystem: SubsystemIndex) -> Result<&dyn System> {
        self.systems
            .get(subsystem.0)
            .map(|system| system.as_ref())
            .ok_or_else(|| {
                Error::OutOfRange(format!(
                    "DiagramBuilder: there is no subsystem with index {subsystem} because \
                     Diagram '{}' has only {} subsystems",
                    self.name,
                    self.systems.len()
                ))
            })
    }

    fn child_input(&self, locator: InputPortLocator) -> Result<&InputPort> {
        self.child(locator.subsystem)?.base().input_port(locator.port)
    }

    fn child_output(&self, locator: OutputPortLocator) -> Result<&OutputPort> {
        self.child(locator.subsystem)?.base().output_port(locator.port)
    }

    fn check_unclaimed(&self, destination: InputPortLocator) -> Result<()> {
        if self.input_sources.contains_key(&destination) {
            let port = self.child_input(destination)?;
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder: input port '{}' of System {} is already connected",
                port.name(),
                self.child(destination.subsystem)?.base().pathname()
            )));
        }
        Ok(())
    }

    fn check_compatible(&self, what: &str, source: &PortKind, destination: InputPortLocator) -> Result<()> {
        let port = self.child_input(destination)?;
        if !kinds_compatible(source, port.kind()) {
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder::{what}(): cannot feed a {} into input port '{}' of type {}",
                source.type_description(),
                port.name(),
                port.kind().type_description()
            )));
        }
        Ok(())
    }

    /// Feeds a child's output port into another child's input port.
    pub fn connect(&mut self, source: OutputPortLocator, destination: InputPortLocator) -> Result<()> {
        let kind = self.child_output(source)?.kind().clone();
        self.check_compatible("connect", &kind, destination)?;
        self.check_unclaimed(destination)?;
        self.input_sources
            .insert(destination, InputSource::Connected(source));
        Ok(())
    }

    /// Creates a Diagram input port that feeds `destination`.
    pub fn export_input(&mut self, destination: InputPortLocator, name: impl Into<String>) -> Result<InputPortIndex> {
        let name = name.into();
        let kind = self.child_input(destination)?.kind().clone();
        self.check_unclaimed(destination)?;
        if self.exported_inputs.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder::export_input(): Diagram '{}' already has an input port named '{name}'",
                self.name
            )));
        }
        let index = InputPortIndex(self.exported_inputs.len());
        self.exported_inputs.push((name, kind));
        self.input_sources
            .insert(destination, InputSource::Exported(index));
        Ok(index)
    }

    /// Feeds an already exported Diagram input to one more child input.
    pub fn connect_input(&mut self, diagram_input: InputPortIndex, destination: InputPortLocator) -> Result<()> {
        let kind = self
            .exported_inputs
            .get(diagram_input.0)
            .map(|(_, kind)| kind.clone())
            .ok_or_else(|| {
                Error::OutOfRange(format!(
                    "DiagramBuilder::connect_input(): there is no Diagram input with index \
                     {diagram_input} because there are only {} exported inputs",
                    self.exported_inputs.len()
                ))
            })?;
        self.check_compatible("connect_input", &kind, destination)?;
        self.check_unclaimed(destination)?;
        self.input_sources
            .insert(destination, InputSource::Exported(diagram_input));
        Ok(())
    }

    /// Creates a Diagram output port that forwards a child's output port.
    pub fn export_output(&mut self, source: OutputPortLocator, name: impl Into<String>) -> Result<OutputPortIndex> {
        let name = name.into();
        self.child_output(source)?;
        if self.exported_outputs.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::PreconditionViolation(format!(
                "DiagramBuilder::export_output(): Diagram '{}' already has an output port named '{name}'",
                self.name
            )));
        }
        self.exported_outputs.push((name, source));
        Ok(OutputPortIndex(self.exported_outputs.len() - 1))
    }

    pub fn build(self) -> Result<Diagram> {
        let mut base = SystemBase::new("Diagram", self.name);
        for (name, kind) in &self.exported_inputs {
            base.declare_input_port(name.clone(), kind.clone())?;
        }
        for (name, locator) in &self.exported_outputs {
            let kind = self
                .systems
                .get(locator.subsystem.0)
                .map(|child| child.base().output_port(locator.port))
                .transpose()?
                .map(|port| port.kind().clone())
                .ok_or_else(|| {
                    Error::OutOfRange(format!(
                        "DiagramBuilder::build(): exported output '{name}' names missing subsystem {}",
                        locator.subsystem
                    ))
                })?;
            base.declare_output_port(
                name.clone(),
                kind,
                OutputSource::Subsystem {
                    subsystem: locator.subsystem,
                    port: locator.port,
                },
                None,
            )?;
        }

        if !self.systems.is_empty() {
            base.lock_name();
        }

        let mut diagram = Diagram {
            base,
            systems: self.systems,
            input_sources: self.input_sources,
        };
        let ancestry = [diagram.base.as_ancestor()];
        diagram.attach_children(&ancestry);
        debug!(
            diagram = %diagram.base.pathname(),
            subsystems = diagram.systems.len(),
            connections = diagram.input_sources.len(),
            "built diagram"
        );
        Ok(diagram)
    }
}

/// A System composed of subsystems.
pub struct Diagram {
    base: SystemBase,
    systems: Vec<Box<dyn System>>,
    input_sources: BTreeMap<InputPortLocator, InputSource>,
}

impl Diagram {
    pub fn num_subsystems(&self) -> usize {
        self.systems.len()
    }

    pub fn subsystem(&self, index: SubsystemIndex) -> Result<&dyn System> {
        self.systems
            .get(index.0)
            .map(|system| system.as_ref())
            .ok_or_else(|| {
                Error::OutOfRange(format!(
                    "Diagram::subsystem(): there is no subsystem with index {index} because \
                     Diagram {} has only {} subsystems",
                    self.base.pathname(),
                    self.systems.len()
                ))
            })
    }

    pub fn subsystem_by_name(&self, name: &str) -> Option<&dyn System> {
        self.systems
            .iter()
            .find(|system| system.base().name() == name)
            .map(|system| system.as_ref())
    }

    pub fn input_source(&self, locator: InputPortLocator) -> Option<InputSource> {
        self.input_sources.get(&locator).copied()
    }

    fn attach_children(&mut self, ancestry: &[Ancestor]) {
        for (position, child) in self.systems.iter_mut().enumerate() {
            child.attach_to_parent(SubsystemIndex(position), ancestry);
        }
    }

    /// Subscribes child input trackers to whatever feeds them, exported
    /// output trackers to the child outputs they forward, and the Diagram's
    /// state and parameter groups to those of every child.
    fn link_subcontexts(
        &self,
        tree: &mut ContextTree<'_>,
        own: ContextIndex,
        children: &[ContextIndex],
    ) -> Result<()> {
        let child_context = |subsystem: SubsystemIndex| {
            children.get(subsystem.0).copied().ok_or_else(|| {
                Error::PreconditionViolation(format!(
                    "Diagram {}: no subcontext was built for subsystem {subsystem}",
                    self.base.pathname()
                ))
            })
        };

        for (destination, source) in &self.input_sources {
            let subscriber = TrackerRef {
                context: child_context(destination.subsystem)?,
                ticket: self
                    .subsystem(destination.subsystem)?
                    .base()
                    .input_port(destination.port)?
                    .ticket(),
            };
            let prerequisite = match source {
                InputSource::Connected(upstream) => TrackerRef {
                    context: child_context(upstream.subsystem)?,
                    ticket: self
                        .subsystem(upstream.subsystem)?
                        .base()
                        .output_port(upstream.port)?
                        .ticket(),
                },
                InputSource::Exported(port) => TrackerRef {
                    context: own,
                    ticket: self.base.input_port(*port)?.ticket(),
                },
            };
            tree.subscribe_across(subscriber, prerequisite)?;
        }

        for port in self.base.output_ports() {
            if let OutputSource::Subsystem { subsystem, port: child_port } = port.source() {
                let prerequisite = TrackerRef {
                    context: child_context(subsystem)?,
                    ticket: self.subsystem(subsystem)?.base().output_port(child_port)?.ticket(),
                };
                tree.subscribe_across(
                    TrackerRef {
                        context: own,
                        ticket: port.ticket(),
                    },
                    prerequisite,
                )?;
            }
        }

        for &child in children {
            for group in CHILD_GROUP_TICKETS {
                tree.subscribe_across(
                    TrackerRef { context: own, ticket: group },
                    TrackerRef { context: child, ticket: group },
                )?;
            }
            for shared in PARENT_SHARED_TICKETS {
                tree.subscribe_across(
                    TrackerRef { context: child, ticket: shared },
                    TrackerRef { context: own, ticket: shared },
                )?;
            }
        }
        Ok(())
    }
}

impl System for Diagram {
    fn base(&self) -> &SystemBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SystemBase {
        &mut self.base
    }

    fn build_context<'s>(
        &'s self,
        tree: &mut ContextTree<'s>,
        parent: Option<ContextIndex>,
    ) -> Result<ContextIndex> {
        let mut context = Context::new();
        self.base.initialize_context(&mut context)?;
        let own = tree.push(self, context, parent)?;
        let children = self
            .systems
            .iter()
            .map(|child| child.as_ref().build_context(tree, Some(own)))
            .collect::<Result<Vec<_>>>()?;
        self.link_subcontexts(tree, own, &children)?;
        debug!(
            diagram = %self.base.pathname(),
            subcontexts = children.len(),
            "linked subcontexts"
        );
        Ok(own)
    }

    fn hierarchy_resolver(&self) -> Option<&dyn HierarchyResolver> {
        Some(self)
    }

    fn subsystems(&self) -> &[Box<dyn System>] {
        &self.systems
    }

    fn attach_to_parent(&mut self, index_in_parent: SubsystemIndex, ancestry: &[Ancestor]) {
        self.base.attach_to_parent(index_in_parent, ancestry);
        let mut chain = ancestry.to_vec();
        chain.push(self.base.as_ancestor());
        self.attach_children(&chain);
    }
}

impl HierarchyResolver for Diagram {
    fn eval_connected_subsystem_input_port(
        &self,
        context: ContextRef<'_>,
        locator: InputPortLocator,
    ) -> Result<Option<AbstractValue>> {
        self.base.validate_context(context)?;
        match self.input_sources.get(&locator) {
            None => Ok(None),
            Some(InputSource::Connected(upstream)) => {
                self.eval_subsystem_output_port(context, *upstream).map(Some)
            }
            Some(InputSource::Exported(port)) => self.base.eval_input_port(context, *port),
        }
    }

    fn eval_subsystem_output_port(
        &self,
        context: ContextRef<'_>,
        locator: OutputPortLocator,
    ) -> Result<AbstractValue> {
        self.base.validate_context(context)?;
        let child = self.subsystem(locator.subsystem)?;
        let subcontext = context.subcontext(locator.subsystem.0)?;
        child.base().eval_output_port(subcontext, locator.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::leaf::LeafSystem;
    use crate::cache_entry::ValueProducer;
    use crate::ticket::{CacheIndex, ALL_INPUT_PORTS_TICKET, ALL_PARAMETERS_TICKET, X_TICKET};
    use nalgebra::DVector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn doubler(name: &str, calls: Arc<AtomicUsize>) -> LeafSystem {
        let mut system = LeafSystem::new("Doubler", name);
        system.declare_vector_input_port("u", 1).expect("input");
        system
            .declare_vector_output_port(
                "y",
                1,
                move |context| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let u = context
                        .eval_vector_input(InputPortIndex(0))?
                        .unwrap_or_else(|| DVector::zeros(1));
                    Ok(u * 2.0)
                },
                [ALL_INPUT_PORTS_TICKET],
            )
            .expect("output");
        system
    }

    fn input(subsystem: usize, port: usize) -> InputPortLocator {
        InputPortLocator {
            subsystem: SubsystemIndex(subsystem),
            port: InputPortIndex(port),
        }
    }

    fn output(subsystem: usize, port: usize) -> OutputPortLocator {
        OutputPortLocator {
            subsystem: SubsystemIndex(subsystem),
            port: OutputPortIndex(port),
        }
    }

    fn chain(first: Arc<AtomicUsize>, second: Arc<AtomicUsize>) -> Diagram {
        let mut builder = DiagramBuilder::new("chain");
        builder.add_system(doubler("first", first)).expect("first");
        builder.add_system(doubler("second", second)).expect("second");
        builder.export_input(input(0, 0), "u").expect("export u");
        builder.connect(output(0, 0), input(1, 0)).expect("connect");
        builder.export_output(output(1, 0), "y").expect("export y");
        builder.build().expect("build")
    }

    fn scalar(value: &AbstractValue) -> f64 {
        value.as_vector().map(|v| v[0]).expect("vector value")
    }

    #[test]
    fn sibling_connection_propagates_across_contexts() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let diagram = chain(first.clone(), second.clone());
        let mut tree = ContextTree::new(&diagram).expect("tree");
        assert_eq!(tree.len(), 3);

        tree.fix_vector_input(ContextIndex(0), InputPortIndex(0), &[1.5])
            .expect("fix");
        let y = tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(scalar(&y), 6.0);
        tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        tree.fix_vector_input(ContextIndex(0), InputPortIndex(0), &[-1.0])
            .expect("refix");
        let y = tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(scalar(&y), -4.0);
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exported_output_tracker_follows_child() {
        let diagram = chain(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let tree = ContextTree::new(&diagram).expect("tree");
        let root = tree.context(ContextIndex(0)).expect("root");
        let ticket = diagram.base().output_ports()[0].ticket();
        let tracker = root.graph().tracker(ticket).expect("exported y");
        assert_eq!(tracker.prerequisites().len(), 1);
    }

    #[test]
    fn children_know_their_pathnames() {
        let diagram = chain(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let second = diagram.subsystem_by_name("second").expect("second");
        assert_eq!(second.base().pathname(), "::chain::second");
        assert_eq!(second.base().root_id(), diagram.base().id());

        let tree = ContextTree::new(&diagram).expect("tree");
        let context = second
            .base()
            .get_my_context_from_root(tree.root())
            .expect("subcontext");
        assert_eq!(context.pathname(), "::chain::second");
        assert!(!context.is_root());
    }

    #[test]
    fn wiring_errors_are_reported() {
        let mut builder = DiagramBuilder::new("bad");
        builder
            .add_system(doubler("a", Arc::new(AtomicUsize::new(0))))
            .expect("a");
        let err = builder
            .add_system(doubler("a", Arc::new(AtomicUsize::new(0))))
            .expect_err("duplicate name");
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

        let mut wide = LeafSystem::new("Wide", "wide");
        wide.declare_vector_output_port("y", 3, |_| Ok(DVector::zeros(3)), [crate::ticket::NOTHING_TICKET])
            .expect("output");
        builder.add_system(wide).expect("wide");
        let err = builder
            .connect(output(1, 0), input(0, 0))
            .expect_err("size 3 into size 1");
        assert!(err.to_string().contains("vector of size 3"));

        builder.export_input(input(0, 0), "u").expect("export");
        let err = builder.export_input(input(0, 0), "v").expect_err("claimed");
        assert!(err.to_string().contains("already connected"));

        let err = builder.connect(output(5, 0), input(0, 0)).expect_err("no subsystem 5");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn unwired_child_input_is_unconnected() {
        let mut builder = DiagramBuilder::new("loose");
        builder
            .add_system(doubler("only", Arc::new(AtomicUsize::new(0))))
            .expect("only");
        let diagram = builder.build().expect("build");
        let tree = ContextTree::new(&diagram).expect("tree");
        let child = tree.root().subcontext(0).expect("child");
        assert!(child.eval_input_port(InputPortIndex(0)).expect("eval").is_none());
    }

    #[test]
    fn diagram_cache_entries_follow_child_state_and_parameters() {
        let mut builder = DiagramBuilder::new("store");
        for name in ["left", "right"] {
            let mut cell = LeafSystem::new("Cell", name);
            cell.base_mut()
                .declare_discrete_state(DVector::from_element(1, 1.0));
            cell.base_mut()
                .declare_numeric_parameter(DVector::from_element(1, 0.5));
            builder.add_system(cell).expect(name);
        }
        let mut diagram = builder.build().expect("build");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        diagram
            .base_mut()
            .declare_cache_entry(
                "weighted total",
                ValueProducer::from_model(AbstractValue::new(0.0_f64), move |context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut total = 0.0;
                    for position in 0..context.num_subcontexts() {
                        let cell = context.subcontext(position)?;
                        total += cell.discrete_state(0)?[0] * cell.numeric_parameter(0)?[0];
                    }
                    Ok(AbstractValue::new(total))
                }),
                [X_TICKET, ALL_PARAMETERS_TICKET],
            )
            .expect("total");

        let mut tree = ContextTree::new(&diagram).expect("tree");
        let total = |tree: &ContextTree<'_>| {
            let value = tree.root().get_cache_value(CacheIndex(0)).expect("total");
            *value.get::<f64>().expect("f64")
        };
        assert_eq!(total(&tree), 1.0);
        assert_eq!(total(&tree), 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tree.set_discrete_state(ContextIndex(2), 0, DVector::from_element(1, 7.0))
            .expect("right state");
        assert_eq!(total(&tree), 4.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tree.set_numeric_parameter(ContextIndex(1), 0, DVector::from_element(1, 2.0))
            .expect("left parameter");
        assert_eq!(total(&tree), 5.5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tree.notify_changed(ContextIndex(0), ACCURACY_TICKET)
            .expect("accuracy");
        let child = tree.context(ContextIndex(1)).expect("left");
        assert!(child.graph().tracker(ACCURACY_TICKET).expect("accuracy").change_count() > 0);
        assert_eq!(total(&tree), 5.5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn composed_systems_keep_their_names() {
        let mut diagram = chain(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let err = diagram
            .base_mut()
            .set_name("renamed")
            .expect_err("has subsystems");
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
        assert!(err.to_string().contains("cannot be renamed"));
        assert_eq!(diagram.base().name(), "chain");

        let mut loose = doubler("loose", Arc::new(AtomicUsize::new(0)));
        loose.base_mut().set_name("free").expect("not composed yet");
        let mut builder = DiagramBuilder::new("outer");
        builder.add_system(loose).expect("free");
        let mut outer = builder.build().expect("outer");
        assert_eq!(outer.subsystems()[0].base().pathname(), "::outer::free");
        let err = outer.base_mut().set_name("other").expect_err("outer is composite");
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    }
}
