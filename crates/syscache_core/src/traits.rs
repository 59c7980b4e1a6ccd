use crate::context::{ContextRef, ContextTree};
use crate::error::Result;
use crate::system_base::{Ancestor, SystemBase};
use crate::ticket::{ContextIndex, InputPortIndex, OutputPortIndex, SubsystemIndex};
use crate::value::AbstractValue;

/// A declared computational System: a leaf or a composition of Systems.
///
/// Systems are immutable once built and may be shared between threads;
/// all runtime state lives in the Contexts created from them.
pub trait System: Send + Sync {
    /// Declarations and identity shared by every System kind.
    fn base(&self) -> &SystemBase;

    fn base_mut(&mut self) -> &mut SystemBase;

    /// Creates and initializes this System's Context, plus those of any
    /// subsystems, and adds them to `tree` below `parent`.
    fn build_context<'s>(
        &'s self,
        tree: &mut ContextTree<'s>,
        parent: Option<ContextIndex>,
    ) -> Result<ContextIndex>;

    /// The capability to evaluate subsystem ports. Leaf Systems have none.
    fn hierarchy_resolver(&self) -> Option<&dyn HierarchyResolver> {
        None
    }

    /// Directly contained Systems, in subsystem-index order.
    fn subsystems(&self) -> &[Box<dyn System>] {
        &[]
    }

    /// Records the enclosing composition. `ancestry` lists the enclosing
    /// Systems from the root down to the direct parent.
    fn attach_to_parent(&mut self, index_in_parent: SubsystemIndex, ancestry: &[Ancestor]) {
        self.base_mut().attach_to_parent(index_in_parent, ancestry);
    }
}

/// Identifies one input port of one child of a composite System.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputPortLocator {
    pub subsystem: SubsystemIndex,
    pub port: InputPortIndex,
}

/// Identifies one output port of one child of a composite System.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputPortLocator {
    pub subsystem: SubsystemIndex,
    pub port: OutputPortIndex,
}

/// Resolves subsystem ports on behalf of the children of a composite System.
/// Every `context` argument is the composite's own Context.
pub trait HierarchyResolver {
    /// Finds whatever feeds the child input port `locator` and evaluates it.
    /// `Ok(None)` means the port is neither connected nor exported.
    fn eval_connected_subsystem_input_port(
        &self,
        context: ContextRef<'_>,
        locator: InputPortLocator,
    ) -> Result<Option<AbstractValue>>;

    /// Evaluates a child's output port in that child's subcontext.
    fn eval_subsystem_output_port(
        &self,
        context: ContextRef<'_>,
        locator: OutputPortLocator,
    ) -> Result<AbstractValue>;
}
