//! Input and output port descriptors.

use crate::error::{Error, Result};
use crate::ticket::{CacheIndex, DependencyTicket, InputPortIndex, OutputPortIndex, SubsystemIndex};
use crate::value::AbstractValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "InputPort"),
            PortDirection::Output => write!(f, "OutputPort"),
        }
    }
}

/// What a port carries.
#[derive(Debug, Clone)]
pub enum PortKind {
    /// A `DVector<f64>` of fixed size.
    Vector { size: usize },
    /// Any value with the same concrete type as `model`.
    Abstract { model: AbstractValue },
}

impl PortKind {
    pub fn is_vector(&self) -> bool {
        matches!(self, PortKind::Vector { .. })
    }

    pub fn type_description(&self) -> String {
        match self {
            PortKind::Vector { size } => format!("vector of size {size}"),
            PortKind::Abstract { model } => model.type_name().to_string(),
        }
    }

    /// A value of this kind suitable for seeding a cache slot.
    pub fn model_value(&self) -> AbstractValue {
        match self {
            PortKind::Vector { size } => AbstractValue::vector(nalgebra::DVector::zeros(*size)),
            PortKind::Abstract { model } => model.clone(),
        }
    }

    /// Returns a description of the actual type if `value` does not fit.
    pub fn mismatch(&self, value: &AbstractValue) -> Option<String> {
        match self {
            PortKind::Vector { size } => match value.as_vector() {
                Some(vector) if vector.len() == *size => None,
                Some(vector) => Some(format!("vector of size {}", vector.len())),
                None => Some(value.type_name().to_string()),
            },
            PortKind::Abstract { model } => {
                if model.value_type_id() == value.value_type_id() {
                    None
                } else {
                    Some(value.type_name().to_string())
                }
            }
        }
    }
}

/// State shared by input and output ports.
#[derive(Debug)]
pub struct PortBase {
    name: String,
    ticket: DependencyTicket,
    kind: PortKind,
    deprecation: Option<String>,
    deprecation_warned: AtomicBool,
}

impl PortBase {
    fn new(name: String, ticket: DependencyTicket, kind: PortKind) -> Self {
        Self {
            name,
            ticket,
            kind,
            deprecation: None,
            deprecation_warned: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ticket(&self) -> DependencyTicket {
        self.ticket
    }

    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    pub fn deprecation(&self) -> Option<&str> {
        self.deprecation.as_deref()
    }

    pub(crate) fn set_deprecation(&mut self, message: String) {
        self.deprecation = Some(message);
    }

    /// Sets the per-port warned flag, returning its previous value.
    pub(crate) fn mark_deprecation_warned(&self) -> bool {
        self.deprecation_warned.swap(true, Ordering::AcqRel)
    }
}

/// Checks a value handed to `fix_input_port` against the declared port type.
pub type TypeChecker = Arc<dyn Fn(&AbstractValue) -> Result<()> + Send + Sync>;

#[derive(Debug)]
pub struct InputPort {
    index: InputPortIndex,
    base: PortBase,
}

impl InputPort {
    pub(crate) fn new(index: InputPortIndex, ticket: DependencyTicket, name: String, kind: PortKind) -> Self {
        Self {
            index,
            base: PortBase::new(name, ticket, kind),
        }
    }

    pub fn index(&self) -> InputPortIndex {
        self.index
    }

    pub fn base(&self) -> &PortBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut PortBase {
        &mut self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn ticket(&self) -> DependencyTicket {
        self.base.ticket()
    }

    pub fn kind(&self) -> &PortKind {
        self.base.kind()
    }

    /// Builds the checker a Context uses when a value is fixed on this port.
    pub(crate) fn make_type_checker(&self, system_pathname: String) -> TypeChecker {
        let kind = self.kind().clone();
        let name = self.name().to_string();
        let index = self.index;
        Arc::new(move |value: &AbstractValue| match kind.mismatch(value) {
            None => Ok(()),
            Some(actual) => Err(Error::TypeMismatch(format!(
                "System::fix_input_port(): expected value of type {} for input port '{}' \
                 (index {}) but the actual type was {}. (System {})",
                kind.type_description(),
                name,
                index,
                actual,
                system_pathname
            ))),
        })
    }
}

/// Where an output port's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// Mirrors a cache entry of the same System.
    CacheEntry(CacheIndex),
    /// Forwards a child's output port of a composite System.
    Subsystem {
        subsystem: SubsystemIndex,
        port: OutputPortIndex,
    },
}

#[derive(Debug)]
pub struct OutputPort {
    index: OutputPortIndex,
    base: PortBase,
    source: OutputSource,
    prerequisite: Option<DependencyTicket>,
}

impl OutputPort {
    pub(crate) fn new(
        index: OutputPortIndex,
        ticket: DependencyTicket,
        name: String,
        kind: PortKind,
        source: OutputSource,
        prerequisite: Option<DependencyTicket>,
    ) -> Self {
        Self {
            index,
            base: PortBase::new(name, ticket, kind),
            source,
            prerequisite,
        }
    }

    pub fn index(&self) -> OutputPortIndex {
        self.index
    }

    pub fn base(&self) -> &PortBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut PortBase {
        &mut self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn ticket(&self) -> DependencyTicket {
        self.base.ticket()
    }

    pub fn kind(&self) -> &PortKind {
        self.base.kind()
    }

    pub fn source(&self) -> OutputSource {
        self.source
    }

    /// The intra-system tracker this port's tracker subscribes to, if any.
    pub fn prerequisite(&self) -> Option<DependencyTicket> {
        self.prerequisite
    }
}
