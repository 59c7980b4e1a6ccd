//! Pathnames, Context/System mismatch messages and deprecation warnings.

use crate::context::ContextRef;
use crate::error::Error;
use crate::port::{PortBase, PortDirection};
use crate::system_base::SystemBase;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::warn;

/// Separator between the levels of a hierarchical pathname.
pub const PATH_SEPARATOR: &str = "::";

/// Name shown for a System or Context whose name is empty.
pub(crate) const UNNAMED: &str = "_";

/// Joins names root-first into a pathname such as `::root::arm::motor`.
pub fn join_pathname<'n>(names: impl IntoIterator<Item = &'n str>) -> String {
    names.into_iter().fold(String::new(), |mut path, name| {
        path.push_str(PATH_SEPARATOR);
        path.push_str(if name.is_empty() { UNNAMED } else { name });
        path
    })
}

/// Qualifies an operation name the way every diagnostic prefixes it.
pub(crate) fn fmt_func(func: &str) -> String {
    format!("System::{func}()")
}

/// Explains why `context` cannot be used with `system`.
///
/// Checks run from most to least specific: a root Context handed to a
/// subsystem, a subcontext handed to the root, then the generic case.
pub(crate) fn context_mismatch(system: &SystemBase, context: ContextRef<'_>) -> Error {
    let Some(context_id) = context.system_id() else {
        return Error::ContextMismatch(format!(
            "Context was not associated with any System but should have been \
             created for {} System {}",
            system.type_name(),
            system.pathname()
        ));
    };

    if system.parent().is_some() && context_id == system.root_id() {
        return Error::ContextMismatch(format!(
            "A function call on a {} system named '{}' was passed the root \
             Diagram's Context instead of the appropriate subsystem Context. \
             Use get_my_context_from_root() to acquire the appropriate \
             subsystem Context.",
            system.type_name(),
            system.pathname()
        ));
    }

    if context.root().system_id() == Some(system.id()) {
        return Error::ContextMismatch(format!(
            "A function call on the root Diagram was passed a subcontext \
             associated with its subsystem named '{}' instead of the root \
             Context. When calling a function on the root Diagram, pass the \
             root Context.",
            context.pathname()
        ));
    }

    Error::ContextMismatch(format!(
        "A function call on a {} system named '{}' was passed the Context of \
         a system named '{}' instead of the appropriate subsystem Context.",
        system.type_name(),
        system.pathname(),
        context.pathname()
    ))
}

type LedgerKey = (String, PortDirection, String);

/// Process-wide record of which deprecated ports have been reported.
///
/// Created on first use and kept for the life of the process. Keys are
/// (system type, port direction, port name), so every instance of a System
/// type shares one entry.
struct DeprecationLedger {
    warned: Mutex<HashSet<LedgerKey>>,
}

impl DeprecationLedger {
    fn global() -> &'static DeprecationLedger {
        static LEDGER: OnceLock<DeprecationLedger> = OnceLock::new();
        LEDGER.get_or_init(|| DeprecationLedger {
            warned: Mutex::new(HashSet::new()),
        })
    }

    /// Returns true the first time `key` is seen in this process.
    fn first_sighting(&self, key: LedgerKey) -> bool {
        self.warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
    }
}

/// Emits the deprecation warning for `port` unless it was already emitted
/// for this port object or for the same port of another instance of the
/// same System type. Returns whether a warning was emitted.
pub(crate) fn warn_port_deprecation(
    system: &SystemBase,
    direction: PortDirection,
    index: usize,
    port: &PortBase,
) -> bool {
    let Some(deprecation) = port.deprecation() else {
        return false;
    };
    if port.mark_deprecation_warned() {
        return false;
    }
    let key = (
        system.type_name().to_string(),
        direction,
        port.name().to_string(),
    );
    if !DeprecationLedger::global().first_sighting(key) {
        return false;
    }
    let message = if deprecation.is_empty() {
        "no deprecation details were provided"
    } else {
        deprecation
    };
    warn!(
        "{direction}[{index}] ({}) of System {} ({}) is deprecated: {message}",
        port.name(),
        system.pathname(),
        system.type_name()
    );
    true
}
