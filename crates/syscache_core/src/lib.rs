pub mod cache;
pub mod cache_entry;
pub mod context;
pub mod dependency;
pub mod diagnostics;
pub mod diagram;
pub mod error;
pub mod leaf;
pub mod port;
pub mod system_base;
/// The `syscache_core` crate is a dependency-tracked caching runtime for
/// composed dynamical systems. Systems declare ports, state, parameters and
/// cache entries; Contexts hold the runtime values, and derived quantities
/// are recomputed exactly when one of their declared prerequisites changes.
///
/// Key components:
/// - **Tickets**: stable identities tying declarations to runtime trackers.
/// - **Systems**: `SystemBase` declarations, `LeafSystem`, and `Diagram` compositions.
/// - **Contexts**: per-instance state in a `ContextTree`, with a dependency graph and cache per Context.
/// - **Evaluation**: input/output port resolution through the enclosing Diagram, memoized cache reads.
/// - **Diagnostics**: hierarchical pathnames, Context/System mismatch messages, deduplicated deprecation warnings.
pub mod traits;
pub mod ticket;
pub mod value;

pub use cache_entry::ValueProducer;
pub use context::{Context, ContextOptions, ContextRef, ContextTree};
pub use diagram::{Diagram, DiagramBuilder};
pub use error::{Error, ErrorKind, Result};
pub use leaf::LeafSystem;
pub use port::PortKind;
pub use system_base::SystemBase;
pub use traits::{HierarchyResolver, InputPortLocator, OutputPortLocator, System};
pub use value::AbstractValue;
