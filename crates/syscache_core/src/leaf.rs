//! Leaf Systems: no subsystems, outputs computed by cache entries.

use crate::cache_entry::ValueProducer;
use crate::context::{Context, ContextRef, ContextTree};
use crate::error::Result;
use crate::port::{OutputSource, PortKind};
use crate::system_base::SystemBase;
use crate::ticket::{CacheIndex, ContextIndex, DependencyTicket, InputPortIndex, OutputPortIndex};
use crate::traits::System;
use crate::value::AbstractValue;
use nalgebra::DVector;

/// A System whose behavior is given entirely by its declarations.
///
/// Every output port mirrors a cache entry declared alongside it, so an
/// output is recomputed only when the prerequisites of that entry change.
#[derive(Debug)]
pub struct LeafSystem {
    base: SystemBase,
}

impl LeafSystem {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            base: SystemBase::new(type_name, name),
        }
    }

    pub fn declare_vector_input_port(&mut self, name: impl Into<String>, size: usize) -> Result<InputPortIndex> {
        self.base.declare_vector_input_port(name, size)
    }

    pub fn declare_abstract_input_port(&mut self, name: impl Into<String>, model: AbstractValue) -> Result<InputPortIndex> {
        self.base.declare_abstract_input_port(name, model)
    }

    pub fn declare_cache_entry(
        &mut self,
        description: impl Into<String>,
        producer: ValueProducer,
        prerequisites: impl IntoIterator<Item = DependencyTicket>,
    ) -> Result<CacheIndex> {
        self.base.declare_cache_entry(description, producer, prerequisites)
    }

    /// Declares a vector-valued output port computed by `calculate`, which
    /// must return a `DVector<f64>` of length `size`.
    pub fn declare_vector_output_port(
        &mut self,
        name: impl Into<String>,
        size: usize,
        calculate: impl Fn(ContextRef<'_>) -> anyhow::Result<DVector<f64>> + Send + Sync + 'static,
        prerequisites: impl IntoIterator<Item = DependencyTicket>,
    ) -> Result<OutputPortIndex> {
        let kind = PortKind::Vector { size };
        let producer = ValueProducer::from_model(kind.model_value(), move |context| {
            calculate(context).map(AbstractValue::vector)
        });
        self.declare_output_port(name.into(), kind, producer, prerequisites)
    }

    /// Declares an output port carrying values of the same type as `model`.
    pub fn declare_abstract_output_port(
        &mut self,
        name: impl Into<String>,
        model: AbstractValue,
        calculate: impl Fn(ContextRef<'_>) -> anyhow::Result<AbstractValue> + Send + Sync + 'static,
        prerequisites: impl IntoIterator<Item = DependencyTicket>,
    ) -> Result<OutputPortIndex> {
        let kind = PortKind::Abstract { model };
        let producer = ValueProducer::from_model(kind.model_value(), calculate);
        self.declare_output_port(name.into(), kind, producer, prerequisites)
    }

    fn declare_output_port(
        &mut self,
        name: String,
        kind: PortKind,
        producer: ValueProducer,
        prerequisites: impl IntoIterator<Item = DependencyTicket>,
    ) -> Result<OutputPortIndex> {
        self.base.check_output_port_name(&name)?;
        let cache_index = self
            .base
            .declare_cache_entry(format!("{name} output"), producer, prerequisites)?;
        let ticket = self.base.cache_entry(cache_index)?.ticket();
        self.base.declare_output_port(
            name,
            kind,
            OutputSource::CacheEntry(cache_index),
            Some(ticket),
        )
    }
}

impl System for LeafSystem {
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
        tree.push(self, context, parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ticket::{ALL_INPUT_PORTS_TICKET, NOTHING_TICKET, TIME_TICKET, XCDOT_TICKET, XC_TICKET};
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    /// A gain block: y = k * u, with k a numeric parameter. Counts how often
    /// its output is recalculated.
    fn gain(calls: Arc<AtomicUsize>) -> LeafSystem {
        let mut system = LeafSystem::new("Gain", "gain");
        system.declare_vector_input_port("u", 2).expect("input");
        let k = system
            .base_mut()
            .declare_numeric_parameter(DVector::from_element(1, 3.0));
        system
            .declare_vector_output_port(
                "y",
                2,
                move |context| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let u = context
                        .eval_vector_input(InputPortIndex(0))?
                        .unwrap_or_else(|| DVector::zeros(2));
                    let k = context.numeric_parameter(0)?[0];
                    Ok(u * k)
                },
                [ALL_INPUT_PORTS_TICKET, k],
            )
            .expect("output");
        system
    }

    #[test]
    fn output_is_memoized_until_a_prerequisite_changes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let system = gain(calls.clone());
        let mut tree = ContextTree::new(&system).expect("tree");
        tree.fix_vector_input(ContextIndex(0), InputPortIndex(0), &[1.0, 2.0])
            .expect("fix");

        let first = tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        let second = tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert!(first.ptr_eq(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.as_vector().map(|y| y.as_slice().to_vec()), Some(vec![3.0, 6.0]));

        tree.set_time(1.0).expect("time");
        tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "time is not a prerequisite");

        tree.set_numeric_parameter(ContextIndex(0), 0, DVector::from_element(1, 0.5))
            .expect("parameter");
        let third = tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(third.as_vector().map(|y| y.as_slice().to_vec()), Some(vec![0.5, 1.0]));
    }

    #[test]
    fn notify_changed_on_unrelated_ticket_keeps_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let system = gain(calls.clone());
        let mut tree = ContextTree::new(&system).expect("tree");
        tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        tree.notify_changed(ContextIndex(0), XC_TICKET).expect("xc");
        tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tree.notify_changed(ContextIndex(0), ALL_INPUT_PORTS_TICKET).expect("u");
        tree.root().eval_output_port(OutputPortIndex(0)).expect("y");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disabled_caching_recalculates_every_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let system = gain(calls.clone());
        let mut tree = ContextTree::new(&system).expect("tree");
        tree.disable_caching(ContextIndex(0), CacheIndex(0)).expect("disable");
        for _ in 0..3 {
            tree.root().get_cache_value(CacheIndex(0)).expect("value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tree.enable_caching(ContextIndex(0), CacheIndex(0)).expect("enable");
        tree.root().get_cache_value(CacheIndex(0)).expect("value");
        tree.root().get_cache_value(CacheIndex(0)).expect("value");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unconnected_root_input_is_none() {
        let system = gain(Arc::new(AtomicUsize::new(0)));
        let tree = ContextTree::new(&system).expect("tree");
        assert!(tree
            .root()
            .eval_input_port(InputPortIndex(0))
            .expect("eval")
            .is_none());
        let err = tree
            .root()
            .eval_required_input(InputPortIndex(0))
            .expect_err("unconnected");
        assert_eq!(err.kind(), ErrorKind::Unconnected);
        assert!(err.to_string().contains("neither connected nor fixed"));
    }

    #[test]
    fn fixed_value_of_wrong_size_is_rejected() {
        let system = gain(Arc::new(AtomicUsize::new(0)));
        let mut tree = ContextTree::new(&system).expect("tree");
        let err = tree
            .fix_vector_input(ContextIndex(0), InputPortIndex(0), &[1.0, 2.0, 3.0])
            .expect_err("size 3 on a size-2 port");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(tree
            .context(ContextIndex(0))
            .expect("root")
            .fixed_input_value(InputPortIndex(0))
            .is_none());
    }

    #[test]
    fn output_index_out_of_range_names_count() {
        let system = gain(Arc::new(AtomicUsize::new(0)));
        let tree = ContextTree::new(&system).expect("tree");
        assert_err_contains(
            tree.root().eval_output_port(OutputPortIndex(4)),
            "no output port with index 4 because there are only 1 output ports",
        );
    }

    #[test]
    fn calculated_value_must_match_allocated_type() {
        let mut system = LeafSystem::new("Broken", "broken");
        system
            .declare_cache_entry(
                "count",
                ValueProducer::from_model(AbstractValue::new(0_u32), |_| Ok(AbstractValue::new(1.5_f64))),
                [NOTHING_TICKET],
            )
            .expect("entry");
        let tree = ContextTree::new(&system).expect("tree");
        let err = tree
            .root()
            .get_cache_value(CacheIndex(0))
            .expect_err("f64 for a u32 entry");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(err.to_string().contains("'count'"));
    }

    #[test]
    fn self_dependent_calculator_is_reported() {
        let mut system = LeafSystem::new("Loop", "loop");
        system
            .declare_cache_entry(
                "echo",
                ValueProducer::from_model(AbstractValue::new(0_i64), |context| {
                    let value = context.get_cache_value(CacheIndex(0))?;
                    Ok(value)
                }),
                [TIME_TICKET],
            )
            .expect("entry");
        let tree = ContextTree::new(&system).expect("tree");
        let err = tree
            .root()
            .get_cache_value(CacheIndex(0))
            .expect_err("recursive");
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
        assert!(err.to_string().contains("depends on itself"));

        // The failed attempt leaves the slot usable for a later read.
        let err = tree.root().get_cache_value(CacheIndex(0)).expect_err("still recursive");
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn prerequisites_must_already_be_declared() {
        let mut system = LeafSystem::new("Late", "late");
        let spare = system.base_mut().allocate_ticket();
        assert_err_contains(
            system.declare_cache_entry(
                "early",
                ValueProducer::from_model(AbstractValue::new(0_u8), |_| Ok(AbstractValue::new(0_u8))),
                [spare],
            ),
            "is not a declared source or an earlier cache entry",
        );
        assert_err_contains(
            system.declare_cache_entry(
                "empty",
                ValueProducer::from_model(AbstractValue::new(0_u8), |_| Ok(AbstractValue::new(0_u8))),
                std::iter::empty::<DependencyTicket>(),
            ),
            "empty prerequisites list",
        );
        assert_eq!(system.base().num_cache_entries(), 0);

        let known = system
            .base_mut()
            .declare_cache_entry_with_known_ticket(
                spare,
                "spare",
                ValueProducer::from_model(AbstractValue::new(0_u8), |_| Ok(AbstractValue::new(0_u8))),
                [NOTHING_TICKET],
            )
            .expect("allocated ticket");
        assert_eq!(known, CacheIndex(0));
        system
            .base_mut()
            .declare_cache_entry_with_known_ticket(
                XCDOT_TICKET,
                "xcdot",
                ValueProducer::from_model(AbstractValue::new(0_u8), |_| Ok(AbstractValue::new(0_u8))),
                [XC_TICKET],
            )
            .expect("reserved ticket");
        assert_err_contains(
            system.base_mut().declare_cache_entry_with_known_ticket(
                spare,
                "again",
                ValueProducer::from_model(AbstractValue::new(0_u8), |_| Ok(AbstractValue::new(0_u8))),
                [NOTHING_TICKET],
            ),
            "neither a reserved cache ticket nor an allocated unused one",
        );
    }

    #[test]
    fn duplicate_port_names_are_rejected() {
        let mut system = gain(Arc::new(AtomicUsize::new(0)));
        assert_err_contains(system.declare_vector_input_port("u", 1), "already has an input port named 'u'");
        let entries = system.base().num_cache_entries();
        assert_err_contains(
            system.declare_vector_output_port("y", 2, |_| Ok(DVector::zeros(2)), [NOTHING_TICKET]),
            "already has an output port named 'y'",
        );
        assert_eq!(system.base().num_cache_entries(), entries);
    }

    #[test]
    fn contexts_are_initialized_once() {
        let system = gain(Arc::new(AtomicUsize::new(0)));
        let mut context = Context::new();
        system.base().initialize_context(&mut context).expect("first");
        let trackers = context.graph().num_trackers();
        assert_err_contains(
            system.base().initialize_context(&mut context),
            "has already been initialized",
        );
        assert_eq!(context.graph().num_trackers(), trackers);
        assert_eq!(context.system_id(), Some(system.base().id()));
        assert_eq!(context.cache().num_entries(), 1);
    }

    #[test]
    fn vector_output_must_keep_its_declared_size() {
        let mut source = LeafSystem::new("Source", "source");
        source
            .declare_vector_output_port("y", 2, |_| Ok(DVector::zeros(5)), [NOTHING_TICKET])
            .expect("output");
        let tree = ContextTree::new(&source).expect("tree");
        let err = tree
            .root()
            .eval_output_port(OutputPortIndex(0))
            .expect_err("five values for a size-2 port");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_err_contains(
            tree.root().eval_output_port(OutputPortIndex(0)),
            "calculated a vector of size 5 but its allocated size is 2",
        );
    }

    #[test]
    fn cache_entries_can_depend_on_earlier_entries() {
        let squares = Arc::new(AtomicUsize::new(0));
        let shifts = Arc::new(AtomicUsize::new(0));
        let mut system = LeafSystem::new("Polynomial", "poly");
        let p = system
            .base_mut()
            .declare_numeric_parameter(DVector::from_element(1, 2.0));

        let counter = squares.clone();
        let squared = system
            .declare_cache_entry(
                "squared",
                ValueProducer::from_model(AbstractValue::new(0.0_f64), move |context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let p = context.numeric_parameter(0)?[0];
                    Ok(AbstractValue::new(p * p))
                }),
                [p],
            )
            .expect("squared");
        let squared_ticket = system.base().cache_entry(squared).expect("entry").ticket();

        let counter = shifts.clone();
        let shifted = system
            .declare_cache_entry(
                "shifted",
                ValueProducer::from_model(AbstractValue::new(0.0_f64), move |context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let square = context.get_cache_value(squared)?;
                    let square = square
                        .get::<f64>()
                        .ok_or_else(|| anyhow::anyhow!("squared is not an f64"))?;
                    Ok(AbstractValue::new(square + 1.0))
                }),
                [squared_ticket],
            )
            .expect("shifted");

        let mut tree = ContextTree::new(&system).expect("tree");
        let read = |tree: &ContextTree<'_>| {
            let value = tree.root().get_cache_value(shifted).expect("shifted");
            *value.get::<f64>().expect("f64")
        };
        assert_eq!(read(&tree), 5.0);
        assert_eq!(read(&tree), 5.0);
        assert_eq!((squares.load(Ordering::SeqCst), shifts.load(Ordering::SeqCst)), (1, 1));

        tree.set_numeric_parameter(ContextIndex(0), 0, DVector::from_element(1, 3.0))
            .expect("parameter");
        assert!(!tree
            .context(ContextIndex(0))
            .expect("root")
            .cache()
            .entry_value(shifted)
            .expect("slot")
            .is_up_to_date());
        assert_eq!(read(&tree), 10.0);
        assert_eq!((squares.load(Ordering::SeqCst), shifts.load(Ordering::SeqCst)), (2, 2));

        tree.set_time(4.0).expect("time");
        assert_eq!(read(&tree), 10.0);
        assert_eq!((squares.load(Ordering::SeqCst), shifts.load(Ordering::SeqCst)), (2, 2));
    }

    #[test]
    fn panicking_calculator_does_not_poison_its_entry() {
        let failed_once = Arc::new(AtomicBool::new(false));
        let flag = failed_once.clone();
        let mut system = LeafSystem::new("Flaky", "flaky");
        system
            .declare_cache_entry(
                "answer",
                ValueProducer::from_model(AbstractValue::new(0_i32), move |_| {
                    if !flag.swap(true, Ordering::SeqCst) {
                        panic!("first calculation fails");
                    }
                    Ok(AbstractValue::new(42_i32))
                }),
                [TIME_TICKET],
            )
            .expect("answer");
        let tree = ContextTree::new(&system).expect("tree");

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            tree.root().get_cache_value(CacheIndex(0))
        }));
        assert!(outcome.is_err());
        assert!(failed_once.load(Ordering::SeqCst));

        let value = tree.root().get_cache_value(CacheIndex(0)).expect("second read");
        assert_eq!(value.get::<i32>(), Some(&42));
    }
}
