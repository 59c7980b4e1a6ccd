//! Type-erased values stored in ports, state, parameters and cache slots.

use nalgebra::DVector;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// An immutable, cheaply cloned, type-erased value.
///
/// Clones share the same allocation, so [`AbstractValue::ptr_eq`] tells
/// whether two handles refer to the very same stored value.
#[derive(Clone)]
pub struct AbstractValue {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl AbstractValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wraps a numeric vector, the payload of vector-valued ports and state.
    pub fn vector(value: DVector<f64>) -> Self {
        Self::new(value)
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::vector(DVector::from_column_slice(values))
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn as_vector(&self) -> Option<&DVector<f64>> {
        self.get::<DVector<f64>>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn value_type_id(&self) -> TypeId {
        Any::type_id(&*self.inner)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn ptr_eq(&self, other: &AbstractValue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AbstractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_vector() {
            Some(vector) => write!(f, "AbstractValue({:?})", vector.as_slice()),
            None => write!(f, "AbstractValue(<{}>)", self.type_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage_and_keep_type() {
        let value = AbstractValue::from_slice(&[1.0, 2.0]);
        let copy = value.clone();
        assert!(value.ptr_eq(&copy));
        assert!(value.is::<DVector<f64>>());
        assert_eq!(copy.as_vector().map(|v| v.len()), Some(2));
        assert_eq!(value.value_type_id(), TypeId::of::<DVector<f64>>());

        let other = AbstractValue::new(String::from("gear"));
        assert!(!value.ptr_eq(&other));
        assert_eq!(other.get::<String>().map(String::as_str), Some("gear"));
        assert!(other.type_name().contains("String"));
    }
}
