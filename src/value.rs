use core::any::Any;
use core::fmt;
use std::sync::Arc;

use crate::provider::ValueType;

/// Host object passed through the engine by reference.
///
/// The engine only ever sees an opaque pointer tagged with a fixed type name;
/// SQL code observes the value as NULL while user-defined functions can read
/// the object back. Equality is identity of the shared allocation.
#[derive(Clone)]
pub struct HostObject(Arc<dyn Any + Send + Sync>);

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wrap an existing shared allocation without copying.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn as_arc(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.0
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({:p})", Arc::as_ptr(&self.0))
    }
}

/// Owned value crossing the boundary.
///
/// Handlers return it and callers hand it to the generic `bind` / `result`
/// operations, which dispatch on its tag through [`ValueRef`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Blob of `n` zero bytes, materialized by the engine.
    ZeroBlob(i32),
    /// Host object; SQL sees NULL.
    Object(HostObject),
}

impl Value {
    /// Borrow this value without copying its payload.
    pub fn as_value_ref(&self) -> ValueRef<'_> {
        match self {
            Value::Null => ValueRef::Null,
            Value::Integer(v) => ValueRef::Integer(*v),
            Value::Float(v) => ValueRef::Float(*v),
            Value::Text(v) => ValueRef::Text(v),
            Value::Blob(v) => ValueRef::Blob(v),
            Value::ZeroBlob(n) => ValueRef::ZeroBlob(*n),
            Value::Object(object) => ValueRef::Object(object),
        }
    }

    /// Storage class the engine reports once this value is bound.
    pub fn value_type(&self) -> ValueType {
        self.as_value_ref().value_type()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<HostObject> for Value {
    fn from(value: HostObject) -> Self {
        Value::Object(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Borrowed view of a [`Value`], the form `bind` and `result` dispatch on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Integer(i64),
    Float(f64),
    Text(&'a str),
    Blob(&'a [u8]),
    ZeroBlob(i32),
    Object(&'a HostObject),
}

impl ValueRef<'_> {
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueRef::Null | ValueRef::Object(_) => ValueType::Null,
            ValueRef::Integer(_) => ValueType::Integer,
            ValueRef::Float(_) => ValueType::Float,
            ValueRef::Text(_) => ValueType::Text,
            ValueRef::Blob(_) | ValueRef::ZeroBlob(_) => ValueType::Blob,
        }
    }

    pub fn to_owned(&self) -> Value {
        match *self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Float(v) => Value::Float(v),
            ValueRef::Text(v) => Value::Text(v.to_owned()),
            ValueRef::Blob(v) => Value::Blob(v.to_vec()),
            ValueRef::ZeroBlob(n) => Value::ZeroBlob(n),
            ValueRef::Object(object) => Value::Object(object.clone()),
        }
    }
}

impl<'a> From<&'a Value> for ValueRef<'a> {
    fn from(value: &'a Value) -> Self {
        value.as_value_ref()
    }
}

#[cfg(test)]
mod tests {
    use crate::provider::ValueType;

    use super::{HostObject, Value, ValueRef};

    #[test]
    fn borrowed_view_round_trips_every_tag() {
        let object = HostObject::new(3_u32);
        let values = [
            Value::Null,
            Value::Integer(-4),
            Value::Float(0.5),
            Value::Text("héllo".to_owned()),
            Value::Blob(vec![0, 1, 2]),
            Value::ZeroBlob(8),
            Value::Object(object),
        ];
        for value in &values {
            assert_eq!(ValueRef::from(value).to_owned(), *value);
        }
    }

    #[test]
    fn host_objects_compare_by_identity() {
        let a = HostObject::new(String::from("payload"));
        let b = HostObject::new(String::from("payload"));
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        assert_ne!(Value::Object(a.clone()), Value::Object(b));
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("payload"));
        assert!(a.downcast_ref::<i64>().is_none());
    }

    #[test]
    fn storage_class_of_special_variants() {
        assert_eq!(Value::ZeroBlob(4).value_type(), ValueType::Blob);
        assert_eq!(Value::Object(HostObject::new(1_u8)).value_type(), ValueType::Null);
        assert_eq!(ValueRef::Text("").value_type(), ValueType::Text);
        assert!(Value::from(None::<i64>).is_null());
        assert_eq!(Value::from(Some(7_i32)), Value::Integer(7));
    }
}
