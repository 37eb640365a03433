use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::array::Array;
use crate::dep::Dep;
use crate::error::Error;
use crate::observer::{self, Observer};

/// Dynamically typed state.
///
/// `Object` and `Array` are shared handles: cloning a `Value` that holds one
/// clones the handle, not the contents.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(Object),
    Array(Array),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Array(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().map(|n| n as i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
        }
    }

    /// Observer handle of the contained container, if it is observed.
    pub fn observer(&self) -> Option<Observer> {
        match self {
            Value::Object(o) => o.observer(),
            Value::Array(a) => a.observer(),
            _ => None,
        }
    }

    /// Setter equality: identical, or both NaN.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self == other,
        }
    }

    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Object(o) => Some(o.addr()),
            Value::Array(a) => Some(a.addr()),
            _ => None,
        }
    }

    /// Order used by `Array::sort`: null, bools, numbers, strings, then
    /// containers in their existing relative order.
    pub fn natural_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Number(_) => 2,
                Value::Str(_) => 3,
                Value::Object(_) | Value::Array(_) => 4,
            }
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

/// Strict equality: NaN is never equal to itself and containers compare
/// by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::Array(a) => fmt::Debug::fmt(a, f),
        }
    }
}

macro_rules! number_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Number(n as f64)
            }
        })*
    };
}

number_from!(i32, i64, u32, u64, usize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Array::from_vec(items))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Property key accepted by `Runtime::set` / `Runtime::delete`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    Index(usize),
    Name(String),
}

impl Key {
    /// Array position, for numeric names as well.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Key::Index(i) => Some(*i),
            Key::Name(name) => name.parse().ok(),
        }
    }

    pub fn into_name(self) -> String {
        match self {
            Key::Index(i) => i.to_string(),
            Key::Name(name) => name,
        }
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

pub(crate) struct Field {
    pub(crate) value: Value,
    /// Present once the field has been made reactive.
    pub(crate) dep: Option<Dep>,
    pub(crate) configurable: bool,
    pub(crate) writable: bool,
    pub(crate) shallow: bool,
}

impl Field {
    pub(crate) fn plain(value: Value) -> Self {
        Self {
            value,
            dep: None,
            configurable: true,
            writable: true,
            shallow: false,
        }
    }

    pub(crate) fn tracked(value: Value, dep: Dep, shallow: bool) -> Self {
        Self {
            value,
            dep: Some(dep),
            configurable: true,
            writable: true,
            shallow,
        }
    }
}

/// Shared handle to a keyed container.
#[derive(Clone)]
pub struct Object {
    inner: Rc<ObjectData>,
}

struct ObjectData {
    fields: RefCell<IndexMap<String, Field>>,
    observer: RefCell<Option<Observer>>,
    extensible: Cell<bool>,
    frozen: Cell<bool>,
    reserved: bool,
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    pub fn new() -> Self {
        Self::with_reserved(false)
    }

    /// A host-owned instance that must never be converted into trackable
    /// state (for example a component instance or a virtual node).
    pub fn reserved() -> Self {
        Self::with_reserved(true)
    }

    fn with_reserved(reserved: bool) -> Self {
        Self {
            inner: Rc::new(ObjectData {
                fields: RefCell::new(IndexMap::new()),
                observer: RefCell::new(None),
                extensible: Cell::new(true),
                frozen: Cell::new(false),
                reserved,
            }),
        }
    }

    /// Reads `key`, recording the read for the evaluating watcher.
    ///
    /// Missing keys read as `Null`; on an observed object that read is
    /// recorded against the object's own subject so a later
    /// `Runtime::set` of the key reaches the reader.
    pub fn get(&self, key: &str) -> Value {
        let found = {
            let fields = self.inner.fields.borrow();
            fields
                .get(key)
                .map(|field| (field.value.clone(), field.dep.clone(), field.shallow))
        };
        match found {
            Some((value, Some(dep), shallow)) => {
                observer::track_field_read(&dep, &value, shallow);
                value
            }
            Some((value, None, _)) => value,
            None => {
                self.track_shape();
                Value::Null
            }
        }
    }

    /// Reads `key` without recording anything.
    pub fn peek(&self, key: &str) -> Value {
        self.inner
            .fields
            .borrow()
            .get(key)
            .map(|field| field.value.clone())
            .unwrap_or_default()
    }

    /// Assigns through the field's setter.
    ///
    /// Writing a value that is the same as the current one does nothing.
    /// Read-only fields ignore the write. A key that does not exist yet is
    /// added as a plain, untracked field; use `Runtime::set` to add a
    /// tracked one.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        let mut fields = self.inner.fields.borrow_mut();
        if !fields.contains_key(key) {
            if self.is_extensible() {
                fields.insert(key.to_owned(), Field::plain(value));
            } else {
                log::debug!("ignored write of new key \"{key}\" on a non-extensible object");
            }
            return Ok(());
        }
        let Some(field) = fields.get_mut(key) else {
            return Ok(());
        };
        if !field.writable || field.value.same_value(&value) {
            return Ok(());
        }
        field.value = value.clone();
        let shallow = field.shallow;
        let dep = field.dep.clone();
        drop(fields);

        let Some(dep) = dep else {
            return Ok(());
        };
        if !shallow && let Some(runtime) = dep.runtime() {
            runtime.observe(&value);
        }
        dep.notify()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.track_shape();
        self.inner.fields.borrow().contains_key(key)
    }

    /// Field names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.track_shape();
        self.field_names()
    }

    pub fn len(&self) -> usize {
        self.track_shape();
        self.inner.fields.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a non-configurable field, which observation leaves untracked.
    pub fn define_fixed(&self, key: &str, value: impl Into<Value>) {
        let mut field = Field::plain(value.into());
        field.configurable = false;
        self.inner.fields.borrow_mut().insert(key.to_owned(), field);
    }

    pub fn prevent_extensions(&self) {
        self.inner.extensible.set(false);
    }

    /// Non-extensible, every field non-configurable and read-only.
    pub fn freeze(&self) {
        self.inner.extensible.set(false);
        self.inner.frozen.set(true);
        for field in self.inner.fields.borrow_mut().values_mut() {
            field.configurable = false;
            field.writable = false;
        }
    }

    pub fn is_extensible(&self) -> bool {
        self.inner.extensible.get()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.get()
    }

    pub fn is_reserved(&self) -> bool {
        self.inner.reserved
    }

    pub fn observer(&self) -> Option<Observer> {
        self.inner.observer.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn set_observer(&self, observer: Observer) {
        *self.inner.observer.borrow_mut() = Some(observer);
    }

    pub(crate) fn field_names(&self) -> Vec<String> {
        self.inner.fields.borrow().keys().cloned().collect()
    }

    /// Current value and configurability of `key`.
    pub(crate) fn field_info(&self, key: &str) -> Option<(Value, bool)> {
        self.inner
            .fields
            .borrow()
            .get(key)
            .map(|field| (field.value.clone(), field.configurable))
    }

    pub(crate) fn install_field(&self, key: &str, field: Field) {
        self.inner.fields.borrow_mut().insert(key.to_owned(), field);
    }

    pub(crate) fn remove_field(&self, key: &str) -> Option<Value> {
        self.inner
            .fields
            .borrow_mut()
            .shift_remove(key)
            .map(|field| field.value)
    }

    fn track_shape(&self) {
        if let Some(observer) = self.observer() {
            observer.dep().depend();
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Object {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let object = Object::new();
        {
            let mut fields = object.inner.fields.borrow_mut();
            for (key, value) in iter {
                fields.insert(key.into(), Field::plain(value.into()));
            }
        }
        object
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.inner.fields.borrow();
        f.debug_map()
            .entries(fields.iter().map(|(k, field)| (k, &field.value)))
            .finish()
    }
}

#[cfg(feature = "serde")]
mod json {
    use super::{Object, Value};
    use crate::array::Array;

    impl From<serde_json::Value> for Value {
        fn from(json: serde_json::Value) -> Self {
            match json {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Bool(b) => Value::Bool(b),
                serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
                serde_json::Value::String(s) => Value::from(s),
                serde_json::Value::Array(items) => {
                    Value::Array(Array::from_vec(items.into_iter().map(Value::from).collect()))
                }
                serde_json::Value::Object(map) => Value::Object(map.into_iter().collect::<Object>()),
            }
        }
    }

    impl Value {
        /// Snapshot as JSON, read without tracking. Non-finite numbers
        /// become `null`.
        pub fn to_json(&self) -> serde_json::Value {
            match self {
                Value::Null => serde_json::Value::Null,
                Value::Bool(b) => serde_json::Value::Bool(*b),
                Value::Number(n) => serde_json::Number::from_f64(*n)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number),
                Value::Str(s) => serde_json::Value::String(s.to_string()),
                Value::Array(a) => {
                    serde_json::Value::Array(a.snapshot().iter().map(Value::to_json).collect())
                }
                Value::Object(o) => serde_json::Value::Object(
                    o.field_names()
                        .into_iter()
                        .map(|key| {
                            let value = o.peek(&key).to_json();
                            (key, value)
                        })
                        .collect(),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_same_value_but_not_strictly_equal() {
        let nan = Value::Number(f64::NAN);
        assert!(nan.same_value(&Value::Number(f64::NAN)));
        assert_ne!(nan, Value::Number(f64::NAN));
        assert_eq!(Value::from(3), Value::Number(3.0));
    }

    #[test]
    fn containers_compare_by_identity() {
        let a: Object = [("x", 1)].into_iter().collect();
        let b: Object = [("x", 1)].into_iter().collect();
        assert_eq!(Value::from(a.clone()), Value::from(a.clone()));
        assert_ne!(Value::from(a), Value::from(b));
    }

    #[test]
    fn plain_object_reads_and_writes() {
        let obj: Object = [("a", 1)].into_iter().collect();
        obj.set("a", 2).unwrap();
        obj.set("b", "x").unwrap();
        assert_eq!(obj.get("a"), Value::from(2));
        assert_eq!(obj.get("b").as_str(), Some("x"));
        assert_eq!(obj.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(obj.get("missing").is_null());
    }

    #[test]
    fn frozen_object_ignores_writes() {
        let obj: Object = [("a", 1)].into_iter().collect();
        obj.freeze();
        obj.set("a", 5).unwrap();
        obj.set("b", 5).unwrap();
        assert_eq!(obj.peek("a"), Value::from(1));
        assert!(!obj.contains_key("b"));
    }

    #[test]
    fn key_parses_array_indices() {
        assert_eq!(Key::from("3").as_index(), Some(3));
        assert_eq!(Key::from("x").as_index(), None);
        assert_eq!(Key::from(7).into_name(), "7");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_conversion() {
        let value = Value::from(serde_json::json!({"a": 1, "list": [1, 2]}));
        let obj = value.as_object().unwrap();
        assert_eq!(obj.peek("a"), Value::from(1));
        assert_eq!(obj.peek("list").as_array().unwrap().len(), 2);
        assert_eq!(value.to_json(), serde_json::json!({"a": 1.0, "list": [1.0, 2.0]}));
    }
}
