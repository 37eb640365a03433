//! Conversion of plain containers into trackable state.
//!
//! Observing an object installs a subject on every configurable field;
//! observing an array attaches a subject to the array itself and observes
//! its items. Either way the container gets an [`Observer`] handle with
//! the container-level subject used for shape changes (`set`, `delete`,
//! array mutations).

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::array::Array;
use crate::dep::Dep;
use crate::error::Error;
use crate::runtime::Runtime;
use crate::value::{Field, Key, Object, Value};

/// Handle attached to each observed container.
#[derive(Clone)]
pub struct Observer {
    inner: Rc<ObserverInner>,
}

struct ObserverInner {
    dep: Dep,
    root_count: Cell<usize>,
}

impl Observer {
    fn new(runtime: &Runtime) -> Self {
        Self {
            inner: Rc::new(ObserverInner {
                dep: Dep::new(runtime),
                root_count: Cell::new(0),
            }),
        }
    }

    /// Container-level subject.
    pub fn dep(&self) -> &Dep {
        &self.inner.dep
    }

    /// Number of roots using this container as their data.
    pub fn root_count(&self) -> usize {
        self.inner.root_count.get()
    }

    pub(crate) fn retain_root(&self) {
        self.inner.root_count.set(self.inner.root_count.get() + 1);
    }

    pub(crate) fn release_root(&self) {
        self.inner
            .root_count
            .set(self.inner.root_count.get().saturating_sub(1));
    }

    pub fn ptr_eq(&self, other: &Observer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("dep", &self.inner.dep)
            .field("root_count", &self.root_count())
            .finish()
    }
}

/// Read side of a tracked field.
pub(crate) fn track_field_read(dep: &Dep, value: &Value, shallow: bool) {
    if !dep.is_tracking() {
        return;
    }
    dep.depend();
    if shallow {
        return;
    }
    if let Some(child) = value.observer() {
        child.dep().depend();
        if let Value::Array(items) = value {
            depend_array(items);
        }
    }
}

/// Element access inside arrays is not intercepted, so touching an array
/// registers every observed element, recursively for nested arrays.
fn depend_array(array: &Array) {
    for item in array.snapshot() {
        if let Some(observer) = item.observer() {
            observer.dep().depend();
        }
        if let Value::Array(nested) = &item {
            depend_array(nested);
        }
    }
}

impl Runtime {
    /// Makes `value` trackable if it is a container that can be observed,
    /// returning its handle. Observing twice returns the same handle.
    pub fn observe(&self, value: &Value) -> Option<Observer> {
        self.observe_value(value, false)
    }

    /// Like `observe`, and counts `value` as some root's data.
    pub fn observe_root(&self, value: &Value) -> Option<Observer> {
        self.observe_value(value, true)
    }

    fn observe_value(&self, value: &Value, as_root: bool) -> Option<Observer> {
        let observer = match value {
            Value::Object(object) => object.observer().or_else(|| {
                (self.is_observing() && object.is_extensible() && !object.is_reserved())
                    .then(|| self.attach_object(object))
            }),
            Value::Array(array) => array
                .observer()
                .or_else(|| self.is_observing().then(|| self.attach_array(array))),
            _ => None,
        };
        if as_root && let Some(observer) = &observer {
            observer.retain_root();
        }
        observer
    }

    fn attach_object(&self, object: &Object) -> Observer {
        let observer = Observer::new(self);
        object.set_observer(observer.clone());
        for key in object.field_names() {
            self.define_reactive(object, &key, None, false);
        }
        log::trace!("observed object as dep #{}", observer.dep().id());
        observer
    }

    fn attach_array(&self, array: &Array) -> Observer {
        let observer = Observer::new(self);
        array.set_observer(observer.clone());
        for item in array.snapshot() {
            self.observe(&item);
        }
        log::trace!("observed array as dep #{}", observer.dep().id());
        observer
    }

    /// Installs a tracked field on `object`.
    ///
    /// `value` defaults to the field's current value. Non-configurable
    /// fields are left alone. Shallow fields neither observe their value
    /// nor record the child container when read.
    pub fn define_reactive(&self, object: &Object, key: &str, value: Option<Value>, shallow: bool) {
        let current = match object.field_info(key) {
            Some((_, false)) => return,
            Some((current, true)) => current,
            None => Value::Null,
        };
        let value = value.unwrap_or(current);
        if !shallow {
            self.observe(&value);
        }
        object.install_field(key, Field::tracked(value, Dep::new(self), shallow));
    }

    /// Assigns `key` on `target`, adding a tracked field when the key is new.
    ///
    /// On arrays a numeric key replaces (or appends) the element at that
    /// position. Writing a new key onto a primitive, a reserved instance,
    /// root data or a non-extensible object logs a warning and changes
    /// nothing.
    pub fn set(&self, target: &Value, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), Error> {
        let key = key.into();
        let value = value.into();
        match target {
            Value::Array(array) => {
                let Some(index) = key.as_index() else {
                    self.warn(format!("Cannot set non-index key {key:?} on an array"));
                    return Ok(());
                };
                array.pad_to(index);
                array.splice(index, 1, [value]).map(drop)
            }
            Value::Object(object) => {
                let name = key.into_name();
                if object.field_info(&name).is_some() {
                    return object.set(&name, value);
                }
                let observer = object.observer();
                if object.is_reserved() || observer.as_ref().is_some_and(|ob| ob.root_count() > 0) {
                    self.warn(
                        "Avoid adding reactive properties to a reserved instance or its root data \
                         at runtime - declare it upfront.",
                    );
                    return Ok(());
                }
                if !object.is_extensible() {
                    self.warn(format!("Cannot add property \"{name}\" to a non-extensible object"));
                    return Ok(());
                }
                let Some(observer) = observer else {
                    object.install_field(&name, Field::plain(value));
                    return Ok(());
                };
                self.define_reactive(object, &name, Some(value), false);
                observer.dep().notify()
            }
            other => {
                self.warn(format!(
                    "Cannot set reactive property on null or primitive value: {other:?}"
                ));
                Ok(())
            }
        }
    }

    /// Removes `key` from `target` and notifies the container's subject.
    pub fn delete(&self, target: &Value, key: impl Into<Key>) -> Result<(), Error> {
        let key = key.into();
        match target {
            Value::Array(array) => match key.as_index() {
                Some(index) => array.splice(index, 1, []).map(drop),
                None => Ok(()),
            },
            Value::Object(object) => {
                let name = key.into_name();
                let observer = object.observer();
                if object.is_reserved() || observer.as_ref().is_some_and(|ob| ob.root_count() > 0) {
                    self.warn(
                        "Avoid deleting properties on a reserved instance or its root data \
                         - just set it to null.",
                    );
                    return Ok(());
                }
                match object.field_info(&name) {
                    Some((_, true)) => {}
                    _ => return Ok(()),
                }
                object.remove_field(&name);
                match observer {
                    Some(observer) => observer.dep().notify(),
                    None => Ok(()),
                }
            }
            other => {
                self.warn(format!(
                    "Cannot delete reactive property on null or primitive value: {other:?}"
                ));
                Ok(())
            }
        }
    }
}
