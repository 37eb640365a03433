//! Ordered containers and their intercepted mutation surface.
//!
//! Element writes cannot be observed individually. Instead every mutating
//! operation on [`Array`] performs the change, converts inserted items into
//! trackable state, and notifies the array's own subject. Reads pass
//! through unchanged; on an observed array they record the array's subject.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use crate::error::Error;
use crate::observer::Observer;
use crate::value::Value;

#[derive(Clone, Default)]
pub struct Array {
    inner: Rc<ArrayData>,
}

#[derive(Default)]
struct ArrayData {
    items: RefCell<Vec<Value>>,
    observer: RefCell<Option<Observer>>,
}

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            inner: Rc::new(ArrayData {
                items: RefCell::new(items),
                observer: RefCell::new(None),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.track();
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.track();
        self.inner.items.borrow().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.track();
        self.snapshot()
    }

    pub fn observer(&self) -> Option<Observer> {
        self.inner.observer.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Array) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- intercepted mutations ----

    /// Appends `value`; returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize, Error> {
        let value = value.into();
        self.intercept(std::slice::from_ref(&value), |items| {
            items.push(value.clone());
            items.len()
        })
    }

    pub fn pop(&self) -> Result<Option<Value>, Error> {
        self.intercept(&[], Vec::pop)
    }

    pub fn shift(&self) -> Result<Option<Value>, Error> {
        self.intercept(&[], |items| {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        })
    }

    /// Prepends `values` in order; returns the new length.
    pub fn unshift(&self, values: impl IntoIterator<Item = Value>) -> Result<usize, Error> {
        let values: Vec<Value> = values.into_iter().collect();
        self.intercept(&values, |items| {
            items.splice(0..0, values.iter().cloned());
            items.len()
        })
    }

    /// Removes `delete_count` items at `start` and inserts `insert` in their
    /// place. Both bounds are clamped to the current length. Returns the
    /// removed items.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        insert: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>, Error> {
        let insert: Vec<Value> = insert.into_iter().collect();
        self.intercept(&insert, |items| {
            let start = start.min(items.len());
            let end = start.saturating_add(delete_count).min(items.len());
            items.splice(start..end, insert.iter().cloned()).collect()
        })
    }

    /// Sorts with [`Value::natural_cmp`].
    pub fn sort(&self) -> Result<(), Error> {
        self.sort_by(Value::natural_cmp)
    }

    pub fn sort_by(&self, compare: impl FnMut(&Value, &Value) -> Ordering) -> Result<(), Error> {
        self.intercept(&[], |items| items.sort_by(compare))
    }

    pub fn reverse(&self) -> Result<(), Error> {
        self.intercept(&[], |items| items.reverse())
    }

    // ---- internals ----

    fn intercept<R>(&self, inserted: &[Value], mutate: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R, Error> {
        let result = mutate(&mut self.inner.items.borrow_mut());
        let Some(observer) = self.observer() else {
            return Ok(result);
        };
        if let Some(runtime) = observer.dep().runtime() {
            for item in inserted {
                runtime.observe(item);
            }
        }
        observer.dep().notify()?;
        Ok(result)
    }

    /// Grows the array with `Null` so that `len >= min_len`, without notifying.
    pub(crate) fn pad_to(&self, min_len: usize) {
        let mut items = self.inner.items.borrow_mut();
        if items.len() < min_len {
            items.resize(min_len, Value::Null);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Value> {
        self.inner.items.borrow().clone()
    }

    pub(crate) fn set_observer(&self, observer: Observer) {
        *self.inner.observer.borrow_mut() = Some(observer);
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn track(&self) {
        if let Some(observer) = self.observer() {
            observer.dep().depend();
        }
    }
}

impl FromIterator<Value> for Array {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.items.borrow().iter()).finish()
    }
}
