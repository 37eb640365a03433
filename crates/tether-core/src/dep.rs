use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::error::Error;
use crate::runtime::{Runtime, RuntimeInner};
use crate::watcher::{Watcher, WatcherInner};

pub type DepId = u64;

/// Subscriber registry for one tracked field or container.
///
/// Subscribers are held weakly. Entries of watchers dropped without a
/// teardown are pruned on the next subscription or notification.
#[derive(Clone)]
pub struct Dep {
    inner: Rc<DepInner>,
}

struct DepInner {
    id: DepId,
    runtime: Weak<RuntimeInner>,
    subs: RefCell<SmallVec<[Weak<WatcherInner>; 4]>>,
}

impl Dep {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        Self {
            inner: Rc::new(DepInner {
                id: runtime.next_dep_id(),
                runtime: runtime.downgrade(),
                subs: RefCell::new(SmallVec::new()),
            }),
        }
    }

    pub fn id(&self) -> DepId {
        self.inner.id
    }

    pub(crate) fn runtime(&self) -> Option<Runtime> {
        Runtime::upgrade(&self.inner.runtime)
    }

    pub(crate) fn add_sub(&self, watcher: &Watcher) {
        let mut subs = self.inner.subs.borrow_mut();
        subs.retain(|sub| sub.strong_count() > 0);
        subs.push(watcher.downgrade());
    }

    pub(crate) fn remove_sub(&self, watcher: &Watcher) {
        let target = watcher.downgrade();
        self.inner
            .subs
            .borrow_mut()
            .retain(|sub| sub.strong_count() > 0 && !sub.ptr_eq(&target));
    }

    /// Whether a read right now would be recorded.
    pub fn is_tracking(&self) -> bool {
        self.runtime().is_some_and(|rt| rt.is_tracking())
    }

    /// Registers this subject with the watcher currently evaluating, if any.
    pub fn depend(&self) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        if let Some(target) = runtime.current_target() {
            target.add_dep(self);
        }
    }

    /// Calls `update()` on a snapshot of the current subscribers.
    ///
    /// Every subscriber is updated even if one fails; the first internal
    /// error is returned.
    pub fn notify(&self) -> Result<(), Error> {
        let subs: SmallVec<[Watcher; 4]> = {
            let mut subs = self.inner.subs.borrow_mut();
            subs.retain(|sub| sub.strong_count() > 0);
            subs.iter().filter_map(Watcher::upgrade).collect()
        };
        let mut first_error = None;
        for sub in subs {
            if let Err(err) = sub.update() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subs
            .borrow()
            .iter()
            .filter(|sub| sub.strong_count() > 0)
            .count()
    }

    pub fn ptr_eq(&self, other: &Dep) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dep")
            .field("id", &self.inner.id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::watcher::Expression;

    fn raw_entries(dep: &Dep) -> usize {
        dep.inner.subs.borrow().len()
    }

    #[test]
    fn dropped_watchers_are_pruned() {
        let rt = Runtime::new();
        let dep = Dep::new(&rt);
        for _ in 0..1000 {
            let reader = dep.clone();
            let watcher = rt
                .watch(Expression::getter(move |_| {
                    reader.depend();
                    Ok(Value::Null)
                }))
                .build()
                .unwrap();
            assert_eq!(dep.subscriber_count(), 1);
            drop(watcher);
        }
        assert_eq!(dep.subscriber_count(), 0);
        assert!(raw_entries(&dep) <= 1);

        dep.notify().unwrap();
        assert_eq!(raw_entries(&dep), 0);
    }

    #[test]
    fn teardown_unsubscribes() {
        let rt = Runtime::new();
        let dep = Dep::new(&rt);
        let reader = dep.clone();
        let watcher = rt
            .watch(Expression::getter(move |_| {
                reader.depend();
                Ok(Value::Null)
            }))
            .build()
            .unwrap();
        assert_eq!(raw_entries(&dep), 1);
        watcher.teardown();
        assert_eq!(raw_entries(&dep), 0);
    }
}
