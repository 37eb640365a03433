use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::runtime::Runtime;
use crate::value::Value;
use crate::watcher::{Expression, Watcher, WatcherBuilder, WatcherInner};

pub type RootHook = Rc<dyn Fn(&Root)>;

/// Lifecycle points a root reports to its listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Before each batched re-run of the render watcher, once mounted.
    BeforeUpdate,
    Mounted,
    /// After a flush that re-ran the render watcher.
    Updated,
    /// After a flush following `activate`.
    Activated,
    Destroyed,
}

/// Owner of a group of watchers sharing one data object.
///
/// Watchers built through [`Root::watch`] are kept alive by the root and
/// torn down together by [`Root::destroy`].
#[derive(Clone)]
pub struct Root {
    inner: Rc<RootInner>,
}

pub(crate) struct RootInner {
    id: u64,
    name: String,
    runtime: Runtime,
    data: Value,
    watchers: RefCell<Vec<Watcher>>,
    render_watcher: RefCell<Option<Weak<WatcherInner>>>,
    mounted: Cell<bool>,
    inactive: Cell<bool>,
    being_destroyed: Cell<bool>,
    destroyed: Cell<bool>,
    hooks: RefCell<Vec<(Hook, RootHook)>>,
}

impl Root {
    pub(crate) fn new(runtime: &Runtime, name: String, data: Value) -> Self {
        Self {
            inner: Rc::new(RootInner {
                id: runtime.next_root_id(),
                name,
                runtime: runtime.clone(),
                data,
                watchers: RefCell::new(Vec::new()),
                render_watcher: RefCell::new(None),
                mounted: Cell::new(false),
                inactive: Cell::new(false),
                being_destroyed: Cell::new(false),
                destroyed: Cell::new(false),
                hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn data(&self) -> Value {
        self.inner.data.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Builder for a watcher owned by this root, evaluated against its data.
    pub fn watch(&self, expression: impl Into<Expression>) -> WatcherBuilder {
        self.inner.runtime.watch(expression).root(self)
    }

    /// Creates the render watcher and marks the root mounted.
    pub fn mount(
        &self,
        render: impl Fn(&Value) -> anyhow::Result<Value> + 'static,
    ) -> Result<Watcher, Error> {
        let root = self.downgrade();
        let watcher = self
            .watch(Expression::getter(render))
            .render()
            .label(format!("render of \"{}\"", self.inner.name))
            .before(move || {
                if let Some(root) = Root::upgrade(&root)
                    && root.is_mounted()
                    && !root.is_destroyed()
                {
                    root.call_hook(Hook::BeforeUpdate);
                }
            })
            .build()?;
        self.inner.mounted.set(true);
        self.call_hook(Hook::Mounted);
        Ok(watcher)
    }

    pub fn on(&self, hook: Hook, f: impl Fn(&Root) + 'static) {
        self.inner.hooks.borrow_mut().push((hook, Rc::new(f)));
    }

    pub fn on_updated(&self, f: impl Fn(&Root) + 'static) {
        self.on(Hook::Updated, f);
    }

    pub fn on_activated(&self, f: impl Fn(&Root) + 'static) {
        self.on(Hook::Activated, f);
    }

    pub fn on_destroyed(&self, f: impl Fn(&Root) + 'static) {
        self.on(Hook::Destroyed, f);
    }

    /// Queues the root for activation at the end of the next flush.
    pub fn activate(&self) {
        self.inner.inactive.set(false);
        self.inner.runtime.queue_activated_root(self);
    }

    pub fn deactivate(&self) {
        self.inner.inactive.set(true);
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.get()
    }

    pub fn is_inactive(&self) -> bool {
        self.inner.inactive.get()
    }

    pub fn is_being_destroyed(&self) -> bool {
        self.inner.being_destroyed.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    pub fn watchers(&self) -> Vec<Watcher> {
        self.inner.watchers.borrow().clone()
    }

    pub fn render_watcher(&self) -> Option<Watcher> {
        self.inner
            .render_watcher
            .borrow()
            .as_ref()
            .and_then(Watcher::upgrade)
    }

    /// Tears down every owned watcher and releases the data. Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.being_destroyed.replace(true) {
            return;
        }
        let watchers = std::mem::take(&mut *inner.watchers.borrow_mut());
        for watcher in &watchers {
            watcher.teardown();
        }
        *inner.render_watcher.borrow_mut() = None;
        if let Some(observer) = inner.data.observer() {
            observer.release_root();
        }
        inner.destroyed.set(true);
        log::debug!("destroyed root \"{}\" ({} watchers)", inner.name, watchers.len());
        self.call_hook(Hook::Destroyed);
    }

    pub(crate) fn register_watcher(&self, watcher: &Watcher, render: bool) {
        if render {
            *self.inner.render_watcher.borrow_mut() = Some(watcher.downgrade());
        }
        self.inner.watchers.borrow_mut().push(watcher.clone());
    }

    pub(crate) fn remove_watcher(&self, watcher: &Watcher) {
        self.inner.watchers.borrow_mut().retain(|w| !w.ptr_eq(watcher));
    }

    pub(crate) fn is_render_watcher(&self, watcher: &Watcher) -> bool {
        self.render_watcher().is_some_and(|w| w.ptr_eq(watcher))
    }

    pub(crate) fn set_inactive(&self, inactive: bool) {
        self.inner.inactive.set(inactive);
    }

    pub(crate) fn call_hook(&self, hook: Hook) {
        let listeners: Vec<RootHook> = self
            .inner
            .hooks
            .borrow()
            .iter()
            .filter(|(h, _)| *h == hook)
            .map(|(_, f)| f.clone())
            .collect();
        for listener in listeners {
            listener(self);
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RootInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RootInner>) -> Option<Root> {
        weak.upgrade().map(|inner| Root { inner })
    }

    pub fn ptr_eq(&self, other: &Root) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("watchers", &self.inner.watchers.borrow().len())
            .field("mounted", &self.is_mounted())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
