//! Subscriber units.
//!
//! A [`Watcher`] evaluates an expression with itself on top of the
//! evaluation stack, so every tracked read during that evaluation
//! subscribes it to the subject behind the read. Dependencies are double
//! buffered: each evaluation collects a fresh set and subjects that were
//! not touched again are unsubscribed afterwards.
//!
//! Lazy watchers implement computed values. They start dirty, recompute
//! only when read, and own a subject of their own so that other watchers
//! can depend on the computed value instead of on its inputs.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::dep::{Dep, DepId};
use crate::error::{Error, guarded};
use crate::root::{Root, RootInner};
use crate::runtime::Runtime;
use crate::traverse::traverse;
use crate::value::Value;

pub type WatcherId = u64;

/// Tracked expression body. Receives the watcher's context value.
pub type Getter = Rc<dyn Fn(&Value) -> anyhow::Result<Value>>;

/// Reaction callback, called with `(new, old)`.
pub type Callback = Rc<dyn Fn(&Value, &Value) -> anyhow::Result<()>>;

/// Pre-run hook invoked by the scheduler before each batched run.
pub type BeforeHook = Rc<dyn Fn()>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WatcherFlags: u8 {
        /// Subscribe to every nested field of the produced value.
        const DEEP = 1 << 0;
        /// Report failures to the error handler instead of returning them.
        const USER = 1 << 1;
        /// Computed value: recompute on demand.
        const LAZY = 1 << 2;
        /// React inside the notification instead of through the scheduler.
        const SYNC = 1 << 3;
        /// The primary render unit of its root.
        const RENDER = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Evaluating,
    Dirty,
    TornDown,
}

/// What a watcher evaluates.
#[derive(Clone)]
pub enum Expression {
    Getter(Getter),
    /// Dot-delimited path such as `"user.tags.0"`, resolved against the
    /// context value.
    Path(String),
}

impl Expression {
    pub fn getter(f: impl Fn(&Value) -> anyhow::Result<Value> + 'static) -> Self {
        Expression::Getter(Rc::new(f))
    }

    fn describe(&self) -> String {
        match self {
            Expression::Getter(_) => "<getter>".to_string(),
            Expression::Path(path) => path.clone(),
        }
    }
}

impl From<&str> for Expression {
    fn from(path: &str) -> Self {
        Expression::Path(path.to_owned())
    }
}

impl From<String> for Expression {
    fn from(path: String) -> Self {
        Expression::Path(path)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Getter(_) => f.write_str("Getter(..)"),
            Expression::Path(path) => f.debug_tuple("Path").field(path).finish(),
        }
    }
}

enum Compiled {
    Getter(Getter),
    Path(Vec<String>),
    Invalid,
}

fn parse_path(path: &str) -> Option<Vec<String>> {
    let valid = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'));
    valid.then(|| path.split('.').map(str::to_owned).collect())
}

fn resolve_path(context: &Value, segments: &[String]) -> Value {
    let mut current = context.clone();
    for segment in segments {
        current = match &current {
            Value::Object(object) => object.get(segment),
            Value::Array(array) => match segment.parse::<usize>() {
                Ok(index) => array.get(index).unwrap_or_default(),
                Err(_) if segment == "length" => Value::from(array.len()),
                Err(_) => Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current
}

/// Option set accepted by [`WatcherBuilder::options`].
#[derive(Clone, Default)]
pub struct WatchOptions {
    pub deep: bool,
    pub user: bool,
    pub lazy: bool,
    pub sync: bool,
    pub before: Option<BeforeHook>,
}

/// Configures and creates a [`Watcher`].
///
/// Obtained from [`Runtime::watch`] or [`Root::watch`].
#[must_use = "a watcher is only created by `build`"]
pub struct WatcherBuilder {
    runtime: Runtime,
    expression: Expression,
    context: Option<Value>,
    root: Option<Root>,
    callback: Option<Callback>,
    flags: WatcherFlags,
    before: Option<BeforeHook>,
    label: Option<String>,
}

impl WatcherBuilder {
    pub(crate) fn new(runtime: Runtime, expression: Expression) -> Self {
        Self {
            runtime,
            expression,
            context: None,
            root: None,
            callback: None,
            flags: WatcherFlags::empty(),
            before: None,
            label: None,
        }
    }

    /// Value passed to the getter and used as the base of a path.
    /// Defaults to the owning root's data.
    pub fn context(mut self, value: impl Into<Value>) -> Self {
        self.context = Some(value.into());
        self
    }

    pub fn root(mut self, root: &Root) -> Self {
        self.root = Some(root.clone());
        self
    }

    pub fn on_change(mut self, callback: impl Fn(&Value, &Value) -> anyhow::Result<()> + 'static) -> Self {
        self.callback = Some(Rc::new(callback));
        self
    }

    pub fn options(mut self, options: WatchOptions) -> Self {
        self.flags.set(WatcherFlags::DEEP, options.deep);
        self.flags.set(WatcherFlags::USER, options.user);
        self.flags.set(WatcherFlags::LAZY, options.lazy);
        self.flags.set(WatcherFlags::SYNC, options.sync);
        self.before = options.before;
        self
    }

    pub fn deep(mut self) -> Self {
        self.flags |= WatcherFlags::DEEP;
        self
    }

    pub fn user(mut self) -> Self {
        self.flags |= WatcherFlags::USER;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.flags |= WatcherFlags::LAZY;
        self
    }

    pub fn sync(mut self) -> Self {
        self.flags |= WatcherFlags::SYNC;
        self
    }

    /// Marks the watcher as its root's primary render unit.
    pub fn render(mut self) -> Self {
        self.flags |= WatcherFlags::RENDER;
        self
    }

    pub fn before(mut self, hook: impl Fn() + 'static) -> Self {
        self.before = Some(Rc::new(hook));
        self
    }

    /// Text used in diagnostics instead of the expression.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Creates the watcher and, unless it is lazy, evaluates it once.
    ///
    /// A failing first evaluation of a non-user watcher tears the watcher
    /// down and returns the error.
    pub fn build(self) -> Result<Watcher, Error> {
        let WatcherBuilder {
            runtime,
            expression,
            context,
            root,
            callback,
            flags,
            before,
            label,
        } = self;

        let id = runtime.next_watcher_id();
        let label = label.unwrap_or_else(|| expression.describe());
        let compiled = match expression {
            Expression::Getter(getter) => Compiled::Getter(getter),
            Expression::Path(path) => match parse_path(&path) {
                Some(segments) => Compiled::Path(segments),
                None => {
                    runtime.warn(format!(
                        "Failed watching path: \"{path}\" Watcher only accepts simple \
                         dot-delimited paths. For full control, use a function instead."
                    ));
                    Compiled::Invalid
                }
            },
        };
        let context = context
            .or_else(|| root.as_ref().map(Root::data))
            .unwrap_or_default();
        let lazy = flags.contains(WatcherFlags::LAZY);
        let subject = lazy.then(|| Dep::new(&runtime));

        let watcher = Watcher {
            inner: Rc::new(WatcherInner {
                id,
                runtime,
                root: root.as_ref().map(Root::downgrade),
                label,
                compiled,
                context,
                callback,
                before,
                flags,
                active: Cell::new(true),
                dirty: Cell::new(lazy),
                value: RefCell::new(Value::Null),
                deps: RefCell::new(SmallVec::new()),
                new_deps: RefCell::new(SmallVec::new()),
                dep_ids: RefCell::new(HashSet::new()),
                new_dep_ids: RefCell::new(HashSet::new()),
                subject,
            }),
        };
        if let Some(root) = &root {
            root.register_watcher(&watcher, flags.contains(WatcherFlags::RENDER));
        }
        if !lazy {
            match watcher.get() {
                Ok(value) => *watcher.inner.value.borrow_mut() = value,
                Err(err) => {
                    watcher.teardown();
                    return Err(err);
                }
            }
        }
        log::trace!("created watcher #{id} ({})", watcher.inner.label);
        Ok(watcher)
    }
}

/// Handle to a subscriber unit. Clones share the same unit.
#[derive(Clone)]
pub struct Watcher {
    inner: Rc<WatcherInner>,
}

pub(crate) struct WatcherInner {
    id: WatcherId,
    runtime: Runtime,
    root: Option<Weak<RootInner>>,
    label: String,
    compiled: Compiled,
    context: Value,
    callback: Option<Callback>,
    before: Option<BeforeHook>,
    flags: WatcherFlags,
    active: Cell<bool>,
    dirty: Cell<bool>,
    value: RefCell<Value>,
    deps: RefCell<SmallVec<[Dep; 8]>>,
    new_deps: RefCell<SmallVec<[Dep; 8]>>,
    dep_ids: RefCell<HashSet<DepId>>,
    new_dep_ids: RefCell<HashSet<DepId>>,
    /// Present on lazy watchers only.
    subject: Option<Dep>,
}

impl WatcherInner {
    fn evaluate_expression(&self) -> anyhow::Result<Value> {
        match &self.compiled {
            Compiled::Getter(getter) => getter(&self.context),
            Compiled::Path(segments) => Ok(resolve_path(&self.context, segments)),
            Compiled::Invalid => Ok(Value::Null),
        }
    }
}

enum Reaction {
    Callback,
    NotifySubscribers,
}

impl Watcher {
    pub fn id(&self) -> WatcherId {
        self.inner.id
    }

    /// Expression text, or the label given at construction.
    pub fn expression(&self) -> &str {
        &self.inner.label
    }

    pub fn flags(&self) -> WatcherFlags {
        self.inner.flags
    }

    /// Cached value from the last evaluation.
    pub fn value(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    pub fn is_user(&self) -> bool {
        self.inner.flags.contains(WatcherFlags::USER)
    }

    pub fn state(&self) -> WatcherState {
        if !self.is_active() {
            WatcherState::TornDown
        } else if self.inner.runtime.is_evaluating(self) {
            WatcherState::Evaluating
        } else if self.inner.flags.contains(WatcherFlags::LAZY) && self.is_dirty() {
            WatcherState::Dirty
        } else {
            WatcherState::Idle
        }
    }

    /// Ids of the subjects this watcher is currently subscribed to.
    pub fn dependency_ids(&self) -> Vec<DepId> {
        self.inner.deps.borrow().iter().map(Dep::id).collect()
    }

    /// Subject of a lazy watcher.
    pub fn subject(&self) -> Option<&Dep> {
        self.inner.subject.as_ref()
    }

    pub fn root(&self) -> Option<Root> {
        self.inner.root.as_ref().and_then(Root::upgrade)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub(crate) fn before_hook(&self) -> Option<BeforeHook> {
        self.inner.before.clone()
    }

    // ---- evaluation ----

    /// Evaluates the expression with this watcher collecting dependencies,
    /// then prunes subjects that were not read again.
    fn get(&self) -> Result<Value, Error> {
        let inner = &self.inner;
        let user = self.is_user();
        let result = {
            let _target = inner.runtime.push_target(Some(self.clone()));
            let result = guarded(user, || inner.evaluate_expression());
            if inner.flags.contains(WatcherFlags::DEEP)
                && let Ok(value) = &result
            {
                traverse(value);
            }
            result
        };
        self.cleanup_deps();

        match result {
            Ok(value) => Ok(value),
            Err(source) => {
                let error = Error::Getter {
                    expression: inner.label.clone(),
                    source,
                };
                if user {
                    self.report(&error, &format!("getter for watcher \"{}\"", inner.label));
                    Ok(Value::Null)
                } else {
                    Err(error)
                }
            }
        }
    }

    pub(crate) fn add_dep(&self, dep: &Dep) {
        let inner = &self.inner;
        if !inner.active.get() {
            return;
        }
        let id = dep.id();
        if !inner.new_dep_ids.borrow_mut().insert(id) {
            return;
        }
        inner.new_deps.borrow_mut().push(dep.clone());
        if !inner.dep_ids.borrow().contains(&id) {
            dep.add_sub(self);
        }
    }

    fn cleanup_deps(&self) {
        let inner = &self.inner;
        if !inner.active.get() {
            // torn down mid-evaluation
            let collected = std::mem::take(&mut *inner.new_deps.borrow_mut());
            for dep in &collected {
                dep.remove_sub(self);
            }
            inner.new_dep_ids.borrow_mut().clear();
            return;
        }
        {
            let fresh = inner.new_dep_ids.borrow();
            for dep in inner.deps.borrow().iter() {
                if !fresh.contains(&dep.id()) {
                    dep.remove_sub(self);
                }
            }
        }
        inner.dep_ids.swap(&inner.new_dep_ids);
        inner.new_dep_ids.borrow_mut().clear();
        inner.deps.swap(&inner.new_deps);
        inner.new_deps.borrow_mut().clear();
    }

    fn get_and_invoke(&self, reaction: Reaction) -> Result<(), Error> {
        let value = self.get()?;
        let inner = &self.inner;
        inner.dirty.set(false);
        // Containers may have been mutated in place, so they always fire.
        let changed = value != *inner.value.borrow()
            || value.is_container()
            || inner.flags.contains(WatcherFlags::DEEP);
        if !changed {
            return Ok(());
        }
        let old = inner.value.replace(value.clone());
        match reaction {
            Reaction::Callback => self.invoke_callback(&value, &old),
            Reaction::NotifySubscribers => match &inner.subject {
                Some(subject) => subject.notify(),
                None => Ok(()),
            },
        }
    }

    fn invoke_callback(&self, value: &Value, old: &Value) -> Result<(), Error> {
        let Some(callback) = self.inner.callback.clone() else {
            return Ok(());
        };
        let user = self.is_user();
        let Err(source) = guarded(user, || callback(value, old)) else {
            return Ok(());
        };
        let error = Error::Callback {
            expression: self.inner.label.clone(),
            source,
        };
        if user {
            self.report(&error, &format!("callback for watcher \"{}\"", self.inner.label));
            Ok(())
        } else {
            Err(error)
        }
    }

    fn report(&self, error: &Error, info: &str) {
        let root = self.root();
        self.inner.runtime.handle_error(error, root.as_ref(), info);
    }

    /// Called by a subject when one of the dependencies changed.
    pub(crate) fn update(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if !inner.active.get() {
            return Ok(());
        }
        if let Some(subject) = &inner.subject {
            if subject.subscriber_count() == 0 {
                inner.dirty.set(true);
                return Ok(());
            }
            return self.get_and_invoke(Reaction::NotifySubscribers);
        }
        if inner.flags.contains(WatcherFlags::SYNC) {
            return self.run();
        }
        inner.runtime.queue_watcher(self);
        Ok(())
    }

    /// Re-evaluates and fires the callback on change. No-op once torn down.
    pub(crate) fn run(&self) -> Result<(), Error> {
        if !self.is_active() {
            return Ok(());
        }
        self.get_and_invoke(Reaction::Callback)
    }

    // ---- computed access ----

    /// Recomputes if dirty and returns the current value.
    pub fn evaluate(&self) -> Result<Value, Error> {
        if self.inner.dirty.get() {
            let value = self.get()?;
            *self.inner.value.borrow_mut() = value;
            self.inner.dirty.set(false);
        }
        Ok(self.value())
    }

    /// Makes the evaluating watcher depend on this computed value.
    pub fn depend(&self) {
        if let Some(subject) = &self.inner.subject {
            subject.depend();
        }
    }

    /// Computed-value accessor: `depend` followed by `evaluate`.
    pub fn read(&self) -> Result<Value, Error> {
        self.depend();
        self.evaluate()
    }

    /// Unsubscribes from every subject and deactivates the watcher.
    /// Calling it again does nothing.
    pub fn teardown(&self) {
        let inner = &self.inner;
        if !inner.active.get() {
            return;
        }
        if let Some(root) = self.root()
            && !root.is_being_destroyed()
        {
            root.remove_watcher(self);
        }
        let deps = std::mem::take(&mut *inner.deps.borrow_mut());
        for dep in &deps {
            dep.remove_sub(self);
        }
        inner.dep_ids.borrow_mut().clear();
        inner.active.set(false);
        log::trace!("tore down watcher #{}", inner.id);
    }

    // ---- identity ----

    pub(crate) fn downgrade(&self) -> Weak<WatcherInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<WatcherInner>) -> Option<Watcher> {
        weak.upgrade().map(|inner| Watcher { inner })
    }

    pub fn ptr_eq(&self, other: &Watcher) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.inner.id)
            .field("expression", &self.inner.label)
            .field("flags", &self.inner.flags)
            .field("active", &self.inner.active.get())
            .field("dirty", &self.inner.dirty.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;

    #[test]
    fn path_parsing_rejects_expressions() {
        assert_eq!(
            parse_path("a.b_1.$c"),
            Some(vec!["a".to_string(), "b_1".to_string(), "$c".to_string()])
        );
        assert_eq!(parse_path("a[0]"), None);
        assert_eq!(parse_path("a + b"), None);
    }

    #[test]
    fn path_resolution_walks_objects_and_arrays() {
        let inner: Object = [("name", "x")].into_iter().collect();
        let list = Value::from(vec![Value::from(inner), Value::from(2)]);
        let root: Object = [("list", list)].into_iter().collect();
        let root = Value::from(root);

        let seg = |p: &str| parse_path(p).unwrap();
        assert_eq!(resolve_path(&root, &seg("list.0.name")).as_str(), Some("x"));
        assert_eq!(resolve_path(&root, &seg("list.length")), Value::from(2));
        assert!(resolve_path(&root, &seg("list.5")).is_null());
        assert!(resolve_path(&root, &seg("list.1.deeper")).is_null());
        assert!(resolve_path(&root, &seg("missing.x")).is_null());
    }

    #[test]
    fn invalid_path_evaluates_to_null() {
        let rt = Runtime::new();
        let data = Value::from([("a", 1)].into_iter().collect::<Object>());
        rt.observe(&data);
        let watcher = rt.watch("a[0]").context(data).build().unwrap();
        assert!(watcher.value().is_null());
        assert!(watcher.dependency_ids().is_empty());
    }

    #[test]
    fn builder_options_set_flags() {
        let rt = Runtime::new();
        let watcher = rt
            .watch(Expression::getter(|_| Ok(Value::Null)))
            .options(WatchOptions {
                deep: true,
                user: true,
                ..WatchOptions::default()
            })
            .label("opts")
            .build()
            .unwrap();
        assert_eq!(watcher.flags(), WatcherFlags::DEEP | WatcherFlags::USER);
        assert_eq!(watcher.expression(), "opts");
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[test]
    fn teardown_is_idempotent() {
        let rt = Runtime::new();
        let data = Value::from([("a", 1)].into_iter().collect::<Object>());
        rt.observe(&data);
        let watcher = rt.watch("a").context(data).build().unwrap();
        assert_eq!(watcher.dependency_ids().len(), 1);
        watcher.teardown();
        watcher.teardown();
        assert_eq!(watcher.state(), WatcherState::TornDown);
        assert!(watcher.dependency_ids().is_empty());
    }
}
