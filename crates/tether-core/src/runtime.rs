use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::config::RuntimeConfig;
use crate::dep::DepId;
use crate::error::{Error, ErrorHandler, LogErrorHandler};
use crate::next_tick::{EventLoop, NextTick, TickDriver};
use crate::root::Root;
use crate::scheduler::{FlushReport, Scheduler};
use crate::value::Value;
use crate::watcher::{Expression, Watcher, WatcherBuilder, WatcherId};

thread_local! {
    static CURRENT: Runtime = Runtime::new();
}

pub type FlushListener = Rc<dyn Fn(&FlushReport)>;

/// The engine context: evaluation stack, flush queue, deferred callbacks,
/// id counters and error routing.
///
/// Cloning yields another handle to the same engine. Trackable state and
/// watchers created through one runtime never interact with another one.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    next_dep_id: Cell<DepId>,
    next_watcher_id: Cell<WatcherId>,
    next_root_id: Cell<u64>,
    // `None` entries suspend tracking (see `untracked`).
    targets: RefCell<Vec<Option<Watcher>>>,
    observing: Cell<bool>,
    pub(crate) scheduler: Scheduler,
    pub(crate) ticker: NextTick,
    pub(crate) event_loop: Rc<EventLoop>,
    pub(crate) driver: Rc<dyn TickDriver>,
    handler: RefCell<Rc<dyn ErrorHandler>>,
    pub(crate) flush_listeners: RefCell<Vec<FlushListener>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_loop = Rc::new(EventLoop::new());
        let driver: Rc<dyn TickDriver> = event_loop.clone();
        Self::build(config, event_loop, driver)
    }

    /// Runtime whose deferred flushes are handed to a host event loop.
    ///
    /// The built-in [`EventLoop`] stays empty in this mode, so
    /// `run_until_idle` and friends have nothing to do.
    pub fn with_driver(config: RuntimeConfig, driver: Rc<dyn TickDriver>) -> Self {
        Self::build(config, Rc::new(EventLoop::new()), driver)
    }

    fn build(config: RuntimeConfig, event_loop: Rc<EventLoop>, driver: Rc<dyn TickDriver>) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                next_dep_id: Cell::new(0),
                next_watcher_id: Cell::new(1),
                next_root_id: Cell::new(1),
                targets: RefCell::new(Vec::new()),
                observing: Cell::new(true),
                scheduler: Scheduler::default(),
                ticker: NextTick::default(),
                event_loop,
                driver,
                handler: RefCell::new(Rc::new(LogErrorHandler)),
                flush_listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Thread-local default runtime.
    pub fn current() -> Runtime {
        CURRENT.with(Runtime::clone)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RuntimeInner>) -> Option<Runtime> {
        weak.upgrade().map(|inner| Runtime { inner })
    }

    pub(crate) fn next_dep_id(&self) -> DepId {
        let id = self.inner.next_dep_id.get();
        self.inner.next_dep_id.set(id + 1);
        id
    }

    pub(crate) fn next_watcher_id(&self) -> WatcherId {
        let id = self.inner.next_watcher_id.get();
        self.inner.next_watcher_id.set(id + 1);
        id
    }

    pub(crate) fn next_root_id(&self) -> u64 {
        let id = self.inner.next_root_id.get();
        self.inner.next_root_id.set(id + 1);
        id
    }

    // ---- evaluation stack ----

    pub(crate) fn push_target(&self, target: Option<Watcher>) -> TargetGuard<'_> {
        self.inner.targets.borrow_mut().push(target);
        TargetGuard { runtime: self }
    }

    pub(crate) fn current_target(&self) -> Option<Watcher> {
        self.inner.targets.borrow().last().cloned().flatten()
    }

    /// Whether a watcher is currently collecting dependencies.
    pub fn is_tracking(&self) -> bool {
        matches!(self.inner.targets.borrow().last(), Some(Some(_)))
    }

    pub(crate) fn is_evaluating(&self, watcher: &Watcher) -> bool {
        self.inner
            .targets
            .borrow()
            .iter()
            .flatten()
            .any(|w| w.ptr_eq(watcher))
    }

    /// Number of nested evaluations in progress.
    pub fn evaluation_depth(&self) -> usize {
        self.inner.targets.borrow().iter().flatten().count()
    }

    /// Runs `f` with dependency collection suspended.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.push_target(None);
        f()
    }

    // ---- observation toggle ----

    pub fn is_observing(&self) -> bool {
        self.inner.observing.get()
    }

    /// While off, `observe` returns existing handles but never creates new ones.
    pub fn set_observing(&self, observing: bool) {
        self.inner.observing.set(observing);
    }

    pub fn without_observing<R>(&self, f: impl FnOnce() -> R) -> R {
        let _restore = FlagGuard::set(&self.inner.observing, false);
        f()
    }

    // ---- construction shortcuts ----

    /// Starts building a watcher for `expression`.
    pub fn watch(&self, expression: impl Into<Expression>) -> WatcherBuilder {
        WatcherBuilder::new(self.clone(), expression.into())
    }

    /// Creates an owning root whose `data` is observed as root data.
    pub fn create_root(&self, name: impl Into<String>, data: impl Into<Value>) -> Root {
        let data = data.into();
        self.observe_root(&data);
        Root::new(self, name.into(), data)
    }

    // ---- errors and diagnostics ----

    pub fn set_error_handler(&self, handler: impl ErrorHandler + 'static) {
        *self.inner.handler.borrow_mut() = Rc::new(handler);
    }

    pub(crate) fn handle_error(&self, error: &Error, root: Option<&Root>, info: &str) {
        let handler = self.inner.handler.borrow().clone();
        handler.handle(error, root, info);
    }

    pub(crate) fn warn(&self, message: impl fmt::Display) {
        if !self.inner.config.silent {
            log::warn!("{message}");
        }
    }

    /// Registers a listener that receives a report after every flush.
    pub fn on_flush(&self, listener: impl Fn(&FlushReport) + 'static) {
        self.inner.flush_listeners.borrow_mut().push(Rc::new(listener));
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("depth", &self.evaluation_depth())
            .field("flushing", &self.is_flushing())
            .field("queued", &self.pending_len())
            .finish()
    }
}

/// Pops the evaluation stack on drop, including during unwinding.
pub(crate) struct TargetGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        self.runtime.inner.targets.borrow_mut().pop();
    }
}

/// Sets a flag for the guard's lifetime and restores the previous value on
/// drop, including during unwinding.
pub(crate) struct FlagGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> FlagGuard<'a> {
    pub(crate) fn set(flag: &'a Cell<bool>, value: bool) -> Self {
        let previous = flag.replace(value);
        Self { flag, previous }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}
