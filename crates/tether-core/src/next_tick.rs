//! Deferred callbacks.
//!
//! Callbacks queued within one synchronous stretch of code share a single
//! deferred job. The job is handed to a [`TickDriver`] at either a
//! microtask or a task [`Boundary`]; when the driver runs it, every queued
//! callback runs in insertion order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, guarded};
use crate::runtime::{FlagGuard, Runtime};

/// Granularity of the asynchronous boundary a deferred job waits for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Boundary {
    /// Runs as soon as the current task finishes.
    #[default]
    Micro,
    /// Runs as a separate task, after pending microtasks.
    Macro,
}

pub type Job = Box<dyn FnOnce() -> Result<(), Error>>;

/// Seam to the host event loop.
pub trait TickDriver {
    fn schedule(&self, boundary: Boundary, job: Job);
}

impl<F> TickDriver for F
where
    F: Fn(Boundary, Job),
{
    fn schedule(&self, boundary: Boundary, job: Job) {
        self(boundary, job)
    }
}

/// Minimal cooperative event loop with a microtask queue and a task queue.
#[derive(Default)]
pub struct EventLoop {
    microtasks: RefCell<VecDeque<Job>>,
    tasks: RefCell<VecDeque<Job>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs microtasks until the queue is empty, including ones queued
    /// while draining. Returns how many ran.
    ///
    /// A failing job does not stop the drain; the first error is returned
    /// once the queue is empty.
    pub fn run_microtasks(&self) -> Result<usize, Error> {
        let mut ran = 0;
        let mut first_error = None;
        loop {
            let job = self.microtasks.borrow_mut().pop_front();
            let Some(job) = job else {
                break;
            };
            ran += 1;
            if let Err(err) = job() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(ran), Err)
    }

    /// Runs the oldest task, then all microtasks. Returns whether a task ran.
    pub fn run_task(&self) -> Result<bool, Error> {
        let task = self.tasks.borrow_mut().pop_front();
        let ran = task.is_some();
        let mut first_error = None;
        if let Some(task) = task
            && let Err(err) = task()
        {
            first_error = Some(err);
        }
        if let Err(err) = self.run_microtasks() {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(ran), Err)
    }

    /// Runs microtasks and tasks until both queues are empty.
    pub fn run_until_idle(&self) -> Result<(), Error> {
        let mut first_error = None;
        if let Err(err) = self.run_microtasks() {
            first_error = Some(err);
        }
        loop {
            match self.run_task() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_idle(&self) -> bool {
        self.microtasks.borrow().is_empty() && self.tasks.borrow().is_empty()
    }

    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.borrow().len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }
}

impl TickDriver for EventLoop {
    fn schedule(&self, boundary: Boundary, job: Job) {
        match boundary {
            Boundary::Micro => self.microtasks.borrow_mut().push_back(job),
            Boundary::Macro => self.tasks.borrow_mut().push_back(job),
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("microtasks", &self.pending_microtasks())
            .field("tasks", &self.pending_tasks())
            .finish()
    }
}

pub(crate) enum Pending {
    Flush,
    Callback(Box<dyn FnOnce() -> anyhow::Result<()>>),
    Resolve(Rc<TickState>),
}

#[derive(Default)]
pub(crate) struct NextTick {
    callbacks: RefCell<Vec<Pending>>,
    pending: Cell<bool>,
    use_macro_task: Cell<bool>,
}

#[derive(Default)]
pub(crate) struct TickState {
    done: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl TickState {
    fn resolve(&self) {
        self.done.set(true);
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Resolves once the batch of deferred callbacks it was queued with has run.
#[must_use = "futures do nothing unless polled"]
pub struct Tick {
    state: Rc<TickState>,
}

impl Tick {
    pub fn is_ready(&self) -> bool {
        self.state.done.get()
    }
}

impl Future for Tick {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.done.get() {
            return Poll::Ready(());
        }
        *self.state.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Runtime {
    /// Runs `callback` after the current synchronous code, together with
    /// every other callback queued before the batch runs.
    pub fn next_tick(&self, callback: impl FnOnce() -> anyhow::Result<()> + 'static) {
        self.enqueue_callback(Pending::Callback(Box::new(callback)), None);
    }

    /// Like `next_tick`. `boundary` applies when this call opens a new batch.
    pub fn next_tick_on(&self, boundary: Boundary, callback: impl FnOnce() -> anyhow::Result<()> + 'static) {
        self.enqueue_callback(Pending::Callback(Box::new(callback)), Some(boundary));
    }

    /// Future that resolves when the current batch has drained.
    pub fn tick(&self) -> Tick {
        let state = Rc::new(TickState::default());
        self.enqueue_callback(Pending::Resolve(state.clone()), None);
        Tick { state }
    }

    /// Runs `f` with batches opened inside it deferred to a task boundary.
    pub fn with_macro_task<R>(&self, f: impl FnOnce() -> R) -> R {
        let _restore = FlagGuard::set(&self.inner.ticker.use_macro_task, true);
        f()
    }

    pub(crate) fn schedule_flush(&self) {
        self.enqueue_callback(Pending::Flush, None);
    }

    fn enqueue_callback(&self, job: Pending, boundary: Option<Boundary>) {
        let ticker = &self.inner.ticker;
        ticker.callbacks.borrow_mut().push(job);
        if ticker.pending.replace(true) {
            return;
        }
        let boundary = boundary.unwrap_or(if ticker.use_macro_task.get() {
            Boundary::Macro
        } else {
            self.inner.config.default_boundary
        });
        log::trace!("deferring callback batch to {boundary:?} boundary");
        let runtime = self.downgrade();
        self.inner.driver.schedule(
            boundary,
            Box::new(move || match Runtime::upgrade(&runtime) {
                Some(runtime) => runtime.flush_callbacks(),
                None => Ok(()),
            }),
        );
    }

    fn flush_callbacks(&self) -> Result<(), Error> {
        let ticker = &self.inner.ticker;
        ticker.pending.set(false);
        let batch = std::mem::take(&mut *ticker.callbacks.borrow_mut());
        let mut first_error = None;
        for job in batch {
            match job {
                Pending::Flush => {
                    if let Err(err) = self.flush_scheduler_queue() {
                        first_error.get_or_insert(err);
                    }
                }
                Pending::Callback(callback) => {
                    if let Err(source) = guarded(true, callback) {
                        self.handle_error(&Error::NextTick { source }, None, "next_tick");
                    }
                }
                Pending::Resolve(state) => state.resolve(),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The built-in event loop driving deferred jobs.
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn run_microtasks(&self) -> Result<usize, Error> {
        self.inner.event_loop.run_microtasks()
    }

    /// Drives the built-in event loop until nothing is left to run, and
    /// returns the first internal error raised by a flush.
    pub fn run_until_idle(&self) -> Result<(), Error> {
        self.inner.event_loop.run_until_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microtasks_run_before_the_next_task() {
        let event_loop = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (boundary, tag) in [(Boundary::Macro, "task"), (Boundary::Micro, "micro")] {
            let order = order.clone();
            event_loop.schedule(
                boundary,
                Box::new(move || {
                    order.borrow_mut().push(tag);
                    Ok(())
                }),
            );
        }
        assert_eq!(event_loop.pending_tasks(), 1);
        event_loop.run_until_idle().unwrap();
        assert_eq!(*order.borrow(), vec!["micro", "task"]);
        assert!(event_loop.is_idle());
    }

    #[test]
    fn callbacks_share_one_batch() {
        let rt = Runtime::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            rt.next_tick(move || {
                order.borrow_mut().push(n);
                Ok(())
            });
        }
        assert_eq!(rt.event_loop().pending_microtasks(), 1);
        assert_eq!(rt.run_microtasks().unwrap(), 1);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_callback_does_not_stop_the_batch() {
        let rt = Runtime::new();
        let reported = Rc::new(Cell::new(0));
        let seen = reported.clone();
        rt.set_error_handler(move |err: &Error, _: Option<&crate::root::Root>, info: &str| {
            assert!(matches!(err, Error::NextTick { .. }));
            assert_eq!(info, "next_tick");
            seen.set(seen.get() + 1);
        });
        let ran = Rc::new(Cell::new(false));
        rt.next_tick(|| anyhow::bail!("boom"));
        let flag = ran.clone();
        rt.next_tick(move || {
            flag.set(true);
            Ok(())
        });
        rt.run_until_idle().unwrap();
        assert_eq!(reported.get(), 1);
        assert!(ran.get());
    }

    #[test]
    fn macro_task_scope_defers_to_a_task() {
        let rt = Runtime::new();
        rt.with_macro_task(|| rt.next_tick(|| Ok(())));
        assert_eq!(rt.event_loop().pending_tasks(), 1);
        assert_eq!(rt.event_loop().pending_microtasks(), 0);
        rt.next_tick(|| Ok(()));
        assert_eq!(rt.event_loop().pending_microtasks(), 0);
        rt.run_until_idle().unwrap();
        rt.next_tick(|| Ok(()));
        assert_eq!(rt.event_loop().pending_microtasks(), 1);
    }

    #[test]
    fn tick_future_resolves_after_the_batch() {
        let rt = Runtime::new();
        let tick = rt.tick();
        assert!(!tick.is_ready());
        rt.run_until_idle().unwrap();
        assert!(tick.is_ready());
        pollster::block_on(tick);
    }

    #[test]
    fn host_driver_receives_requested_boundaries() {
        let jobs: Rc<RefCell<Vec<(Boundary, Job)>>> = Rc::default();
        let sink = jobs.clone();
        let driver: Rc<dyn TickDriver> = Rc::new(move |boundary: Boundary, job: Job| {
            sink.borrow_mut().push((boundary, job));
        });
        let rt = Runtime::with_driver(crate::config::RuntimeConfig::default(), driver);

        let ran = Rc::new(Cell::new(0));
        let count = ran.clone();
        rt.next_tick(move || {
            count.set(count.get() + 1);
            Ok(())
        });
        rt.next_tick(|| Ok(()));
        assert_eq!(jobs.borrow().len(), 1);
        assert!(rt.event_loop().is_idle());

        let (boundary, job) = jobs.borrow_mut().remove(0);
        assert_eq!(boundary, Boundary::Micro);
        job().unwrap();
        assert_eq!(ran.get(), 1);

        rt.with_macro_task(|| rt.next_tick(|| Ok(())));
        let (boundary, job) = jobs.borrow_mut().remove(0);
        assert_eq!(boundary, Boundary::Macro);
        job().unwrap();
        assert!(jobs.borrow().is_empty());
    }
}
