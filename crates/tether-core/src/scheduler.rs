//! Batched flush of queued watchers.
//!
//! Watchers triggered outside a flush are appended to the queue once per
//! tick. The flush sorts the queue by id, so parents run before children
//! and a root's user watchers run before its render watcher, then drains
//! it with a live cursor. Watchers queued during the drain are inserted
//! in id order after the cursor.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use web_time::{Duration, Instant};

use crate::error::Error;
use crate::root::{Hook, Root};
use crate::runtime::Runtime;
use crate::watcher::{Watcher, WatcherId};

/// Repeat runs of one watcher within a single flush before it is treated as
/// an infinite update loop. Repeats count whether the watcher re-queued
/// itself or was re-queued through other watchers.
pub const MAX_UPDATE_COUNT: usize = 100;

#[derive(Default)]
pub(crate) struct Scheduler {
    queue: RefCell<Vec<Watcher>>,
    activated: RefCell<Vec<Root>>,
    has: RefCell<HashSet<WatcherId>>,
    circular: RefCell<HashMap<WatcherId, usize>>,
    halted: RefCell<HashSet<WatcherId>>,
    waiting: Cell<bool>,
    flushing: Cell<bool>,
    index: Cell<usize>,
}

impl Scheduler {
    fn reset(&self) {
        self.index.set(0);
        self.queue.borrow_mut().clear();
        self.activated.borrow_mut().clear();
        self.has.borrow_mut().clear();
        self.circular.borrow_mut().clear();
        self.halted.borrow_mut().clear();
        self.waiting.set(false);
        self.flushing.set(false);
    }
}

/// Resets the scheduler if a flush unwinds before it finishes.
struct FlushGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if self.scheduler.flushing.get() {
            log::warn!("flush interrupted by a panic, dropping queued watchers");
            self.scheduler.reset();
        }
    }
}

/// Summary of one flush, delivered to `Runtime::on_flush` listeners.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushReport {
    /// Watcher runs performed, counting repeated runs.
    pub ran: usize,
    /// Watchers stopped by the update-loop detector.
    pub halted: Vec<WatcherId>,
    pub duration: Duration,
}

impl Runtime {
    /// Queues `watcher` for the next flush unless it is already queued.
    pub(crate) fn queue_watcher(&self, watcher: &Watcher) {
        let scheduler = &self.inner.scheduler;
        let id = watcher.id();
        if !scheduler.has.borrow_mut().insert(id) {
            return;
        }
        {
            let mut queue = scheduler.queue.borrow_mut();
            if scheduler.flushing.get() {
                let floor = scheduler.index.get() + 1;
                let mut at = queue.len();
                while at > floor && queue[at - 1].id() > id {
                    at -= 1;
                }
                queue.insert(at, watcher.clone());
            } else {
                queue.push(watcher.clone());
            }
        }
        self.ensure_flush_scheduled();
    }

    /// Queues a root whose activated hooks run after the next drain.
    pub(crate) fn queue_activated_root(&self, root: &Root) {
        self.inner.scheduler.activated.borrow_mut().push(root.clone());
        self.ensure_flush_scheduled();
    }

    fn ensure_flush_scheduled(&self) {
        let scheduler = &self.inner.scheduler;
        if !scheduler.waiting.replace(true) {
            self.schedule_flush();
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.scheduler.flushing.get()
    }

    /// Watchers waiting for, or still to run in, the current flush.
    pub fn pending_len(&self) -> usize {
        let scheduler = &self.inner.scheduler;
        let queued = scheduler.queue.borrow().len();
        if scheduler.flushing.get() {
            queued.saturating_sub(scheduler.index.get() + 1)
        } else {
            queued
        }
    }

    /// Drains the queue. Runs once per scheduled tick.
    pub(crate) fn flush_scheduler_queue(&self) -> Result<(), Error> {
        let scheduler = &self.inner.scheduler;
        let config = &self.inner.config;
        let started = Instant::now();
        scheduler.flushing.set(true);
        let _unwind = FlushGuard { scheduler };
        scheduler.queue.borrow_mut().sort_by_key(Watcher::id);

        let mut first_error = None;
        let mut ran = 0;
        let mut index = 0;
        loop {
            scheduler.index.set(index);
            let next = scheduler.queue.borrow().get(index).cloned();
            let Some(watcher) = next else {
                break;
            };
            index += 1;
            let id = watcher.id();
            if scheduler.halted.borrow().contains(&id) {
                scheduler.has.borrow_mut().remove(&id);
                continue;
            }
            if config.detect_update_loops {
                let repeats = *scheduler
                    .circular
                    .borrow_mut()
                    .entry(id)
                    .and_modify(|count| *count += 1)
                    .or_insert(0);
                if repeats > config.max_update_count {
                    scheduler.halted.borrow_mut().insert(id);
                    scheduler.has.borrow_mut().remove(&id);
                    let error = Error::UpdateLoop {
                        watcher: id,
                        expression: watcher.is_user().then(|| watcher.expression().to_string()),
                    };
                    let root = watcher.root();
                    self.handle_error(&error, root.as_ref(), "scheduler");
                    continue;
                }
            }
            if let Some(before) = watcher.before_hook() {
                before();
            }
            scheduler.has.borrow_mut().remove(&id);
            ran += 1;
            if let Err(err) = watcher.run() {
                log::debug!("watcher #{id} failed during flush: {err}");
                first_error.get_or_insert(err);
            }
        }

        let activated = std::mem::take(&mut *scheduler.activated.borrow_mut());
        let updated = std::mem::take(&mut *scheduler.queue.borrow_mut());
        let mut halted: Vec<WatcherId> = scheduler.halted.borrow().iter().copied().collect();
        halted.sort_unstable();
        scheduler.reset();

        for root in &activated {
            root.set_inactive(false);
            root.call_hook(Hook::Activated);
        }
        for watcher in updated.iter().rev() {
            let Some(root) = watcher.root() else {
                continue;
            };
            if root.is_render_watcher(watcher) && root.is_mounted() && !root.is_destroyed() {
                root.call_hook(Hook::Updated);
            }
        }

        let report = FlushReport {
            ran,
            halted,
            duration: started.elapsed(),
        };
        log::debug!(
            "flushed {} watcher run(s) in {:?} ({} halted)",
            report.ran,
            report.duration,
            report.halted.len()
        );
        let listeners = self.inner.flush_listeners.borrow().clone();
        for listener in listeners {
            listener(&report);
        }
        first_error.map_or(Ok(()), Err)
    }
}
