use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::root::Root;
use crate::watcher::WatcherId;

/// Errors produced by the reactive core.
///
/// User code (getters, change callbacks, deferred callbacks) reports failures
/// as `anyhow::Error`; the core wraps them with the label of the unit that
/// produced them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error in getter for watcher \"{expression}\": {source}")]
    Getter {
        expression: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("error in callback for watcher \"{expression}\": {source}")]
    Callback {
        expression: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("error in next_tick callback: {source}")]
    NextTick {
        #[source]
        source: anyhow::Error,
    },

    #[error("you may have an infinite update loop {}", loop_site(.expression))]
    UpdateLoop {
        watcher: WatcherId,
        expression: Option<String>,
    },
}

fn loop_site(expression: &Option<String>) -> String {
    match expression {
        Some(expression) => format!("in watcher with expression \"{expression}\""),
        None => "in a render function".to_string(),
    }
}

impl Error {
    /// Label of the watcher this error originated from, if any.
    pub fn expression(&self) -> Option<&str> {
        match self {
            Error::Getter { expression, .. } | Error::Callback { expression, .. } => {
                Some(expression)
            }
            Error::UpdateLoop { expression, .. } => expression.as_deref(),
            Error::NextTick { .. } => None,
        }
    }
}

/// Receives errors that the core decided not to propagate: failures of
/// `user` watchers, deferred callbacks, and update-loop diagnostics.
pub trait ErrorHandler {
    fn handle(&self, error: &Error, root: Option<&Root>, info: &str);
}

impl<F> ErrorHandler for F
where
    F: Fn(&Error, Option<&Root>, &str),
{
    fn handle(&self, error: &Error, root: Option<&Root>, info: &str) {
        self(error, root, info)
    }
}

/// Default handler: writes everything to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle(&self, error: &Error, root: Option<&Root>, info: &str) {
        let origin = root.map(|r| format!(" (root \"{}\")", r.name())).unwrap_or_default();
        match error {
            Error::UpdateLoop { .. } => log::warn!("{error}{origin}"),
            _ => log::error!("Error in {info}{origin}: {error}"),
        }
    }
}

/// Runs `f`, converting a panic into an error when `catch` is set.
pub(crate) fn guarded<R>(catch: bool, f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    if !catch {
        return f();
    }
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
