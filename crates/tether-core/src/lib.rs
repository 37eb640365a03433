//! # Trackable state, watchers, and batched flushes
//!
//! Tether is a fine-grained reactive dependency engine. Plain state is made
//! trackable, watchers record which fields they read while evaluating, and
//! writes re-run exactly the watchers that read the written field. There are
//! four main pieces:
//!
//! - [`Value`], [`Object`], [`Array`]: dynamically typed state.
//!   `Runtime::observe` turns containers into trackable state.
//! - [`Dep`]: the subject behind each tracked field and container.
//! - [`Watcher`]: evaluates an expression, owns its dependency set, and
//!   reacts when one of its dependencies changes.
//! - The flush scheduler and `next_tick`: writes queue watchers, and a
//!   single deferred flush runs each queued watcher once, in creation order.
//!
//! ## Watching state
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use tether_core::prelude::*;
//!
//! let rt = Runtime::new();
//! let state = Value::from([("a", 1), ("b", 2)].into_iter().collect::<Object>());
//! rt.observe(&state);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! let _sum = rt
//!     .watch(Expression::getter(|ctx| {
//!         let obj = ctx.as_object().unwrap();
//!         let a = obj.get("a").as_number().unwrap_or(0.0);
//!         let b = obj.get("b").as_number().unwrap_or(0.0);
//!         Ok(Value::from(a + b))
//!     }))
//!     .context(state.clone())
//!     .on_change(move |new, _old| {
//!         sink.borrow_mut().push(new.clone());
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let obj = state.as_object().unwrap();
//! obj.set("a", 5)?;
//! obj.set("b", 5)?;
//! assert!(seen.borrow().is_empty());
//!
//! rt.run_until_idle()?;
//! assert_eq!(*seen.borrow(), vec![Value::from(10)]);
//! # Ok::<(), tether_core::Error>(())
//! ```
//!
//! Writes are synchronous; reactions are not. Both writes above land
//! before the flush, so the watcher runs once and sees the settled state.
//!
//! ## Computed values
//!
//! Lazy watchers recompute only when read:
//!
//! ```rust
//! use tether_core::prelude::*;
//!
//! let rt = Runtime::new();
//! let state = Value::from([("a", 1)].into_iter().collect::<Object>());
//! rt.observe(&state);
//!
//! let doubled = rt
//!     .watch(Expression::getter(|ctx| {
//!         let a = ctx.as_object().unwrap().get("a").as_number().unwrap_or(0.0);
//!         Ok(Value::from(a * 2.0))
//!     }))
//!     .context(state.clone())
//!     .lazy()
//!     .build()?;
//!
//! state.as_object().unwrap().set("a", 10)?;
//! assert_eq!(doubled.state(), WatcherState::Dirty);
//! assert_eq!(doubled.evaluate()?, Value::from(20));
//! assert!(!doubled.is_dirty());
//! # Ok::<(), tether_core::Error>(())
//! ```
//!
//! ## Roots
//!
//! A [`Root`] owns a data object and the watchers evaluated against it,
//! including at most one render watcher. Its hooks observe mounting, flushes
//! that re-rendered it, and destruction. `Root::destroy` tears down every
//! watcher it owns.
//!
//! ## Hosting
//!
//! Deferred work goes through a [`TickDriver`]. The default is the built-in
//! [`EventLoop`], driven by `Runtime::run_until_idle`; hosts with their own
//! loop pass a driver to `Runtime::with_driver`.

pub mod array;
pub mod config;
pub mod dep;
pub mod error;
pub mod next_tick;
pub mod observer;
pub mod prelude;
pub mod root;
pub mod runtime;
pub mod scheduler;
mod traverse;
pub mod value;
pub mod watcher;

pub use array::Array;
pub use config::RuntimeConfig;
pub use dep::{Dep, DepId};
pub use error::{Error, ErrorHandler, LogErrorHandler};
pub use next_tick::{Boundary, EventLoop, Job, Tick, TickDriver};
pub use observer::Observer;
pub use root::{Hook, Root, RootHook};
pub use runtime::{FlushListener, Runtime};
pub use scheduler::{FlushReport, MAX_UPDATE_COUNT};
pub use value::{Key, Object, Value};
pub use watcher::{
    BeforeHook, Callback, Expression, Getter, WatchOptions, Watcher, WatcherBuilder,
    WatcherFlags, WatcherId, WatcherState,
};
