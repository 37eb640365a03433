pub use crate::array::Array;
pub use crate::config::RuntimeConfig;
pub use crate::dep::Dep;
pub use crate::error::{Error, ErrorHandler, LogErrorHandler};
pub use crate::next_tick::{Boundary, EventLoop, Tick, TickDriver};
pub use crate::root::{Hook, Root};
pub use crate::runtime::Runtime;
pub use crate::scheduler::FlushReport;
pub use crate::value::{Key, Object, Value};
pub use crate::watcher::{Expression, WatchOptions, Watcher, WatcherFlags, WatcherState};
