//! Loader and deferred-dispatch proxy for the Bento analytics/chat script.
//!
//! [`Bento::init`] injects the remote script once and tracks its readiness;
//! every other method on [`Bento`] can be called before that finishes and is
//! forwarded once the remote binding exposes it.

pub mod config;
pub mod error;
pub mod host;
pub mod injector;
pub mod page;
pub mod proxy;
pub mod state;
pub mod telemetry;
pub mod wait;

pub use config::LoaderConfig;
pub use error::{CallError, LoadError};
pub use host::{Binding, GlobalNames, GlobalScope, ReadyHelper, ScopeEvent, ScriptId, ScriptTag};
pub use proxy::{Bento, DispatchHandle, DispatchOutcome};
pub use state::{LoadState, PendingLoad};
pub use telemetry::init_tracing;
pub use wait::WaitBounds;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
