use crate::error::LoadError;
use crate::host::Binding;
use crate::locked;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

pub type LoadResult = Result<Arc<dyn Binding>, LoadError>;

/// The single in-flight load. Clones observe the same operation.
#[derive(Clone)]
pub struct PendingLoad {
    inner: Shared<BoxFuture<'static, LoadResult>>,
}

impl PendingLoad {
    /// Drive `fut` on the runtime so it settles whether or not anyone awaits it.
    pub(crate) fn spawn(fut: impl Future<Output = LoadResult> + Send + 'static) -> Self {
        let handle = tokio::spawn(fut);
        let joined = async move {
            handle
                .await
                .unwrap_or_else(|err| Err(LoadError::Aborted(err.to_string())))
        };
        Self {
            inner: joined.boxed().shared(),
        }
    }

    pub(crate) fn settled(result: LoadResult) -> Self {
        Self {
            inner: futures::future::ready(result).boxed().shared(),
        }
    }

    pub fn same_operation(&self, other: &PendingLoad) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    /// The result, if the load already settled.
    pub fn peek(&self) -> Option<&LoadResult> {
        self.inner.peek()
    }
}

impl Future for PendingLoad {
    type Output = LoadResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("settled", &self.peek().is_some())
            .finish()
    }
}

/// Where the loader is in its lifecycle. `Failed` holds until an explicit reset.
#[derive(Debug, Clone)]
pub enum LoadState {
    Idle,
    Loading(PendingLoad),
    Ready(Arc<dyn Binding>),
    Failed(LoadError),
}

impl LoadState {
    pub fn name(&self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::Loading(_) => "loading",
            LoadState::Ready(_) => "ready",
            LoadState::Failed(_) => "failed",
        }
    }
}

pub(crate) enum Admission {
    Ready(Arc<dyn Binding>),
    Pending(PendingLoad),
}

struct Tracked {
    state: LoadState,
    attempt: u64,
}

/// Owns the one `LoadState`. Every transition goes through here.
pub(crate) struct LoadTracker {
    inner: Mutex<Tracked>,
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Tracked {
                state: LoadState::Idle,
                attempt: 0,
            }),
        }
    }
}

impl LoadTracker {
    pub(crate) fn state(&self) -> LoadState {
        locked(&self.inner).state.clone()
    }

    pub(crate) fn load_error(&self) -> Option<LoadError> {
        match &locked(&self.inner).state {
            LoadState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_loading(&self) -> bool {
        matches!(locked(&self.inner).state, LoadState::Loading(_))
    }

    /// Reuse a ready binding or the in-flight load; otherwise (idle or
    /// failed) open a new attempt with `start`.
    pub(crate) fn admit(&self, start: impl FnOnce(u64) -> PendingLoad) -> Admission {
        let mut tracked = locked(&self.inner);
        match &tracked.state {
            LoadState::Ready(binding) => return Admission::Ready(binding.clone()),
            LoadState::Loading(pending) => return Admission::Pending(pending.clone()),
            LoadState::Failed(err) => info!(%err, "retrying after failed load"),
            LoadState::Idle => {}
        }
        tracked.attempt += 1;
        let pending = start(tracked.attempt);
        tracked.state = LoadState::Loading(pending.clone());
        Admission::Pending(pending)
    }

    /// Record the outcome of `attempt`. Outcomes of superseded attempts are dropped.
    pub(crate) fn settle(&self, attempt: u64, result: &LoadResult) {
        let mut tracked = locked(&self.inner);
        if tracked.attempt != attempt || !matches!(tracked.state, LoadState::Loading(_)) {
            debug!(
                attempt,
                current = tracked.attempt,
                state = tracked.state.name(),
                "discarding stale load outcome"
            );
            return;
        }
        tracked.state = match result {
            Ok(binding) => LoadState::Ready(binding.clone()),
            Err(err) => {
                warn!(%err, "load failed");
                LoadState::Failed(err.clone())
            }
        };
    }

    /// Record a failure that happened before any attempt started. Leaves a
    /// ready or in-flight load alone.
    pub(crate) fn reject(&self, err: &LoadError) {
        let mut tracked = locked(&self.inner);
        if matches!(tracked.state, LoadState::Idle | LoadState::Failed(_)) {
            tracked.state = LoadState::Failed(err.clone());
        }
    }

    pub(crate) fn reset(&self) {
        let mut tracked = locked(&self.inner);
        tracked.attempt += 1;
        tracked.state = LoadState::Idle;
    }
}
