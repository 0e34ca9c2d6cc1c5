//! The `Bento` facade: a stable call surface that works before the remote
//! script has attached itself.
//!
//! Generic methods are fire-and-forget. When the binding already exposes the
//! method the call goes through immediately; otherwise each call waits on its
//! own (readiness signal or polling, bounded by [`WaitBounds`]) and dispatches
//! once the method shows up. Calls racing independently means pre-ready calls
//! are not guaranteed to run in invocation order.

use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::host::{Binding, GlobalScope, ScopeEvent};
use crate::injector::ScriptInjector;
use crate::state::{Admission, LoadState, LoadTracker, PendingLoad};
use crate::wait::{Race, Settled, WaitBounds, WaitExpired};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, info_span, warn};

/// What became of a fire-and-forget call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The remote method ran and returned this value.
    Dispatched(Value),
    /// The remote method threw; the error was logged and swallowed.
    CallFailed(String),
    /// The method never appeared within the wait bounds.
    Expired { available: Vec<String> },
    /// Dropped because the last load failed.
    Dropped(LoadError),
    /// No global scope, nothing to do.
    Skipped,
    /// The call had to wait but no Tokio runtime was available to wait on.
    NoRuntime,
}

/// Resolves to the call's [`DispatchOutcome`]. Dropping it does not cancel the call.
pub struct DispatchHandle(BoxFuture<'static, DispatchOutcome>);

impl DispatchHandle {
    fn settled(outcome: DispatchOutcome) -> Self {
        Self(futures::future::ready(outcome).boxed())
    }

    fn spawn(fut: impl Future<Output = DispatchOutcome> + Send + 'static) -> Self {
        let handle = tokio::spawn(fut);
        Self(
            async move {
                handle
                    .await
                    .unwrap_or_else(|err| DispatchOutcome::CallFailed(err.to_string()))
            }
            .boxed(),
        )
    }
}

impl Future for DispatchHandle {
    type Output = DispatchOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DispatchHandle")
    }
}

struct Inner {
    scope: Option<Arc<dyn GlobalScope>>,
    tracker: Arc<LoadTracker>,
    bounds: WaitBounds,
}

/// Cheap to clone; clones share one load state.
#[derive(Clone)]
pub struct Bento {
    inner: Arc<Inner>,
}

impl fmt::Debug for Bento {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bento")
            .field("headless", &self.inner.scope.is_none())
            .field("state", &self.inner.tracker.state().name())
            .field("bounds", &self.inner.bounds)
            .finish()
    }
}

impl Bento {
    pub fn new(scope: Arc<dyn GlobalScope>) -> Self {
        Self::build(Some(scope), WaitBounds::default())
    }

    /// For contexts without a global scope: every call is a no-op.
    pub fn headless() -> Self {
        Self::build(None, WaitBounds::default())
    }

    /// Replace the per-method wait bounds (default 100ms × 50). The returned
    /// handle still shares load state with `self` and its clones.
    pub fn with_wait_bounds(self, bounds: WaitBounds) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope: self.inner.scope.clone(),
                tracker: self.inner.tracker.clone(),
                bounds,
            }),
        }
    }

    fn build(scope: Option<Arc<dyn GlobalScope>>, bounds: WaitBounds) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope,
                tracker: Arc::new(LoadTracker::default()),
                bounds,
            }),
        }
    }

    /// Start loading the remote script, or join the load already in flight.
    ///
    /// The script tag is attached before this returns; the returned
    /// [`PendingLoad`] settles whether or not it is awaited. A failed previous
    /// load is retried. Outside a Tokio runtime the load is rejected with
    /// [`LoadError::NoRuntime`] and nothing is injected.
    pub fn init(&self, config: LoaderConfig) -> PendingLoad {
        let Some(scope) = self.inner.scope.clone() else {
            warn!("init called without a global scope");
            return PendingLoad::settled(Err(LoadError::NoGlobalScope));
        };
        if Handle::try_current().is_err() {
            let err = LoadError::NoRuntime;
            warn!(%err, "init called outside a tokio runtime");
            self.inner.tracker.reject(&err);
            return PendingLoad::settled(Err(err));
        }
        let url = match config.script_url() {
            Ok(url) => url,
            Err(err) => {
                warn!(%err, "rejecting loader configuration");
                self.inner.tracker.reject(&err);
                return PendingLoad::settled(Err(err));
            }
        };
        let timeout = config.effective_timeout();
        let advanced = config.advanced;

        let admission = self.inner.tracker.admit(|attempt| {
            let span = info_span!("bento_load", attempt, %url, advanced);
            let injection = {
                let _entered = span.enter();
                ScriptInjector::new(scope.clone()).inject(url.clone(), timeout)
            };
            let inner = self.inner.clone();
            PendingLoad::spawn(
                async move {
                    let result = injection.await;
                    inner.tracker.settle(attempt, &result);
                    if advanced && let Ok(binding) = &result {
                        schedule_page_view(scope, binding.clone(), inner.bounds);
                    }
                    result
                }
                .instrument(span),
            )
        });
        match admission {
            Admission::Ready(binding) => PendingLoad::settled(Ok(binding)),
            Admission::Pending(pending) => pending,
        }
    }

    /// Back to idle: clears the stored error and forgets any pending load.
    pub fn reset(&self) {
        info!("resetting loader state");
        self.inner.tracker.reset();
    }

    pub fn load_error(&self) -> Option<LoadError> {
        self.inner.tracker.load_error()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.tracker.is_loading()
    }

    pub fn state(&self) -> LoadState {
        self.inner.tracker.state()
    }

    pub fn identify(&self, email: &str) -> DispatchHandle {
        self.call("identify", vec![Value::from(email)])
    }

    pub fn update_fields(&self, fields: Value) -> DispatchHandle {
        self.call("updateFields", vec![fields])
    }

    pub fn track(&self, event: &str, details: Option<Value>) -> DispatchHandle {
        let mut args = vec![Value::from(event)];
        args.extend(details);
        self.call("track", args)
    }

    pub fn tag(&self, tag: &str) -> DispatchHandle {
        self.call("tag", vec![Value::from(tag)])
    }

    pub fn view(&self) -> DispatchHandle {
        self.call("view", vec![])
    }

    pub fn show_chat(&self) -> DispatchHandle {
        self.call("showChat", vec![])
    }

    pub fn hide_chat(&self) -> DispatchHandle {
        self.call("hideChat", vec![])
    }

    pub fn open_chat(&self) -> DispatchHandle {
        self.call("openChat", vec![])
    }

    pub fn close_chat(&self) -> DispatchHandle {
        self.call("closeChat", vec![])
    }

    pub fn track_subdomains(&self, domains: &[&str]) -> DispatchHandle {
        let domains = domains.iter().map(|d| Value::from(*d)).collect();
        self.call("trackSubdomains", vec![Value::Array(domains)])
    }

    /// Fire-and-forget call of any method on the binding.
    pub fn call(&self, method: impl Into<String>, args: Vec<Value>) -> DispatchHandle {
        let method = method.into();
        let Some(scope) = self.inner.scope.clone() else {
            return DispatchHandle::settled(DispatchOutcome::Skipped);
        };
        if let Some(err) = self.inner.tracker.load_error() {
            warn!(%method, %err, "loader failed; dropping call (reset and init to retry)");
            return DispatchHandle::settled(DispatchOutcome::Dropped(err));
        }
        if let Some(binding) = scope.binding().filter(|b| b.has_method(&method)) {
            return DispatchHandle::settled(invoke(binding.as_ref(), &method, args));
        }

        if Handle::try_current().is_err() {
            warn!(%method, "binding not ready and no tokio runtime to wait on; dropping call");
            return DispatchHandle::settled(DispatchOutcome::NoRuntime);
        }

        debug!(%method, "binding not ready; deferring call");
        let wait = wait_for_method(&scope, &method, self.inner.bounds);
        DispatchHandle::spawn(async move {
            match wait.await {
                Ok(binding) => invoke(binding.as_ref(), &method, args),
                Err(expired) => {
                    let available = available_methods(scope.as_ref());
                    warn!(
                        %method,
                        attempts = expired.attempts,
                        ?available,
                        "method never became available; dropping call"
                    );
                    DispatchOutcome::Expired { available }
                }
            }
        })
    }

    /// The email the remote script has cached for this visitor. Never waits.
    pub fn get_email(&self) -> Option<String> {
        let binding = self.inner.scope.as_ref()?.binding()?;
        match binding.call("getEmail", vec![]) {
            Ok(Value::String(email)) if !email.is_empty() => Some(email),
            Ok(_) => None,
            Err(err) => {
                debug!(%err, "getEmail unavailable");
                None
            }
        }
    }

    /// Ask the remote script whether `email` looks like spam. Unlike the
    /// fire-and-forget methods, failures reach the caller.
    pub async fn spam_check(&self, email: &str) -> Result<bool, LoadError> {
        const METHOD: &str = "spamCheck";
        let scope = self.inner.scope.clone().ok_or(LoadError::NoGlobalScope)?;
        if let Some(err) = self.inner.tracker.load_error() {
            return Err(err);
        }
        Handle::try_current().map_err(|_| LoadError::NoRuntime)?;
        let binding = wait_for_method(&scope, METHOD, self.inner.bounds)
            .await
            .map_err(|_| LoadError::MethodUnavailable {
                method: METHOD.to_string(),
                available: available_methods(scope.as_ref()),
            })?;
        match binding
            .call_async(METHOD, vec![Value::from(email)])
            .await
            .map_err(|err| err.into_load_error(METHOD))?
        {
            Value::Bool(is_spam) => Ok(is_spam),
            other => Err(LoadError::Call {
                method: METHOD.to_string(),
                message: format!("expected a boolean, got {other}"),
            }),
        }
    }

    /// The chat sub-binding, if the remote script has installed it.
    pub fn chat(&self) -> Option<Arc<dyn Binding>> {
        self.inner.scope.as_ref()?.chat()
    }

    /// Wait (same bounds as method calls) for the chat sub-binding.
    pub async fn wait_for_chat(&self) -> Result<Arc<dyn Binding>, LoadError> {
        let scope = self.inner.scope.clone().ok_or(LoadError::NoGlobalScope)?;
        Handle::try_current().map_err(|_| LoadError::NoRuntime)?;
        let lookup_scope = scope.clone();
        wait_for_slot(
            scope.events(),
            ScopeEvent::ChatReady,
            move || lookup_scope.chat(),
            self.inner.bounds,
        )
        .await
        .map_err(|_| LoadError::MethodUnavailable {
            method: scope.names().chat.clone(),
            available: available_methods(scope.as_ref()),
        })
    }
}

fn invoke(binding: &dyn Binding, method: &str, args: Vec<Value>) -> DispatchOutcome {
    match binding.call(method, args) {
        Ok(value) => {
            debug!(%method, "dispatched");
            DispatchOutcome::Dispatched(value)
        }
        Err(err) => {
            warn!(%method, %err, "remote method threw; ignoring");
            DispatchOutcome::CallFailed(err.to_string())
        }
    }
}

fn available_methods(scope: &dyn GlobalScope) -> Vec<String> {
    scope
        .binding()
        .map(|b| b.method_names())
        .unwrap_or_default()
}

/// Subscribes now; the returned future waits until `method` exists on the binding.
fn wait_for_method(
    scope: &Arc<dyn GlobalScope>,
    method: &str,
    bounds: WaitBounds,
) -> impl Future<Output = Result<Arc<dyn Binding>, WaitExpired>> + Send + 'static {
    let lookup_scope = scope.clone();
    let method = method.to_string();
    wait_for_slot(
        scope.events(),
        ScopeEvent::Ready,
        move || lookup_scope.binding().filter(|b| b.has_method(&method)),
        bounds,
    )
}

fn wait_for_slot<T: Send + 'static>(
    rx: broadcast::Receiver<ScopeEvent>,
    wake: ScopeEvent,
    check: impl Fn() -> Option<T> + Clone + Send + 'static,
    bounds: WaitBounds,
) -> impl Future<Output = Result<T, WaitExpired>> + Send + 'static {
    let on_signal = check.clone();
    async move {
        Race::new()
            .on_signal(rx, move |event| {
                if *event == wake { on_signal() } else { None }
            })
            .poll(bounds, check)
            .first_settled()
            .await
            .map(Settled::into_inner)
    }
}

/// Advanced-mode builds expect an explicit page view once their ready helper
/// exists. Best effort: a helper that never shows up is only logged.
fn schedule_page_view(scope: Arc<dyn GlobalScope>, binding: Arc<dyn Binding>, bounds: WaitBounds) {
    let lookup_scope = scope.clone();
    let wait = wait_for_slot(
        scope.events(),
        ScopeEvent::Ready,
        move || lookup_scope.ready_helper(),
        bounds,
    );
    let helper_name = scope.names().ready_helper.clone();
    tokio::spawn(async move {
        match wait.await {
            Ok(helper) => helper.on_ready(Box::new(move || {
                invoke(binding.as_ref(), "view", vec![]);
            })),
            Err(expired) => debug!(
                helper = %helper_name,
                attempts = expired.attempts,
                "ready helper never appeared; skipping page view"
            ),
        }
    });
}
