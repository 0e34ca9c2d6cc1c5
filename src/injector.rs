use crate::error::LoadError;
use crate::host::{GlobalScope, ScopeEvent, ScriptTag};
use crate::state::LoadResult;
use crate::wait::{Race, Settled};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

enum Signal {
    Ready,
    Failed(String),
}

/// Attaches the remote script to the document head and waits for it to
/// populate the binding.
pub struct ScriptInjector {
    scope: Arc<dyn GlobalScope>,
}

impl ScriptInjector {
    pub fn new(scope: Arc<dyn GlobalScope>) -> Self {
        Self { scope }
    }

    /// The script tag and its listeners are in place when this returns; the
    /// returned future only waits. If the binding already exists nothing is
    /// injected.
    pub fn inject(&self, url: Url, timeout: Duration) -> BoxFuture<'static, LoadResult> {
        if let Some(binding) = self.scope.binding() {
            debug!(%url, "binding already present; skipping injection");
            return futures::future::ready(Ok(binding)).boxed();
        }

        let rx = self.scope.events();
        let tag = ScriptTag::async_script(url.clone());
        let script_id = tag.id;
        self.scope.append_script(tag);
        info!(%url, script = %script_id, "injected loader script");

        let scope = self.scope.clone();
        async move {
            let race = Race::new()
                .on_signal(rx, move |event| match event {
                    ScopeEvent::Ready => Some(Signal::Ready),
                    ScopeEvent::ScriptError { id, reason } if *id == script_id => {
                        Some(Signal::Failed(reason.clone()))
                    }
                    ScopeEvent::ScriptLoaded(id) if *id == script_id => {
                        debug!(script = %id, "script fetched; waiting for readiness signal");
                        None
                    }
                    _ => None,
                })
                .deadline(timeout);

            let result = match race.first_settled().await.map(Settled::into_inner) {
                Ok(Signal::Ready) => scope
                    .binding()
                    .ok_or_else(|| LoadError::Initialization {
                        url: url.to_string(),
                    }),
                Ok(Signal::Failed(reason)) => Err(LoadError::Network {
                    url: url.to_string(),
                    reason,
                }),
                Err(expired) => {
                    debug!(elapsed_ms = expired.elapsed.as_millis(), "load wait expired");
                    Err(LoadError::Timeout {
                        url: url.to_string(),
                        timeout_ms: timeout.as_millis(),
                    })
                }
            };

            match &result {
                Ok(_) => info!(%url, "remote binding ready"),
                Err(err) => {
                    warn!(%url, %err, "removing failed loader script");
                    scope.remove_script(script_id);
                }
            }
            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{RecordingBinding, SimulatedPage};
    use tokio::time::Instant;

    fn url() -> Url {
        Url::parse("https://fast.bentonow.com/?site_uuid=abc").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_ready_and_keeps_script() {
        let page = Arc::new(SimulatedPage::new());
        let injector = ScriptInjector::new(page.clone());
        let load = injector.inject(url(), Duration::from_secs(30));

        let script = page.last_script().unwrap();
        assert!(script.async_exec);
        assert_eq!(script.src, url());

        page.populate_binding(Arc::new(RecordingBinding::bento()));
        page.dispatch_ready();
        let binding = load.await.unwrap();
        assert!(binding.has_method("track"));
        assert_eq!(page.scripts().len(), 1);
        assert_eq!(page.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_binding_short_circuits() {
        let page = Arc::new(SimulatedPage::new());
        page.populate_binding(Arc::new(RecordingBinding::bento()));
        let injector = ScriptInjector::new(page.clone());
        injector.inject(url(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(page.appended_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn script_error_removes_script() {
        let page = Arc::new(SimulatedPage::new());
        let injector = ScriptInjector::new(page.clone());
        let load = injector.inject(url(), Duration::from_secs(30));
        let id = page.last_script().unwrap().id;
        page.fail_script(id, "net::ERR_BLOCKED_BY_CLIENT");

        let err = load.await.unwrap_err();
        assert!(matches!(err, LoadError::Network { ref reason, .. } if reason.contains("BLOCKED")));
        assert!(page.scripts().is_empty());
        assert_eq!(page.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_from_other_scripts_are_ignored() {
        let page = Arc::new(SimulatedPage::new());
        let injector = ScriptInjector::new(page.clone());
        let load = injector.inject(url(), Duration::from_secs(30));
        page.fail_script(crate::host::ScriptId::new(), "unrelated");
        page.populate_binding(Arc::new(RecordingBinding::bento()));
        page.dispatch_ready();
        assert!(load.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn script_loaded_alone_does_not_settle() {
        let page = Arc::new(SimulatedPage::new());
        let injector = ScriptInjector::new(page.clone());
        let mut load = injector.inject(url(), Duration::from_secs(30));
        let id = page.last_script().unwrap().id;
        page.finish_script(id);

        tokio::select! {
            _ = &mut load => panic!("load settled on script load without readiness"),
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
        assert_eq!(page.scripts().len(), 1);

        page.populate_binding(Arc::new(RecordingBinding::bento()));
        page.dispatch_ready();
        assert!(load.await.is_ok());
        assert_eq!(page.scripts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_without_binding_is_initialization_error() {
        let page = Arc::new(SimulatedPage::new());
        let injector = ScriptInjector::new(page.clone());
        let load = injector.inject(url(), Duration::from_secs(30));
        page.dispatch_ready();
        assert!(matches!(
            load.await,
            Err(LoadError::Initialization { .. })
        ));
        assert!(page.scripts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let page = Arc::new(SimulatedPage::new());
        let injector = ScriptInjector::new(page.clone());
        let started = Instant::now();
        let err = injector
            .inject(url(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Timeout { timeout_ms: 30_000, .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(30) + Duration::from_millis(50));
        assert!(page.scripts().is_empty());
        assert_eq!(page.listener_count(), 0);
    }
}
