//! The global binding contract the remote script fulfils.
//!
//! The loader never owns the remote object. It observes well-known slots on
//! a [`GlobalScope`] and calls through whatever [`Binding`] is present.

use crate::error::CallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

/// The object the remote script installs once it has initialized.
#[async_trait]
pub trait Binding: Send + Sync {
    fn has_method(&self, name: &str) -> bool;

    fn method_names(&self) -> Vec<String>;

    /// Synchronous call; the return value is whatever the remote method returns.
    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError>;

    /// Call a method whose remote implementation settles asynchronously.
    async fn call_async(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.call(name, args)
    }
}

impl fmt::Debug for dyn Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("methods", &self.method_names())
            .finish()
    }
}

/// "Call once ready" helper some script builds expose next to the binding.
pub trait ReadyHelper: Send + Sync {
    fn on_ready(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Identifies one injected script element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(pub uuid::Uuid);

impl ScriptId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ScriptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script-{}", self.0)
    }
}

/// A script element to attach to the document head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTag {
    pub id: ScriptId,
    pub src: Url,
    /// Execute without blocking parsing, in whatever order it arrives.
    pub async_exec: bool,
}

impl ScriptTag {
    pub fn async_script(src: Url) -> Self {
        Self {
            id: ScriptId::new(),
            src,
            async_exec: true,
        }
    }
}

/// Signals broadcast on the global scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
    /// The main binding announced itself.
    Ready,
    /// The chat sub-binding announced itself.
    ChatReady,
    ScriptLoaded(ScriptId),
    ScriptError { id: ScriptId, reason: String },
}

/// Names of the global slots and readiness events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalNames {
    pub binding: String,
    pub ready_helper: String,
    pub chat: String,
    pub ready_event: String,
    pub chat_ready_event: String,
}

impl Default for GlobalNames {
    fn default() -> Self {
        Self {
            binding: "bento".into(),
            ready_helper: "bento$".into(),
            chat: "$bentoChat".into(),
            ready_event: "bento:ready".into(),
            chat_ready_event: "bento:chat:ready".into(),
        }
    }
}

/// The shared global object plus its document head.
pub trait GlobalScope: Send + Sync {
    fn names(&self) -> &GlobalNames;

    fn binding(&self) -> Option<Arc<dyn Binding>>;

    fn ready_helper(&self) -> Option<Arc<dyn ReadyHelper>>;

    fn chat(&self) -> Option<Arc<dyn Binding>>;

    /// Subscribe to scope events. Dropping the receiver removes the listener.
    fn events(&self) -> broadcast::Receiver<ScopeEvent>;

    fn append_script(&self, tag: ScriptTag);

    fn remove_script(&self, id: ScriptId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_script_tags_get_unique_ids() {
        let src = Url::parse("https://fast.bentonow.com/?site_uuid=abc").unwrap();
        let a = ScriptTag::async_script(src.clone());
        let b = ScriptTag::async_script(src);
        assert!(a.async_exec);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn default_names_match_bento_globals() {
        let names = GlobalNames::default();
        assert_eq!(names.binding, "bento");
        assert_eq!(names.ready_event, "bento:ready");
    }
}
