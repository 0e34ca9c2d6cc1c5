//! In-memory [`GlobalScope`] for headless simulations and tests.

use crate::error::CallError;
use crate::host::{Binding, GlobalNames, GlobalScope, ReadyHelper, ScopeEvent, ScriptId, ScriptTag};
use crate::locked;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Every method the Bento binding exposes.
pub const BENTO_METHODS: &[&str] = &[
    "identify",
    "updateFields",
    "track",
    "tag",
    "view",
    "showChat",
    "hideChat",
    "openChat",
    "closeChat",
    "getEmail",
    "spamCheck",
    "trackSubdomains",
];

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct Slots {
    scripts: Vec<ScriptTag>,
    appended: usize,
    binding: Option<Arc<dyn Binding>>,
    ready_helper: Option<Arc<dyn ReadyHelper>>,
    chat: Option<Arc<dyn Binding>>,
}

/// A page whose global slots and document head live in memory.
pub struct SimulatedPage {
    names: GlobalNames,
    slots: Mutex<Slots>,
    events: broadcast::Sender<ScopeEvent>,
}

impl Default for SimulatedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPage {
    pub fn new() -> Self {
        Self::with_names(GlobalNames::default())
    }

    pub fn with_names(names: GlobalNames) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            names,
            slots: Mutex::new(Slots::default()),
            events,
        }
    }

    pub fn populate_binding(&self, binding: Arc<dyn Binding>) {
        locked(&self.slots).binding = Some(binding);
    }

    pub fn populate_chat(&self, chat: Arc<dyn Binding>) {
        locked(&self.slots).chat = Some(chat);
    }

    pub fn install_ready_helper(&self, helper: Arc<dyn ReadyHelper>) {
        locked(&self.slots).ready_helper = Some(helper);
    }

    pub fn dispatch_ready(&self) {
        self.emit(ScopeEvent::Ready);
    }

    pub fn dispatch_chat_ready(&self) {
        self.emit(ScopeEvent::ChatReady);
    }

    pub fn finish_script(&self, id: ScriptId) {
        self.emit(ScopeEvent::ScriptLoaded(id));
    }

    pub fn fail_script(&self, id: ScriptId, reason: impl Into<String>) {
        self.emit(ScopeEvent::ScriptError {
            id,
            reason: reason.into(),
        });
    }

    /// Scripts currently attached to the head.
    pub fn scripts(&self) -> Vec<ScriptTag> {
        locked(&self.slots).scripts.clone()
    }

    /// Scripts ever attached, including removed ones.
    pub fn appended_count(&self) -> usize {
        locked(&self.slots).appended
    }

    pub fn last_script(&self) -> Option<ScriptTag> {
        locked(&self.slots).scripts.last().cloned()
    }

    /// Live event listeners.
    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn emit(&self, event: ScopeEvent) {
        // No listeners is not an error: nobody is waiting.
        if self.events.send(event.clone()).is_err() {
            debug!(?event, "scope event dispatched with no listeners");
        }
    }
}

impl GlobalScope for SimulatedPage {
    fn names(&self) -> &GlobalNames {
        &self.names
    }

    fn binding(&self) -> Option<Arc<dyn Binding>> {
        locked(&self.slots).binding.clone()
    }

    fn ready_helper(&self) -> Option<Arc<dyn ReadyHelper>> {
        locked(&self.slots).ready_helper.clone()
    }

    fn chat(&self) -> Option<Arc<dyn Binding>> {
        locked(&self.slots).chat.clone()
    }

    fn events(&self) -> broadcast::Receiver<ScopeEvent> {
        self.events.subscribe()
    }

    fn append_script(&self, tag: ScriptTag) {
        let mut slots = locked(&self.slots);
        slots.appended += 1;
        slots.scripts.push(tag);
    }

    fn remove_script(&self, id: ScriptId) {
        locked(&self.slots).scripts.retain(|s| s.id != id);
    }
}

/// One call observed by a [`RecordingBinding`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
enum Behavior {
    Return(Value),
    Throw(String),
}

/// A [`Binding`] that records calls and whose method set can grow over time.
#[derive(Default)]
pub struct RecordingBinding {
    methods: Mutex<BTreeMap<String, Behavior>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// A binding exposing the full Bento surface. `getEmail` answers `null`
    /// and `spamCheck` answers `false` until configured otherwise.
    pub fn bento() -> Self {
        Self::with_methods(BENTO_METHODS)
    }

    pub fn with_methods(names: &[&str]) -> Self {
        let binding = Self::new();
        for name in names {
            binding.add_method(name);
        }
        if binding.has_method("spamCheck") {
            binding.set_return("spamCheck", Value::Bool(false));
        }
        binding
    }

    pub fn add_method(&self, name: &str) {
        locked(&self.methods)
            .entry(name.to_string())
            .or_insert(Behavior::Return(Value::Null));
    }

    pub fn set_return(&self, name: &str, value: Value) {
        locked(&self.methods).insert(name.to_string(), Behavior::Return(value));
    }

    pub fn set_throwing(&self, name: &str, message: impl Into<String>) {
        locked(&self.methods).insert(name.to_string(), Behavior::Throw(message.into()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        locked(&self.calls).clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        locked(&self.calls)
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Binding for RecordingBinding {
    fn has_method(&self, name: &str) -> bool {
        locked(&self.methods).contains_key(name)
    }

    fn method_names(&self) -> Vec<String> {
        locked(&self.methods).keys().cloned().collect()
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let behavior = locked(&self.methods)
            .get(name)
            .cloned()
            .ok_or(CallError::NotFound)?;
        locked(&self.calls).push(RecordedCall {
            method: name.to_string(),
            args,
        });
        match behavior {
            Behavior::Return(value) => Ok(value),
            Behavior::Throw(message) => Err(CallError::Thrown(message)),
        }
    }
}

/// A [`ReadyHelper`] that queues callbacks until [`fire`](Self::fire), then
/// runs later registrations immediately.
#[derive(Default)]
pub struct QueuedReadyHelper {
    state: Mutex<(bool, Vec<Box<dyn FnOnce() + Send>>)>,
}

impl QueuedReadyHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        let pending = {
            let mut state = locked(&self.state);
            state.0 = true;
            std::mem::take(&mut state.1)
        };
        for callback in pending {
            callback();
        }
    }
}

impl ReadyHelper for QueuedReadyHelper {
    fn on_ready(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut state = locked(&self.state);
        if state.0 {
            drop(state);
            callback();
        } else {
            state.1.push(callback);
        }
    }
}
