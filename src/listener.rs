//! Listener API and the per-boundary listener registry.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::{ListenerCallbackError, ListenerError};
use crate::event::{Event, EventTypes, Value, Verdict};
use crate::spy::SpyHandler;

/// Receives events from woven methods.
///
/// Returning `Ok(())` lets the method continue. Flow control is requested by
/// returning one of the [`ProcessControl`] signals; any other error surfaces
/// in the instrumented method at the dispatch site.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &mut Event) -> Result<(), ListenerError>;
}

impl<F> EventListener for F
where
    F: Fn(&mut Event) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &mut Event) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Flow-control signals a listener can raise.
pub struct ProcessControl;

impl ProcessControl {
    /// Make the instrumented method return `value` right away.
    pub fn return_immediately(value: impl Into<Value>) -> ListenerError {
        ListenerError::Control(Verdict::Return(value.into()))
    }

    /// Make a `void` method return right away.
    pub fn return_void() -> ListenerError {
        ListenerError::Control(Verdict::Return(Value::Null))
    }

    /// Make the instrumented method throw `throwable` right away.
    pub fn throw_immediately(throwable: Value) -> ListenerError {
        ListenerError::Control(Verdict::Throw(throwable))
    }
}

static LISTENER_ID_SEQUENCE: AtomicI32 = AtomicI32::new(1000);

/// Allocate a process-unique listener id.
pub fn next_listener_id() -> i32 {
    LISTENER_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
pub struct ListenerRegistration {
    pub listener_id: i32,
    pub event_types: EventTypes,
    pub namespace: String,
    pub enable_unsafe: bool,
    pub listener: Arc<dyn EventListener>,
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("listener_id", &self.listener_id)
            .field("event_types", &self.event_types)
            .field("namespace", &self.namespace)
            .field("enable_unsafe", &self.enable_unsafe)
            .finish_non_exhaustive()
    }
}

/// Listener registrations of one isolation boundary, keyed by listener id.
///
/// Lookups never wait on registration changes: a dispatch racing an
/// unregister either sees the listener or resolves to `Continue`.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<i32, Arc<ListenerRegistration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: ListenerRegistration) -> i32 {
        let id = registration.listener_id;
        debug!(
            listener_id = id,
            namespace = %registration.namespace,
            event_types = ?registration.event_types,
            "listener registered"
        );
        self.listeners.insert(id, Arc::new(registration));
        id
    }

    pub fn unregister(&self, listener_id: i32) -> Option<Arc<ListenerRegistration>> {
        let removed = self.listeners.remove(&listener_id).map(|(_, r)| r);
        if removed.is_some() {
            debug!(listener_id, "listener unregistered");
        }
        removed
    }

    pub fn get(&self, listener_id: i32) -> Option<Arc<ListenerRegistration>> {
        self.listeners.get(&listener_id).map(|r| Arc::clone(r.value()))
    }

    pub fn listener_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.listeners.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

impl SpyHandler for ListenerRegistry {
    fn dispatch(&self, listener_id: i32, event: &mut Event) -> Result<Verdict, ListenerCallbackError> {
        let Some(registration) = self.get(listener_id) else {
            trace!(listener_id, "dispatch for unknown listener");
            return Ok(Verdict::Continue);
        };
        if !registration.event_types.has(event.event_type()) {
            return Ok(Verdict::Continue);
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| registration.listener.on_event(event)));
        match outcome {
            Ok(Ok(())) => Ok(Verdict::Continue),
            Ok(Err(ListenerError::Control(verdict))) => Ok(verdict),
            Ok(Err(ListenerError::Failed(source))) => Err(ListenerCallbackError { listener_id, source }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                Err(ListenerCallbackError { listener_id, source: format!("listener panicked: {message}").into() })
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
