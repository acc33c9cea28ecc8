//! The dispatch bridge woven code calls into.
//!
//! Woven methods never hold a reference to a listener. They call one of the
//! static `jvmweaver/spy/Spy.spyMethodOn*` methods with a namespace and a
//! numeric listener id; the host binds those natives to the functions in
//! this module, which resolve the namespace to its handler (the boundary's
//! listener registry) and hand back a [`Verdict`].
//!
//! The process-wide state here is only the namespace table. Listener state
//! belongs to each namespace's handler.

mod classes;

use std::cell::Cell;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::trace;

use crate::error::ListenerCallbackError;
use crate::event::{Event, Value, Verdict};

pub use classes::spy_class_files;

pub const SPY_CLASS: &str = "jvmweaver/spy/Spy";
pub const RET_CLASS: &str = "jvmweaver/spy/Spy$Ret";
pub const RET_DESC: &str = "Ljvmweaver/spy/Spy$Ret;";
pub const RET_STATE_FIELD: &str = "state";
pub const RET_RESPOND_FIELD: &str = "respond";

pub const RET_STATE_NONE: i32 = 0;
pub const RET_STATE_RETURN: i32 = 1;
pub const RET_STATE_THROWS: i32 = 2;

pub const ON_BEFORE: &str = "spyMethodOnBefore";
pub const ON_BEFORE_DESC: &str = "([Ljava/lang/Object;Ljava/lang/String;IILjava/lang/String;Ljava/lang/String;Ljava/lang/String;Ljava/lang/Object;)Ljvmweaver/spy/Spy$Ret;";
pub const ON_RETURN: &str = "spyMethodOnReturn";
pub const ON_RETURN_DESC: &str = "(Ljava/lang/Object;Ljava/lang/String;I)Ljvmweaver/spy/Spy$Ret;";
pub const ON_THROWS: &str = "spyMethodOnThrows";
pub const ON_THROWS_DESC: &str = "(Ljava/lang/Throwable;Ljava/lang/String;I)Ljvmweaver/spy/Spy$Ret;";
pub const ON_LINE: &str = "spyMethodOnLine";
pub const ON_LINE_DESC: &str = "(ILjava/lang/String;I)Ljvmweaver/spy/Spy$Ret;";
pub const ON_CALL_BEFORE: &str = "spyMethodOnCallBefore";
pub const ON_CALL_BEFORE_DESC: &str =
    "(ILjava/lang/String;Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;I)Ljvmweaver/spy/Spy$Ret;";
pub const ON_CALL_RETURN: &str = "spyMethodOnCallReturn";
pub const ON_CALL_RETURN_DESC: &str = "(Ljava/lang/String;I)Ljvmweaver/spy/Spy$Ret;";
pub const ON_CALL_THROWS: &str = "spyMethodOnCallThrows";
pub const ON_CALL_THROWS_DESC: &str = "(Ljava/lang/String;Ljava/lang/String;I)Ljvmweaver/spy/Spy$Ret;";

/// Receives every dispatch addressed to one namespace.
pub trait SpyHandler: Send + Sync {
    /// Deliver `event` to `listener_id`. An unknown id yields
    /// `Verdict::Continue`.
    fn dispatch(&self, listener_id: i32, event: &mut Event) -> Result<Verdict, ListenerCallbackError>;
}

#[derive(Default)]
struct Spy {
    handlers: DashMap<String, Arc<dyn SpyHandler>>,
}

static SPY: OnceLock<Spy> = OnceLock::new();

fn spy() -> &'static Spy {
    SPY.get_or_init(Spy::default)
}

/// Route dispatches for `namespace` to `handler`, replacing any previous one.
pub fn init(namespace: &str, handler: Arc<dyn SpyHandler>) {
    spy().handlers.insert(namespace.to_string(), handler);
}

/// Stop routing dispatches for `namespace`; woven code sees `Continue`.
pub fn clean(namespace: &str) {
    spy().handlers.remove(namespace);
}

pub fn is_initialized(namespace: &str) -> bool {
    spy().handlers.contains_key(namespace)
}

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running listener code until dropped.
struct Protector;

impl Protector {
    fn enter() -> Option<Self> {
        IN_DISPATCH.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Protector)
            }
        })
    }
}

impl Drop for Protector {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(false));
    }
}

fn dispatch(namespace: &str, listener_id: i32, event: &mut Event) -> Result<Verdict, ListenerCallbackError> {
    let Some(_protector) = Protector::enter() else {
        return Ok(Verdict::Continue);
    };
    let handler = match spy().handlers.get(namespace) {
        Some(handler) => Arc::clone(handler.value()),
        None => {
            trace!(namespace, listener_id, "no handler for namespace");
            return Ok(Verdict::Continue);
        }
    };
    handler.dispatch(listener_id, event)
}

#[allow(clippy::too_many_arguments)]
pub fn spy_method_on_before(
    arguments: &mut Vec<Value>,
    namespace: &str,
    listener_id: i32,
    loader_id: i32,
    class_name: &str,
    method_name: &str,
    method_desc: &str,
    target: Value,
) -> Result<Verdict, ListenerCallbackError> {
    let mut event = Event::Before {
        loader_id,
        class_name: class_name.to_string(),
        method_name: method_name.to_string(),
        method_desc: method_desc.to_string(),
        target,
        arguments: std::mem::take(arguments),
    };
    let verdict = dispatch(namespace, listener_id, &mut event);
    if let Event::Before { arguments: rewritten, .. } = event {
        *arguments = rewritten;
    }
    verdict
}

pub fn spy_method_on_return(
    value: Value,
    namespace: &str,
    listener_id: i32,
) -> Result<Verdict, ListenerCallbackError> {
    dispatch(namespace, listener_id, &mut Event::Return { value })
}

pub fn spy_method_on_throws(
    throwable: Value,
    namespace: &str,
    listener_id: i32,
) -> Result<Verdict, ListenerCallbackError> {
    dispatch(namespace, listener_id, &mut Event::Throws { throwable })
}

pub fn spy_method_on_line(line: i32, namespace: &str, listener_id: i32) -> Result<Verdict, ListenerCallbackError> {
    dispatch(namespace, listener_id, &mut Event::Line { line })
}

pub fn spy_method_on_call_before(
    line: i32,
    owner: &str,
    name: &str,
    desc: &str,
    namespace: &str,
    listener_id: i32,
) -> Result<Verdict, ListenerCallbackError> {
    let mut event = Event::CallBefore {
        line,
        owner: owner.to_string(),
        name: name.to_string(),
        desc: desc.to_string(),
    };
    dispatch(namespace, listener_id, &mut event)
}

pub fn spy_method_on_call_return(namespace: &str, listener_id: i32) -> Result<Verdict, ListenerCallbackError> {
    dispatch(namespace, listener_id, &mut Event::CallReturn)
}

pub fn spy_method_on_call_throws(
    throwable_class: &str,
    namespace: &str,
    listener_id: i32,
) -> Result<Verdict, ListenerCallbackError> {
    let mut event = Event::CallThrows { throwable_class: throwable_class.to_string() };
    dispatch(namespace, listener_id, &mut event)
}
