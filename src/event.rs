//! Events delivered to listeners and the values they carry.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// The points of a method's execution that can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Before,
    Return,
    Throws,
    Line,
    CallBefore,
    CallReturn,
    CallThrows,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::Before,
        EventType::Return,
        EventType::Throws,
        EventType::Line,
        EventType::CallBefore,
        EventType::CallReturn,
        EventType::CallThrows,
    ];

    pub fn flag(self) -> EventTypes {
        match self {
            EventType::Before => EventTypes::BEFORE,
            EventType::Return => EventTypes::RETURN,
            EventType::Throws => EventTypes::THROWS,
            EventType::Line => EventTypes::LINE,
            EventType::CallBefore => EventTypes::CALL_BEFORE,
            EventType::CallReturn => EventTypes::CALL_RETURN,
            EventType::CallThrows => EventTypes::CALL_THROWS,
        }
    }
}

bitflags! {
    /// An ordered set of [`EventType`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventTypes: u8 {
        const BEFORE = 1 << 0;
        const RETURN = 1 << 1;
        const THROWS = 1 << 2;
        const LINE = 1 << 3;
        const CALL_BEFORE = 1 << 4;
        const CALL_RETURN = 1 << 5;
        const CALL_THROWS = 1 << 6;
        const CALLS = Self::CALL_BEFORE.bits() | Self::CALL_RETURN.bits() | Self::CALL_THROWS.bits();
    }
}

impl EventTypes {
    pub fn has(self, ty: EventType) -> bool {
        self.contains(ty.flag())
    }

    pub fn types(self) -> impl Iterator<Item = EventType> {
        EventType::ALL.into_iter().filter(move |t| self.has(*t))
    }
}

impl FromIterator<EventType> for EventTypes {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        iter.into_iter().fold(EventTypes::empty(), |acc, t| acc | t.flag())
    }
}

/// A reference to an object living in the instrumented process.
#[derive(Clone)]
pub struct ObjectRef {
    /// Java name of the object's runtime class.
    pub class_name: Arc<str>,
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(class_name: &str, value: T) -> Self {
        Self { class_name: Arc::from(class_name), handle: Arc::new(value) }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.class_name)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

/// A value crossing the dispatch bridge.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(Arc<str>),
    Object(ObjectRef),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Java name of the boxed runtime class, `None` for null.
    pub fn class_name(&self) -> Option<&str> {
        Some(match self {
            Value::Null => return None,
            Value::Boolean(_) => "java.lang.Boolean",
            Value::Byte(_) => "java.lang.Byte",
            Value::Char(_) => "java.lang.Character",
            Value::Short(_) => "java.lang.Short",
            Value::Int(_) => "java.lang.Integer",
            Value::Long(_) => "java.lang.Long",
            Value::Float(_) => "java.lang.Float",
            Value::Double(_) => "java.lang.Double",
            Value::String(_) => "java.lang.String",
            Value::Object(o) => &o.class_name,
        })
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Byte(v) => Some(*v as i32),
            Value::Char(v) => Some(*v as i32),
            Value::Short(v) => Some(*v as i32),
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

/// What woven code does after a dispatch call returns.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Verdict {
    #[default]
    Continue,
    /// Return this value from the instrumented method immediately.
    Return(Value),
    /// Throw this throwable from the instrumented method immediately.
    Throw(Value),
}

impl Verdict {
    /// The `Spy$Ret.state` code woven code switches on.
    pub fn state(&self) -> i32 {
        match self {
            Verdict::Continue => 0,
            Verdict::Return(_) => 1,
            Verdict::Throw(_) => 2,
        }
    }
}

/// One observation of an instrumented method, handed to a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Before {
        loader_id: i32,
        class_name: String,
        method_name: String,
        method_desc: String,
        target: Value,
        /// Listeners may rewrite the arguments; the method sees the result.
        arguments: Vec<Value>,
    },
    Return { value: Value },
    Throws { throwable: Value },
    Line { line: i32 },
    CallBefore { line: i32, owner: String, name: String, desc: String },
    CallReturn,
    CallThrows { throwable_class: String },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Before { .. } => EventType::Before,
            Event::Return { .. } => EventType::Return,
            Event::Throws { .. } => EventType::Throws,
            Event::Line { .. } => EventType::Line,
            Event::CallBefore { .. } => EventType::CallBefore,
            Event::CallReturn => EventType::CallReturn,
            Event::CallThrows { .. } => EventType::CallThrows,
        }
    }
}
