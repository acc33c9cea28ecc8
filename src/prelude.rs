//! Common imports for writing listeners and hosting the engine.
//!
//! This prelude is intentionally small. It covers the types most
//! integrations use while avoiding over-broad re-exports.

pub use crate::boundary::{BoundaryManager, HostProcess, IsolationBoundary};
pub use crate::config::EngineConfig;
pub use crate::error::{HostError, LifecycleError, ListenerError};
pub use crate::event::{Event, EventType, EventTypes, Value, Verdict};
pub use crate::listener::{EventListener, ProcessControl};
pub use crate::matcher::{Matcher, MatcherBuilder, MatcherExt};
pub use crate::structure::{LoadingBoundary, StructuralType};
pub use crate::transformer::ClassFileTransformer;
