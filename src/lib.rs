//! # jvm-weaver
//!
//! Dynamic method interception for running JVMs.
//!
//! The crate selects methods of classes as they are loaded or redefined,
//! rewrites their bytecode so they report to listeners, and lets those
//! listeners change what the method does next (return early with a value,
//! or throw).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jvm_weaver::prelude::*;
//!
//! let host: Arc<dyn HostProcess> = my_agent_host();
//! let manager = BoundaryManager::global();
//! manager.install(EngineConfig::parse("namespace=trace"), host)?;
//!
//! let boundary = manager.boundary("trace")?;
//! let matcher = MatcherBuilder::default().on_type("com.acme.*").on_behavior("handle*").build();
//! boundary.watch(
//!     matcher,
//!     Arc::new(|event: &mut Event| -> Result<(), ListenerError> {
//!         if let Event::Return { value } = event {
//!             tracing::info!(?value, "returned");
//!         }
//!         Ok(())
//!     }),
//!     EventTypes::BEFORE | EventTypes::RETURN,
//! )?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            Host process (class load hook, natives)      │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Lifecycle (boundary)                    │
//! │   BoundaryManager, IsolationBoundary, HostProcess        │
//! ├─────────────────────────────────────────────────────────┤
//! │                Transform (transformer)                   │
//! │   loop guard -> structure -> matcher -> weaver -> stats  │
//! ├─────────────────────────────────────────────────────────┤
//! │            Weaving (weaver, bytecode, classfile)         │
//! │   instruction model, frame analysis, class writer        │
//! ├─────────────────────────────────────────────────────────┤
//! │              Dispatch bridge (spy, listener)             │
//! │   Spy natives -> namespace -> ListenerRegistry           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`classfile`] | Class file parser and writer |
//! | [`descriptor`] | Field and method descriptors |
//! | [`bytecode`] | Symbolic instruction model, analysis, encoding |
//! | [`structure`] | Structural view of a type used by matchers |
//! | [`matcher`] | Composable method selection |
//! | [`weaver`] | Rewrites method bodies to dispatch events |
//! | [`spy`] | Static dispatch entry points woven code calls |
//! | [`listener`] | Listener API and per-namespace registry |
//! | [`transformer`] | Per-class transform pipeline |
//! | [`boundary`] | Install, uninstall, watch, unwatch |
//!
//! ## Logging
//!
//! Everything is reported through [`tracing`]. Installing a subscriber is
//! left to the host.

pub mod boundary;
pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod listener;
pub mod matcher;
pub mod prelude;
pub mod spy;
pub mod statistic;
pub mod structure;
pub mod transformer;
pub mod weaver;

pub use crate::boundary::{BoundaryAddress, BoundaryManager, HostProcess, IsolationBoundary};
pub use crate::config::EngineConfig;
pub use crate::error::{
    BytecodeError, ClassFileError, HostError, LifecycleError, ListenerCallbackError, ListenerError,
    MatchEvaluationError, TransformError, WeavingError,
};
pub use crate::event::{Event, EventType, EventTypes, Value, Verdict};
pub use crate::listener::{EventListener, ProcessControl};
pub use crate::statistic::{AffectSnapshot, AffectStatistic};
pub use crate::transformer::{ClassFileTransformer, TransformCoordinator};
