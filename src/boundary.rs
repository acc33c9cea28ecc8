//! Namespaces, their isolation boundaries and the install/uninstall
//! lifecycle.
//!
//! Every namespace gets its own [`IsolationBoundary`] with a private
//! listener registry and its own transformers. The only state shared
//! between namespaces is the [`spy`](crate::spy) namespace table and the
//! once-per-process definition of the dispatch shim classes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{HostError, LifecycleError};
use crate::event::EventTypes;
use crate::listener::{next_listener_id, EventListener, ListenerRegistration, ListenerRegistry};
use crate::matcher::Matcher;
use crate::spy;
use crate::statistic::{AffectSnapshot, AffectStatistic};
use crate::structure::LoadingBoundary;
use crate::transformer::{ClassFileTransformer, TransformCoordinator};

/// The instrumented process as seen by the engine.
///
/// Implemented by the agent glue on top of JVMTI; tests use an in-memory
/// host.
pub trait HostProcess: Send + Sync {
    /// Define `bytes` in the root loading scope, visible to every loader.
    fn define_bootstrap_class(&self, internal_name: &str, bytes: &[u8]) -> Result<(), HostError>;

    /// Start calling `transformer` for every class loaded or redefined.
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>) -> Result<(), HostError>;

    /// Stop calling `transformer`. Hosts compare with [`Arc::ptr_eq`].
    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> Result<(), HostError>;

    /// Nearest common superclass of two internal names as `boundary` sees
    /// them, or `None` when the host cannot tell. Weaving then falls back
    /// to `java/lang/Object` outside the woven class's own ancestry.
    fn common_super_class(&self, _boundary: &LoadingBoundary, _a: &str, _b: &str) -> Option<String> {
        None
    }
}

/// Where an installed namespace lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundaryAddress {
    pub namespace: String,
    pub boundary_id: u32,
}

impl fmt::Display for BoundaryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.boundary_id)
    }
}

#[derive(Default)]
struct ManagerState {
    boundaries: HashMap<String, Arc<IsolationBoundary>>,
    spy_defined: bool,
    next_id: u32,
}

/// Installs and uninstalls namespaces. All lifecycle changes are
/// serialized by one lock.
#[derive(Default)]
pub struct BoundaryManager {
    state: Mutex<ManagerState>,
}

static GLOBAL_MANAGER: OnceLock<BoundaryManager> = OnceLock::new();

impl BoundaryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide manager the agent entry points use.
    pub fn global() -> &'static BoundaryManager {
        GLOBAL_MANAGER.get_or_init(BoundaryManager::new)
    }

    /// Install `config.namespace`, or return the address of the boundary
    /// already installed for it.
    pub fn install(&self, config: EngineConfig, host: Arc<dyn HostProcess>) -> Result<BoundaryAddress, LifecycleError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.boundaries.get(&config.namespace) {
            debug!(namespace = %config.namespace, "namespace already installed");
            return Ok(existing.address.clone());
        }

        if !state.spy_defined {
            for (name, bytes) in spy::spy_class_files()? {
                host.define_bootstrap_class(&name, &bytes)?;
            }
            state.spy_defined = true;
            debug!("dispatch shim classes defined");
        }

        state.next_id += 1;
        let address = BoundaryAddress { namespace: config.namespace.clone(), boundary_id: state.next_id };
        let boundary = Arc::new(IsolationBoundary::new(address.clone(), config, host));
        spy::init(&address.namespace, boundary.registry.clone());
        state.boundaries.insert(address.namespace.clone(), boundary);
        info!(namespace = %address.namespace, boundary = %address, "namespace installed");
        Ok(address)
    }

    /// The installed boundary for `namespace`.
    pub fn boundary(&self, namespace: &str) -> Result<Arc<IsolationBoundary>, LifecycleError> {
        self.state
            .lock()
            .boundaries
            .get(namespace)
            .cloned()
            .ok_or_else(|| LifecycleError::NotInstalled(namespace.to_string()))
    }

    /// Tear down `namespace`. Woven code already in the process keeps
    /// running and sees `Continue` from then on.
    pub fn uninstall(&self, namespace: &str) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        let boundary = state
            .boundaries
            .remove(namespace)
            .ok_or_else(|| LifecycleError::NotInstalled(namespace.to_string()))?;
        spy::clean(namespace);
        let result = boundary.shutdown();
        info!(namespace, boundary = %boundary.address, "namespace uninstalled");
        result
    }

    /// Installed namespaces, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().boundaries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One namespace's engine state: its listeners and the transformers
/// weaving for them.
pub struct IsolationBoundary {
    address: BoundaryAddress,
    config: EngineConfig,
    host: Arc<dyn HostProcess>,
    registry: Arc<ListenerRegistry>,
    coordinators: Mutex<HashMap<i32, Arc<TransformCoordinator>>>,
    active: AtomicBool,
}

impl IsolationBoundary {
    fn new(address: BoundaryAddress, config: EngineConfig, host: Arc<dyn HostProcess>) -> Self {
        Self {
            address,
            config,
            host,
            registry: Arc::new(ListenerRegistry::new()),
            coordinators: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        }
    }

    pub fn address(&self) -> &BoundaryAddress {
        &self.address
    }

    pub fn namespace(&self) -> &str {
        &self.address.namespace
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Register `listener` for the methods `matcher` selects and start
    /// weaving classes for it. Returns the new listener id.
    ///
    /// The coordinator table stays locked for the whole registration: a
    /// concurrent shutdown either drains the new transformer or refuses it.
    pub fn watch(
        &self,
        matcher: Arc<dyn Matcher>,
        listener: Arc<dyn EventListener>,
        event_types: EventTypes,
    ) -> Result<i32, LifecycleError> {
        let mut coordinators = self.coordinators.lock();
        if !self.is_active() {
            return Err(LifecycleError::Inactive(self.address.namespace.clone()));
        }
        let registration = ListenerRegistration {
            listener_id: next_listener_id(),
            event_types,
            namespace: self.address.namespace.clone(),
            enable_unsafe: self.config.enable_unsafe,
            listener,
        };
        let coordinator = Arc::new(
            TransformCoordinator::new(&registration, matcher, self.config.dump_path.clone())
                .with_host(self.host.clone()),
        );
        let listener_id = self.registry.register(registration);

        let transformer: Arc<dyn ClassFileTransformer> = coordinator.clone();
        if let Err(error) = self.host.add_transformer(transformer) {
            self.registry.unregister(listener_id);
            return Err(error.into());
        }
        coordinators.insert(listener_id, coordinator);
        drop(coordinators);
        info!(namespace = %self.address.namespace, listener_id, event_types = ?event_types, "watch started");
        Ok(listener_id)
    }

    /// Stop weaving for `listener_id` and forget the listener. Methods
    /// already woven for it dispatch `Continue` from now on.
    pub fn unwatch(&self, listener_id: i32) -> Result<(), LifecycleError> {
        let coordinator = self
            .coordinators
            .lock()
            .remove(&listener_id)
            .ok_or(LifecycleError::UnknownListener(listener_id))?;
        let transformer: Arc<dyn ClassFileTransformer> = coordinator;
        let removed = self.host.remove_transformer(&transformer);
        self.registry.unregister(listener_id);
        info!(namespace = %self.address.namespace, listener_id, "watch stopped");
        removed.map_err(LifecycleError::from)
    }

    /// Listener ids currently watched, sorted.
    pub fn listener_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.coordinators.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// What every watch of this boundary has rewritten so far.
    pub fn affect_snapshot(&self) -> AffectSnapshot {
        let total = AffectStatistic::new();
        for coordinator in self.coordinators.lock().values() {
            total.merge_from(coordinator.statistic());
        }
        total.snapshot()
    }

    fn shutdown(&self) -> Result<(), LifecycleError> {
        let coordinators: Vec<(i32, Arc<TransformCoordinator>)> = {
            let mut table = self.coordinators.lock();
            self.active.store(false, Ordering::Release);
            table.drain().collect()
        };
        let mut first_error: Option<HostError> = None;
        for (listener_id, coordinator) in coordinators {
            let transformer: Arc<dyn ClassFileTransformer> = coordinator;
            if let Err(error) = self.host.remove_transformer(&transformer) {
                warn!(namespace = %self.address.namespace, listener_id, %error, "failed to remove transformer");
                first_error.get_or_insert(error);
            }
        }
        self.registry.clear();
        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for IsolationBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationBoundary")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
