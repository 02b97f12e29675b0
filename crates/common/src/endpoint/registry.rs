//! Process-wide catalog of endpoint algorithms
//!
//! Discovery is lazy: the first lookup or creation populates the catalog from
//! the built-in algorithms plus anything added with
//! [`EndpointRegistry::register_capability`]. Readers work on an immutable
//! snapshot, so lookups never wait on discovery once it has run.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use super::{
    normalize_namespace, AlgorithmId, Ed25519Capability, Endpoint, EndpointCapability,
    P256Capability, X25519Capability,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("allowed endpoint set is locked")]
    Locked,
    #[error("unknown endpoint algorithm: {0}")]
    UnknownAlgorithm(String),
}

#[derive(Debug, Default)]
struct Catalog {
    populated: bool,
    templates: Vec<Arc<dyn EndpointCapability>>,
}

#[derive(Debug, Default)]
struct Allowed {
    ids: Option<BTreeSet<AlgorithmId>>,
    locked: bool,
}

impl Allowed {
    fn permits(&self, id: &AlgorithmId) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(id))
    }
}

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    catalog: RwLock<Arc<Catalog>>,
    discovery: Mutex<()>,
    extra: Mutex<Vec<Arc<dyn EndpointCapability>>>,
    allowed: Mutex<Allowed>,
}

static GLOBAL: OnceLock<Arc<EndpointRegistry>> = OnceLock::new();

fn builtin() -> Vec<Arc<dyn EndpointCapability>> {
    vec![
        Arc::new(Ed25519Capability),
        Arc::new(X25519Capability),
        Arc::new(P256Capability),
    ]
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> Arc<EndpointRegistry> {
        GLOBAL.get_or_init(|| Arc::new(EndpointRegistry::new())).clone()
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Populate the catalog; a no-op once populated
    ///
    /// Concurrent callers serialize on discovery and all observe the
    /// populated catalog afterwards.
    pub fn register(&self) {
        if self.snapshot().populated {
            return;
        }
        let _guard = self.discovery.lock();
        if self.snapshot().populated {
            return;
        }

        let allowed = self.allowed.lock();
        let extra = self.extra.lock().clone();
        let mut templates: Vec<Arc<dyn EndpointCapability>> = Vec::new();
        for capability in builtin().into_iter().chain(extra) {
            let id = capability.id();
            if !allowed.permits(&id) {
                tracing::debug!("endpoint {} not allowed, skipping", id);
                continue;
            }
            if templates.iter().any(|t| t.id() == id) {
                continue;
            }
            templates.push(capability);
        }
        drop(allowed);

        tracing::debug!("discovered {} endpoint algorithms", templates.len());
        *self.catalog.write() = Arc::new(Catalog {
            populated: true,
            templates,
        });
    }

    /// Add an algorithm alongside the built-in ones
    ///
    /// Returns `false` if an algorithm with the same id is already known.
    pub fn register_capability(&self, capability: Arc<dyn EndpointCapability>) -> bool {
        let _guard = self.discovery.lock();
        let id = capability.id();
        {
            let mut extra = self.extra.lock();
            if extra.iter().any(|c| c.id() == id) || builtin().iter().any(|c| c.id() == id) {
                return false;
            }
            extra.push(capability.clone());
        }

        let current = self.snapshot();
        if current.populated && self.allowed.lock().permits(&id) {
            let mut templates = current.templates.clone();
            templates.push(capability);
            *self.catalog.write() = Arc::new(Catalog {
                populated: true,
                templates,
            });
        }
        true
    }

    /// All usable algorithms, discovering them if needed
    pub fn capabilities(&self) -> Vec<Arc<dyn EndpointCapability>> {
        self.register();
        self.snapshot().templates.clone()
    }

    /// Find the algorithm behind `(local_name, namespace)`
    ///
    /// Legacy namespaces resolve to their current counterpart. A miss on an
    /// unpopulated catalog triggers discovery and a second look.
    pub fn lookup(&self, local_name: &str, namespace: &str) -> Option<Arc<dyn EndpointCapability>> {
        let namespace = normalize_namespace(namespace);
        let find = |catalog: &Catalog| {
            catalog
                .templates
                .iter()
                .find(|t| t.id().matches(local_name, namespace))
                .cloned()
        };

        let catalog = self.snapshot();
        if let Some(found) = find(&catalog) {
            return Some(found);
        }
        if catalog.populated {
            return None;
        }
        self.register();
        find(&self.snapshot())
    }

    /// Like [`lookup`](Self::lookup), failing on unknown algorithms
    pub fn require(
        &self,
        local_name: &str,
        namespace: &str,
    ) -> Result<Arc<dyn EndpointCapability>, RegistryError> {
        self.lookup(local_name, namespace)
            .ok_or_else(|| RegistryError::UnknownAlgorithm(format!("{}#{}", namespace, local_name)))
    }

    /// Generate one fresh local endpoint per algorithm
    ///
    /// Endpoints whose strength falls outside `[min_strength, max_strength]`
    /// are discarded immediately. `only` restricts creation to one algorithm.
    pub fn create(
        &self,
        desired_strength: u32,
        min_strength: u32,
        max_strength: u32,
        only: Option<AlgorithmId>,
    ) -> Vec<Arc<Endpoint>> {
        let mut created = Vec::new();
        for capability in self.capabilities() {
            let id = capability.id();
            if only.is_some_and(|only| only != id) {
                continue;
            }
            let endpoint = match Endpoint::generate(capability, desired_strength) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!("failed to generate {} endpoint: {}", id, e);
                    continue;
                }
            };
            let strength = endpoint.strength();
            if strength < min_strength || strength > max_strength {
                tracing::debug!(
                    "discarding {} endpoint with strength {} outside [{}, {}]",
                    id,
                    strength,
                    min_strength,
                    max_strength
                );
                continue;
            }
            created.push(Arc::new(endpoint));
        }
        created
    }

    /// Restrict which algorithms may be discovered
    ///
    /// With `lock` set, later calls fail. The catalog is rediscovered on
    /// next use so the restriction applies to already-populated registries too.
    pub fn set_allowed(&self, ids: &[AlgorithmId], lock: bool) -> Result<(), RegistryError> {
        let _guard = self.discovery.lock();
        {
            let mut allowed = self.allowed.lock();
            if allowed.locked {
                return Err(RegistryError::Locked);
            }
            allowed.ids = Some(ids.iter().copied().collect());
            allowed.locked = lock;
        }
        *self.catalog.write() = Arc::new(Catalog::default());
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.allowed.lock().locked
    }

    /// Drop every discovered template; the next use rediscovers
    pub fn shutdown(&self) {
        let _guard = self.discovery.lock();
        *self.catalog.write() = Arc::new(Catalog::default());
        tracing::debug!("endpoint registry shut down");
    }
}
