use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::endpoint::{normalize_namespace, Endpoint, EndpointRegistry};

/// The current generation of local endpoints, one per algorithm
///
/// Readers take a snapshot and never block rotation. Rotation replaces the
/// whole set atomically; each new endpoint keeps the one it replaced as its
/// previous generation so in-flight traffic still decrypts, and anything older
/// is dropped once the new set is published.
#[derive(Debug)]
pub struct LocalKeySet {
    registry: Arc<EndpointRegistry>,
    current: RwLock<Arc<Vec<Arc<Endpoint>>>>,
    rotation: Mutex<()>,
    desired_strength: u32,
    min_strength: u32,
    max_strength: u32,
}

impl LocalKeySet {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        desired_strength: u32,
        min_strength: u32,
        max_strength: u32,
    ) -> Self {
        let endpoints = registry.create(desired_strength, min_strength, max_strength, None);
        if endpoints.is_empty() {
            tracing::warn!("no local endpoints available, encryption disabled");
        }
        Self {
            registry,
            current: RwLock::new(Arc::new(endpoints)),
            rotation: Mutex::new(()),
            desired_strength,
            min_strength,
            max_strength,
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.current.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// The local endpoint able to talk to `remote`
    pub fn matching(&self, remote: &Endpoint) -> Option<Arc<Endpoint>> {
        self.snapshot()
            .iter()
            .find(|local| local.same_algorithm(remote))
            .cloned()
    }

    /// Look a local endpoint up by local name, optionally within a namespace
    pub fn find(&self, local_name: &str, namespace: Option<&str>) -> Option<Arc<Endpoint>> {
        let namespace = namespace.map(normalize_namespace);
        self.snapshot()
            .iter()
            .find(|local| {
                let id = local.id();
                id.local_name == local_name && namespace.map_or(true, |ns| ns == id.namespace)
            })
            .cloned()
    }

    /// Replace every local endpoint with a fresh one of the same algorithm
    ///
    /// An algorithm that fails to produce a new key keeps its current
    /// endpoint. Returns how many endpoints were rotated.
    pub fn generate_new_key(&self) -> usize {
        let _guard = self.rotation.lock();
        let old = self.snapshot();

        let mut next = Vec::with_capacity(old.len());
        let mut replaced = Vec::new();
        for endpoint in old.iter() {
            let fresh = self
                .registry
                .create(
                    self.desired_strength,
                    self.min_strength,
                    self.max_strength,
                    Some(endpoint.id()),
                )
                .into_iter()
                .next();
            match fresh {
                Some(fresh) => {
                    fresh.set_previous(Some(endpoint.clone()));
                    next.push(fresh);
                    replaced.push(endpoint.clone());
                }
                None => {
                    tracing::warn!("unable to rotate {} endpoint, keeping current", endpoint.id());
                    next.push(endpoint.clone());
                }
            }
        }

        *self.current.write() = Arc::new(next);

        // the replaced generation keeps serving decryption, the one before it goes
        let retired: Vec<_> = replaced
            .iter()
            .filter_map(|endpoint| endpoint.set_previous(None))
            .collect();
        tracing::debug!(
            "rotated {} local endpoints, retired {} old generations",
            replaced.len(),
            retired.len()
        );
        drop(retired);
        replaced.len()
    }

    /// Drop every local endpoint and its previous generation
    pub fn clear(&self) {
        let _guard = self.rotation.lock();
        let old = std::mem::take(&mut *self.current.write());
        for endpoint in old.iter() {
            endpoint.set_previous(None);
        }
    }
}
