//! Loads each pipeline once and shares it between requests.
//!
//! Every identity moves through `Unloaded -> Loading -> Ready`. The first caller to find an
//! identity unloaded runs its loader; everybody else arriving while it loads waits for the
//! result instead of loading a second copy.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;

use crate::device::{DeviceId, ResourceManager};
use crate::error::RegistryError;
use crate::pipeline::{Pipeline, PipelineError, PipelineHandle, PipelineId, PipelineLoader};

type LoadResult = Result<PipelineHandle, RegistryError>;

enum SlotState {
    Unloaded,
    /// The receiver yields `Some` once the loading caller finishes. If that caller is
    /// cancelled the sender is dropped instead.
    Loading(watch::Receiver<Option<LoadResult>>),
    Ready(PipelineHandle),
}

struct Slot {
    state: Mutex<SlotState>,
}

// Puts the slot back to `Unloaded` if the loading future is dropped before it finishes.
struct LoadingGuard<'a> {
    slot: &'a Slot,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.state.lock() = SlotState::Unloaded;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub loaded: bool,
    pub loading: bool,
    pub device: Option<DeviceId>,
}

pub struct PipelineRegistry {
    resources: ResourceManager,
    slots: Mutex<HashMap<PipelineId, Arc<Slot>>>,
    loaders: RwLock<BTreeMap<PipelineId, Arc<dyn PipelineLoader>>>,
}

impl PipelineRegistry {
    pub fn new(resources: ResourceManager) -> Self {
        Self {
            resources,
            slots: Mutex::new(HashMap::new()),
            loaders: RwLock::new(BTreeMap::new()),
        }
    }

    /// Makes `identity` loadable through [`get`](Self::get). Replaces any earlier loader;
    /// an already loaded instance stays cached.
    pub fn register(&self, identity: PipelineId, loader: Arc<dyn PipelineLoader>) {
        log::debug!("registered loader for {identity}");
        self.loaders.write().insert(identity, loader);
    }

    pub fn is_registered(&self, identity: &PipelineId) -> bool {
        self.loaders.read().contains_key(identity)
    }

    fn slot(&self, identity: &PipelineId) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    state: Mutex::new(SlotState::Unloaded),
                })
            })
            .clone()
    }

    /// Returns the cached pipeline for `identity`, running `loader` if nobody has loaded
    /// it yet.
    ///
    /// A failed load leaves the identity unloaded, so a later call tries again.
    pub async fn get_or_load<F, Fut>(
        &self,
        identity: &PipelineId,
        loader: F,
    ) -> Result<PipelineHandle, RegistryError>
    where
        F: FnOnce(DeviceId) -> Fut,
        Fut: Future<Output = Result<Arc<dyn Pipeline>, PipelineError>>,
    {
        let slot = self.slot(identity);

        let tx = loop {
            let mut rx = {
                let mut state = slot.state.lock();
                match &*state {
                    SlotState::Ready(handle) => return Ok(handle.clone()),
                    SlotState::Loading(rx) => rx.clone(),
                    SlotState::Unloaded => {
                        let (tx, rx) = watch::channel(None);
                        *state = SlotState::Loading(rx);
                        break tx;
                    }
                }
            };
            log::debug!("waiting for {identity} to finish loading");
            if let Ok(result) = rx.wait_for(Option::is_some).await {
                if let Some(result) = result.as_ref() {
                    return result.clone();
                }
            };
            // The loading caller went away without a result; the slot is unloaded again.
        };

        let mut guard = LoadingGuard {
            slot: &slot,
            armed: true,
        };
        let device = self.resources.select_device();
        log::info!("loading pipeline {identity} on {device}");
        let started = Instant::now();

        let result = match loader(device).await {
            Ok(pipeline) => {
                log::info!("loaded pipeline {identity} in {:?}", started.elapsed());
                Ok(PipelineHandle::new(identity.clone(), device, pipeline))
            }
            Err(e) => {
                log::warn!("failed to load pipeline {identity}: {e}");
                Err(RegistryError::PipelineLoadFailed {
                    identity: identity.clone(),
                    reason: e.to_string(),
                })
            }
        };

        guard.armed = false;
        *slot.state.lock() = match &result {
            Ok(handle) => SlotState::Ready(handle.clone()),
            Err(_) => SlotState::Unloaded,
        };
        tx.send_replace(Some(result.clone()));
        result
    }

    /// Loads `identity` with its registered loader.
    pub async fn get(&self, identity: &PipelineId) -> Result<PipelineHandle, RegistryError> {
        let loader = self
            .loaders
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPipeline(identity.clone()))?;
        self.get_or_load(identity, |device| async move { loader.load(device).await })
            .await
    }

    /// Loads every registered identity, stopping at the first failure.
    pub async fn preload_all(&self) -> Result<Vec<PipelineHandle>, RegistryError> {
        let identities: Vec<PipelineId> = self.loaders.read().keys().cloned().collect();
        let mut handles = Vec::with_capacity(identities.len());
        for identity in &identities {
            handles.push(self.get(identity).await?);
        }
        Ok(handles)
    }

    /// Snapshot of every registered or requested identity.
    pub fn status(&self) -> BTreeMap<PipelineId, PipelineStatus> {
        let mut status: BTreeMap<PipelineId, PipelineStatus> = self
            .loaders
            .read()
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    PipelineStatus {
                        loaded: false,
                        loading: false,
                        device: None,
                    },
                )
            })
            .collect();
        let slots: Vec<(PipelineId, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        for (id, slot) in slots {
            let entry = match &*slot.state.lock() {
                SlotState::Unloaded => PipelineStatus {
                    loaded: false,
                    loading: false,
                    device: None,
                },
                SlotState::Loading(_) => PipelineStatus {
                    loaded: false,
                    loading: true,
                    device: None,
                },
                SlotState::Ready(handle) => PipelineStatus {
                    loaded: true,
                    loading: false,
                    device: Some(handle.device()),
                },
            };
            status.insert(id, entry);
        }
        status
    }

    /// Drops every cached pipeline and empties device caches.
    ///
    /// Must not race with `get_or_load`; callers use it at shutdown.
    pub fn release_all(&self) {
        let released = {
            let mut slots = self.slots.lock();
            let released = slots
                .values()
                .filter(|slot| matches!(*slot.state.lock(), SlotState::Ready(_)))
                .count();
            slots.clear();
            released
        };
        self.resources.clear_cache();
        log::info!("released {released} pipelines");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::HostBackend;
    use crate::pipeline::{PipelineInput, PipelineOutput};
    use kiln_mesh::Mesh;

    struct Empty;

    impl Pipeline for Empty {
        fn run(&self, _input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
            Ok(PipelineOutput::Mesh(Mesh::default()))
        }
    }

    fn registry() -> PipelineRegistry {
        PipelineRegistry::new(ResourceManager::new(
            Arc::new(HostBackend),
            &EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn loads_once_and_caches() {
        let registry = registry();
        let id = PipelineId::new("empty");
        let a = registry
            .get_or_load(&id, |_| async { Ok(Arc::new(Empty) as Arc<dyn Pipeline>) })
            .await
            .unwrap();
        let b = registry
            .get_or_load(&id, |_| async { Err(PipelineError::new("must not be called")) })
            .await
            .unwrap();
        assert!(a.same_instance(&b));
        assert_eq!(a.device(), DeviceId::Host);
        assert!(registry.status()[&id].loaded);
    }

    #[tokio::test]
    async fn unknown_identity() {
        let registry = registry();
        let id = PipelineId::new("missing");
        assert!(matches!(
            registry.get(&id).await,
            Err(RegistryError::UnknownPipeline(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn release_all_forgets_instances() {
        let registry = registry();
        let id = PipelineId::new("empty");
        let load = |_| async { Ok(Arc::new(Empty) as Arc<dyn Pipeline>) };
        let a = registry.get_or_load(&id, load).await.unwrap();
        registry.release_all();
        assert!(registry.status().is_empty());
        let b = registry.get_or_load(&id, load).await.unwrap();
        assert!(!a.same_instance(&b));
    }
}
