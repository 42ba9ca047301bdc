use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln::{
    EngineConfig, HostBackend, Pipeline, PipelineError, PipelineHandle, PipelineId,
    PipelineInput, PipelineOutput, PipelineRegistry, RegistryError, ResourceManager,
};
use kiln_mesh::Mesh;
use tokio::time::{sleep, timeout};

struct Empty;

impl Pipeline for Empty {
    fn run(&self, _input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
        Ok(PipelineOutput::Mesh(Mesh::default()))
    }
}

fn registry() -> Arc<PipelineRegistry> {
    Arc::new(PipelineRegistry::new(ResourceManager::new(
        Arc::new(HostBackend),
        &EngineConfig::default(),
    )))
}

async fn slow_load(
    registry: Arc<PipelineRegistry>,
    id: PipelineId,
    calls: Arc<AtomicUsize>,
    fail: bool,
) -> Result<PipelineHandle, RegistryError> {
    registry
        .get_or_load(&id, |_device| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(100)).await;
            if fail {
                Err(PipelineError::new("weights missing"))
            } else {
                Ok(Arc::new(Empty) as Arc<dyn Pipeline>)
            }
        })
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_load() {
    let registry = registry();
    let id = PipelineId::with_variant("shape", "geometry");
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| tokio::spawn(slow_load(registry.clone(), id.clone(), calls.clone(), false)))
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| h.same_instance(&handles[0])));
    let status = registry.status();
    assert!(status[&id].loaded);
    assert!(!status[&id].loading);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_load_reaches_every_waiter_then_retries() {
    let registry = registry();
    let id = PipelineId::new("broken");
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..4)
        .map(|_| tokio::spawn(slow_load(registry.clone(), id.clone(), calls.clone(), true)))
        .collect();
    for task in tasks {
        match task.await.unwrap() {
            Err(RegistryError::PipelineLoadFailed { identity, reason }) => {
                assert_eq!(identity, id);
                assert_eq!(reason, "weights missing");
            }
            other => panic!("expected a load failure, got {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!registry.status()[&id].loaded);

    // The failure is not cached.
    let handle = slow_load(registry.clone(), id.clone(), calls.clone(), false)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.identity(), &id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_load_is_taken_over_by_a_waiter() {
    let registry = registry();
    let id = PipelineId::new("slow");

    let stuck = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            registry
                .get_or_load(&id, |_| async {
                    sleep(Duration::from_secs(60)).await;
                    Ok(Arc::new(Empty) as Arc<dyn Pipeline>)
                })
                .await
        })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(registry.status()[&id].loading);

    let waiter = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            registry
                .get_or_load(&id, |_| async { Ok(Arc::new(Empty) as Arc<dyn Pipeline>) })
                .await
        })
    };
    sleep(Duration::from_millis(50)).await;
    stuck.abort();

    let handle = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should take over the load")
        .unwrap()
        .unwrap();
    assert_eq!(handle.identity(), &id);
    assert!(registry.status()[&id].loaded);
}

#[tokio::test]
async fn cancelled_caller_leaves_identity_unloaded() {
    let registry = registry();
    let id = PipelineId::new("slow");

    let result = timeout(
        Duration::from_millis(20),
        registry.get_or_load(&id, |_| async {
            sleep(Duration::from_secs(60)).await;
            Ok(Arc::new(Empty) as Arc<dyn Pipeline>)
        }),
    )
    .await;
    assert!(result.is_err());
    let status = registry.status();
    assert!(!status[&id].loaded);
    assert!(!status[&id].loading);
}

#[tokio::test]
async fn preload_loads_every_registered_identity() {
    let registry = registry();
    let config = EngineConfig::default();
    kiln::procedural::register_procedural(&registry, &config, 16);

    let handles = registry.preload_all().await.unwrap();
    assert_eq!(handles.len(), 3);
    let status = registry.status();
    for id in [
        config.geometry_pipeline(),
        config.texture_pipeline(),
        config.image_pipeline(),
    ] {
        assert!(status[&id].loaded, "{id} not loaded");
    }
}
