mod support;

use shepherd_common::{ExitStatus, Signal};
use shepherd_process::ProcessHandle;
use shepherd_state::AppState;
use shepherd_store::{AppMode, ConfigStore, RuntimeStore};
use shepherd_supervise::{AppDefinition, StopOptions};
use support::{definition, harness, wait_for};

fn cluster(name: &str, instances: u32) -> AppDefinition {
    AppDefinition {
        mode: Some(AppMode::Cluster),
        instances: Some(instances),
        ..definition(name)
    }
}

#[tokio::test]
async fn cluster_start_forks_the_initial_worker_set() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let entry = &h.manager.list().await.unwrap()[0];
    let id = entry.id;

    // Cluster apps are running as soon as start resolves.
    assert_eq!(h.manager.app_state(id), AppState::Running);
    assert_eq!(entry.workers.len(), 2);
    let mut ids: Vec<_> = entry.workers.iter().map(|w| w.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
    assert!(entry.workers.iter().all(|w| w.alive));
}

#[tokio::test]
async fn scale_up_and_back_down_is_symmetric() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let id = h.manager.list().await.unwrap()[0].id;
    let container = h.transport.container_for(h.transport.last_handle().pid());

    h.manager.scale(id, 4).await.unwrap();
    let entry = &h.manager.list().await.unwrap()[0];
    let mut ids: Vec<_> = entry.workers.iter().filter(|w| w.alive).map(|w| w.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(h.configs.find_by_id(id).await.unwrap().unwrap().instances, 4);

    // Scaling back removes the highest-numbered workers first.
    h.manager.scale(id, 2).await.unwrap();
    let entry = &h.manager.list().await.unwrap()[0];
    let mut ids: Vec<_> = entry.workers.iter().filter(|w| w.alive).map(|w| w.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(h.configs.find_by_id(id).await.unwrap().unwrap().instances, 2);
    assert_eq!(h.manager.app_state(id), AppState::Running);
    drop(container);
}

#[tokio::test]
async fn reload_replaces_every_worker_in_place() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let id = h.manager.list().await.unwrap()[0].id;
    let container = h.transport.container_for(h.transport.last_handle().pid());
    let before: Vec<u32> = (0..2).filter_map(|w| container.worker_pid(w)).collect();

    h.manager.reload(id).await.unwrap();

    let entry = &h.manager.list().await.unwrap()[0];
    let mut ids: Vec<_> = entry.workers.iter().filter(|w| w.alive).map(|w| w.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
    let after: Vec<u32> = (0..2).filter_map(|w| container.worker_pid(w)).collect();
    assert_ne!(before, after);
    assert_eq!(h.manager.app_state(id), AppState::Running);
}

#[tokio::test]
async fn crashed_worker_is_respawned_for_autorestart_apps() {
    let h = harness().await;
    h.manager
        .start(AppDefinition {
            autorestart: Some(true),
            ..cluster("api", 2)
        })
        .await
        .unwrap();
    let container = h.transport.container_for(h.transport.last_handle().pid());
    let old_pid = container.worker_pid(0).unwrap();

    container.emit_worker_exit(0, ExitStatus::with_code(1));

    let probe = container.clone();
    wait_for(move || probe.worker_pid(0).map(|p| p != old_pid).unwrap_or(false)).await;
    let entry = &h.manager.list().await.unwrap()[0];
    assert_eq!(entry.workers.iter().filter(|w| w.alive).count(), 2);
}

#[tokio::test]
async fn dead_worker_stays_down_without_autorestart() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let id = h.manager.list().await.unwrap()[0].id;
    let container = h.transport.container_for(h.transport.last_handle().pid());

    h.manager.kill_worker(id, 0).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let entry = &h.manager.list().await.unwrap()[0];
    let alive: Vec<_> = entry.workers.iter().filter(|w| w.alive).map(|w| w.id).collect();
    assert_eq!(alive, vec![1]);
}

#[tokio::test]
async fn restart_worker_replaces_a_single_worker() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let id = h.manager.list().await.unwrap()[0].id;
    let container = h.transport.container_for(h.transport.last_handle().pid());
    let old_pid = container.worker_pid(1).unwrap();
    let untouched = container.worker_pid(0).unwrap();

    h.manager.restart_worker(id, 1).await.unwrap();

    assert_ne!(container.worker_pid(1).unwrap(), old_pid);
    assert_eq!(container.worker_pid(0).unwrap(), untouched);
}

#[tokio::test]
async fn cluster_stop_never_waits_on_the_main_process() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let id = h.manager.list().await.unwrap()[0].id;
    let handle = h.transport.last_handle();
    h.transport
        .container_for(handle.pid())
        .cooperative
        .store(false, std::sync::atomic::Ordering::SeqCst);

    // With the workers deleted the main process is killed outright, so an
    // uncooperative container never costs the graceful timeout.
    tokio::time::timeout(
        std::time::Duration::from_millis(500),
        h.manager.stop(id, StopOptions { graceful: true, timeout_ms: 10_000 }),
    )
    .await
    .expect("stop stalled on the graceful timeout")
    .unwrap();
    assert_eq!(handle.kills(), vec![Signal::Kill]);
}

#[tokio::test]
async fn cluster_stop_brings_down_workers_and_main() {
    let h = harness().await;
    h.manager.start(cluster("api", 2)).await.unwrap();
    let id = h.manager.list().await.unwrap()[0].id;

    h.manager.stop(id, StopOptions::default()).await.unwrap();

    let manager = h.manager.clone();
    wait_for(move || manager.app_state(id) == AppState::Stopped).await;
    assert!(h.runtime.find(id).await.unwrap().is_none());
}
