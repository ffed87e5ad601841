mod support;

use shepherd_common::Signal;
use shepherd_state::AppState;
use shepherd_store::{AppMode, ConfigStore, RuntimeRecord, RuntimeStore};
use shepherd_supervise::{prepare_config, AppDefinition, SupervisorOptions};
use support::{definition, harness, times_started_at, Harness};

/// Register a config directly in the store, bypassing the manager, the way
/// a previous supervisor run would have left it.
async fn seed_app(h: &Harness, name: &str, mutate: impl FnOnce(&mut shepherd_store::AppConfig)) -> u64 {
    let options = SupervisorOptions::new("/tmp/shepherd-tests");
    let mut config = prepare_config(&definition(name), 1, &options).unwrap();
    mutate(&mut config);
    let id = config.id;
    h.configs.insert(config).await.unwrap();
    id
}

#[tokio::test]
async fn attaches_to_a_surviving_process() {
    let h = harness().await;
    let id = seed_app(&h, "web", |_| {}).await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    // The recorded process started before the record was written.
    h.probe.set(555, times_started_at(9_000));

    h.manager.initialize().await.unwrap();

    assert_eq!(h.manager.app_state(id), AppState::Running);
    assert!(h.manager.started(id).await.unwrap());
    let record = h.runtime.find(id).await.unwrap().unwrap();
    assert!(record.timestamps.attached.is_some());
    assert_eq!(h.transport.attached.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn resurrect_is_idempotent() {
    let h = harness().await;
    let id = seed_app(&h, "web", |_| {}).await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    h.probe.set(555, times_started_at(9_000));

    h.manager.initialize().await.unwrap();
    h.manager.resurrect().await.unwrap();
    h.manager.resurrect().await.unwrap();

    // One attachment, no fresh spawns, record intact.
    assert_eq!(h.transport.attached.lock().unwrap().len(), 1);
    assert_eq!(h.transport.spawned_count(), 0);
    assert_eq!(h.manager.app_state(id), AppState::Running);
}

#[tokio::test]
async fn reused_pid_is_never_touched() {
    let h = harness().await;
    let id = seed_app(&h, "web", |c| c.autorestart = true).await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    // A process on that pid, but born after our record: someone else's.
    h.probe.set(555, times_started_at(20_000));

    h.manager.initialize().await.unwrap();

    let attached = h.transport.attached.lock().unwrap().clone();
    assert!(
        attached.iter().all(|handle| handle.kills().is_empty()),
        "signalled an unrelated process"
    );
    // The stale record is gone and the autorestart app was started fresh.
    assert!(h.manager.started(id).await.unwrap());
    assert_eq!(h.transport.spawned_count(), 1);
    let record = h.runtime.find(id).await.unwrap().unwrap();
    assert_ne!(record.pid, 555);
}

#[tokio::test]
async fn dead_pid_record_is_cleaned_up() {
    let h = harness().await;
    let id = seed_app(&h, "web", |_| {}).await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    // No probe entry: the pid is gone.

    h.manager.initialize().await.unwrap();

    assert!(h.runtime.find(id).await.unwrap().is_none());
    assert_eq!(h.manager.app_state(id), AppState::Stopped);
    assert_eq!(h.transport.spawned_count(), 0);
}

#[tokio::test]
async fn failed_attach_kills_the_stray_process() {
    let h = harness().await;
    let id = seed_app(&h, "web", |_| {}).await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    h.probe.set(555, times_started_at(9_000));
    h.transport.fail_ping_for(555);

    h.manager.initialize().await.unwrap();

    assert!(h.runtime.find(id).await.unwrap().is_none());
    assert_eq!(h.manager.app_state(id), AppState::Stopped);
    let attached = h.transport.attached.lock().unwrap().clone();
    assert!(attached
        .iter()
        .any(|handle| handle.kills().contains(&Signal::Kill)));
}

#[tokio::test]
async fn startup_apps_start_fresh_during_resurrection() {
    let h = harness().await;
    let id = seed_app(&h, "boot", |c| c.startup = true).await;

    h.manager.initialize().await.unwrap();

    assert!(h.manager.started(id).await.unwrap());
    assert_eq!(h.transport.spawned_count(), 1);
}

#[tokio::test]
async fn attached_cluster_restores_worker_state() {
    let h = harness().await;
    let id = seed_app(&h, "api", |c| {
        c.mode = AppMode::Cluster;
        c.instances = 2;
    })
    .await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    h.probe.set(555, times_started_at(9_000));
    // Pre-populate what the container would report after a reconnect.
    let container = h.transport.seed_container(555);
    container.seed_worker(0, 1000, true);
    container.seed_worker(1, 1001, false);

    h.manager.initialize().await.unwrap();

    assert_eq!(h.manager.app_state(id), AppState::Running);
    let entry = &h.manager.list().await.unwrap()[0];
    assert_eq!(entry.workers.len(), 2);
    let alive: Vec<_> = entry.workers.iter().filter(|w| w.alive).map(|w| w.id).collect();
    assert_eq!(alive, vec![0]);
}

#[tokio::test]
async fn dead_attached_worker_is_revived_for_autorestart_apps() {
    let h = harness().await;
    let id = seed_app(&h, "api", |c| {
        c.mode = AppMode::Cluster;
        c.instances = 2;
        c.autorestart = true;
    })
    .await;
    h.runtime
        .upsert(RuntimeRecord::new(id, 555, 10_000))
        .await
        .unwrap();
    h.probe.set(555, times_started_at(9_000));
    let container = h.transport.seed_container(555);
    container.seed_worker(0, 1000, true);
    container.seed_worker(1, 1001, false);

    h.manager.initialize().await.unwrap();

    // Worker 1 died while the supervisor was away; the restart policy
    // brings it back into its slot.
    let mut alive: Vec<u32> = Vec::new();
    for _ in 0..200 {
        let workers = h.manager.workers(id).await.unwrap();
        alive = workers.iter().filter(|w| w.alive).map(|w| w.id).collect();
        if alive.len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(alive, vec![0, 1]);
    assert_eq!(h.transport.spawned_count(), 0);
}

#[tokio::test]
async fn unknown_definition_with_startup_defaults_is_not_started() {
    let h = harness().await;
    // Registration without start leaves everything stopped through a boot.
    h.manager
        .register(AppDefinition {
            startup: Some(false),
            ..definition("idle")
        })
        .await
        .unwrap();
    h.manager.initialize().await.unwrap();
    assert_eq!(h.transport.spawned_count(), 0);
}
