use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grip_link::config::SimConfig;
use grip_link::{BackendConfig, BackendManager, LinkState, ListenerHandle, Sample, Transport};

type Seen = Arc<Mutex<Vec<(Sample, Transport)>>>;

fn recorder() -> (ListenerHandle, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: ListenerHandle = Arc::new(move |s: &Sample, t: Transport| -> anyhow::Result<()> {
        sink.lock().unwrap().push((s.clone(), t));
        Ok(())
    });
    (listener, seen)
}

fn quiet_sim() -> SimConfig {
    SimConfig {
        jitter: 0,
        ..SimConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn simulator_start_delivers_tagged_sample_within_one_tick() {
    let manager = BackendManager::new(BackendConfig::simulator(quiet_sim()));
    let (listener, seen) = recorder();
    manager.add_listener(listener);

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(25)).await;

    {
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let (sample, source) = &seen[0];
        assert_eq!(*source, Transport::Simulator);
        assert_eq!(sample.channels(), 4);
        assert!(sample.values().iter().all(|v| *v <= 4095));
    }
    manager.stop().await;
    assert_eq!(manager.state(), LinkState::Stopped);
}

fn channel_zero(manager: &BackendManager) -> Vec<u32> {
    manager
        .history(usize::MAX)
        .iter()
        .map(|entry| entry.sample[0])
        .collect()
}

#[tokio::test(start_paused = true)]
async fn held_key_rises_strictly_then_falls_strictly_to_floor() {
    let config = quiet_sim();
    let floor = config.floor as u32;
    let manager = BackendManager::new(BackendConfig::simulator(config).with_history(1000));
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(110)).await;

    let pressed_at = manager.history(usize::MAX).len();
    manager.handle_char('1', true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let released_at = manager.history(usize::MAX).len();
    manager.handle_char('1', false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    manager.stop().await;

    let levels = channel_zero(&manager);
    assert!(pressed_at > 0 && released_at - pressed_at >= 45);
    assert!(levels[..pressed_at].iter().all(|&v| v == floor));

    for pair in levels[pressed_at - 1..released_at].windows(2) {
        assert!(pair[1] > pair[0], "not rising while held: {:?}", pair);
    }

    let falling = &levels[released_at - 1..];
    let reached = falling
        .iter()
        .position(|&v| v == floor)
        .expect("never returned to the floor");
    for pair in falling[..=reached].windows(2) {
        assert!(pair[1] < pair[0], "not falling after release: {:?}", pair);
    }
    assert!(falling[reached..].iter().all(|&v| v == floor));

    for entry in manager.history(usize::MAX) {
        assert_eq!(entry.sample.channels(), 4);
        assert!(entry.sample.values().iter().all(|&v| (floor..=4095).contains(&v)));
    }
}

#[tokio::test]
async fn sample_age_tracks_staleness() {
    let manager = BackendManager::new(BackendConfig::simulator(quiet_sim()));
    assert!(manager.sample_age().is_none());

    manager.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.latest().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    manager.stop().await;

    let fresh = manager.sample_age().unwrap();
    assert!(fresh < Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stale = manager.sample_age().unwrap();
    assert!(stale >= fresh + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn failing_listener_does_not_starve_others() {
    let manager = BackendManager::new(BackendConfig::simulator(quiet_sim()));
    let failures = Arc::new(AtomicUsize::new(0));
    let f = failures.clone();
    manager.add_listener(Arc::new(move |_: &Sample, _: Transport| -> anyhow::Result<()> {
        f.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("consumer went away")
    }));
    let (listener, seen) = recorder();
    manager.add_listener(listener);

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.stop().await;

    let delivered = seen.lock().unwrap().len();
    assert!(delivered >= 5);
    assert_eq!(failures.load(Ordering::SeqCst), delivered);
}

#[tokio::test(start_paused = true)]
async fn listener_registration_is_a_set() {
    let manager = BackendManager::new(BackendConfig::simulator(quiet_sim()).with_history(100));
    let (listener, seen) = recorder();
    assert!(manager.add_listener(listener.clone()));
    assert!(!manager.add_listener(listener.clone()));
    assert_eq!(manager.listener_count(), 1);

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let first_round = seen.lock().unwrap().len();
    // One delivery per tick, not two
    assert_eq!(first_round, manager.history(usize::MAX).len());

    assert!(manager.remove_listener(&listener));
    assert!(!manager.remove_listener(&listener));
    let after_remove = seen.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().unwrap().len(), after_remove);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn swap_and_restart_keeps_listeners() {
    let manager = BackendManager::default();
    let (listener, seen) = recorder();
    manager.add_listener(listener);

    manager.use_simulator(quiet_sim()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let old = manager.current().unwrap();

    let faster = SimConfig {
        tick_ms: 10,
        ..quiet_sim()
    };
    manager.use_simulator(faster).await.unwrap();
    assert_eq!(old.state(), LinkState::Stopped);
    let before = seen.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().unwrap().len() > before);

    manager.stop().await;
    manager.start().await.unwrap();
    assert_eq!(manager.state(), LinkState::Connected);
    manager.stop().await;

    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|(_, source)| *source == Transport::Simulator));
}

#[tokio::test(start_paused = true)]
async fn reselecting_same_config_is_a_no_op() {
    let manager = BackendManager::default();
    let config = BackendConfig::simulator(quiet_sim()).with_history(50);
    manager.select_transport(config.clone()).await.unwrap();
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let history_before = manager.history(usize::MAX).len();

    manager.select_transport(config).await.unwrap();
    assert_eq!(manager.state(), LinkState::Connected);
    assert!(manager.history(usize::MAX).len() >= history_before);
    manager.stop().await;
}
