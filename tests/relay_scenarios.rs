use scene_link::{
    LinkConfig, Message, MessageKind, ParameterType, ParameterValue, Relay, RelayControl, SyncClient,
    SyncEvent, Transport, FramedTransport, LOCK_PARAMETER_ID,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct RunningRelay {
    relay: Arc<Relay>,
    config: LinkConfig,
    task: tokio::task::JoinHandle<scene_link::Result<()>>,
    _record_dir: tempfile::TempDir,
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Binds ingest and publish on consecutive ephemeral ports so `LinkConfig` addressing works.
async fn bind_pair() -> (u16, TcpListener, TcpListener) {
    loop {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);
        if base > u16::MAX - 2 {
            continue;
        }
        let Ok(ingest) = TcpListener::bind(("127.0.0.1", base + 1)).await else {
            continue;
        };
        let Ok(publish) = TcpListener::bind(("127.0.0.1", base + 2)).await else {
            continue;
        };
        return (base, ingest, publish);
    }
}

async fn start_relay(client_timeout: Duration) -> RunningRelay {
    let record_dir = tempfile::tempdir().unwrap();
    let (base, ingest, publish) = bind_pair().await;
    let config = LinkConfig::new()
        .with_base_port(base)
        .with_client_timeout(client_timeout)
        .with_sweep_interval(Duration::from_millis(50))
        .with_record_dir(record_dir.path());

    let relay = Arc::new(Relay::new(config.clone()));
    let task = tokio::spawn(Arc::clone(&relay).serve(ingest, publish));

    RunningRelay {
        relay,
        config,
        task,
        _record_dir: record_dir,
    }
}

async fn connect_client(running: &RunningRelay, client_id: u8, subscribers_before: usize) -> SyncClient<FramedTransport<tokio::net::TcpStream>, FramedTransport<tokio::net::TcpStream>> {
    let client = SyncClient::connect(&running.config, client_id).await.unwrap();
    // subscription is registered by the accept task; wait until it is live
    timeout(WAIT, async {
        while running.relay.subscriber_count() <= subscribers_before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    client
}

async fn next_event<P: Transport, S: Transport>(client: &mut SyncClient<P, S>) -> SyncEvent {
    timeout(WAIT, client.receive()).await.unwrap().unwrap().unwrap()
}

#[tokio::test]
async fn test_silent_lock_holder_is_released() {
    let running = start_relay(Duration::from_millis(300)).await;
    let mut holder = connect_client(&running, 1, 0).await;
    let mut observer = connect_client(&running, 2, 1).await;

    holder.lock(7).await.unwrap();
    assert_eq!(next_event(&mut observer).await, SyncEvent::Lock { object_id: 7, locked: true });
    assert_eq!(running.relay.with_state(|s| s.lock_holder(7)), Some(1));

    // observer keeps heartbeating, holder goes silent
    let release = timeout(WAIT, async {
        loop {
            observer.ping().await.unwrap();
            match timeout(Duration::from_millis(100), observer.receive()).await {
                Ok(Ok(Some(event))) => return event,
                Ok(other) => panic!("subscription ended: {:?}", other.map(|_| ())),
                Err(_) => continue,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(release, SyncEvent::Lock { object_id: 7, locked: false });
    assert_eq!(running.relay.with_state(|s| s.lock_holder(7)), None);
    assert!(running.relay.with_state(|s| s.last_seen(2).is_some()));

    let cached = running
        .relay
        .with_state(|s| s.cached(7, LOCK_PARAMETER_ID).cloned())
        .unwrap();
    assert_eq!(cached.lock_state(), Some(false));
    assert_eq!(cached.client_id, running.config.relay_id);
}

#[tokio::test]
async fn test_late_joiner_resend() {
    let running = start_relay(Duration::from_secs(30)).await;
    let mut editor = connect_client(&running, 1, 0).await;

    editor.send_update(4, 0, &ParameterValue::Vector3([0.0, 1.0, 0.0])).await.unwrap();
    editor.send_update(4, 0, &ParameterValue::Vector3([0.0, 2.0, 0.0])).await.unwrap();
    editor.send_update(4, 1, &ParameterValue::Float(0.5)).await.unwrap();

    timeout(WAIT, async {
        while running.relay.with_state(|s| s.cache_len()) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut late = connect_client(&running, 3, 1).await;
    late.registry_mut().register_fn(4, 1, ParameterType::Float, |_| {});
    late.request_resend().await.unwrap();

    let mut replayed = Vec::new();
    for _ in 0..2 {
        match next_event(&mut late).await {
            SyncEvent::Parameter { message, .. } => replayed.push(message),
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(replayed[0].cache_key(), (4, 0));
    assert_eq!(replayed[0].value().unwrap(), ParameterValue::Vector3([0.0, 2.0, 0.0]));
    assert_eq!(replayed[1].cache_key(), (4, 1));
}

#[tokio::test]
async fn test_updates_fan_out_and_skip_sender() {
    let running = start_relay(Duration::from_secs(30)).await;
    let mut a = connect_client(&running, 1, 0).await;
    let mut b = connect_client(&running, 2, 1).await;

    a.send_update(9, 2, &ParameterValue::Color([1.0, 0.0, 0.0, 1.0])).await.unwrap();

    match next_event(&mut b).await {
        SyncEvent::Parameter { message, applied } => {
            assert_eq!(message.kind, MessageKind::ParameterUpdate);
            assert_eq!(message.client_id, 1);
            assert!(!applied);
        }
        other => panic!("unexpected event {:?}", other),
    }
    b.reset(9).await.unwrap();

    // a never sees its own update, only b's reset
    assert_eq!(next_event(&mut a).await, SyncEvent::Reset(9));
    assert_eq!(a.get_stats().echoes_dropped, 1);
}

#[tokio::test]
async fn test_record_controls_over_tcp() {
    let running = start_relay(Duration::from_secs(30)).await;
    let record_dir = running.config.record_dir.clone();
    let mut client = connect_client(&running, 1, 0).await;

    client.send_control(RelayControl::RecordStart).await.unwrap();
    for i in 0..5 {
        client.send_update(1, 0, &ParameterValue::Int(i)).await.unwrap();
    }
    client.send_control(RelayControl::RecordStop).await.unwrap();

    let files = timeout(WAIT, async {
        loop {
            let files: Vec<_> = std::fs::read_dir(&record_dir).unwrap().map(|e| e.unwrap().path()).collect();
            let complete = files.len() == 1
                && std::fs::read_to_string(&files[0]).map(|c| c.lines().count() == 5).unwrap_or(false);
            if complete {
                return files;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("sync_") && name.ends_with("_1.txt"));

    let contents = std::fs::read_to_string(&files[0]).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "1|0|0|1|0|1|00000000");
    assert!(!running.relay.recorder().is_recording());
}

#[tokio::test]
async fn test_garbage_frames_do_not_stop_relay() {
    let running = start_relay(Duration::from_secs(30)).await;
    let mut observer = connect_client(&running, 2, 0).await;

    let mut raw = FramedTransport::connect(running.config.ingest_addr().unwrap()).await.unwrap();
    raw.send(&[0xde, 0xad]).await.unwrap();
    raw.send(&[1, 0, 99, 0, 0, 0, 0, 0]).await.unwrap();
    raw.send_message(&Message::lock(5, 0, 3, true)).await.unwrap();

    assert_eq!(next_event(&mut observer).await, SyncEvent::Lock { object_id: 3, locked: true });
}
