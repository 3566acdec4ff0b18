//! Subscribe-then-republish broker for scene edits.
//!
//! Clients push frames to the ingest endpoint. Every frame is funnelled into one
//! processing loop, so the publish endpoint sees all re-broadcasts in a single total order.

use crate::config::LinkConfig;
use crate::debug;
use crate::error::Result;
use crate::liveness::LivenessMonitor;
use crate::protocol::{ClientId, Message, MessageKind, ObjectId, ParameterId, RelayControl, LOCK_PARAMETER_ID};
use crate::record::RecordWriter;
use crate::transport::{FramedTransport, Transport};
use ahash::AHashMap;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const INGEST_QUEUE: usize = 1024;

/// Result of feeding one message through [`RelayState::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// Echo of the relay's own traffic.
    Dropped,
    /// Heartbeat; only the client registry changed.
    Registered,
    Relayed(Message),
    /// Cache contents for a resend request, ordered by key.
    Replayed(Vec<Message>),
}

/// Lock table, client registry and state cache.
pub struct RelayState {
    relay_id: ClientId,
    tick: u8,
    locks: AHashMap<ObjectId, ClientId>,
    clients: AHashMap<ClientId, Instant>,
    cache: AHashMap<(ObjectId, ParameterId), Message>,
}

impl RelayState {
    pub fn new(relay_id: ClientId) -> Self {
        Self {
            relay_id,
            tick: 0,
            locks: AHashMap::new(),
            clients: AHashMap::new(),
            cache: AHashMap::new(),
        }
    }

    pub fn relay_id(&self) -> ClientId {
        self.relay_id
    }

    pub fn tick(&self) -> u8 {
        self.tick
    }

    pub fn advance_tick(&mut self) -> u8 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    pub fn touch(&mut self, client_id: ClientId, now: Instant) {
        if self.clients.insert(client_id, now).is_none() {
            tracing::info!(client = client_id, "Client registered");
        }
    }

    pub fn last_seen(&self, client_id: ClientId) -> Option<Instant> {
        self.clients.get(&client_id).copied()
    }

    pub fn clients(&self) -> impl Iterator<Item = (ClientId, Instant)> + '_ {
        self.clients.iter().map(|(id, seen)| (*id, *seen))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn remove_client(&mut self, client_id: ClientId) -> bool {
        self.clients.remove(&client_id).is_some()
    }

    pub fn lock_holder(&self, object_id: ObjectId) -> Option<ClientId> {
        self.locks.get(&object_id).copied()
    }

    pub fn locks_held_by(&self, client_id: ClientId) -> Vec<ObjectId> {
        let mut objects: Vec<_> = self
            .locks
            .iter()
            .filter(|(_, holder)| **holder == client_id)
            .map(|(object, _)| *object)
            .collect();
        objects.sort_unstable();
        objects
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn cached(&self, object_id: ObjectId, parameter_id: ParameterId) -> Option<&Message> {
        self.cache.get(&(object_id, parameter_id))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Every cached message, ordered by (object, parameter).
    pub fn replay(&self) -> Vec<Message> {
        let mut entries: Vec<_> = self.cache.iter().collect();
        entries.sort_unstable_by_key(|(key, _)| **key);
        entries.into_iter().map(|(_, message)| message.clone()).collect()
    }

    fn store(&mut self, message: &Message) {
        self.cache.insert(message.cache_key(), message.clone());
    }

    pub fn process(&mut self, message: Message, now: Instant) -> RelayOutcome {
        if message.client_id == self.relay_id {
            return RelayOutcome::Dropped;
        }

        self.touch(message.client_id, now);

        match message.kind {
            MessageKind::Ping => RelayOutcome::Registered,
            MessageKind::ResendRequest => {
                let replay = self.replay();
                tracing::debug!(client = message.client_id, entries = replay.len(), "Replaying state cache");
                RelayOutcome::Replayed(replay)
            }
            MessageKind::Lock => RelayOutcome::Relayed(self.apply_lock(message)),
            // ticks are transient; a cached sync would shadow parameter (0, 0)
            MessageKind::Sync => RelayOutcome::Relayed(message),
            MessageKind::ResetObject => {
                let object_id = message.object_id;
                self.cache
                    .retain(|(object, parameter), _| *object != object_id || *parameter == LOCK_PARAMETER_ID);
                self.store(&message);
                RelayOutcome::Relayed(message)
            }
            MessageKind::ParameterUpdate | MessageKind::UndoRedoAdd => {
                self.store(&message);
                RelayOutcome::Relayed(message)
            }
        }
    }

    /// Updates the lock table and returns the re-stamped message to broadcast.
    ///
    /// Non-holders cannot change the holder; their messages are still relayed but not cached.
    fn apply_lock(&mut self, message: Message) -> Message {
        let sender = message.client_id;
        let object_id = message.object_id;
        let locked = message.lock_state().unwrap_or(false);
        let holder = self.lock_holder(object_id);

        let changed = match (locked, holder) {
            (true, None) => {
                self.locks.insert(object_id, sender);
                tracing::debug!(client = sender, object = object_id, "Object locked");
                true
            }
            (true, Some(current)) if current == sender => true,
            (false, Some(current)) if current == sender => {
                self.locks.remove(&object_id);
                tracing::debug!(client = sender, object = object_id, "Object unlocked");
                true
            }
            (_, Some(current)) => {
                tracing::warn!(
                    client = sender,
                    holder = current,
                    object = object_id,
                    locked,
                    "Lock message from non-holder"
                );
                false
            }
            (false, None) => false,
        };

        let relayed = message.with_sender(self.relay_id);
        if changed {
            self.store(&relayed);
        }
        relayed
    }

    /// Drops the lock on `object_id` and returns the release to broadcast.
    pub fn release_lock(&mut self, object_id: ObjectId) -> Option<Message> {
        let holder = self.locks.remove(&object_id)?;
        let release = Message::lock(self.relay_id, self.tick, object_id, false);
        self.store(&release);
        tracing::info!(client = holder, object = object_id, "Released lock of stale client");
        Some(release)
    }
}

/// Relay service: shared state, publish fan-out and the record writer.
pub struct Relay {
    config: LinkConfig,
    state: Mutex<RelayState>,
    publish: broadcast::Sender<Bytes>,
    recorder: Arc<RecordWriter>,
    liveness: LivenessMonitor,
}

impl Relay {
    pub fn new(config: LinkConfig) -> Self {
        let (publish, _) = broadcast::channel(config.publish_capacity.max(1));
        Self {
            state: Mutex::new(RelayState::new(config.relay_id)),
            publish,
            recorder: Arc::new(RecordWriter::new(config.record_dir.clone(), config.record_size)),
            liveness: LivenessMonitor::from_config(&config),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<RecordWriter> {
        &self.recorder
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.publish.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.publish.receiver_count()
    }

    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        // state is plain tables; a panic mid-update leaves nothing half-borrowed
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut RelayState) -> R) -> R {
        f(&mut self.lock_state())
    }

    // Called with the state lock held so publish order matches processing order.
    fn publish(&self, message: &Message) {
        debug::log_message("out", message);
        if self.publish.send(message.encode()).is_err() {
            tracing::trace!("No subscribers for relayed message");
        }
    }

    pub fn handle_frame(&self, frame: &[u8]) -> usize {
        self.handle_frame_at(frame, Instant::now())
    }

    /// Processes one inbound frame and returns the number of messages broadcast.
    pub fn handle_frame_at(&self, frame: &[u8], now: Instant) -> usize {
        if let Some(control) = RelayControl::parse(frame) {
            self.handle_control(control);
            return 0;
        }

        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(len = frame.len(), error = %e, "Dropping undecodable frame");
                return 0;
            }
        };
        debug::log_message("in", &message);

        let mut state = self.lock_state();
        match state.process(message, now) {
            RelayOutcome::Dropped | RelayOutcome::Registered => 0,
            RelayOutcome::Relayed(message) => {
                self.publish(&message);
                self.recorder.append(&message);
                1
            }
            RelayOutcome::Replayed(messages) => {
                for message in &messages {
                    self.publish(message);
                }
                messages.len()
            }
        }
    }

    pub fn handle_control(&self, control: RelayControl) {
        tracing::info!(control = control.as_str(), "Relay control");
        match control {
            RelayControl::RecordStart => self.recorder.start(),
            RelayControl::RecordStop => {
                self.recorder.stop();
            }
        }
    }

    /// Runs one liveness sweep and broadcasts the resulting lock releases.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut state = self.lock_state();
        let releases = self.liveness.sweep(&mut state, now);
        for release in &releases {
            self.publish(release);
            self.recorder.append(release);
        }
        releases.len()
    }

    pub fn broadcast_sync(&self) -> u8 {
        let mut state = self.lock_state();
        let tick = state.advance_tick();
        self.publish(&Message::sync(state.relay_id(), tick));
        tick
    }

    async fn process_frame(self: &Arc<Self>, frame: Bytes) {
        match RelayControl::parse(&frame) {
            // stopping flushes to disk
            Some(control) => {
                let relay = Arc::clone(self);
                if let Err(e) = tokio::task::spawn_blocking(move || relay.handle_control(control)).await {
                    tracing::error!(error = %e, "Relay control task failed");
                }
            }
            None => {
                self.handle_frame(&frame);
            }
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let ingest = TcpListener::bind(self.config.ingest_addr()?).await?;
        let publish = TcpListener::bind(self.config.publish_addr()?).await?;
        self.serve(ingest, publish).await
    }

    pub async fn run_until<F>(self: Arc<Self>, ingest: TcpListener, publish: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(ingest, publish) => result,
        }
    }

    /// Runs the relay on already-bound listeners until the ingest side shuts down.
    pub async fn serve(self: Arc<Self>, ingest: TcpListener, publish: TcpListener) -> Result<()> {
        self.config.validate()?;

        tracing::info!(
            ingest = %ingest.local_addr()?,
            publish = %publish.local_addr()?,
            relay_id = self.config.relay_id,
            "Sync relay listening"
        );

        let (tx, mut rx) = mpsc::channel::<Bytes>(INGEST_QUEUE);

        let mut tasks = TaskSet::default();
        tasks.push(self.liveness.spawn(Arc::clone(&self)));
        tasks.push(self.recorder.spawn_writer_task());
        if let Some(interval) = self.config.sync_interval {
            tasks.push(spawn_sync_task(Arc::clone(&self), interval));
        }
        tasks.push(tokio::spawn(accept_ingest(ingest, tx)));
        tasks.push(tokio::spawn(accept_publish(publish, Arc::clone(&self))));

        while let Some(frame) = rx.recv().await {
            self.process_frame(frame).await;
        }

        Ok(())
    }
}

#[derive(Default)]
struct TaskSet(Vec<JoinHandle<()>>);

impl TaskSet {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.0.push(handle);
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn spawn_sync_task(relay: Arc<Relay>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            relay.broadcast_sync();
        }
    })
}

async fn accept_ingest(listener: TcpListener, tx: mpsc::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => spawn_ingest_connection(socket, peer_addr, tx.clone()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept ingest connection");
            }
        }
    }
}

fn spawn_ingest_connection(socket: TcpStream, peer_addr: SocketAddr, tx: mpsc::Sender<Bytes>) {
    tokio::spawn(async move {
        let mut transport = match FramedTransport::from_tcp(socket) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "Failed to configure socket");
                return;
            }
        };
        tracing::debug!(peer = %peer_addr, "Ingest connection opened");

        let source = peer_addr.to_string();
        loop {
            match transport.receive().await {
                Ok(Some(frame)) => {
                    debug::trace_transport_receive(frame.len(), &source);
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %peer_addr, error = %e, "Ingest connection error");
                    break;
                }
            }
        }
        tracing::debug!(peer = %peer_addr, "Ingest connection closed");
    });
}

async fn accept_publish(listener: TcpListener, relay: Arc<Relay>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let subscription = relay.subscribe();
                spawn_publish_connection(socket, peer_addr, subscription);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept publish connection");
            }
        }
    }
}

fn spawn_publish_connection(socket: TcpStream, peer_addr: SocketAddr, mut subscription: broadcast::Receiver<Bytes>) {
    tokio::spawn(async move {
        let mut transport = match FramedTransport::from_tcp(socket) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "Failed to configure socket");
                return;
            }
        };
        tracing::debug!(peer = %peer_addr, "Subscriber connected");

        let destination = peer_addr.to_string();
        loop {
            match subscription.recv().await {
                Ok(frame) => {
                    if let Err(e) = transport.send(&frame).await {
                        tracing::debug!(peer = %peer_addr, error = %e, "Subscriber send failed");
                        break;
                    }
                    debug::trace_transport_send(frame.len(), &destination);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = %peer_addr, skipped, "Subscriber lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!(peer = %peer_addr, "Subscriber disconnected");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterValue;
    use crate::protocol::RESET_PARAMETER_ID;
    use std::time::Duration;

    const RELAY: ClientId = 255;

    fn update(client: ClientId, object: ObjectId, parameter: ParameterId, x: f32) -> Message {
        Message::parameter_update(client, 0, object, parameter, &ParameterValue::Float(x)).unwrap()
    }

    #[test]
    fn test_own_messages_dropped() {
        let mut state = RelayState::new(RELAY);
        let outcome = state.process(update(RELAY, 1, 0, 1.0), Instant::now());

        assert_eq!(outcome, RelayOutcome::Dropped);
        assert_eq!(state.client_count(), 0);
        assert_eq!(state.cache_len(), 0);
    }

    #[test]
    fn test_ping_only_registers() {
        let mut state = RelayState::new(RELAY);
        let now = Instant::now();

        assert_eq!(state.process(Message::ping(4, 0), now), RelayOutcome::Registered);
        assert_eq!(state.last_seen(4), Some(now));
        assert_eq!(state.cache_len(), 0);
    }

    #[test]
    fn test_updates_cached_and_relayed_identically() {
        let mut state = RelayState::new(RELAY);
        let message = update(1, 3, 2, 0.5);

        assert_eq!(state.process(message.clone(), Instant::now()), RelayOutcome::Relayed(message.clone()));
        assert_eq!(state.cached(3, 2), Some(&message));
    }

    #[test]
    fn test_lock_single_holder() {
        let mut state = RelayState::new(RELAY);
        let now = Instant::now();

        let RelayOutcome::Relayed(relayed) = state.process(Message::lock(1, 0, 7, true), now) else {
            panic!("lock not relayed");
        };
        assert_eq!(relayed.client_id, RELAY);
        assert_eq!(state.lock_holder(7), Some(1));

        // advisory: relayed, holder unchanged
        assert!(matches!(state.process(Message::lock(2, 0, 7, true), now), RelayOutcome::Relayed(_)));
        assert_eq!(state.lock_holder(7), Some(1));
        assert!(matches!(state.process(Message::lock(2, 0, 7, false), now), RelayOutcome::Relayed(_)));
        assert_eq!(state.lock_holder(7), Some(1));
        assert_eq!(state.cached(7, LOCK_PARAMETER_ID).and_then(Message::lock_state), Some(true));

        state.process(Message::lock(1, 0, 7, false), now);
        assert_eq!(state.lock_holder(7), None);
        assert_eq!(state.cached(7, LOCK_PARAMETER_ID).and_then(Message::lock_state), Some(false));
    }

    #[test]
    fn test_resend_replays_latest_per_key() {
        let mut state = RelayState::new(RELAY);
        let now = Instant::now();

        state.process(update(1, 5, 1, 1.0), now);
        state.process(update(2, 5, 1, 2.0), now);
        state.process(update(1, 2, 0, 3.0), now);
        state.process(Message::lock(1, 0, 5, true), now);
        state.process(Message::ping(3, 0), now);

        let RelayOutcome::Replayed(replay) = state.process(Message::resend_request(3, 0), now) else {
            panic!("resend not replayed");
        };

        let keys: Vec<_> = replay.iter().map(Message::cache_key).collect();
        assert_eq!(keys, vec![(2, 0), (5, LOCK_PARAMETER_ID), (5, 1)]);
        assert_eq!(replay[2].value().unwrap(), ParameterValue::Float(2.0));
    }

    #[test]
    fn test_reset_clears_object_cache() {
        let mut state = RelayState::new(RELAY);
        let now = Instant::now();

        state.process(update(1, 5, 0, 1.0), now);
        state.process(update(1, 5, 1, 1.0), now);
        state.process(update(1, 6, 0, 1.0), now);
        state.process(Message::lock(1, 0, 5, true), now);
        state.process(Message::reset_object(1, 0, 5), now);

        assert!(state.cached(5, 0).is_none());
        assert!(state.cached(5, 1).is_none());
        assert!(state.cached(5, LOCK_PARAMETER_ID).is_some());
        assert!(state.cached(5, RESET_PARAMETER_ID).is_some());
        assert!(state.cached(6, 0).is_some());
    }

    #[test]
    fn test_release_lock() {
        let mut state = RelayState::new(RELAY);
        state.process(Message::lock(1, 0, 9, true), Instant::now());

        let release = state.release_lock(9).unwrap();
        assert_eq!(release.client_id, RELAY);
        assert_eq!(release.lock_state(), Some(false));
        assert_eq!(state.lock_holder(9), None);
        assert!(state.release_lock(9).is_none());
    }

    #[tokio::test]
    async fn test_relay_broadcast_order() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(LinkConfig::new().with_record_dir(dir.path()));
        let mut rx = relay.subscribe();

        relay.handle_frame(&update(1, 1, 0, 1.0).encode());
        relay.handle_frame(&Message::lock(2, 0, 1, true).encode());
        relay.handle_frame(&Message::ping(3, 0).encode());
        relay.handle_frame(&[1, 2]);

        let first = Message::decode(&rx.recv().await.unwrap()).unwrap();
        let second = Message::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind, MessageKind::ParameterUpdate);
        assert_eq!(first.client_id, 1);
        assert_eq!(second.kind, MessageKind::Lock);
        assert_eq!(second.client_id, RELAY);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_records_between_controls() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(LinkConfig::new().with_record_dir(dir.path()));

        relay.handle_frame(&update(1, 1, 0, 1.0).encode());
        relay.handle_frame(b"recordstart");
        relay.handle_frame(&update(1, 1, 0, 2.0).encode());
        relay.handle_frame(&update(1, 1, 0, 3.0).encode());
        assert_eq!(relay.recorder().pending(), 2);

        relay.handle_frame(b"recordstop");
        assert_eq!(relay.recorder().pending(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_relay_sweep_broadcasts_release() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig::new()
            .with_record_dir(dir.path())
            .with_client_timeout(Duration::from_secs(3));
        let relay = Relay::new(config);
        let mut rx = relay.subscribe();

        let start = Instant::now();
        relay.handle_frame_at(&Message::lock(1, 0, 7, true).encode(), start);
        rx.recv().await.unwrap();

        assert_eq!(relay.sweep(start + Duration::from_secs(2)), 0);
        assert_eq!(relay.sweep(start + Duration::from_secs(4)), 1);
        assert_eq!(relay.sweep(start + Duration::from_secs(5)), 0);

        let release = Message::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(release.lock_state(), Some(false));
        assert_eq!(release.object_id, 7);
        assert_eq!(relay.with_state(|state| state.lock_holder(7)), None);
    }

    #[tokio::test]
    async fn test_serve_rejects_zero_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let configs = [
            LinkConfig::new()
                .with_record_dir(dir.path())
                .with_sweep_interval(Duration::ZERO),
            LinkConfig::new()
                .with_record_dir(dir.path())
                .with_sync_interval(Some(Duration::ZERO)),
        ];

        for config in configs {
            let ingest = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let publish = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let relay = Arc::new(Relay::new(config));

            let result = relay.serve(ingest, publish).await;
            assert!(matches!(result, Err(crate::error::LinkError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_sync_tick() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(LinkConfig::new().with_record_dir(dir.path()));
        let mut rx = relay.subscribe();

        assert_eq!(relay.broadcast_sync(), 1);
        let sync = Message::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sync.kind, MessageKind::Sync);
        assert_eq!(sync.tick, 1);
        assert_eq!(sync.client_id, RELAY);
    }
}
