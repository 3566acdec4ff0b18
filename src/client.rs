use crate::codec;
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::parameter::{ParameterRegistry, ParameterValue};
use crate::protocol::{ClientId, Message, MessageKind, ObjectId, ParameterId, RelayControl, SceneCommand};
use crate::scene::SceneSnapshot;
use crate::transport::{FramedTransport, Transport};
use bytes::Bytes;
use std::time::Instant;
use tokio::net::TcpStream;

/// Pulls a scene from a distribution responder.
pub struct SceneRequester<T: Transport> {
    transport: T,
}

impl SceneRequester<FramedTransport<TcpStream>> {
    pub async fn connect(config: &LinkConfig) -> Result<Self> {
        let transport = FramedTransport::connect(config.responder_addr()?).await?;
        Ok(Self::new(transport))
    }
}

impl<T: Transport> SceneRequester<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn request(&mut self, command: SceneCommand) -> Result<Bytes> {
        self.transport.send(command.as_str().as_bytes()).await?;
        self.transport.receive().await?.ok_or(LinkError::ConnectionClosed)
    }

    /// Issues all five queries and reassembles the snapshot.
    ///
    /// Geometry instance ids and texture paths are not transmitted and come back empty.
    pub async fn fetch_scene(&mut self) -> Result<SceneSnapshot> {
        let header = self.request(SceneCommand::Header).await?;
        // an empty header reply means the responder could not answer
        let header = if header.is_empty() {
            tracing::warn!("Responder sent an empty header, using defaults");
            Default::default()
        } else {
            codec::unpack_header(&header)?
        };

        let nodes = codec::unpack_nodes(&self.request(SceneCommand::Nodes).await?)?;
        let geometry = codec::unpack_geometry(&self.request(SceneCommand::Objects).await?)?;
        let textures = codec::unpack_textures(&self.request(SceneCommand::Textures).await?)?;
        let materials = codec::unpack_materials(&self.request(SceneCommand::Materials).await?)?;

        let snapshot = SceneSnapshot {
            header,
            nodes,
            geometry,
            textures,
            materials,
        };
        snapshot.validate()?;

        tracing::info!(
            nodes = snapshot.nodes.len(),
            geometry = snapshot.geometry.len(),
            textures = snapshot.textures.len(),
            materials = snapshot.materials.len(),
            "Scene received"
        );
        Ok(snapshot)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Parameter update or undo/redo entry; `applied` when a registered handler took it.
    Parameter { message: Message, applied: bool },
    Lock { object_id: ObjectId, locked: bool },
    Reset(ObjectId),
    Sync(u8),
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub sent: u64,
    pub received: u64,
    pub echoes_dropped: u64,
    pub handler_errors: u64,
    pub last_sync: Option<Instant>,
}

/// One participant on the relay: pushes edits to the ingest side, reads the publish side.
pub struct SyncClient<P: Transport, S: Transport> {
    client_id: ClientId,
    tick: u8,
    push: P,
    subscription: S,
    registry: ParameterRegistry,
    stats: SyncStats,
}

impl SyncClient<FramedTransport<TcpStream>, FramedTransport<TcpStream>> {
    pub async fn connect(config: &LinkConfig, client_id: ClientId) -> Result<Self> {
        let subscription = FramedTransport::connect(config.publish_addr()?).await?;
        let push = FramedTransport::connect(config.ingest_addr()?).await?;
        Ok(Self::new(client_id, push, subscription))
    }
}

impl<P: Transport, S: Transport> SyncClient<P, S> {
    pub fn new(client_id: ClientId, push: P, subscription: S) -> Self {
        Self {
            client_id,
            tick: 0,
            push,
            subscription,
            registry: ParameterRegistry::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn tick(&self) -> u8 {
        self.tick
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ParameterRegistry {
        &mut self.registry
    }

    pub fn get_stats(&self) -> &SyncStats {
        &self.stats
    }

    async fn push_message(&mut self, message: &Message) -> Result<()> {
        self.push.send_message(message).await?;
        self.stats.sent += 1;
        Ok(())
    }

    pub async fn send_update(&mut self, object_id: ObjectId, parameter_id: ParameterId, value: &ParameterValue) -> Result<()> {
        let message = Message::parameter_update(self.client_id, self.tick, object_id, parameter_id, value)?;
        self.push_message(&message).await
    }

    pub async fn send_undo_redo(&mut self, object_id: ObjectId, parameter_id: ParameterId, value: &ParameterValue) -> Result<()> {
        let mut message = Message::parameter_update(self.client_id, self.tick, object_id, parameter_id, value)?;
        message.kind = MessageKind::UndoRedoAdd;
        self.push_message(&message).await
    }

    pub async fn lock(&mut self, object_id: ObjectId) -> Result<()> {
        let message = Message::lock(self.client_id, self.tick, object_id, true);
        self.push_message(&message).await
    }

    pub async fn unlock(&mut self, object_id: ObjectId) -> Result<()> {
        let message = Message::lock(self.client_id, self.tick, object_id, false);
        self.push_message(&message).await
    }

    pub async fn reset(&mut self, object_id: ObjectId) -> Result<()> {
        let message = Message::reset_object(self.client_id, self.tick, object_id);
        self.push_message(&message).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        let message = Message::ping(self.client_id, self.tick);
        self.push_message(&message).await
    }

    pub async fn request_resend(&mut self) -> Result<()> {
        let message = Message::resend_request(self.client_id, self.tick);
        self.push_message(&message).await
    }

    pub async fn send_control(&mut self, control: RelayControl) -> Result<()> {
        self.push.send(control.as_str().as_bytes()).await?;
        self.stats.sent += 1;
        Ok(())
    }

    /// Next relayed event, `None` once the relay closed the subscription.
    ///
    /// Echoes of this client's own messages are skipped. Parameter updates are applied
    /// to the registry before being returned.
    pub async fn receive(&mut self) -> Result<Option<SyncEvent>> {
        loop {
            let Some(message) = self.subscription.receive_message().await? else {
                return Ok(None);
            };
            self.stats.received += 1;

            if message.client_id == self.client_id {
                self.stats.echoes_dropped += 1;
                continue;
            }

            match message.kind {
                MessageKind::ParameterUpdate | MessageKind::UndoRedoAdd => {
                    let applied = match self.registry.dispatch(&message) {
                        Ok(applied) => applied,
                        Err(e) => {
                            self.stats.handler_errors += 1;
                            tracing::warn!(
                                object = message.object_id,
                                parameter = message.parameter_id,
                                error = %e,
                                "Failed to apply parameter update"
                            );
                            false
                        }
                    };
                    return Ok(Some(SyncEvent::Parameter { message, applied }));
                }
                MessageKind::Lock => {
                    return Ok(Some(SyncEvent::Lock {
                        object_id: message.object_id,
                        locked: message.lock_state().unwrap_or(false),
                    }));
                }
                MessageKind::ResetObject => return Ok(Some(SyncEvent::Reset(message.object_id))),
                MessageKind::Sync => {
                    self.tick = message.tick;
                    self.stats.last_sync = Some(Instant::now());
                    return Ok(Some(SyncEvent::Sync(message.tick)));
                }
                MessageKind::Ping | MessageKind::ResendRequest => continue,
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.push.close().await?;
        self.subscription.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParameterType;
    use crate::responder::SceneResponder;
    use crate::scene::{CameraNode, Node, NodeKind, SceneBuilder};
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    type Pipe = FramedTransport<DuplexStream>;

    fn client_with_peers(client_id: ClientId) -> (SyncClient<Pipe, Pipe>, Pipe, Pipe) {
        let (push, relay_ingest) = FramedTransport::pair(4096);
        let (relay_publish, subscription) = FramedTransport::pair(4096);
        (SyncClient::new(client_id, push, subscription), relay_ingest, relay_publish)
    }

    #[tokio::test]
    async fn test_fetch_scene() {
        let mut builder = SceneBuilder::new();
        builder.push_node(Node::group("root").with_children(1));
        builder.push_node(Node::new("cam", NodeKind::Camera(CameraNode::default())));
        let snapshot = builder.finish().unwrap();
        let responder = SceneResponder::new(snapshot.clone());

        let (client_side, mut server_side) = FramedTransport::pair(4096);
        let serving = tokio::spawn(async move { responder.serve(&mut server_side).await });

        let mut requester = SceneRequester::new(client_side);
        let fetched = requester.fetch_scene().await.unwrap();
        assert_eq!(fetched, snapshot);

        requester.close().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_outbound_messages() {
        let (mut client, mut ingest, _publish) = client_with_peers(4);

        client.lock(7).await.unwrap();
        client.send_update(7, 1, &ParameterValue::Vector3([1.0, 2.0, 3.0])).await.unwrap();
        client.send_control(RelayControl::RecordStart).await.unwrap();

        let lock = ingest.receive_message().await.unwrap().unwrap();
        assert_eq!(lock.lock_state(), Some(true));
        assert_eq!(lock.client_id, 4);

        let update = ingest.receive_message().await.unwrap().unwrap();
        assert_eq!(update.parameter_type, ParameterType::Vector3);

        assert_eq!(ingest.receive().await.unwrap().unwrap(), Bytes::from_static(b"recordstart"));
        assert_eq!(client.get_stats().sent, 3);
    }

    #[tokio::test]
    async fn test_receive_dispatches_and_skips_echoes() {
        let (mut client, _ingest, mut publish) = client_with_peers(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client
            .registry_mut()
            .register_fn(7, 1, ParameterType::Float, move |value| sink.lock().unwrap().push(value));

        publish
            .send_message(&Message::parameter_update(4, 0, 7, 1, &ParameterValue::Float(9.0)).unwrap())
            .await
            .unwrap();
        publish
            .send_message(&Message::parameter_update(2, 0, 7, 1, &ParameterValue::Float(1.0)).unwrap())
            .await
            .unwrap();
        publish.send_message(&Message::sync(255, 42)).await.unwrap();
        publish.send_message(&Message::lock(255, 0, 7, false)).await.unwrap();

        let event = client.receive().await.unwrap().unwrap();
        assert!(matches!(event, SyncEvent::Parameter { applied: true, .. }));
        assert_eq!(client.receive().await.unwrap(), Some(SyncEvent::Sync(42)));
        assert_eq!(client.tick(), 42);
        assert_eq!(
            client.receive().await.unwrap(),
            Some(SyncEvent::Lock { object_id: 7, locked: false })
        );

        assert_eq!(seen.lock().unwrap().as_slice(), &[ParameterValue::Float(1.0)]);
        assert_eq!(client.get_stats().echoes_dropped, 1);

        publish.close().await.unwrap();
        assert_eq!(client.receive().await.unwrap(), None);
    }
}
