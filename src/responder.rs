//! Request/reply endpoint serving one immutable scene snapshot.

use crate::codec;
use crate::debug;
use crate::error::Result;
use crate::protocol::SceneCommand;
use crate::scene::SceneSnapshot;
use crate::transport::{FramedTransport, Transport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};

/// Answers scene queries from a fixed snapshot.
pub struct SceneResponder {
    snapshot: Arc<SceneSnapshot>,
}

impl SceneResponder {
    pub fn new(snapshot: SceneSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> &SceneSnapshot {
        &self.snapshot
    }

    pub fn encode(&self, command: SceneCommand) -> Result<Bytes> {
        let started = Instant::now();
        let reply = match command {
            SceneCommand::Header => codec::pack_header(&self.snapshot.header),
            SceneCommand::Nodes => codec::pack_nodes(&self.snapshot.nodes),
            SceneCommand::Objects => codec::pack_geometry(&self.snapshot.geometry)?,
            SceneCommand::Textures => codec::pack_textures(&self.snapshot.textures)?,
            SceneCommand::Materials => codec::pack_materials(&self.snapshot.materials)?,
        };
        debug::trace_codec(command, reply.len(), started.elapsed().as_micros());
        Ok(reply)
    }

    /// Reply for one raw request. Anything that cannot be answered gets an empty reply.
    pub fn handle_request(&self, request: &[u8]) -> Bytes {
        let Ok(text) = std::str::from_utf8(request) else {
            tracing::warn!(len = request.len(), "Non-UTF-8 scene request");
            return Bytes::new();
        };

        let Some(command) = SceneCommand::parse(text) else {
            tracing::warn!(command = text, "Unknown scene request");
            return Bytes::new();
        };

        match self.encode(command) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(command = command.as_str(), error = %e, "Failed to encode scene reply");
                Bytes::new()
            }
        }
    }

    /// Serves requests on one connection until the peer closes it.
    pub async fn serve<T: Transport>(&self, transport: &mut T) -> Result<()> {
        while let Some(request) = transport.receive().await? {
            let reply = self.handle_request(&request);
            transport.send(&reply).await?;
        }
        Ok(())
    }
}

/// TCP front end for a [`SceneResponder`].
pub struct ResponderServer {
    responder: Arc<SceneResponder>,
    next_session_id: AtomicU64,
}

impl ResponderServer {
    pub fn new(responder: SceneResponder) -> Self {
        Self {
            responder: Arc::new(responder),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn responder(&self) -> &Arc<SceneResponder> {
        &self.responder
    }

    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let stats = self.responder.snapshot().stats();
        tracing::info!(
            addr = %listener.local_addr()?,
            nodes = self.responder.snapshot().nodes.len(),
            geo = stats.geo_nodes,
            lights = stats.lights,
            cameras = stats.cameras,
            "Scene responder listening"
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "New scene request connection");

        let mut transport = match FramedTransport::from_tcp(socket) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        };

        let responder = Arc::clone(&self.responder);
        tokio::spawn(async move {
            if let Err(e) = responder.serve(&mut transport).await {
                tracing::debug!(session_id, error = %e, "Scene connection error");
            }
            tracing::debug!(session_id, "Scene connection closed");
        });
    }
}
