use crate::error::{LinkError, Result};
use crate::protocol::Message;
use crate::serialization::{FrameDecoder, FrameEncoder};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 16 * 1024;

/// Frame-oriented byte channel used by every endpoint.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Next complete frame, `None` once the peer closed the stream cleanly.
    async fn receive(&mut self) -> Result<Option<Bytes>>;

    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.send(&message.encode()).await
    }

    async fn receive_message(&mut self) -> Result<Option<Message>> {
        match self.receive().await? {
            Some(frame) => Ok(Some(Message::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Length-prefixed frames over any async byte stream.
pub struct FramedTransport<S> {
    stream: Option<S>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    peer: Option<SocketAddr>,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; READ_CHUNK],
            peer: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl FramedTransport<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LinkError::Transport(format!("Connect to {} failed: {}", addr, e)))?;
        Self::from_tcp(stream)
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        let mut transport = Self::new(stream);
        transport.peer = peer;
        Ok(transport)
    }
}

impl FramedTransport<DuplexStream> {
    /// Two in-memory endpoints wired to each other.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (Self::new(a), Self::new(b))
    }
}

#[async_trait]
impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.encoder.write_frame(frame)?;
        let data = self.encoder.flush();

        let stream = self.stream.as_mut().ok_or(LinkError::ConnectionClosed)?;
        stream.write_all(&data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.decoder.try_read_frame()? {
                return Ok(Some(frame));
            }

            let stream = self.stream.as_mut().ok_or(LinkError::ConnectionClosed)?;
            let n = stream.read(&mut self.read_buf).await?;

            if n == 0 {
                self.stream = None;
                if self.decoder.buffered() > 0 {
                    return Err(LinkError::Transport(format!(
                        "Stream closed with {} bytes of an incomplete frame",
                        self.decoder.buffered()
                    )));
                }
                return Ok(None);
            }

            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.decoder.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
