use crate::error::{LinkError, Result};
use crate::scene::SceneSnapshot;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::Path;

/// Upper bound on one length-prefixed frame.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    MessagePack,
    Bincode,
}

impl SnapshotFormat {
    /// `.json`, `.msgpack`/`.mp`, `.bin`/`.bincode`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(SnapshotFormat::Json),
            "msgpack" | "mp" => Some(SnapshotFormat::MessagePack),
            "bin" | "bincode" => Some(SnapshotFormat::Bincode),
            _ => None,
        }
    }
}

/// Reads and writes scene snapshot files handed over by an external scene producer.
pub struct SnapshotSerializer {
    format: SnapshotFormat,
}

impl SnapshotSerializer {
    pub fn new(format: SnapshotFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(SnapshotFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(SnapshotFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(SnapshotFormat::Bincode)
    }

    pub fn for_path(path: &Path) -> Result<Self> {
        SnapshotFormat::from_path(path).map(Self::new).ok_or_else(|| {
            LinkError::Config(format!("Cannot infer snapshot format from '{}'", path.display()))
        })
    }

    pub fn serialize_snapshot(&self, snapshot: &SceneSnapshot) -> Result<Bytes> {
        let data = match self.format {
            SnapshotFormat::Json => serde_json::to_vec(snapshot)?,
            SnapshotFormat::MessagePack => rmp_serde::to_vec(snapshot)?,
            SnapshotFormat::Bincode => bincode::serialize(snapshot)?,
        };
        Ok(Bytes::from(data))
    }

    pub fn deserialize_snapshot(&self, data: &[u8]) -> Result<SceneSnapshot> {
        let snapshot = match self.format {
            SnapshotFormat::Json => serde_json::from_slice(data)?,
            SnapshotFormat::MessagePack => rmp_serde::from_slice(data)?,
            SnapshotFormat::Bincode => bincode::deserialize(data)?,
        };
        Ok(snapshot)
    }

    pub fn get_format(&self) -> SnapshotFormat {
        self.format
    }
}

/// Loads a snapshot file, picking the format from its extension, and validates it.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<SceneSnapshot> {
    let path = path.as_ref();
    let serializer = SnapshotSerializer::for_path(path)?;
    let snapshot = serializer.deserialize_snapshot(&std::fs::read(path)?)?;
    snapshot.validate()?;

    tracing::debug!(
        path = %path.display(),
        nodes = snapshot.nodes.len(),
        geometry = snapshot.geometry.len(),
        "Loaded scene snapshot"
    );
    Ok(snapshot)
}

pub fn save_snapshot(path: impl AsRef<Path>, snapshot: &SceneSnapshot) -> Result<()> {
    let path = path.as_ref();
    let data = SnapshotSerializer::for_path(path)?.serialize_snapshot(snapshot)?;
    std::fs::write(path, &data)?;
    Ok(())
}

/// Accumulates `u32` LE length-prefixed frames.
pub struct FrameEncoder {
    buffer: BytesMut,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(LinkError::Transport(format!(
                "Frame of {} bytes exceeds limit of {}",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }

        self.buffer.reserve(LENGTH_PREFIX + frame.len());
        self.buffer.put_u32_le(frame.len() as u32);
        self.buffer.put_slice(frame);
        Ok(())
    }

    pub fn flush(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a byte stream back into frames; partial frames stay buffered until complete.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn try_read_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(LinkError::Transport(format!(
                "Incoming frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_SIZE
            )));
        }

        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
