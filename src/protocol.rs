use crate::error::DecodeError;
use crate::parameter::ParameterValue;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub type ClientId = u8;
pub type ObjectId = i16;
pub type ParameterId = i16;

/// Wire revision. Version 1 always places the payload at byte 8.
pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 8;
pub const SHORT_HEADER_SIZE: usize = 3;
pub const PAYLOAD_OFFSET: usize = HEADER_SIZE;

/// Parameter slot used by lock messages so they never collide with real parameters
/// in the state cache.
pub const LOCK_PARAMETER_ID: ParameterId = -1;

/// Parameter slot used by object resets.
pub const RESET_PARAMETER_ID: ParameterId = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    ParameterUpdate = 0,
    Lock = 1,
    Sync = 2,
    Ping = 3,
    ResendRequest = 4,
    UndoRedoAdd = 5,
    ResetObject = 6,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(MessageKind::ParameterUpdate),
            1 => Ok(MessageKind::Lock),
            2 => Ok(MessageKind::Sync),
            3 => Ok(MessageKind::Ping),
            4 => Ok(MessageKind::ResendRequest),
            5 => Ok(MessageKind::UndoRedoAdd),
            6 => Ok(MessageKind::ResetObject),
            other => Err(DecodeError::UnknownMessageKind(other)),
        }
    }

    /// Kinds sent as the bare `[client, tick, kind]` short form.
    pub fn is_short(self) -> bool {
        matches!(self, MessageKind::Sync | MessageKind::Ping | MessageKind::ResendRequest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParameterType {
    Bool = 0,
    Int = 1,
    Float = 2,
    Vector2 = 3,
    Vector3 = 4,
    Vector4 = 5,
    Quaternion = 6,
    Color = 7,
    String = 8,
    Unknown = 100,
}

impl ParameterType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ParameterType::Bool,
            1 => ParameterType::Int,
            2 => ParameterType::Float,
            3 => ParameterType::Vector2,
            4 => ParameterType::Vector3,
            5 => ParameterType::Vector4,
            6 => ParameterType::Quaternion,
            7 => ParameterType::Color,
            8 => ParameterType::String,
            _ => ParameterType::Unknown,
        }
    }

    /// Fixed payload size, `None` for length-prefixed or opaque payloads.
    pub fn payload_size(self) -> Option<usize> {
        match self {
            ParameterType::Bool => Some(1),
            ParameterType::Int | ParameterType::Float => Some(4),
            ParameterType::Vector2 => Some(8),
            ParameterType::Vector3 => Some(12),
            ParameterType::Vector4 | ParameterType::Quaternion | ParameterType::Color => Some(16),
            ParameterType::String | ParameterType::Unknown => None,
        }
    }
}

/// One unit on the synchronization channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub client_id: ClientId,
    pub tick: u8,
    pub kind: MessageKind,
    pub object_id: ObjectId,
    pub parameter_id: ParameterId,
    pub parameter_type: ParameterType,
    pub payload: Bytes,
}

impl Message {
    fn short(kind: MessageKind, client_id: ClientId, tick: u8) -> Self {
        Self {
            client_id,
            tick,
            kind,
            object_id: 0,
            parameter_id: 0,
            parameter_type: ParameterType::Unknown,
            payload: Bytes::new(),
        }
    }

    pub fn parameter_update(
        client_id: ClientId,
        tick: u8,
        object_id: ObjectId,
        parameter_id: ParameterId,
        value: &ParameterValue,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            client_id,
            tick,
            kind: MessageKind::ParameterUpdate,
            object_id,
            parameter_id,
            parameter_type: value.parameter_type(),
            payload: value.encode()?,
        })
    }

    pub fn lock(client_id: ClientId, tick: u8, object_id: ObjectId, locked: bool) -> Self {
        Self {
            client_id,
            tick,
            kind: MessageKind::Lock,
            object_id,
            parameter_id: LOCK_PARAMETER_ID,
            parameter_type: ParameterType::Bool,
            payload: Bytes::copy_from_slice(&[locked as u8]),
        }
    }

    pub fn reset_object(client_id: ClientId, tick: u8, object_id: ObjectId) -> Self {
        Self {
            client_id,
            tick,
            kind: MessageKind::ResetObject,
            object_id,
            parameter_id: RESET_PARAMETER_ID,
            parameter_type: ParameterType::Unknown,
            payload: Bytes::new(),
        }
    }

    pub fn ping(client_id: ClientId, tick: u8) -> Self {
        Self::short(MessageKind::Ping, client_id, tick)
    }

    pub fn sync(client_id: ClientId, tick: u8) -> Self {
        Self::short(MessageKind::Sync, client_id, tick)
    }

    pub fn resend_request(client_id: ClientId, tick: u8) -> Self {
        Self::short(MessageKind::ResendRequest, client_id, tick)
    }

    /// Same message, re-stamped as coming from `client_id`.
    pub fn with_sender(&self, client_id: ClientId) -> Self {
        Self {
            client_id,
            ..self.clone()
        }
    }

    pub fn lock_state(&self) -> Option<bool> {
        if self.kind != MessageKind::Lock {
            return None;
        }
        self.payload.first().map(|b| *b != 0)
    }

    pub fn cache_key(&self) -> (ObjectId, ParameterId) {
        (self.object_id, self.parameter_id)
    }

    pub fn value(&self) -> Result<ParameterValue, DecodeError> {
        ParameterValue::decode(self.parameter_type, &self.payload)
    }

    pub fn encoded_len(&self) -> usize {
        if self.kind.is_short() {
            SHORT_HEADER_SIZE
        } else {
            HEADER_SIZE + self.payload.len()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.client_id);
        buf.put_u8(self.tick);
        buf.put_u8(self.kind as u8);

        if !self.kind.is_short() {
            buf.put_i16_le(self.object_id);
            buf.put_i16_le(self.parameter_id);
            buf.put_u8(self.parameter_type as u8);
            buf.put_slice(&self.payload);
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < SHORT_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: SHORT_HEADER_SIZE,
                available: data.len(),
            });
        }

        let kind = MessageKind::from_u8(data[2])?;
        if kind.is_short() {
            return Ok(Self::short(kind, data[0], data[1]));
        }

        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }

        let object_id = i16::from_le_bytes([data[3], data[4]]);
        let parameter_id = i16::from_le_bytes([data[5], data[6]]);
        let parameter_type = ParameterType::from_u8(data[7]);
        let payload = &data[PAYLOAD_OFFSET..];

        validate_payload(kind, parameter_type, payload)?;

        Ok(Self {
            client_id: data[0],
            tick: data[1],
            kind,
            object_id,
            parameter_id,
            parameter_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn validate_payload(kind: MessageKind, parameter_type: ParameterType, payload: &[u8]) -> Result<(), DecodeError> {
    if kind == MessageKind::Lock && parameter_type != ParameterType::Bool {
        return Err(DecodeError::PayloadSize {
            parameter_type: format!("{:?} lock", parameter_type),
            expected: 1,
            actual: payload.len(),
        });
    }

    if kind == MessageKind::ResetObject {
        return Ok(());
    }

    match parameter_type.payload_size() {
        Some(expected) if expected != payload.len() => Err(DecodeError::PayloadSize {
            parameter_type: format!("{:?}", parameter_type),
            expected,
            actual: payload.len(),
        }),
        Some(_) => Ok(()),
        None if parameter_type == ParameterType::String => {
            if payload.len() < 4 {
                return Err(DecodeError::Truncated {
                    needed: 4,
                    available: payload.len(),
                });
            }
            let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            if payload.len() - 4 != len {
                return Err(DecodeError::PayloadSize {
                    parameter_type: "String".to_string(),
                    expected: len + 4,
                    actual: payload.len(),
                });
            }
            Ok(())
        }
        None => Ok(()),
    }
}

/// Plain-text control frames understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayControl {
    RecordStart,
    RecordStop,
}

impl RelayControl {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        match frame {
            b"recordstart" => Some(RelayControl::RecordStart),
            b"recordstop" => Some(RelayControl::RecordStop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayControl::RecordStart => "recordstart",
            RelayControl::RecordStop => "recordstop",
        }
    }
}

/// Queries accepted by the distribution responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneCommand {
    Header,
    Nodes,
    Objects,
    Textures,
    Materials,
}

impl SceneCommand {
    pub const ALL: [SceneCommand; 5] = [
        SceneCommand::Header,
        SceneCommand::Nodes,
        SceneCommand::Objects,
        SceneCommand::Textures,
        SceneCommand::Materials,
    ];

    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "header" => Some(SceneCommand::Header),
            "nodes" => Some(SceneCommand::Nodes),
            "objects" => Some(SceneCommand::Objects),
            "textures" => Some(SceneCommand::Textures),
            "materials" => Some(SceneCommand::Materials),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SceneCommand::Header => "header",
            SceneCommand::Nodes => "nodes",
            SceneCommand::Objects => "objects",
            SceneCommand::Textures => "textures",
            SceneCommand::Materials => "materials",
        }
    }
}
