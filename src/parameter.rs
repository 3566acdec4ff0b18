use crate::error::{DecodeError, LinkError, Result};
use crate::protocol::{Message, MessageKind, ObjectId, ParameterId, ParameterType};
use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    Quaternion([f32; 4]),
    Color([f32; 4]),
    String(String),
}

impl ParameterValue {
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::Bool(_) => ParameterType::Bool,
            ParameterValue::Int(_) => ParameterType::Int,
            ParameterValue::Float(_) => ParameterType::Float,
            ParameterValue::Vector2(_) => ParameterType::Vector2,
            ParameterValue::Vector3(_) => ParameterType::Vector3,
            ParameterValue::Vector4(_) => ParameterType::Vector4,
            ParameterValue::Quaternion(_) => ParameterType::Quaternion,
            ParameterValue::Color(_) => ParameterType::Color,
            ParameterValue::String(_) => ParameterType::String,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            ParameterValue::Bool(v) => buf.put_u8(*v as u8),
            ParameterValue::Int(v) => buf.put_i32_le(*v),
            ParameterValue::Float(v) => buf.put_f32_le(*v),
            ParameterValue::Vector2(v) => put_floats(&mut buf, v),
            ParameterValue::Vector3(v) => put_floats(&mut buf, v),
            ParameterValue::Vector4(v)
            | ParameterValue::Quaternion(v)
            | ParameterValue::Color(v) => put_floats(&mut buf, v),
            ParameterValue::String(s) => {
                put_len(&mut buf, s.len())?;
                buf.put_slice(s.as_bytes());
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(parameter_type: ParameterType, raw: &[u8]) -> std::result::Result<Self, DecodeError> {
        if let Some(expected) = parameter_type.payload_size() {
            if raw.len() < expected {
                return Err(DecodeError::Truncated {
                    needed: expected,
                    available: raw.len(),
                });
            }
        }

        match parameter_type {
            ParameterType::Bool => Ok(ParameterValue::Bool(raw[0] != 0)),
            ParameterType::Int => Ok(ParameterValue::Int(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))),
            ParameterType::Float => Ok(ParameterValue::Float(read_floats::<1>(raw)[0])),
            ParameterType::Vector2 => Ok(ParameterValue::Vector2(read_floats(raw))),
            ParameterType::Vector3 => Ok(ParameterValue::Vector3(read_floats(raw))),
            ParameterType::Vector4 => Ok(ParameterValue::Vector4(read_floats(raw))),
            ParameterType::Quaternion => Ok(ParameterValue::Quaternion(read_floats(raw))),
            ParameterType::Color => Ok(ParameterValue::Color(read_floats(raw))),
            ParameterType::String => {
                if raw.len() < 4 {
                    return Err(DecodeError::Truncated { needed: 4, available: raw.len() });
                }
                let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                let body = raw.get(4..4 + len).ok_or(DecodeError::Truncated {
                    needed: 4 + len,
                    available: raw.len(),
                })?;
                let s = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8)?;
                Ok(ParameterValue::String(s.to_string()))
            }
            ParameterType::Unknown => Err(DecodeError::UnknownEnum {
                field: "parameter type",
                value: ParameterType::Unknown as i32,
            }),
        }
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| LinkError::InvalidMessage(format!("String payload of {} bytes exceeds u32", len)))?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_floats(buf: &mut BytesMut, values: &[f32]) {
    for v in values {
        buf.put_f32_le(*v);
    }
}

// Callers check the length first.
fn read_floats<const N: usize>(raw: &[u8]) -> [f32; N] {
    let mut out = [0.0f32; N];
    for (i, chunk) in raw.chunks_exact(4).take(N).enumerate() {
        out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

/// Receiving end of one scene-object parameter.
pub trait ParameterHandler: Send {
    fn parameter_type(&self) -> ParameterType;

    fn apply(&mut self, raw: &[u8]) -> std::result::Result<(), DecodeError>;
}

/// Handler that decodes the payload once and hands the typed value to a closure.
pub struct TypedHandler<F> {
    parameter_type: ParameterType,
    on_value: F,
}

impl<F> TypedHandler<F>
where
    F: FnMut(ParameterValue) + Send,
{
    pub fn new(parameter_type: ParameterType, on_value: F) -> Self {
        Self {
            parameter_type,
            on_value,
        }
    }
}

impl<F> ParameterHandler for TypedHandler<F>
where
    F: FnMut(ParameterValue) + Send,
{
    fn parameter_type(&self) -> ParameterType {
        self.parameter_type
    }

    fn apply(&mut self, raw: &[u8]) -> std::result::Result<(), DecodeError> {
        let value = ParameterValue::decode(self.parameter_type, raw)?;
        (self.on_value)(value);
        Ok(())
    }
}

/// Maps (object, parameter) slots to the handler resolved at registration time.
pub struct ParameterRegistry {
    handlers: AHashMap<(ObjectId, ParameterId), Box<dyn ParameterHandler>>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self {
            handlers: AHashMap::new(),
        }
    }

    pub fn register(&mut self, object_id: ObjectId, parameter_id: ParameterId, handler: Box<dyn ParameterHandler>) {
        self.handlers.insert((object_id, parameter_id), handler);
    }

    pub fn register_fn<F>(&mut self, object_id: ObjectId, parameter_id: ParameterId, parameter_type: ParameterType, on_value: F)
    where
        F: FnMut(ParameterValue) + Send + 'static,
    {
        self.register(object_id, parameter_id, Box::new(TypedHandler::new(parameter_type, on_value)));
    }

    pub fn unregister_object(&mut self, object_id: ObjectId) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|(object, _), _| *object != object_id);
        before - self.handlers.len()
    }

    pub fn has(&self, object_id: ObjectId, parameter_id: ParameterId) -> bool {
        self.handlers.contains_key(&(object_id, parameter_id))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Applies a parameter update. Returns `false` when no handler is registered for the slot.
    pub fn dispatch(&mut self, message: &Message) -> Result<bool> {
        if !matches!(message.kind, MessageKind::ParameterUpdate | MessageKind::UndoRedoAdd) {
            return Ok(false);
        }

        let Some(handler) = self.handlers.get_mut(&message.cache_key()) else {
            return Ok(false);
        };

        if handler.parameter_type() != message.parameter_type {
            return Err(LinkError::InvalidMessage(format!(
                "Parameter {}/{} expects {:?}, got {:?}",
                message.object_id,
                message.parameter_id,
                handler.parameter_type(),
                message.parameter_type
            )));
        }

        handler.apply(&message.payload)?;
        Ok(true)
    }
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_value_payload_sizes() {
        let values = [
            ParameterValue::Bool(true),
            ParameterValue::Int(-4),
            ParameterValue::Float(0.25),
            ParameterValue::Vector2([1.0, 2.0]),
            ParameterValue::Vector3([1.0, 2.0, 3.0]),
            ParameterValue::Vector4([1.0, 2.0, 3.0, 4.0]),
            ParameterValue::Quaternion([0.0, 0.0, 0.0, 1.0]),
            ParameterValue::Color([1.0, 0.5, 0.25, 1.0]),
        ];

        for value in values {
            let ty = value.parameter_type();
            let encoded = value.encode().unwrap();
            assert_eq!(Some(encoded.len()), ty.payload_size());
            assert_eq!(ParameterValue::decode(ty, &encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_string_length_prefix() {
        let encoded = ParameterValue::String("spot".to_string()).encode().unwrap();
        assert_eq!(&encoded[..4], &4u32.to_le_bytes());
        assert_eq!(&encoded[4..], b"spot");
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_string_length_overflow() {
        let mut buf = BytesMut::new();
        let err = put_len(&mut buf, u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, LinkError::InvalidMessage(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        let err = ParameterValue::decode(ParameterType::Vector3, &[0; 8]).unwrap_err();
        assert!(err.is_truncated());

        let err = ParameterValue::decode(ParameterType::String, &[10, 0, 0, 0, b'a']).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_registry_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut registry = ParameterRegistry::new();
        registry.register_fn(7, 0, ParameterType::Vector3, move |value| {
            sink.lock().unwrap().push(value);
        });

        let update = Message::parameter_update(1, 0, 7, 0, &ParameterValue::Vector3([1.0, 2.0, 3.0])).unwrap();
        assert!(registry.dispatch(&update).unwrap());

        let unknown = Message::parameter_update(1, 0, 8, 0, &ParameterValue::Float(1.0)).unwrap();
        assert!(!registry.dispatch(&unknown).unwrap());

        assert_eq!(seen.lock().unwrap().as_slice(), &[ParameterValue::Vector3([1.0, 2.0, 3.0])]);
    }

    #[test]
    fn test_registry_type_mismatch() {
        let mut registry = ParameterRegistry::new();
        registry.register_fn(1, 2, ParameterType::Float, |_| {});

        let wrong = Message::parameter_update(1, 0, 1, 2, &ParameterValue::Int(3)).unwrap();
        assert!(registry.dispatch(&wrong).is_err());
    }

    #[test]
    fn test_unregister_object() {
        let mut registry = ParameterRegistry::new();
        registry.register_fn(1, 0, ParameterType::Float, |_| {});
        registry.register_fn(1, 1, ParameterType::Float, |_| {});
        registry.register_fn(2, 0, ParameterType::Float, |_| {});

        assert_eq!(registry.unregister_object(1), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.has(2, 0));
    }
}
