pub mod protocol;
pub mod parameter;
pub mod scene;
pub mod codec;
pub mod serialization;
pub mod transport;
pub mod responder;
pub mod relay;
pub mod liveness;
pub mod record;
pub mod client;
pub mod config;
pub mod error;
pub mod debug;

pub use protocol::{
    ClientId, ObjectId, ParameterId,
    Message, MessageKind, ParameterType,
    RelayControl, SceneCommand,
    PROTOCOL_VERSION, LOCK_PARAMETER_ID, RESET_PARAMETER_ID,
};

pub use parameter::{
    ParameterValue, ParameterHandler, ParameterRegistry, TypedHandler,
};

pub use scene::{
    Node, NodeKind, NodeType, GeoNode, LightNode, LightType, CameraNode,
    GeometryPackage, TexturePackage, MaterialPackage, MaterialType, ShaderProperty,
    SceneHeader, SceneSnapshot, SceneStats, SceneBuilder, reconstruct_tree,
};

pub use codec::{
    pack_header, unpack_header,
    pack_nodes, unpack_nodes,
    pack_geometry, unpack_geometry,
    pack_textures, unpack_textures,
    pack_materials, unpack_materials,
};

pub use serialization::{
    SnapshotSerializer, SnapshotFormat, FrameEncoder, FrameDecoder,
    load_snapshot, save_snapshot,
};

pub use transport::{
    Transport, FramedTransport,
};

pub use responder::{
    SceneResponder, ResponderServer,
};

pub use relay::{
    Relay, RelayState, RelayOutcome,
};

pub use liveness::LivenessMonitor;

pub use record::RecordWriter;

pub use client::{
    SceneRequester, SyncClient, SyncEvent, SyncStats,
};

pub use config::LinkConfig;

pub use error::{
    DecodeError, LinkError, Result,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_snapshot, log_message,
    format_bytes, message_summary,
};
