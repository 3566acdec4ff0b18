use crate::protocol::{Message, MessageKind, SceneCommand};
use crate::scene::SceneSnapshot;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `SCENE_LINK_DEBUG=1`: dump loaded scene snapshots as pretty JSON and log every relayed message
/// - `SCENE_LINK_TRACE=1`: log codec sizes and per-frame transport traffic
pub fn init_debug_mode() {
    let debug = env::var("SCENE_LINK_DEBUG").is_ok();
    let trace = env::var("SCENE_LINK_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        tracing::info!("Debug mode enabled, snapshots and relayed messages will be logged");
    }
    if trace {
        tracing::info!("Trace mode enabled, codec and transport traffic will be logged");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

pub fn log_snapshot(label: &str, snapshot: &SceneSnapshot) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(snapshot) {
        Ok(json) => {
            tracing::debug!(label, nodes = snapshot.nodes.len(), "Scene snapshot:\n{}", json);
        }
        Err(e) => {
            tracing::warn!(label, error = %e, "Failed to serialize snapshot to JSON");
        }
    }
}

pub fn log_message(direction: &str, message: &Message) {
    if !is_debug_enabled() {
        return;
    }

    tracing::debug!(direction, "{}", message_summary(message));
}

pub fn trace_codec(command: SceneCommand, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(
        command = command.as_str(),
        size = %format_bytes(size_bytes),
        micros = duration_micros as u64,
        "Packed scene reply"
    );
}

pub fn trace_transport_send(bytes: usize, destination: &str) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(bytes, destination, "Sent frame");
}

pub fn trace_transport_receive(bytes: usize, source: &str) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(bytes, source, "Received frame");
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// One-line description of a relay message.
pub fn message_summary(message: &Message) -> String {
    match message.kind {
        MessageKind::Ping | MessageKind::Sync | MessageKind::ResendRequest => {
            format!("{:?} (client: {}, tick: {})", message.kind, message.client_id, message.tick)
        }
        MessageKind::Lock => format!(
            "Lock (client: {}, object: {}, locked: {})",
            message.client_id,
            message.object_id,
            message.lock_state().unwrap_or(false)
        ),
        MessageKind::ResetObject => format!(
            "ResetObject (client: {}, object: {})",
            message.client_id, message.object_id
        ),
        MessageKind::ParameterUpdate | MessageKind::UndoRedoAdd => format!(
            "{:?} (client: {}, tick: {}, object: {}, parameter: {}, {:?}, {})",
            message.kind,
            message.client_id,
            message.tick,
            message.object_id,
            message.parameter_id,
            message.parameter_type,
            format_bytes(message.payload.len())
        ),
    }
}
